//! Controller for streams of arbitrary values.

use std::fmt;
use std::rc::Rc;

use log::{trace, warn};

use super::{
    call_pull_if_needed as schedule, desired_size, error_controller, finish_close, schedule_pull,
    watch_pull, watch_start, Controller, PullAction, PullFlags,
};
use crate::error::{StreamError, StreamResult};
use crate::queue::SizedQueue;
use crate::reader::{ReadResult, ReaderInner};
use crate::realm::Realm;
use crate::source::{hook_promise, UnderlyingSource};
use crate::strategy::{QueuingStrategy, SizeFn};
use crate::stream::{ReadableStream, StreamRef, StreamSlot, StreamState};
use crate::value::Value;
use crate::StreamPromise;

pub(crate) struct DefaultState {
    pub(crate) queue: SizedQueue<Value>,
    pub(crate) high_water_mark: f64,
    pub(crate) flags: PullFlags,
    pub(crate) source: Option<Rc<dyn UnderlyingSource<DefaultController>>>,
    pub(crate) size: Option<SizeFn>,
}

fn state_mut(slot: &mut StreamSlot) -> StreamResult<&mut DefaultState> {
    match &mut slot.controller {
        Controller::Default(state) => Ok(state),
        Controller::Byte(_) => Err(StreamError::Unsupported("value controller on a byte stream")),
    }
}

pub(crate) fn setup(
    realm: &Realm,
    source: Rc<dyn UnderlyingSource<DefaultController>>,
    strategy: QueuingStrategy,
) -> ReadableStream {
    let state = DefaultState {
        queue: SizedQueue::new(),
        high_water_mark: strategy.high_water_mark(),
        flags: PullFlags::default(),
        source: Some(Rc::clone(&source)),
        size: strategy.size_fn(),
    };
    let stream = realm.insert_stream(Controller::Default(state));
    let stream_ref = stream.stream_ref();
    let controller = DefaultController::new(stream_ref.clone());
    let started = hook_promise(source.start(&controller), realm.tasks());
    watch_start(&stream_ref, started);
    stream
}

pub(crate) fn call_pull_if_needed(stream: &StreamRef) {
    let source = stream
        .with(|slot| match schedule_pull(slot) {
            PullAction::Invoke => Some(state_mut(slot).ok().and_then(|state| state.source.clone())),
            PullAction::Skip | PullAction::Coalesced => None,
        })
        .flatten();
    let Some(source) = source else {
        return;
    };
    let Some(source) = source else {
        stream.with(|slot| slot.controller.flags_mut().pulling = false);
        return;
    };
    let Some(realm) = stream.realm() else {
        return;
    };
    trace!("pulling from value source");
    let controller = DefaultController::new(stream.clone());
    let pulled = hook_promise(source.pull(&controller), realm.tasks());
    watch_pull(stream, pulled);
}

pub(crate) fn pull_steps(stream: &StreamRef, reader: &Rc<ReaderInner>) -> StreamPromise<ReadResult> {
    let dequeued = stream
        .with(|slot| {
            let state = state_mut(slot).ok()?;
            let chunk = state.queue.dequeue()?;
            Some((chunk, state.flags.close_requested && state.queue.is_empty()))
        })
        .flatten();
    match dequeued {
        Some((chunk, drained_and_closing)) => {
            if drained_and_closing {
                finish_close(stream);
            } else {
                schedule(stream);
            }
            reader.resolved_read(chunk)
        }
        None => {
            let read = reader.add_request();
            schedule(stream);
            read
        }
    }
}

/// Producer handle for a value stream.
#[derive(Clone)]
pub struct DefaultController {
    stream: StreamRef,
}

impl DefaultController {
    pub(crate) fn new(stream: StreamRef) -> Self {
        Self { stream }
    }

    /// Queues `chunk`, or hands it straight to the oldest waiting read.
    ///
    /// A chunk from another domain is adapted into the stream's domain
    /// first. If the size function throws or returns an invalid size the
    /// stream is errored and the failure is also returned here.
    pub fn enqueue(&self, chunk: impl Into<Value>) -> StreamResult<()> {
        let chunk = chunk.into();
        let (reader, size) = self.stream.try_with(|slot| {
            let readable = slot.state == StreamState::Readable;
            let reader = slot.reader_with_requests();
            let state = state_mut(slot)?;
            if state.flags.close_requested || !readable {
                return Err(StreamError::InvalidState("enqueue into"));
            }
            Ok((reader, state.size.clone()))
        })?;
        let chunk = self.stream.adopt(&chunk).map_err(|err| {
            warn!("chunk refused at the boundary: {err}");
            StreamError::from(err)
        })?;

        if let Some(reader) = reader {
            reader.fulfill_request(chunk, false);
        } else {
            let size = match size {
                None => 1.0,
                Some(size) => match size(&chunk) {
                    Ok(size) => size,
                    Err(thrown) => {
                        error_controller(&self.stream, thrown.clone());
                        return Err(StreamError::Thrown(thrown));
                    }
                },
            };
            let queued = self
                .stream
                .with(|slot| {
                    if slot.state != StreamState::Readable {
                        return Ok(());
                    }
                    state_mut(slot)?.queue.enqueue_with_size(chunk, size)
                })
                .unwrap_or(Ok(()));
            if let Err(err) = queued {
                if let Some(domain) = self.stream.domain() {
                    error_controller(&self.stream, err.to_value(&domain));
                }
                return Err(err);
            }
        }
        schedule(&self.stream);
        Ok(())
    }

    /// Requests a close. Takes effect once the queue drains.
    pub fn close(&self) -> StreamResult<()> {
        let drained = self.stream.try_with(|slot| {
            let readable = slot.state == StreamState::Readable;
            let state = state_mut(slot)?;
            if state.flags.close_requested || !readable {
                return Err(StreamError::InvalidState("close"));
            }
            state.flags.close_requested = true;
            Ok(state.queue.is_empty())
        })?;
        if drained {
            finish_close(&self.stream);
        }
        Ok(())
    }

    /// Errors the stream with `error`, discarding anything queued. Ignored
    /// unless the stream is readable.
    pub fn error(&self, error: Value) {
        error_controller(&self.stream, error);
    }

    /// `None` when errored, 0 when closed.
    pub fn desired_size(&self) -> Option<f64> {
        self.stream.with(|slot| desired_size(slot)).flatten()
    }

    /// Entries currently buffered.
    pub fn queued(&self) -> usize {
        self.stream
            .with(|slot| state_mut(slot).map_or(0, |state| state.queue.len()))
            .unwrap_or(0)
    }
}

impl fmt::Debug for DefaultController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultController")
            .field("desired_size", &self.desired_size())
            .field("queued", &self.queued())
            .finish()
    }
}
