//! Default reader: the consumer-side lock on a stream.
//!
//! A reader belongs to a consumer realm, which may differ from the stream's.
//! Everything it hands out (chunks, stored errors, cancel results) is first
//! adapted into the consumer's domain; a failed adaptation leaves the
//! affected promise pending.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use log::{debug, warn};
use microtask::Promise;

use crate::boundary::{Boundary, Domain};
use crate::controller;
use crate::error::{StreamError, StreamResult};
use crate::realm::Realm;
use crate::stream::{cancel_stream, ReadableStream, StreamRef, StreamState};
use crate::value::{ErrorName, Value};
use crate::StreamPromise;

/// Outcome of a single read.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadResult {
    /// The chunk, or `Undefined` once the stream is done.
    pub value: Value,
    /// Set when the stream has closed and no chunk was produced.
    pub done: bool,
}

impl ReadResult {
    /// A delivered chunk.
    pub fn chunk(value: Value) -> Self {
        Self { value, done: false }
    }

    /// End of stream.
    pub fn done() -> Self {
        Self {
            value: Value::Undefined,
            done: true,
        }
    }
}

pub(crate) struct ReaderInner {
    realm: Realm,
    stream: RefCell<Option<ReadableStream>>,
    requests: RefCell<VecDeque<StreamPromise<ReadResult>>>,
    closed: StreamPromise<()>,
}

impl ReaderInner {
    fn stream_ref(&self) -> Option<StreamRef> {
        self.stream.borrow().as_ref().map(ReadableStream::stream_ref)
    }

    fn attached(&self) -> Option<ReadableStream> {
        self.stream.borrow().as_ref().cloned()
    }

    pub(crate) fn domain(&self) -> &Domain {
        self.realm.domain()
    }

    pub(crate) fn pending(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Registers a read that the controller will fulfill later.
    pub(crate) fn add_request(&self) -> StreamPromise<ReadResult> {
        let request = Promise::new(self.realm.tasks());
        self.requests.borrow_mut().push_back(request.clone());
        request
    }

    /// Fulfills the oldest waiting read.
    pub(crate) fn fulfill_request(&self, chunk: Value, done: bool) {
        let request = self.requests.borrow_mut().pop_front();
        if let Some(request) = request {
            self.deliver(&request, chunk, done);
        }
    }

    /// A read satisfied straight from the queue.
    pub(crate) fn resolved_read(&self, chunk: Value) -> StreamPromise<ReadResult> {
        let read = Promise::new(self.realm.tasks());
        self.deliver(&read, chunk, false);
        read
    }

    fn deliver(&self, read: &StreamPromise<ReadResult>, chunk: Value, done: bool) {
        match Boundary::adapt(&chunk, self.domain()) {
            Ok(value) => {
                read.resolve(ReadResult { value, done });
            }
            Err(err) => warn!("read left unsettled: {err}"),
        }
    }

    /// Settles every waiting read as done and resolves `closed`.
    pub(crate) fn settle_closed(&self) {
        let requests: Vec<_> = self.requests.borrow_mut().drain(..).collect();
        for request in requests {
            request.resolve(ReadResult::done());
        }
        self.closed.resolve(());
    }

    /// Rejects every waiting read and `closed` with `error`.
    pub(crate) fn settle_errored(&self, error: &Value) {
        let requests: Vec<_> = self.requests.borrow_mut().drain(..).collect();
        let error = match Boundary::adapt(error, self.domain()) {
            Ok(error) => error,
            Err(err) => {
                warn!("{} reads and the closed promise left unsettled: {err}", requests.len());
                return;
            }
        };
        for request in requests {
            request.reject(error.clone());
        }
        self.closed.reject(error);
    }

    /// A promise already rejected with `error`, adapted for this reader.
    pub(crate) fn rejected<T: Clone + 'static>(&self, error: &Value) -> StreamPromise<T> {
        let promise = Promise::new(self.realm.tasks());
        match Boundary::adapt(error, self.domain()) {
            Ok(error) => {
                promise.reject(error);
            }
            Err(err) => warn!("rejection left unsettled: {err}"),
        }
        promise
    }

    pub(crate) fn detached_error(&self) -> Value {
        StreamRef::detached_error(self.domain())
    }

    /// Re-homes a promise produced in the stream's realm onto this reader's
    /// queue, adapting a rejection reason on the way.
    fn into_consumer(&self, promise: StreamPromise<()>) -> StreamPromise<()> {
        if promise.queue().same_queue(self.realm.tasks()) {
            return promise;
        }
        let local = Promise::new(self.realm.tasks());
        let out = local.clone();
        let domain = self.domain().clone();
        promise.upon(move |outcome| match outcome {
            Ok(()) => {
                out.resolve(());
            }
            Err(error) => match Boundary::adapt(&error, &domain) {
                Ok(error) => {
                    out.reject(error);
                }
                Err(err) => warn!("cancel result left unsettled: {err}"),
            },
        });
        local
    }
}

/// Consumer handle locking a [`ReadableStream`].
///
/// Dropping the last clone of a reader without releasing it also unlocks the
/// stream; waiting reads are then abandoned.
#[derive(Clone)]
pub struct DefaultReader {
    inner: Rc<ReaderInner>,
}

impl DefaultReader {
    pub(crate) fn acquire(stream: &ReadableStream, consumer: &Realm) -> StreamResult<Self> {
        let stream_ref = stream.stream_ref();
        let (state, stored_error) = stream_ref.try_with(|slot| {
            if slot.is_locked() {
                return Err(StreamError::AlreadyLocked);
            }
            Ok((slot.state, slot.stored_error.clone()))
        })?;

        let inner = Rc::new(ReaderInner {
            realm: consumer.clone(),
            stream: RefCell::new(Some(stream.clone())),
            requests: RefCell::new(VecDeque::new()),
            closed: Promise::new(consumer.tasks()),
        });
        match state {
            StreamState::Readable => {}
            StreamState::Closed => {
                inner.closed.resolve(());
            }
            StreamState::Errored => inner.settle_errored(&stored_error.unwrap_or_default()),
        }
        let weak = Rc::downgrade(&inner);
        stream_ref.with(|slot| slot.reader = Some(weak));
        debug!(
            "reader acquired in realm '{}' for a stream of realm '{}'",
            consumer.label(),
            stream.realm().label()
        );
        Ok(Self { inner })
    }

    /// Resolves when the stream closes, rejects with the stored error when
    /// it errors or with a `TypeError` when the lock is released first.
    pub fn closed(&self) -> StreamPromise<()> {
        self.inner.closed.clone()
    }

    /// Requests the next chunk. Results settle in call order.
    pub fn read(&self) -> StreamResult<StreamPromise<ReadResult>> {
        let stream = self.inner.stream_ref().ok_or(StreamError::NotOwned)?;
        let (state, stored_error) = stream.try_with(|slot| {
            slot.disturbed = true;
            Ok((slot.state, slot.stored_error.clone()))
        })?;
        Ok(match state {
            StreamState::Closed => Promise::resolved(self.inner.realm.tasks(), ReadResult::done()),
            StreamState::Errored => self.inner.rejected(&stored_error.unwrap_or_default()),
            StreamState::Readable => controller::pull_steps(&stream, &self.inner),
        })
    }

    /// Cancels the locked stream. The lock is kept.
    pub fn cancel(&self, reason: Value) -> StreamResult<StreamPromise<()>> {
        let stream = self.inner.attached().ok_or(StreamError::NotOwned)?;
        let realm = stream.realm().clone();
        let Ok(reason) = Boundary::adapt(&reason, realm.domain()) else {
            warn!("cancel reason could not enter realm '{}'", realm.label());
            return Ok(Promise::new(self.inner.realm.tasks()));
        };
        let canceled = cancel_stream(&stream.stream_ref(), reason, &realm);
        Ok(self.inner.into_consumer(canceled))
    }

    /// Detaches from the stream so another reader can lock it.
    pub fn release_lock(&self) -> StreamResult<()> {
        let Some(stream) = self.inner.stream_ref() else {
            return Ok(());
        };
        let pending = self.inner.pending();
        if pending > 0 {
            return Err(StreamError::NotEmpty(pending));
        }
        let state = stream.with(|slot| {
            slot.reader = None;
            slot.state
        });
        if state == Some(StreamState::Readable) {
            let released = self
                .inner
                .realm
                .error(ErrorName::TypeError, "reader released");
            self.inner.closed.reject(released);
        }
        let handle = self.inner.stream.borrow_mut().take();
        drop(handle);
        debug!("reader released");
        Ok(())
    }

    /// `false` once the lock has been released.
    pub fn is_attached(&self) -> bool {
        self.inner.stream.borrow().is_some()
    }

    /// Reads still waiting for a chunk.
    pub fn pending_reads(&self) -> usize {
        self.inner.pending()
    }

    /// Realm that owns this reader's promises.
    pub fn realm(&self) -> &Realm {
        &self.inner.realm
    }

    /// The locked stream, while attached.
    pub fn stream(&self) -> Option<ReadableStream> {
        self.inner.attached()
    }
}

impl fmt::Debug for DefaultReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultReader")
            .field("realm", &self.inner.realm.label())
            .field("attached", &self.is_attached())
            .field("pending_reads", &self.pending_reads())
            .finish()
    }
}
