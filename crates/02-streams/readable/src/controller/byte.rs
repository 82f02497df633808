//! Controller for byte streams.
//!
//! Two sources can feed it. Callback sources push chunks through
//! [`ByteController::enqueue`] or answer pull-into requests through
//! [`ByobRequest::respond`]. External sources keep their bytes with the
//! realm's [`ExternalSourceHost`]: the controller only tracks how many bytes
//! are available and asks the host to copy them out when a read needs them.

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use log::{debug, trace};

use super::{
    call_pull_if_needed as schedule, desired_size, error_controller, finish_close, schedule_pull,
    watch_pull, watch_start, CancelTarget, Controller, PullAction, PullFlags,
};
use crate::error::{StreamError, StreamResult};
use crate::queue::SizedQueue;
use crate::reader::{ReadResult, ReaderInner};
use crate::realm::Realm;
use crate::source::{hook_promise, ExternalSource, ExternalSourceHost, UnderlyingSource};
use crate::strategy::ByteStreamOptions;
use crate::stream::{ReadableStream, StreamRef, StreamSlot, StreamState};
use crate::value::Value;
use crate::StreamPromise;

/// Host callbacks plus the opaque source they operate on.
#[derive(Clone)]
pub(crate) struct ExternalBinding {
    pub(crate) host: Rc<dyn ExternalSourceHost>,
    pub(crate) source: ExternalSource,
    pub(crate) flags: u32,
}

pub(crate) struct ExternalState {
    binding: ExternalBinding,
    available: usize,
    source_locked: bool,
}

pub(crate) enum ByteSource {
    Callbacks(Option<Rc<dyn UnderlyingSource<ByteController>>>),
    External(ExternalState),
}

/// Destination buffer of an outstanding auto-allocated read.
#[derive(Debug)]
pub(crate) struct PullIntoDescriptor {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    element_size: usize,
}

impl PullIntoDescriptor {
    fn auto_allocated(byte_length: usize, element_size: usize) -> Self {
        Self {
            buffer: vec![0; byte_length],
            byte_offset: 0,
            byte_length,
            bytes_filled: 0,
            element_size,
        }
    }

    fn remaining(&self) -> usize {
        self.byte_length - self.bytes_filled
    }

    fn filled(&self) -> &[u8] {
        &self.buffer[self.byte_offset..self.byte_offset + self.bytes_filled]
    }

    fn write(&mut self, bytes: &[u8]) {
        let start = self.byte_offset + self.bytes_filled;
        self.buffer[start..start + bytes.len()].copy_from_slice(bytes);
        self.bytes_filled += bytes.len();
    }

    /// Holds bytes that do not yet make up a whole element.
    fn is_partial(&self) -> bool {
        self.bytes_filled % self.element_size != 0
    }

    /// Splits the filled region into the whole-element prefix and the rest.
    fn into_committed(self) -> (Vec<u8>, Vec<u8>) {
        let usable = self.bytes_filled - self.bytes_filled % self.element_size;
        let filled = self.filled();
        (filled[..usable].to_vec(), filled[usable..].to_vec())
    }
}

pub(crate) struct ByteState {
    queue: SizedQueue<Rc<[u8]>>,
    pub(crate) high_water_mark: f64,
    pub(crate) flags: PullFlags,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    auto_allocate_chunk_size: Option<usize>,
    element_size: usize,
    source: ByteSource,
}

impl ByteState {
    fn new(options: &ByteStreamOptions, source: ByteSource) -> Self {
        Self {
            queue: SizedQueue::new(),
            high_water_mark: options.high_water_mark,
            flags: PullFlags::default(),
            pending_pull_intos: VecDeque::new(),
            auto_allocate_chunk_size: options.auto_allocate_chunk_size,
            element_size: options.element_size,
            source,
        }
    }

    pub(crate) fn is_external(&self) -> bool {
        matches!(self.source, ByteSource::External(_))
    }

    /// Buffered bytes: queued chunks, or what the host reported available.
    pub(crate) fn queue_total(&self) -> f64 {
        match &self.source {
            ByteSource::External(external) => external.available as f64,
            ByteSource::Callbacks(_) => self.queue.total_size(),
        }
    }

    pub(crate) fn source_locked(&self) -> bool {
        match &self.source {
            ByteSource::External(external) => external.source_locked,
            ByteSource::Callbacks(_) => false,
        }
    }

    pub(crate) fn external_binding(&self) -> Option<ExternalBinding> {
        match &self.source {
            ByteSource::External(external) => Some(external.binding.clone()),
            ByteSource::Callbacks(_) => None,
        }
    }

    /// External bindings survive until disposal so the host can be
    /// notified and finalized.
    pub(crate) fn take_source(&mut self) -> Option<Rc<dyn UnderlyingSource<ByteController>>> {
        match &mut self.source {
            ByteSource::Callbacks(source) => source.take(),
            ByteSource::External(_) => None,
        }
    }

    pub(crate) fn reset_queue(&mut self) {
        self.queue.reset();
        self.pending_pull_intos.clear();
        if let ByteSource::External(external) = &mut self.source {
            external.available = 0;
        }
    }

    /// Moves queued bytes into the head pull-into descriptor. When the
    /// queue can complete an element only whole elements are taken,
    /// otherwise everything available is copied in. Returns the committed
    /// bytes once the head holds at least one whole element.
    fn fill_head_from_queue(&mut self) -> StreamResult<Option<Vec<u8>>> {
        let Some(head) = self.pending_pull_intos.front_mut() else {
            return Ok(None);
        };
        let available = self.queue.total_size() as usize;
        let max_filled = head.bytes_filled + available.min(head.remaining());
        let aligned = max_filled - max_filled % head.element_size;
        let current = head.bytes_filled - head.bytes_filled % head.element_size;
        let ready = aligned > current;
        let target = if ready { aligned } else { max_filled };
        let mut to_copy = target - head.bytes_filled;
        while to_copy > 0 {
            let Some(chunk) = self.queue.dequeue() else {
                break;
            };
            let take = to_copy.min(chunk.len());
            head.write(&chunk[..take]);
            if take < chunk.len() {
                let rest: Rc<[u8]> = Rc::from(&chunk[take..]);
                let size = rest.len() as f64;
                self.queue.requeue_front(rest, size)?;
            }
            to_copy -= take;
        }
        if !ready {
            return Ok(None);
        }
        Ok(self
            .pending_pull_intos
            .pop_front()
            .map(|head| head.into_committed().0))
    }

    fn head_is_partial(&self) -> bool {
        self.pending_pull_intos
            .front()
            .map_or(false, PullIntoDescriptor::is_partial)
    }

    pub(crate) fn cancel_target(&self) -> CancelTarget {
        match &self.source {
            ByteSource::Callbacks(source) => CancelTarget::Byte(source.clone()),
            ByteSource::External(external) => CancelTarget::External(external.binding.clone()),
        }
    }
}

fn state_mut(slot: &mut StreamSlot) -> StreamResult<&mut ByteState> {
    match &mut slot.controller {
        Controller::Byte(state) => Ok(state),
        Controller::Default(_) => Err(StreamError::Unsupported("byte controller on a value stream")),
    }
}

pub(crate) fn setup(
    realm: &Realm,
    source: Rc<dyn UnderlyingSource<ByteController>>,
    options: ByteStreamOptions,
) -> StreamResult<ReadableStream> {
    options.validate()?;
    let state = ByteState::new(&options, ByteSource::Callbacks(Some(Rc::clone(&source))));
    let stream = realm.insert_stream(Controller::Byte(state));
    let stream_ref = stream.stream_ref();
    let controller = ByteController::new(stream_ref.clone());
    let started = hook_promise(source.start(&controller), realm.tasks());
    watch_start(&stream_ref, started);
    Ok(stream)
}

pub(crate) fn setup_external(
    realm: &Realm,
    source: ExternalSource,
    flags: u32,
    options: ByteStreamOptions,
) -> StreamResult<ReadableStream> {
    options.validate()?;
    let host = realm
        .config()
        .external_host
        .clone()
        .ok_or(StreamError::NoExternalHost)?;
    let external = ExternalState {
        binding: ExternalBinding {
            host,
            source,
            flags,
        },
        available: 0,
        source_locked: false,
    };
    let state = ByteState::new(&options, ByteSource::External(external));
    let stream = realm.insert_stream(Controller::Byte(state));
    debug!("external byte stream created with flags {flags:#x}");
    watch_start(&stream.stream_ref(), hook_promise(Ok(None), realm.tasks()));
    Ok(stream)
}

pub(crate) fn lock_external_source(stream: &StreamRef) -> StreamResult<ExternalSource> {
    stream.try_with(|slot| {
        if slot.is_locked() {
            return Err(StreamError::AlreadyLocked);
        }
        match &mut state_mut(slot)?.source {
            ByteSource::External(external) => {
                external.source_locked = true;
                Ok(external.binding.source.clone())
            }
            ByteSource::Callbacks(_) => Err(StreamError::Unsupported("stream has no external source")),
        }
    })
}

pub(crate) fn release_external_source(stream: &StreamRef) -> StreamResult<()> {
    stream.try_with(|slot| match &mut state_mut(slot)?.source {
        ByteSource::External(external) => {
            external.source_locked = false;
            Ok(())
        }
        ByteSource::Callbacks(_) => Err(StreamError::Unsupported("stream has no external source")),
    })
}

enum PullCall {
    Callbacks(Option<Rc<dyn UnderlyingSource<ByteController>>>),
    Request(ExternalBinding, f64),
}

pub(crate) fn call_pull_if_needed(stream: &StreamRef) {
    let call = stream
        .with(|slot| {
            if !matches!(schedule_pull(slot), PullAction::Invoke) {
                return None;
            }
            let desired = desired_size(slot).unwrap_or(0.0);
            let state = state_mut(slot).ok()?;
            Some(match &state.source {
                ByteSource::Callbacks(source) => PullCall::Callbacks(source.clone()),
                ByteSource::External(external) => {
                    PullCall::Request(external.binding.clone(), desired)
                }
            })
        })
        .flatten();
    let controller = ByteController::new(stream.clone());
    match call {
        None => {}
        Some(PullCall::Callbacks(None)) => {
            stream.with(|slot| slot.controller.flags_mut().pulling = false);
        }
        Some(PullCall::Callbacks(Some(source))) => {
            let Some(realm) = stream.realm() else {
                return;
            };
            trace!("pulling from byte source");
            let pulled = hook_promise(source.pull(&controller), realm.tasks());
            watch_pull(stream, pulled);
        }
        Some(PullCall::Request(binding, desired)) => {
            // Stays `pulling` until the host reports data.
            trace!("requesting {desired} bytes from external source");
            binding
                .host
                .request_data(&controller, &binding.source, binding.flags, desired);
        }
    }
}

enum ReadStep {
    Chunk(Rc<[u8]>),
    Filled(Vec<u8>),
    External(ExternalBinding, usize),
    Wait,
}

pub(crate) fn pull_steps(stream: &StreamRef, reader: &Rc<ReaderInner>) -> StreamPromise<ReadResult> {
    let step = stream
        .with(|slot| {
            let state = state_mut(slot).ok()?;
            if let ByteSource::External(external) = &state.source {
                return Some(if external.available > 0 {
                    ReadStep::External(external.binding.clone(), external.available)
                } else {
                    ReadStep::Wait
                });
            }
            let Some(size) = state.auto_allocate_chunk_size else {
                return Some(match state.queue.dequeue() {
                    Some(chunk) => ReadStep::Chunk(chunk),
                    None => ReadStep::Wait,
                });
            };
            // Auto-allocated reads take queued bytes in whole elements.
            if reader.pending() == 0 {
                // Left behind by a reader that went away.
                state.pending_pull_intos.clear();
            }
            state
                .pending_pull_intos
                .push_back(PullIntoDescriptor::auto_allocated(size, state.element_size));
            if state.pending_pull_intos.len() > 1 {
                return Some(ReadStep::Wait);
            }
            Some(match state.fill_head_from_queue() {
                Ok(Some(bytes)) => ReadStep::Filled(bytes),
                _ => ReadStep::Wait,
            })
        })
        .flatten();

    match step {
        Some(ReadStep::Chunk(chunk)) => {
            close_or_pull(stream);
            reader.resolved_read(Value::Bytes(chunk))
        }
        Some(ReadStep::Filled(bytes)) => {
            close_or_pull(stream);
            reader.resolved_read(Value::from(bytes))
        }
        Some(ReadStep::External(binding, available)) => {
            let bytes = copy_from_host(stream, &binding, available);
            if bytes.is_empty() {
                let read = reader.add_request();
                schedule(stream);
                return read;
            }
            close_or_pull(stream);
            reader.resolved_read(Value::from(bytes))
        }
        Some(ReadStep::Wait) => {
            let read = reader.add_request();
            close_or_pull(stream);
            read
        }
        None => reader.rejected(&reader.detached_error()),
    }
}

/// Asks the host to write up to `available` bytes and charges them against
/// the available count.
fn copy_from_host(stream: &StreamRef, binding: &ExternalBinding, available: usize) -> Vec<u8> {
    let controller = ByteController::new(stream.clone());
    let mut buffer = vec![0u8; available];
    let written = binding
        .host
        .write_into_buffer(&controller, &binding.source, binding.flags, &mut buffer)
        .min(available);
    buffer.truncate(written);
    stream.with(|slot| {
        if let Ok(ByteState {
            source: ByteSource::External(external),
            ..
        }) = state_mut(slot)
        {
            external.available = external.available.saturating_sub(written);
        }
    });
    buffer
}

/// After bytes leave the controller: finish a requested close once nothing
/// is buffered, otherwise see whether the source should produce more. A
/// close that would strand a partial element errors the stream instead.
fn close_or_pull(stream: &StreamRef) {
    let step = stream
        .with(|slot| {
            let state = state_mut(slot).ok()?;
            if !state.flags.close_requested || state.queue_total() > 0.0 {
                return None;
            }
            Some(state.head_is_partial())
        })
        .flatten();
    match step {
        None => schedule(stream),
        Some(false) => finish_close(stream),
        Some(true) => {
            if let Some(domain) = stream.domain() {
                error_controller(stream, StreamError::PartialPullInto.to_value(&domain));
            }
        }
    }
}

/// Fills waiting pull-into requests from the queue, delivering each one as
/// soon as it holds a whole element.
fn fill_reads_from_queue(stream: &StreamRef) -> StreamResult<()> {
    loop {
        let next = stream.try_with(|slot| {
            let Some(reader) = slot.reader_with_requests() else {
                return Ok(None);
            };
            let state = state_mut(slot)?;
            Ok(state.fill_head_from_queue()?.map(|bytes| (reader, bytes)))
        })?;
        let Some((reader, bytes)) = next else {
            return Ok(());
        };
        reader.fulfill_request(Value::from(bytes), false);
    }
}

enum CloseAction {
    Deferred,
    Now,
    Partial,
}

/// Producer handle for a byte stream.
#[derive(Clone)]
pub struct ByteController {
    stream: StreamRef,
}

impl ByteController {
    pub(crate) fn new(stream: StreamRef) -> Self {
        Self { stream }
    }

    /// Queues a copy of `chunk` or hands it to the oldest waiting read. An
    /// outstanding pull-into request is abandoned and its filled bytes are
    /// delivered ahead of `chunk`.
    pub fn enqueue(&self, chunk: &[u8]) -> StreamResult<()> {
        if chunk.is_empty() {
            return Err(StreamError::InvalidChunkSize("chunk must not be empty"));
        }
        let delivery = self.stream.try_with(|slot| {
            let readable = slot.state == StreamState::Readable;
            let reader = slot.reader_with_requests();
            let state = state_mut(slot)?;
            if state.flags.close_requested || !readable {
                return Err(StreamError::InvalidState("enqueue into"));
            }
            if state.is_external() {
                return Err(StreamError::Unsupported(
                    "enqueue on an external source; use update_data_available",
                ));
            }
            let Some(reader) = reader else {
                state
                    .queue
                    .enqueue_with_size(Rc::from(chunk), chunk.len() as f64)?;
                return Ok(None);
            };
            let mut bytes = Vec::with_capacity(chunk.len());
            if let Some(head) = state.pending_pull_intos.pop_front() {
                bytes.extend_from_slice(head.filled());
            }
            bytes.extend_from_slice(chunk);
            Ok(Some((reader, bytes)))
        })?;
        if let Some((reader, bytes)) = delivery {
            reader.fulfill_request(Value::from(bytes), false);
        }
        schedule(&self.stream);
        Ok(())
    }

    /// Requests a close. Deferred while bytes are buffered; refused, and the
    /// stream errored, if a pull-into request holds a partial element.
    pub fn close(&self) -> StreamResult<()> {
        let action = self.stream.try_with(|slot| {
            let readable = slot.state == StreamState::Readable;
            let state = state_mut(slot)?;
            if state.flags.close_requested || !readable {
                return Err(StreamError::InvalidState("close"));
            }
            if state.queue_total() > 0.0 {
                state.flags.close_requested = true;
                return Ok(CloseAction::Deferred);
            }
            if state
                .pending_pull_intos
                .front()
                .map_or(false, PullIntoDescriptor::is_partial)
            {
                return Ok(CloseAction::Partial);
            }
            state.flags.close_requested = true;
            Ok(CloseAction::Now)
        })?;
        match action {
            CloseAction::Deferred => Ok(()),
            CloseAction::Now => {
                finish_close(&self.stream);
                Ok(())
            }
            CloseAction::Partial => {
                let err = StreamError::PartialPullInto;
                if let Some(domain) = self.stream.domain() {
                    error_controller(&self.stream, err.to_value(&domain));
                }
                Err(err)
            }
        }
    }

    /// Errors the stream, discarding buffered bytes and pull-into requests.
    pub fn error(&self, error: Value) {
        error_controller(&self.stream, error);
    }

    /// `None` when errored, 0 when closed.
    pub fn desired_size(&self) -> Option<f64> {
        self.stream.with(|slot| desired_size(slot)).flatten()
    }

    /// The oldest outstanding pull-into request, if any.
    pub fn byob_request(&self) -> Option<ByobRequest> {
        let capacity = self
            .stream
            .with(|slot| {
                slot.reader_with_requests()?;
                let state = state_mut(slot).ok()?;
                state.pending_pull_intos.front().map(PullIntoDescriptor::remaining)
            })
            .flatten()?;
        Some(ByobRequest {
            controller: self.clone(),
            capacity,
        })
    }

    /// Host report for external sources: `available` bytes can now be read.
    /// Waiting reads are filled immediately; a pull requested while the host
    /// was busy is issued now.
    pub fn update_data_available(&self, available: usize) -> StreamResult<()> {
        let reader = self.stream.try_with(|slot| {
            let readable = slot.state == StreamState::Readable;
            let reader = slot.reader_with_requests();
            let state = state_mut(slot)?;
            if state.flags.close_requested || !readable {
                return Err(StreamError::InvalidState("report data on"));
            }
            let ByteSource::External(external) = &mut state.source else {
                return Err(StreamError::Unsupported(
                    "update_data_available on a callback byte source",
                ));
            };
            external.available = available;
            state.flags.pulling = false;
            Ok(reader)
        })?;
        trace!("external source reports {available} bytes");

        if let Some(reader) = reader {
            self.fill_external_reads(&reader);
        }
        let again = self
            .stream
            .with(|slot| std::mem::take(&mut slot.controller.flags_mut().pull_again))
            .unwrap_or(false);
        if again {
            schedule(&self.stream);
        }
        Ok(())
    }

    fn fill_external_reads(&self, reader: &Rc<ReaderInner>) {
        while reader.pending() > 0 {
            let next = self
                .stream
                .with(|slot| match state_mut(slot) {
                    Ok(ByteState {
                        source: ByteSource::External(external),
                        ..
                    }) if external.available > 0 => {
                        Some((external.binding.clone(), external.available))
                    }
                    _ => None,
                })
                .flatten();
            let Some((binding, available)) = next else {
                return;
            };
            let bytes = copy_from_host(&self.stream, &binding, available);
            if bytes.is_empty() {
                return;
            }
            reader.fulfill_request(Value::from(bytes), false);
        }
    }

    fn respond(&self, bytes: &[u8]) -> StreamResult<()> {
        let committed = self.stream.try_with(|slot| {
            let readable = slot.state == StreamState::Readable;
            let reader = slot.reader_with_requests();
            let state = state_mut(slot)?;
            if !readable {
                return Err(StreamError::InvalidState("respond on"));
            }
            let Some(reader) = reader else {
                // Requests outlived their reads; nothing can receive the bytes.
                state.pending_pull_intos.clear();
                return Err(StreamError::NoPullIntoRequest);
            };
            let head = state
                .pending_pull_intos
                .front_mut()
                .ok_or(StreamError::NoPullIntoRequest)?;
            let remaining = head.remaining();
            if bytes.len() > remaining {
                return Err(StreamError::RespondOverflow {
                    written: bytes.len(),
                    remaining,
                });
            }
            head.write(bytes);
            if head.bytes_filled < head.element_size {
                return Ok(None);
            }
            let Some(head) = state.pending_pull_intos.pop_front() else {
                return Ok(None);
            };
            let (delivered, remainder) = head.into_committed();
            if !remainder.is_empty() {
                let size = remainder.len() as f64;
                state.queue.enqueue_with_size(Rc::from(remainder), size)?;
            }
            Ok(Some((reader, delivered)))
        })?;
        let Some((reader, delivered)) = committed else {
            return Ok(());
        };
        reader.fulfill_request(Value::from(delivered), false);
        fill_reads_from_queue(&self.stream)?;
        close_or_pull(&self.stream);
        Ok(())
    }
}

impl fmt::Debug for ByteController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteController")
            .field("desired_size", &self.desired_size())
            .finish()
    }
}

/// View onto the oldest outstanding pull-into request.
#[derive(Clone, Debug)]
pub struct ByobRequest {
    controller: ByteController,
    capacity: usize,
}

impl ByobRequest {
    /// Bytes still unfilled when the request was taken.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes `bytes` into the request. Once at least one whole element is
    /// filled the request is committed: whole elements go to the waiting
    /// read and any trailing partial element is carried into the next
    /// request. Fails with [`StreamError::NoPullIntoRequest`] when no read
    /// is waiting for the bytes.
    pub fn respond(&self, bytes: &[u8]) -> StreamResult<()> {
        self.controller.respond(bytes)
    }
}
