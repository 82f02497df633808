//! Stream slots, public handles and the three state transitions.

use std::fmt;
use std::rc::{Rc, Weak};

use log::{debug, warn};
use microtask::Promise;

use crate::boundary::{Boundary, BoundaryError, Domain};
use crate::controller::{self, ByteController, Controller, ControllerKind};
use crate::error::{StreamError, StreamResult};
use crate::reader::{DefaultReader, ReaderInner};
use crate::realm::{Realm, RealmShared};
use crate::source::{ExternalSource, UnderlyingSource};
use crate::strategy::{ByteStreamOptions, QueuingStrategy};
use crate::tee;
use crate::value::{ErrorName, Value};
use crate::StreamPromise;

/// Lifecycle state. Leaves `Readable` at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Accepting reads; the source may still produce.
    Readable,
    /// Drained after a close or cancel. Reads report `done`.
    Closed,
    /// Holds a stored error that every later read rejects with.
    Errored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StreamKey {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

pub(crate) struct StreamSlot {
    pub(crate) generation: u32,
    pub(crate) handles: usize,
    pub(crate) state: StreamState,
    pub(crate) disturbed: bool,
    pub(crate) stored_error: Option<Value>,
    pub(crate) reader: Option<Weak<ReaderInner>>,
    pub(crate) controller: Controller,
}

impl StreamSlot {
    /// The attached reader, if it is still alive.
    pub(crate) fn reader(&self) -> Option<Rc<ReaderInner>> {
        self.reader.as_ref().and_then(Weak::upgrade)
    }

    /// The attached reader when it has at least one read waiting.
    pub(crate) fn reader_with_requests(&self) -> Option<Rc<ReaderInner>> {
        self.reader().filter(|reader| reader.pending() > 0)
    }

    pub(crate) fn pending_reads(&self) -> usize {
        self.reader().map_or(0, |reader| reader.pending())
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.reader().is_some() || self.controller.source_locked()
    }
}

/// Weak, generation-checked reference to a stream slot.
///
/// Held by controllers, readers' internals and the tee coordinator. Resolves
/// to nothing once the slot has been disposed or the realm dropped.
#[derive(Clone)]
pub(crate) struct StreamRef {
    realm: Weak<RealmShared>,
    key: StreamKey,
}

impl StreamRef {
    pub(crate) fn realm(&self) -> Option<Realm> {
        self.realm.upgrade().map(Realm::from_shared)
    }

    pub(crate) fn domain(&self) -> Option<Domain> {
        self.realm.upgrade().map(|shared| shared.domain.clone())
    }

    /// Runs `f` against the slot. The closure must not call producer or
    /// consumer code, nor drop a [`ReadableStream`].
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut StreamSlot) -> R) -> Option<R> {
        let shared = self.realm.upgrade()?;
        let mut streams = shared.streams.borrow_mut();
        let slot = streams.get_mut(self.key.index)?;
        if slot.generation != self.key.generation {
            return None;
        }
        Some(f(slot))
    }

    /// Like [`with`](Self::with), mapping a vanished slot to
    /// [`StreamError::Detached`].
    pub(crate) fn try_with<R>(
        &self,
        f: impl FnOnce(&mut StreamSlot) -> StreamResult<R>,
    ) -> StreamResult<R> {
        self.with(f).unwrap_or(Err(StreamError::Detached))
    }

    /// Marshals a value handed in by a producer or caller into the stream's
    /// domain before it is stored or passed on.
    pub(crate) fn adopt(&self, value: &Value) -> Result<Value, BoundaryError> {
        let domain = self
            .domain()
            .ok_or_else(|| BoundaryError::Uncatchable("released realm".to_string()))?;
        Boundary::adapt(value, &domain)
    }

    /// Error value describing a vanished stream, homed in `domain`.
    pub(crate) fn detached_error(domain: &Domain) -> Value {
        StreamError::Detached.to_value(domain)
    }
}

/// Readable → Closed. Settles waiting reads with `done` and resolves the
/// reader's `closed` promise.
pub(crate) fn close_stream(stream: &StreamRef) {
    let transition = stream
        .with(|slot| {
            if slot.state != StreamState::Readable {
                return None;
            }
            slot.state = StreamState::Closed;
            Some((slot.reader(), slot.controller.external()))
        })
        .flatten();
    let Some((reader, external)) = transition else {
        return;
    };
    debug!("stream closed");
    if let Some(reader) = reader {
        reader.settle_closed();
    }
    if let Some(binding) = external {
        let controller = ByteController::new(stream.clone());
        binding
            .host
            .closed_notify(&controller, &binding.source, binding.flags);
    }
}

/// Readable → Errored. `error` must already belong to the stream's domain;
/// it is stored as given. Rejects waiting reads and the reader's `closed`
/// promise.
pub(crate) fn error_stream(stream: &StreamRef, error: Value) {
    let transition = stream
        .with(|slot| {
            if slot.state != StreamState::Readable {
                return None;
            }
            slot.state = StreamState::Errored;
            slot.stored_error = Some(error.clone());
            Some((slot.reader(), slot.controller.external()))
        })
        .flatten();
    let Some((reader, external)) = transition else {
        return;
    };
    debug!("stream errored: {error:?}");
    if let Some(reader) = reader {
        reader.settle_errored(&error);
    }
    if let Some(binding) = external {
        let controller = ByteController::new(stream.clone());
        binding
            .host
            .errored_notify(&controller, &binding.source, binding.flags, &error);
    }
}

/// Cancels without a lock check. The stream is closed before the source
/// hears about it, so repeated cancels are no-ops.
pub(crate) fn cancel_stream(stream: &StreamRef, reason: Value, realm: &Realm) -> StreamPromise<()> {
    let status = stream.with(|slot| {
        slot.disturbed = true;
        (slot.state, slot.stored_error.clone())
    });
    match status {
        None => Promise::rejected(realm.tasks(), StreamRef::detached_error(realm.domain())),
        Some((StreamState::Closed, _)) => Promise::resolved(realm.tasks(), ()),
        Some((StreamState::Errored, error)) => {
            Promise::rejected(realm.tasks(), error.unwrap_or_default())
        }
        Some((StreamState::Readable, _)) => {
            debug!("stream canceled: {reason:?}");
            close_stream(stream);
            controller::cancel_steps(stream, reason, realm).then(|()| Ok(()), Err)
        }
    }
}

/// Public handle to a readable stream.
///
/// Handles are counted: the stream's slot is reclaimed once every handle
/// (including the one an attached reader holds) has been dropped. Pending
/// promises are left unsettled at that point.
pub struct ReadableStream {
    realm: Realm,
    key: StreamKey,
}

impl ReadableStream {
    pub(crate) fn attach(realm: Realm, key: StreamKey) -> Self {
        Self { realm, key }
    }

    /// Creates a value stream. `start` runs before this returns.
    pub fn new(
        realm: &Realm,
        source: impl UnderlyingSource + 'static,
        strategy: QueuingStrategy,
    ) -> Self {
        Self::from_source(realm, Rc::new(source), strategy)
    }

    /// Like [`new`](Self::new) for an already shared source.
    pub fn from_source(
        realm: &Realm,
        source: Rc<dyn UnderlyingSource>,
        strategy: QueuingStrategy,
    ) -> Self {
        controller::setup_default(realm, source, strategy)
    }

    /// Creates a byte stream driven by callbacks.
    pub fn new_bytes(
        realm: &Realm,
        source: impl UnderlyingSource<ByteController> + 'static,
        options: ByteStreamOptions,
    ) -> StreamResult<Self> {
        controller::setup_byte(realm, Rc::new(source), options)
    }

    /// Creates a byte stream whose data lives with the realm's
    /// [`ExternalSourceHost`](crate::ExternalSourceHost).
    pub fn new_external(
        realm: &Realm,
        source: ExternalSource,
        flags: u32,
        options: ByteStreamOptions,
    ) -> StreamResult<Self> {
        controller::setup_external(realm, source, flags, options)
    }

    pub(crate) fn stream_ref(&self) -> StreamRef {
        StreamRef {
            realm: self.realm.downgrade(),
            key: self.key,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut StreamSlot) -> R) -> Option<R> {
        self.stream_ref().with(f)
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn state(&self) -> StreamState {
        self.with(|slot| slot.state).unwrap_or(StreamState::Closed)
    }

    /// Locked while a live reader is attached or the external source is
    /// held by the host.
    pub fn is_locked(&self) -> bool {
        self.with(|slot| slot.is_locked()).unwrap_or(false)
    }

    /// Set once the stream has been read from or canceled.
    pub fn is_disturbed(&self) -> bool {
        self.with(|slot| slot.disturbed).unwrap_or(false)
    }

    pub fn stored_error(&self) -> Option<Value> {
        self.with(|slot| slot.stored_error.clone()).flatten()
    }

    pub fn controller_kind(&self) -> Option<ControllerKind> {
        self.with(|slot| slot.controller.kind())
    }

    /// `None` when errored, 0 when closed.
    pub fn desired_size(&self) -> Option<f64> {
        self.with(|slot| controller::desired_size(slot)).flatten()
    }

    /// Cancels an unlocked stream. A locked stream yields a promise rejected
    /// with a `TypeError`; cancel through its reader instead.
    pub fn cancel(&self, reason: Value) -> StreamPromise<()> {
        if self.is_locked() {
            let error = self.realm.error(
                ErrorName::TypeError,
                StreamError::AlreadyLocked.to_string(),
            );
            return Promise::rejected(self.realm.tasks(), error);
        }
        let reason = match Boundary::adapt(&reason, self.realm.domain()) {
            Ok(reason) => reason,
            Err(err) => {
                warn!("cancel left unsettled: {err}");
                return Promise::new(self.realm.tasks());
            }
        };
        cancel_stream(&self.stream_ref(), reason, &self.realm)
    }

    /// Locks the stream to a reader in the stream's own realm.
    pub fn get_reader(&self) -> StreamResult<DefaultReader> {
        DefaultReader::acquire(self, &self.realm)
    }

    /// Locks the stream to a reader owned by `consumer`. Chunks, errors and
    /// reasons are adapted across the boundary in both directions.
    pub fn get_reader_in(&self, consumer: &Realm) -> StreamResult<DefaultReader> {
        DefaultReader::acquire(self, consumer)
    }

    /// Splits the stream into two branches that each see every chunk.
    pub fn tee(&self) -> StreamResult<(ReadableStream, ReadableStream)> {
        tee::tee(self, false)
    }

    /// Like [`tee`](Self::tee); when `clone_for_branch2` is set, branch 2
    /// receives structured clones of every chunk.
    pub fn tee_with(&self, clone_for_branch2: bool) -> StreamResult<(ReadableStream, ReadableStream)> {
        tee::tee(self, clone_for_branch2)
    }

    /// Hands the external source to the host, locking the stream.
    pub fn lock_external_source(&self) -> StreamResult<ExternalSource> {
        controller::lock_external_source(&self.stream_ref())
    }

    /// Returns the external source lock taken by
    /// [`lock_external_source`](Self::lock_external_source).
    pub fn release_external_source(&self) -> StreamResult<()> {
        controller::release_external_source(&self.stream_ref())
    }

    /// Returns `true` if both handles refer to the same stream.
    pub fn same(&self, other: &ReadableStream) -> bool {
        self.realm.same(&other.realm) && self.key == other.key
    }
}

impl Clone for ReadableStream {
    fn clone(&self) -> Self {
        self.with(|slot| slot.handles += 1);
        Self {
            realm: self.realm.clone(),
            key: self.key,
        }
    }
}

impl Drop for ReadableStream {
    fn drop(&mut self) {
        release_handle(&self.realm, self.key);
    }
}

/// Drops one handle count. The slot is removed once no handles remain; if the
/// arena is busy the release is retried from the task queue.
fn release_handle(realm: &Realm, key: StreamKey) {
    let shared = realm.shared();
    let Ok(mut streams) = shared.streams.try_borrow_mut() else {
        let realm_for_task = realm.clone();
        realm
            .tasks()
            .enqueue(move || release_handle(&realm_for_task, key));
        return;
    };
    let Some(slot) = streams.get_mut(key.index) else {
        return;
    };
    if slot.generation != key.generation {
        return;
    }
    slot.handles = slot.handles.saturating_sub(1);
    if slot.handles > 0 {
        return;
    }
    let slot = streams.remove(key.index);
    drop(streams);
    dispose_slot(slot);
}

fn dispose_slot(slot: StreamSlot) {
    debug!(
        "disposing stream slot in state {:?} with {} pending reads",
        slot.state,
        slot.pending_reads()
    );
    if slot.pending_reads() > 0 {
        warn!("stream disposed with reads outstanding; they will never settle");
    }
    if let Some(binding) = slot.controller.external() {
        binding.host.finalize(&binding.source, binding.flags);
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ReadableStream");
        debug.field("realm", &self.realm.label());
        match self.with(|slot| (slot.state, slot.is_locked(), slot.controller.kind())) {
            Some((state, locked, kind)) => debug
                .field("state", &state)
                .field("locked", &locked)
                .field("kind", &kind),
            None => debug.field("state", &"disposed"),
        };
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::controller::DefaultController;
    use crate::source::HookResult;

    struct Closing;

    impl UnderlyingSource for Closing {
        fn start(&self, controller: &DefaultController) -> HookResult {
            controller.enqueue("a").map_err(|e| Value::from(e.to_string()))?;
            controller.close().map_err(|e| Value::from(e.to_string()))?;
            Ok(None)
        }
    }

    struct Unstarted {
        realm: Realm,
        canceled: Rc<Cell<bool>>,
    }

    impl UnderlyingSource for Unstarted {
        fn start(&self, _controller: &DefaultController) -> HookResult {
            Ok(Some(self.realm.promise()))
        }

        fn cancel(&self, _reason: Value) -> HookResult {
            self.canceled.set(true);
            Ok(Some(Promise::rejected(self.realm.tasks(), Value::from("oops"))))
        }
    }

    struct FailsOnStart(Value);

    impl UnderlyingSource for FailsOnStart {
        fn start(&self, controller: &DefaultController) -> HookResult {
            controller.error(self.0.clone());
            Ok(None)
        }
    }

    #[test]
    fn cancel_on_an_errored_stream_rejects_with_the_stored_error() {
        let realm = Realm::default();
        let error = realm.error(ErrorName::TypeError, "failed early");
        let stream = ReadableStream::new(
            &realm,
            FailsOnStart(error.clone()),
            QueuingStrategy::default(),
        );
        assert_eq!(stream.state(), StreamState::Errored);

        let canceled = stream.cancel(Value::from("late"));
        assert_eq!(realm.block_on(canceled).unwrap().unwrap_err(), error);
        assert!(stream.is_disturbed());
        assert_eq!(stream.stored_error(), Some(error));
    }

    struct Recording(Rc<RefCell<Vec<Value>>>);

    impl UnderlyingSource for Recording {
        fn cancel(&self, reason: Value) -> HookResult {
            self.0.borrow_mut().push(reason);
            Ok(None)
        }
    }

    #[test]
    fn cancel_reason_from_another_domain_is_adapted() {
        let realm = Realm::default();
        let elsewhere = Domain::new("elsewhere");
        let reasons = Rc::new(RefCell::new(Vec::new()));
        let stream = ReadableStream::new(
            &realm,
            Recording(reasons.clone()),
            QueuingStrategy::default(),
        );
        let reason = Value::error(&elsewhere, ErrorName::Error, "abort");
        assert_eq!(realm.block_on(stream.cancel(reason.clone())), Some(Ok(())));

        let seen = reasons.borrow();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].home().unwrap().same(realm.domain()));
        assert_ne!(seen[0], reason);
        assert_eq!(seen[0].error_message(), Some("abort"));
    }

    #[test]
    fn cancel_before_start_resolves_and_closes() {
        let realm = Realm::default();
        let canceled = Rc::new(Cell::new(false));
        let stream = ReadableStream::new(
            &realm,
            Unstarted {
                realm: realm.clone(),
                canceled: canceled.clone(),
            },
            QueuingStrategy::default(),
        );
        let result = stream.cancel(Value::from("reason"));
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_disturbed());
        assert_eq!(realm.block_on(result), Some(Ok(())));
        assert!(canceled.get());
    }

    #[test]
    fn cancel_after_close_is_a_resolved_no_op() {
        let realm = Realm::default();
        let stream = ReadableStream::new(&realm, Closing, QueuingStrategy::default());
        realm.run_until_idle();
        let first = stream.cancel(Value::Undefined);
        let second = stream.cancel(Value::Undefined);
        assert_eq!(realm.block_on(first), Some(Ok(())));
        assert_eq!(realm.block_on(second), Some(Ok(())));
    }

    #[test]
    fn cancel_on_a_locked_stream_rejects_with_type_error() {
        let realm = Realm::default();
        let stream = ReadableStream::new(&realm, Closing, QueuingStrategy::default());
        let _reader = stream.get_reader().unwrap();
        let error = realm
            .block_on(stream.cancel(Value::Undefined))
            .unwrap()
            .unwrap_err();
        assert_eq!(error.error_name(), Some(ErrorName::TypeError));
    }

    #[test]
    fn slot_is_reclaimed_when_last_handle_drops() {
        let realm = Realm::default();
        let stream = ReadableStream::new(&realm, Closing, QueuingStrategy::default());
        let copy = stream.clone();
        assert_eq!(realm.live_streams(), 1);
        drop(stream);
        assert_eq!(realm.live_streams(), 1);
        assert!(copy.same(&copy.clone()));
        drop(copy);
        realm.run_until_idle();
        assert_eq!(realm.live_streams(), 0);
    }

    #[test]
    fn reader_keeps_the_slot_alive() {
        let realm = Realm::default();
        let stream = ReadableStream::new(&realm, Closing, QueuingStrategy::default());
        let reader = stream.get_reader().unwrap();
        drop(stream);
        assert_eq!(realm.live_streams(), 1);
        let first = reader.read().unwrap();
        assert_eq!(realm.block_on(first).unwrap().unwrap().value, Value::from("a"));
        drop(reader);
        realm.run_until_idle();
        assert_eq!(realm.live_streams(), 0);
    }
}
