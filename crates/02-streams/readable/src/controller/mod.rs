//! Push-side controllers and the algorithms shared by both variants.
//!
//! A stream owns exactly one [`Controller`], tagged by variant. Every entry
//! point that runs producer code (start, pull, cancel, size) first copies what
//! it needs out of the arena slot, releases the slot, and only then calls out.

mod byte;
mod default;

use std::rc::Rc;

use log::{debug, trace, warn};

pub use byte::{ByobRequest, ByteController};
pub use default::DefaultController;

pub(crate) use byte::{
    lock_external_source, release_external_source, setup as setup_byte, setup_external,
    ByteState, ExternalBinding,
};
pub(crate) use default::{setup as setup_default, DefaultState};

use crate::reader::{ReadResult, ReaderInner};
use crate::realm::Realm;
use crate::source::{hook_promise, HookResult, UnderlyingSource};
use crate::strategy::SizeFn;
use crate::stream::{close_stream, error_stream, StreamRef, StreamSlot, StreamState};
use crate::value::Value;
use crate::StreamPromise;

/// Variant tag exposed for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerKind {
    /// Arbitrary values, sized by the queuing strategy.
    Default,
    /// Byte chunks supplied through callbacks.
    Byte,
    /// Byte chunks whose buffer lives with the host.
    External,
}

/// Flags every controller carries.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PullFlags {
    pub(crate) started: bool,
    pub(crate) pulling: bool,
    pub(crate) pull_again: bool,
    pub(crate) close_requested: bool,
}

pub(crate) enum Controller {
    Default(DefaultState),
    Byte(ByteState),
}

/// Algorithms detached from a controller. Dropped only after the arena slot
/// has been released, since dropping a source can release stream handles.
#[derive(Default)]
pub(crate) struct Released {
    _value_source: Option<Rc<dyn UnderlyingSource<DefaultController>>>,
    _byte_source: Option<Rc<dyn UnderlyingSource<ByteController>>>,
    _size: Option<SizeFn>,
}

pub(crate) enum CancelTarget {
    Value(Option<Rc<dyn UnderlyingSource<DefaultController>>>),
    Byte(Option<Rc<dyn UnderlyingSource<ByteController>>>),
    External(ExternalBinding),
}

impl Controller {
    pub(crate) fn kind(&self) -> ControllerKind {
        match self {
            Controller::Default(_) => ControllerKind::Default,
            Controller::Byte(state) if state.is_external() => ControllerKind::External,
            Controller::Byte(_) => ControllerKind::Byte,
        }
    }

    pub(crate) fn flags(&self) -> &PullFlags {
        match self {
            Controller::Default(state) => &state.flags,
            Controller::Byte(state) => &state.flags,
        }
    }

    pub(crate) fn flags_mut(&mut self) -> &mut PullFlags {
        match self {
            Controller::Default(state) => &mut state.flags,
            Controller::Byte(state) => &mut state.flags,
        }
    }

    pub(crate) fn high_water_mark(&self) -> f64 {
        match self {
            Controller::Default(state) => state.high_water_mark,
            Controller::Byte(state) => state.high_water_mark,
        }
    }

    pub(crate) fn queue_total(&self) -> f64 {
        match self {
            Controller::Default(state) => state.queue.total_size(),
            Controller::Byte(state) => state.queue_total(),
        }
    }

    pub(crate) fn source_locked(&self) -> bool {
        match self {
            Controller::Default(_) => false,
            Controller::Byte(state) => state.source_locked(),
        }
    }

    pub(crate) fn external(&self) -> Option<ExternalBinding> {
        match self {
            Controller::Default(_) => None,
            Controller::Byte(state) => state.external_binding(),
        }
    }

    pub(crate) fn clear_algorithms(&mut self) -> Released {
        match self {
            Controller::Default(state) => Released {
                _value_source: state.source.take(),
                _size: state.size.take(),
                ..Released::default()
            },
            Controller::Byte(state) => Released {
                _byte_source: state.take_source(),
                ..Released::default()
            },
        }
    }

    pub(crate) fn reset_queue(&mut self) {
        match self {
            Controller::Default(state) => state.queue.reset(),
            Controller::Byte(state) => state.reset_queue(),
        }
    }

    fn cancel_target(&self) -> CancelTarget {
        match self {
            Controller::Default(state) => CancelTarget::Value(state.source.clone()),
            Controller::Byte(state) => state.cancel_target(),
        }
    }
}

/// `null` when errored, `0` when closed, `highWaterMark - queueTotal` otherwise.
pub(crate) fn desired_size(slot: &StreamSlot) -> Option<f64> {
    match slot.state {
        StreamState::Errored => None,
        StreamState::Closed => Some(0.0),
        StreamState::Readable => {
            Some(slot.controller.high_water_mark() - slot.controller.queue_total())
        }
    }
}

pub(crate) enum PullAction {
    Skip,
    Coalesced,
    Invoke,
}

/// Decides whether the source should be asked for data, and claims the
/// `pulling` flag when it should. A pull requested while one is in flight is
/// remembered in `pull_again` instead of being issued.
pub(crate) fn schedule_pull(slot: &mut StreamSlot) -> PullAction {
    if slot.state != StreamState::Readable {
        return PullAction::Skip;
    }
    let locked_with_requests = slot.pending_reads() > 0;
    let wants_data = desired_size(slot).map_or(false, |desired| desired > 0.0);
    let flags = slot.controller.flags_mut();
    if flags.close_requested || !flags.started {
        return PullAction::Skip;
    }
    if !locked_with_requests && !wants_data {
        return PullAction::Skip;
    }
    if flags.pulling {
        flags.pull_again = true;
        return PullAction::Coalesced;
    }
    flags.pulling = true;
    PullAction::Invoke
}

pub(crate) fn call_pull_if_needed(stream: &StreamRef) {
    match stream.with(|slot| slot.controller.kind()) {
        Some(ControllerKind::Default) => default::call_pull_if_needed(stream),
        Some(ControllerKind::Byte | ControllerKind::External) => {
            byte::call_pull_if_needed(stream)
        }
        None => {}
    }
}

/// Watches a source pull promise: clears `pulling`, re-runs scheduling once
/// if another pull was requested meanwhile, errors the stream on rejection.
pub(crate) fn watch_pull(stream: &StreamRef, pulled: StreamPromise<()>) {
    let on_done = stream.clone();
    let on_error = stream.clone();
    pulled.react(
        move |()| {
            let again = on_done
                .with(|slot| {
                    let flags = slot.controller.flags_mut();
                    flags.pulling = false;
                    std::mem::take(&mut flags.pull_again)
                })
                .unwrap_or(false);
            if again {
                trace!("pull settled with a coalesced request; pulling again");
                call_pull_if_needed(&on_done);
            }
        },
        move |error| error_controller(&on_error, error),
    );
}

/// Marks the controller started once the source's start completes.
pub(crate) fn watch_start(stream: &StreamRef, started: StreamPromise<()>) {
    let on_done = stream.clone();
    let on_error = stream.clone();
    started.react(
        move |()| {
            on_done.with(|slot| slot.controller.flags_mut().started = true);
            call_pull_if_needed(&on_done);
        },
        move |error| error_controller(&on_error, error),
    );
}

/// Resets the queue, drops the algorithms and errors the stream. No-op unless
/// the stream is still readable. An error that cannot enter the stream's
/// domain leaves the stream as it is.
pub(crate) fn error_controller(stream: &StreamRef, error: Value) {
    let error = match stream.adopt(&error) {
        Ok(error) => error,
        Err(err) => {
            warn!("stream error dropped at the boundary: {err}");
            return;
        }
    };
    let released = stream
        .with(|slot| {
            if slot.state != StreamState::Readable {
                return None;
            }
            slot.controller.reset_queue();
            Some(slot.controller.clear_algorithms())
        })
        .flatten();
    if let Some(released) = released {
        drop(released);
        error_stream(stream, error);
    }
}

/// Drops the algorithms and closes the stream.
pub(crate) fn finish_close(stream: &StreamRef) {
    let released = stream.with(|slot| slot.controller.clear_algorithms());
    drop(released);
    close_stream(stream);
}

/// Read dispatch by controller variant.
pub(crate) fn pull_steps(stream: &StreamRef, reader: &Rc<ReaderInner>) -> StreamPromise<ReadResult> {
    match stream.with(|slot| slot.controller.kind()) {
        Some(ControllerKind::Default) => default::pull_steps(stream, reader),
        Some(ControllerKind::Byte | ControllerKind::External) => byte::pull_steps(stream, reader),
        None => reader.rejected(&reader.detached_error()),
    }
}

/// Forwards `reason` to the source after discarding buffered data.
///
/// A rejection from the source's cancel hook is ignored when the source had
/// not finished starting; otherwise it is what the returned promise rejects
/// with.
pub(crate) fn cancel_steps(stream: &StreamRef, reason: Value, realm: &Realm) -> StreamPromise<()> {
    let prepared = stream.with(|slot| {
        slot.controller.reset_queue();
        (slot.controller.cancel_target(), slot.controller.flags().started)
    });
    let Some((target, started)) = prepared else {
        return hook_promise(Ok(None), realm.tasks());
    };

    let result: HookResult = match target {
        CancelTarget::Value(Some(source)) => source.cancel(reason),
        CancelTarget::Byte(Some(source)) => source.cancel(reason),
        CancelTarget::Value(None) | CancelTarget::Byte(None) => Ok(None),
        CancelTarget::External(binding) => {
            let controller = ByteController::new(stream.clone());
            binding
                .host
                .cancel(&controller, &binding.source, binding.flags, reason)
        }
    };
    let released = stream.with(|slot| slot.controller.clear_algorithms());
    drop(released);

    let canceled = hook_promise(result, realm.tasks());
    if started {
        return canceled;
    }
    canceled.then(
        |()| Ok(()),
        |error| {
            debug!("ignoring cancel rejection from a source that never started: {error:?}");
            Ok(())
        },
    )
}
