//! Producer-side capability sets.

use std::any::Any;
use std::rc::Rc;

use microtask::{Promise, TaskQueue};

use crate::controller::{ByteController, DefaultController};
use crate::value::Value;
use crate::StreamPromise;

/// Result of a source hook: `Err` is a synchronous throw, `Ok(Some(p))` an
/// asynchronous completion, `Ok(None)` immediate success.
pub type HookResult = Result<Option<StreamPromise<()>>, Value>;

/// Callbacks supplied by a producer at stream construction.
///
/// `C` is the controller handed to the hooks: [`DefaultController`] for value
/// streams, [`ByteController`] for byte streams. Hooks take `&self`; sources
/// keep their own state in cells.
pub trait UnderlyingSource<C = DefaultController> {
    /// Runs once, synchronously, during construction. May enqueue, close or
    /// error before returning.
    fn start(&self, _controller: &C) -> HookResult {
        Ok(None)
    }

    /// Asked for more data. Never invoked again while a returned promise is
    /// still pending.
    fn pull(&self, _controller: &C) -> HookResult {
        Ok(None)
    }

    /// The consumer canceled the stream with `reason`.
    fn cancel(&self, _reason: Value) -> HookResult {
        Ok(None)
    }
}

/// Opaque host-side source object for external byte streams.
pub type ExternalSource = Rc<dyn Any>;

/// Host callback set for byte streams whose buffer lives with the host.
///
/// Installed once per realm through [`RealmConfig`](crate::RealmConfig).
pub trait ExternalSourceHost {
    /// The stream wants up to `desired_size` more bytes. The host answers
    /// later through [`ByteController::update_data_available`].
    fn request_data(
        &self,
        controller: &ByteController,
        source: &ExternalSource,
        flags: u32,
        desired_size: f64,
    );

    /// Copies available bytes into `buffer`, returning how many were written.
    fn write_into_buffer(
        &self,
        controller: &ByteController,
        source: &ExternalSource,
        flags: u32,
        buffer: &mut [u8],
    ) -> usize;

    /// The consumer canceled the stream.
    fn cancel(
        &self,
        controller: &ByteController,
        source: &ExternalSource,
        flags: u32,
        reason: Value,
    ) -> HookResult;

    fn closed_notify(&self, _controller: &ByteController, _source: &ExternalSource, _flags: u32) {}

    fn errored_notify(
        &self,
        _controller: &ByteController,
        _source: &ExternalSource,
        _flags: u32,
        _error: &Value,
    ) {
    }

    /// The stream was disposed; the host may release `source`.
    fn finalize(&self, _source: &ExternalSource, _flags: u32) {}
}

/// Normalizes a hook result into a promise whose reactions run on `tasks`.
pub(crate) fn hook_promise(result: HookResult, tasks: &TaskQueue) -> StreamPromise<()> {
    match result {
        Ok(None) => Promise::resolved(tasks, ()),
        Ok(Some(promise)) if promise.queue().same_queue(tasks) => promise,
        Ok(Some(promise)) => {
            let local = Promise::new(tasks);
            local.follow(&promise);
            local
        }
        Err(thrown) => Promise::rejected(tasks, thrown),
    }
}
