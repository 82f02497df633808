use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use readable::{
    DefaultController, HookResult, QueuingStrategy, ReadableStream, Realm, StreamPromise,
    StreamResult, UnderlyingSource, Value,
};
use stream_scenarios::CheckResult;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Engine errors hold `Rc`-backed values, so they are flattened to text
/// before entering `anyhow`.
pub trait Checked<T> {
    fn checked(self) -> Result<T>;
}

impl<T> Checked<T> for StreamResult<T> {
    fn checked(self) -> Result<T> {
        self.map_err(|err| anyhow!("{err}"))
    }
}

impl Checked<()> for CheckResult {
    fn checked(self) -> Result<()> {
        self.map_err(|msg| anyhow!(msg))
    }
}

/// Drives `realm` until `promise` settles.
pub fn settle<T: Clone + 'static>(
    realm: &Realm,
    promise: StreamPromise<T>,
) -> Result<std::result::Result<T, Value>> {
    realm.block_on(promise).context("promise never settled")
}

/// Enqueues everything and closes during start.
pub struct Eager(Vec<Value>);

impl Eager {
    pub fn new(chunks: Vec<Value>) -> Self {
        Self(chunks)
    }
}

impl UnderlyingSource for Eager {
    fn start(&self, controller: &DefaultController) -> HookResult {
        for chunk in &self.0 {
            controller.enqueue(chunk.clone()).map_err(|err| Value::from(err.to_string()))?;
        }
        controller.close().map_err(|err| Value::from(err.to_string()))?;
        Ok(None)
    }
}

/// Hands its controller to the test and records cancel reasons.
#[derive(Default)]
pub struct Pusher {
    controller: RefCell<Option<DefaultController>>,
    pub pulls: Cell<usize>,
    pub reasons: RefCell<Vec<Value>>,
}

impl UnderlyingSource for Pusher {
    fn start(&self, controller: &DefaultController) -> HookResult {
        *self.controller.borrow_mut() = Some(controller.clone());
        Ok(None)
    }

    fn pull(&self, _controller: &DefaultController) -> HookResult {
        self.pulls.set(self.pulls.get() + 1);
        Ok(None)
    }

    fn cancel(&self, reason: Value) -> HookResult {
        self.reasons.borrow_mut().push(reason);
        Ok(None)
    }
}

impl Pusher {
    pub fn controller(&self) -> Result<DefaultController> {
        self.controller.borrow().clone().context("source never started")
    }
}

pub fn pushed(realm: &Realm) -> (Rc<Pusher>, ReadableStream) {
    let source = Rc::new(Pusher::default());
    let stream = ReadableStream::from_source(realm, source.clone(), QueuingStrategy::default());
    realm.run_until_idle();
    (source, stream)
}
