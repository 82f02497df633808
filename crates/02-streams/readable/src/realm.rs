//! Execution realm: one isolation domain, one task queue, one stream arena.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use log::debug;
use microtask::{Promise, TaskQueue};
use slab::Slab;

use crate::boundary::Domain;
use crate::config::RealmConfig;
use crate::controller::Controller;
use crate::stream::{ReadableStream, StreamKey, StreamSlot, StreamState};
use crate::value::{ErrorName, Value};
use crate::StreamPromise;

pub(crate) struct RealmShared {
    pub(crate) domain: Domain,
    pub(crate) tasks: TaskQueue,
    pub(crate) config: RealmConfig,
    pub(crate) streams: RefCell<Slab<StreamSlot>>,
    next_generation: Cell<u32>,
}

/// Handle to an execution realm. Cheap to clone.
///
/// Streams created in a realm live in its arena and schedule every reaction
/// on its task queue. Nothing runs until the queue is driven with
/// [`run_until_idle`](Realm::run_until_idle) or [`block_on`](Realm::block_on).
#[derive(Clone)]
pub struct Realm {
    shared: Rc<RealmShared>,
}

impl Realm {
    /// Creates a realm with a fresh isolation domain labelled after
    /// `config.label` and an empty task queue.
    pub fn new(config: RealmConfig) -> Self {
        let domain = Domain::new(config.label.clone());
        let tasks = TaskQueue::new(config.label.clone());
        debug!("realm '{}' created as {}", config.label, domain.id());
        Self {
            shared: Rc::new(RealmShared {
                domain,
                tasks,
                config,
                streams: RefCell::new(Slab::new()),
                next_generation: Cell::new(0),
            }),
        }
    }

    /// Domain every object homed in this realm belongs to.
    pub fn domain(&self) -> &Domain {
        &self.shared.domain
    }

    /// Queue that runs this realm's promise reactions.
    pub fn tasks(&self) -> &TaskQueue {
        &self.shared.tasks
    }

    /// Settings the realm was created with.
    pub fn config(&self) -> &RealmConfig {
        &self.shared.config
    }

    /// Diagnostic label, shared with the domain.
    pub fn label(&self) -> &str {
        &self.shared.config.label
    }

    /// Runs queued tasks until none remain. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        self.shared.tasks.run_until_idle()
    }

    /// Drives `fut` to completion, draining the queue between polls. `None`
    /// if the queue went idle with the future still pending.
    pub fn block_on<F: Future>(&self, fut: F) -> Option<F::Output> {
        self.shared.tasks.block_on(fut)
    }

    /// Forced abort: the domain stops accepting values. Promises whose
    /// settlement would cross into it are left pending.
    pub fn shutdown(&self) {
        debug!("realm '{}' shut down", self.label());
        self.shared.domain.shutdown();
    }

    pub fn is_alive(&self) -> bool {
        self.shared.domain.is_alive()
    }

    /// Number of stream slots currently held by the arena.
    pub fn live_streams(&self) -> usize {
        self.shared.streams.borrow().len()
    }

    /// Error object homed in this realm.
    pub fn error(&self, name: ErrorName, message: impl Into<String>) -> Value {
        Value::error(&self.shared.domain, name, message)
    }

    /// List object homed in this realm.
    pub fn list(&self, items: Vec<Value>) -> Value {
        Value::list(&self.shared.domain, items)
    }

    /// Fresh pending promise on this realm's queue.
    pub fn promise<T: Clone + 'static>(&self) -> StreamPromise<T> {
        Promise::new(&self.shared.tasks)
    }

    pub fn same(&self, other: &Realm) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn downgrade(&self) -> Weak<RealmShared> {
        Rc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Rc<RealmShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &RealmShared {
        &self.shared
    }

    /// Allocates a readable slot owning `controller` and returns the first
    /// public handle to it.
    pub(crate) fn insert_stream(&self, controller: Controller) -> ReadableStream {
        let generation = self.shared.next_generation.get().wrapping_add(1);
        self.shared.next_generation.set(generation);
        let index = self.shared.streams.borrow_mut().insert(StreamSlot {
            generation,
            handles: 1,
            state: StreamState::Readable,
            disturbed: false,
            stored_error: None,
            reader: None,
            controller,
        });
        ReadableStream::attach(self.clone(), StreamKey { index, generation })
    }
}

impl Default for Realm {
    fn default() -> Self {
        Self::new(RealmConfig::default())
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("label", &self.label())
            .field("domain", &self.shared.domain.id())
            .field("alive", &self.is_alive())
            .field("pending_tasks", &self.shared.tasks.len())
            .finish()
    }
}
