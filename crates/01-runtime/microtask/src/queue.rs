//! Cooperative task queue.
//!
//! Continuations are appended in settlement order and executed strictly FIFO.
//! A task may enqueue further tasks; those run in the same `run_until_idle`
//! call but never before tasks that were already queued.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::pin_mut;
use futures::task::noop_waker_ref;
use log::trace;

type Task = Box<dyn FnOnce()>;

/// Shared handle to a single-threaded continuation queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Rc<QueueInner>,
}

struct QueueInner {
    label: String,
    tasks: RefCell<VecDeque<Task>>,
    executed: Cell<u64>,
}

impl TaskQueue {
    /// Creates an empty queue tagged with `label` for diagnostics.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(QueueInner {
                label: label.into(),
                tasks: RefCell::new(VecDeque::new()),
                executed: Cell::new(0),
            }),
        }
    }

    /// Diagnostic label supplied at construction.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Appends a continuation to the back of the queue.
    pub fn enqueue(&self, task: impl FnOnce() + 'static) {
        self.inner.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Number of continuations waiting to run.
    pub fn len(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Returns `true` when no continuation is waiting.
    pub fn is_idle(&self) -> bool {
        self.inner.tasks.borrow().is_empty()
    }

    /// Total number of continuations executed since construction.
    pub fn executed(&self) -> u64 {
        self.inner.executed.get()
    }

    /// Returns `true` if both handles refer to the same queue.
    pub fn same_queue(&self, other: &TaskQueue) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs the continuations that were queued when the tick started.
    ///
    /// Tasks enqueued while the tick runs are left for the next tick.
    pub fn run_tick(&self) -> usize {
        let batch = self.len();
        let mut work = 0;
        for _ in 0..batch {
            // The borrow must end before the task runs: tasks enqueue more tasks.
            let task = self.inner.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    work += 1;
                }
                None => break,
            }
        }
        self.inner
            .executed
            .set(self.inner.executed.get() + work as u64);
        work
    }

    /// Runs ticks until the queue is empty. Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut work = 0;
        loop {
            let ran = self.run_tick();
            if ran == 0 {
                break;
            }
            work += ran;
        }
        work
    }

    /// Drives `fut` to completion, draining the queue between polls.
    ///
    /// Returns `None` when the future is still pending and the queue has no
    /// work left that could make progress.
    pub fn block_on<F: Future>(&self, fut: F) -> Option<F::Output> {
        pin_mut!(fut);
        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                return Some(out);
            }
            if self.run_until_idle() == 0 {
                trace!("queue '{}' stalled with a pending future", self.label());
                return None;
            }
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("label", &self.inner.label)
            .field("pending", &self.len())
            .field("executed", &self.executed())
            .finish()
    }
}
