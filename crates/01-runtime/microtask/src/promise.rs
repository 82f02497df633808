//! Settle-once promises with queued reactions.
//!
//! A promise is fulfilled or rejected at most once. Reactions registered
//! before settlement are scheduled on the promise's [`TaskQueue`] in
//! registration order when it settles; reactions registered afterwards are
//! scheduled immediately. Reactions never run synchronously inside
//! `resolve`/`reject`.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use smallvec::SmallVec;

use crate::queue::TaskQueue;

type Reaction<T, E> = Box<dyn FnOnce(Result<T, E>)>;

/// Observable state of a [`Promise`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromiseState {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Fulfilled,
    /// Settled with an error.
    Rejected,
}

enum Settlement<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    settlement: Settlement<T, E>,
    reactions: SmallVec<[Reaction<T, E>; 2]>,
    wakers: SmallVec<[Waker; 1]>,
}

/// Shared handle to a settle-once result.
pub struct Promise<T, E> {
    queue: TaskQueue,
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Creates a pending promise whose reactions run on `queue`.
    pub fn new(queue: &TaskQueue) -> Self {
        Self {
            queue: queue.clone(),
            inner: Rc::new(RefCell::new(Inner {
                settlement: Settlement::Pending,
                reactions: SmallVec::new(),
                wakers: SmallVec::new(),
            })),
        }
    }

    /// Creates a promise already fulfilled with `value`.
    pub fn resolved(queue: &TaskQueue, value: T) -> Self {
        let promise = Self::new(queue);
        promise.resolve(value);
        promise
    }

    /// Creates a promise already rejected with `error`.
    pub fn rejected(queue: &TaskQueue, error: E) -> Self {
        let promise = Self::new(queue);
        promise.reject(error);
        promise
    }

    /// Fulfills the promise. Returns `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Rejects the promise. Returns `false` if it was already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    /// Settles with `outcome`. Returns `false` if it was already settled.
    pub fn settle(&self, outcome: Result<T, E>) -> bool {
        let (reactions, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.settlement, Settlement::Pending) {
                return false;
            }
            inner.settlement = match &outcome {
                Ok(value) => Settlement::Fulfilled(value.clone()),
                Err(error) => Settlement::Rejected(error.clone()),
            };
            (
                mem::take(&mut inner.reactions),
                mem::take(&mut inner.wakers),
            )
        };
        for reaction in reactions {
            let outcome = outcome.clone();
            self.queue.enqueue(move || reaction(outcome));
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Settles this promise with whatever `other` settles with.
    pub fn follow(&self, other: &Promise<T, E>) {
        let this = self.clone();
        other.upon(move |outcome| {
            this.settle(outcome);
        });
    }

    /// Current state.
    pub fn state(&self) -> PromiseState {
        match self.inner.borrow().settlement {
            Settlement::Pending => PromiseState::Pending,
            Settlement::Fulfilled(_) => PromiseState::Fulfilled,
            Settlement::Rejected(_) => PromiseState::Rejected,
        }
    }

    /// Returns `true` while unsettled.
    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// Settled outcome, if any.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().settlement {
            Settlement::Pending => None,
            Settlement::Fulfilled(value) => Some(Ok(value.clone())),
            Settlement::Rejected(error) => Some(Err(error.clone())),
        }
    }

    /// Fulfillment value, if fulfilled.
    pub fn value(&self) -> Option<T> {
        self.outcome().and_then(Result::ok)
    }

    /// Rejection reason, if rejected.
    pub fn error(&self) -> Option<E> {
        self.outcome().and_then(Result::err)
    }

    /// Registers a reaction receiving the settled outcome.
    pub fn upon(&self, reaction: impl FnOnce(Result<T, E>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        let outcome = match &inner.settlement {
            Settlement::Pending => {
                inner.reactions.push(Box::new(reaction));
                return;
            }
            Settlement::Fulfilled(value) => Ok(value.clone()),
            Settlement::Rejected(error) => Err(error.clone()),
        };
        drop(inner);
        self.queue.enqueue(move || reaction(outcome));
    }

    /// Registers separate fulfillment and rejection reactions.
    pub fn react(
        &self,
        on_fulfilled: impl FnOnce(T) + 'static,
        on_rejected: impl FnOnce(E) + 'static,
    ) {
        self.upon(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value),
            Err(error) => on_rejected(error),
        });
    }

    /// Chains a derived promise settled by whichever handler runs.
    pub fn then<U>(
        &self,
        on_fulfilled: impl FnOnce(T) -> Result<U, E> + 'static,
        on_rejected: impl FnOnce(E) -> Result<U, E> + 'static,
    ) -> Promise<U, E>
    where
        U: Clone + 'static,
    {
        let derived = Promise::new(&self.queue);
        let out = derived.clone();
        self.upon(move |outcome| {
            let next = match outcome {
                Ok(value) => on_fulfilled(value),
                Err(error) => on_rejected(error),
            };
            out.settle(next);
        });
        derived
    }

    /// Maps the fulfillment value, passing rejections through.
    pub fn map<U>(&self, f: impl FnOnce(T) -> U + 'static) -> Promise<U, E>
    where
        U: Clone + 'static,
    {
        self.then(move |value| Ok(f(value)), Err)
    }

    /// Queue on which this promise schedules reactions.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Returns `true` if both handles refer to the same promise.
    pub fn same(&self, other: &Promise<T, E>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T, E> Future for Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.settlement {
            Settlement::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            Settlement::Rejected(error) => Poll::Ready(Err(error.clone())),
            Settlement::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.borrow().settlement {
            Settlement::Pending => PromiseState::Pending,
            Settlement::Fulfilled(_) => PromiseState::Fulfilled,
            Settlement::Rejected(_) => PromiseState::Rejected,
        };
        f.debug_struct("Promise")
            .field("queue", &self.queue.label())
            .field("state", &state)
            .finish()
    }
}
