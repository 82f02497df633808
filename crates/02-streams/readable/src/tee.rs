//! Tee: two branches fed by one shared upstream reader.
//!
//! The coordinator state is owned by the two branch sources. Reactions on
//! upstream promises only hold it weakly, so once both branches are gone the
//! coordinator and its upstream reader are released.

use std::cell::RefCell;
use std::mem;
use std::rc::{Rc, Weak};

use log::{debug, trace};
use smallvec::SmallVec;

use crate::controller::DefaultController;
use crate::error::StreamResult;
use crate::reader::{DefaultReader, ReadResult};
use crate::realm::Realm;
use crate::source::{HookResult, UnderlyingSource};
use crate::strategy::QueuingStrategy;
use crate::stream::{ReadableStream, StreamRef};
use crate::value::Value;
use crate::StreamPromise;

struct TeeState {
    reader: DefaultReader,
    realm: Realm,
    clone_for_branch2: bool,
    reading: bool,
    read_again: bool,
    closed_or_errored: bool,
    canceled: [bool; 2],
    reasons: [Value; 2],
    branches: [Option<StreamRef>; 2],
    cancel_promise: StreamPromise<()>,
}

impl TeeState {
    fn live_branches(&self) -> SmallVec<[StreamRef; 2]> {
        self.branches
            .iter()
            .zip(self.canceled)
            .filter(|(_, canceled)| !canceled)
            .filter_map(|(branch, _)| branch.clone())
            .collect()
    }
}

type Shared = Rc<RefCell<TeeState>>;

struct TeeBranch {
    state: Shared,
    index: usize,
}

impl UnderlyingSource for TeeBranch {
    fn pull(&self, _controller: &DefaultController) -> HookResult {
        pull(&self.state);
        Ok(None)
    }

    fn cancel(&self, reason: Value) -> HookResult {
        Ok(Some(cancel_branch(&self.state, self.index, reason)))
    }
}

pub(crate) fn tee(
    stream: &ReadableStream,
    clone_for_branch2: bool,
) -> StreamResult<(ReadableStream, ReadableStream)> {
    let reader = stream.get_reader()?;
    let realm = stream.realm().clone();
    let closed = reader.closed();
    let state = Rc::new(RefCell::new(TeeState {
        reader,
        realm: realm.clone(),
        clone_for_branch2,
        reading: false,
        read_again: false,
        closed_or_errored: false,
        canceled: [false; 2],
        reasons: [Value::Undefined, Value::Undefined],
        branches: [None, None],
        cancel_promise: realm.promise(),
    }));

    let branch = |index| TeeBranch {
        state: Rc::clone(&state),
        index,
    };
    let first = ReadableStream::new(&realm, branch(0), QueuingStrategy::default());
    let second = ReadableStream::new(&realm, branch(1), QueuingStrategy::default());
    state.borrow_mut().branches = [Some(first.stream_ref()), Some(second.stream_ref())];

    let on_close = Rc::downgrade(&state);
    let on_error = Rc::downgrade(&state);
    closed.react(
        move |()| upstream_closed(&on_close),
        move |error| upstream_errored(&on_error, error),
    );
    debug!("stream teed (clone_for_branch2 = {clone_for_branch2})");
    Ok((first, second))
}

/// Issues one upstream read, or remembers that another is wanted.
fn pull(tee: &Shared) {
    let reader = {
        let mut state = tee.borrow_mut();
        if state.closed_or_errored {
            return;
        }
        if state.reading {
            state.read_again = true;
            return;
        }
        state.reading = true;
        state.reader.clone()
    };
    let read = match reader.read() {
        Ok(read) => read,
        Err(err) => {
            debug!("tee upstream read refused: {err}");
            tee.borrow_mut().reading = false;
            return;
        }
    };
    trace!("tee reading upstream");
    let on_chunk = Rc::downgrade(tee);
    let on_error = Rc::downgrade(tee);
    read.react(
        move |result| {
            if let Some(tee) = on_chunk.upgrade() {
                forward(&tee, result);
            }
        },
        // Branches are errored through the closed promise.
        move |_error| {
            if let Some(tee) = on_error.upgrade() {
                tee.borrow_mut().reading = false;
            }
        },
    );
}

fn forward(tee: &Shared, result: ReadResult) {
    if result.done {
        tee.borrow_mut().reading = false;
        close_branches(tee);
        return;
    }

    let (branches, canceled, clone, domain) = {
        let mut state = tee.borrow_mut();
        state.read_again = false;
        (
            state.branches.clone(),
            state.canceled,
            state.clone_for_branch2,
            state.realm.domain().clone(),
        )
    };
    let first = result.value;
    let mut second = first.clone();
    if clone && !canceled[1] {
        match first.structured_clone(&domain) {
            Ok(cloned) => second = cloned,
            Err(clone_error) => {
                clone_failed(tee, &branches, clone_error);
                return;
            }
        }
    }
    for (index, chunk) in [first, second].into_iter().enumerate() {
        if canceled[index] {
            continue;
        }
        if let Some(branch) = &branches[index] {
            if let Err(err) = DefaultController::new(branch.clone()).enqueue(chunk) {
                trace!("tee branch {index} dropped a chunk: {err}");
            }
        }
    }

    let again = {
        let mut state = tee.borrow_mut();
        state.reading = false;
        mem::take(&mut state.read_again)
    };
    if again {
        pull(tee);
    }
}

fn clone_failed(tee: &Shared, branches: &[Option<StreamRef>; 2], error: Value) {
    debug!("tee clone failed; erroring both branches");
    for branch in branches.iter().flatten() {
        DefaultController::new(branch.clone()).error(error.clone());
    }
    let (reader, cancel_promise) = {
        let mut state = tee.borrow_mut();
        state.closed_or_errored = true;
        (state.reader.clone(), state.cancel_promise.clone())
    };
    match reader.cancel(error) {
        Ok(canceled) => cancel_promise.follow(&canceled),
        Err(err) => {
            let reason = err.to_value(reader.realm().domain());
            cancel_promise.reject(reason);
        }
    }
}

/// Closes every branch not individually canceled and resolves the shared
/// cancel promise unless both branches were canceled.
fn close_branches(tee: &Shared) {
    let (live, settle) = {
        let mut state = tee.borrow_mut();
        state.closed_or_errored = true;
        (
            state.live_branches(),
            (!state.canceled.iter().all(|c| *c)).then(|| state.cancel_promise.clone()),
        )
    };
    for branch in live {
        // Already closed through the read path is fine.
        let _ = DefaultController::new(branch).close();
    }
    if let Some(cancel_promise) = settle {
        cancel_promise.resolve(());
    }
}

fn upstream_closed(tee: &Weak<RefCell<TeeState>>) {
    if let Some(tee) = tee.upgrade() {
        close_branches(&tee);
    }
}

fn upstream_errored(tee: &Weak<RefCell<TeeState>>, error: Value) {
    let Some(tee) = tee.upgrade() else {
        return;
    };
    let (branches, settle) = {
        let mut state = tee.borrow_mut();
        state.closed_or_errored = true;
        (
            state.branches.clone(),
            (!state.canceled.iter().all(|c| *c)).then(|| state.cancel_promise.clone()),
        )
    };
    debug!("tee upstream errored: {error:?}");
    for branch in branches.iter().flatten() {
        DefaultController::new(branch.clone()).error(error.clone());
    }
    if let Some(cancel_promise) = settle {
        cancel_promise.resolve(());
    }
}

/// Records a branch cancel. The second one forwards both reasons, in branch
/// order, as a single upstream cancel.
fn cancel_branch(tee: &Shared, index: usize, reason: Value) -> StreamPromise<()> {
    let (composite, reader, cancel_promise) = {
        let mut state = tee.borrow_mut();
        state.canceled[index] = true;
        state.reasons[index] = reason;
        let composite = state.canceled[1 - index].then(|| {
            let reasons = state.reasons.to_vec();
            state.realm.list(reasons)
        });
        (composite, state.reader.clone(), state.cancel_promise.clone())
    };
    let Some(composite) = composite else {
        return cancel_promise;
    };
    debug!("both tee branches canceled; canceling upstream");
    match reader.cancel(composite) {
        Ok(canceled) => cancel_promise.follow(&canceled),
        Err(err) => {
            cancel_promise.reject(err.to_value(reader.realm().domain()));
        }
    }
    cancel_promise
}
