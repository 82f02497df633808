use std::cell::Cell;
use std::rc::Rc;

use log::{debug, trace};
use readable::{
    DefaultController, ErrorName, HookResult, Realm, StreamPromise, UnderlyingSource, Value,
};

use crate::config::ScenarioKind;
use crate::stats::StatsSink;
use crate::{chunk_value, FAILURE_MESSAGE};

/// Underlying source that follows a [`ScenarioKind`] script and records what
/// the controller asked of it.
///
/// Pulls complete on a later task, so a controller that invoked `pull` again
/// before the previous one settled shows up in `overlapping_pulls`.
pub struct ScriptedSource<S> {
    realm: Realm,
    kind: ScenarioKind,
    stats: S,
    next: Cell<u32>,
    bursts_done: Cell<u32>,
    in_flight: Rc<Cell<bool>>,
}

impl<S: StatsSink> ScriptedSource<S> {
    pub fn new(realm: &Realm, kind: ScenarioKind, stats: S) -> Rc<Self> {
        Rc::new(Self {
            realm: realm.clone(),
            kind,
            stats,
            next: Cell::new(0),
            bursts_done: Cell::new(0),
            in_flight: Rc::new(Cell::new(false)),
        })
    }

    pub fn kind(&self) -> ScenarioKind {
        self.kind
    }

    pub fn produced(&self) -> u32 {
        self.next.get()
    }

    fn emit(&self, controller: &DefaultController) -> Result<(), Value> {
        let index = self.next.get();
        controller
            .enqueue(chunk_value(index))
            .map_err(|err| err.to_value(self.realm.domain()))?;
        self.next.set(index.wrapping_add(1));
        let queued = u32::try_from(controller.queued()).unwrap_or(u32::MAX);
        self.stats.with_stats(|stats| {
            stats.produced = stats.produced.wrapping_add(1);
            stats.max_queued = stats.max_queued.max(queued);
        });
        Ok(())
    }

    fn close(&self, controller: &DefaultController) -> Result<(), Value> {
        controller
            .close()
            .map_err(|err| err.to_value(self.realm.domain()))
    }

    fn produce(&self, controller: &DefaultController) -> Result<(), Value> {
        match self.kind {
            // Closed during start.
            ScenarioKind::Flood { .. } => {}
            ScenarioKind::Burst { bursts, burst_size } => {
                if self.bursts_done.get() < bursts {
                    for _ in 0..burst_size {
                        self.emit(controller)?;
                    }
                    self.bursts_done.set(self.bursts_done.get() + 1);
                }
                if self.bursts_done.get() >= bursts {
                    self.close(controller)?;
                }
            }
            ScenarioKind::Backpressure { chunks, .. } => {
                if self.next.get() < chunks {
                    self.emit(controller)?;
                    if controller.desired_size().is_some_and(|size| size <= 0.0) {
                        self.stats.with_stats(|stats| {
                            stats.backpressure_stops = stats.backpressure_stops.wrapping_add(1);
                        });
                    }
                }
                if self.next.get() >= chunks {
                    self.close(controller)?;
                }
            }
            ScenarioKind::Failing { after } => {
                if self.next.get() < after {
                    self.emit(controller)?;
                } else {
                    debug!("scripted source failing after {after} chunks");
                    controller.error(self.realm.error(ErrorName::Error, FAILURE_MESSAGE));
                }
            }
        }
        Ok(())
    }

    fn finish_later(&self) -> StreamPromise<()> {
        let promise: StreamPromise<()> = self.realm.promise();
        let settle = promise.clone();
        let in_flight = Rc::clone(&self.in_flight);
        self.realm.tasks().enqueue(move || {
            in_flight.set(false);
            settle.resolve(());
        });
        promise
    }
}

impl<S: StatsSink> UnderlyingSource for ScriptedSource<S> {
    fn start(&self, controller: &DefaultController) -> HookResult {
        if let ScenarioKind::Flood { chunk_count } = self.kind {
            for _ in 0..chunk_count {
                self.emit(controller)?;
            }
            self.close(controller)?;
            debug!("flood source enqueued {chunk_count} chunks during start");
        }
        Ok(None)
    }

    fn pull(&self, controller: &DefaultController) -> HookResult {
        let overlapped = self.in_flight.replace(true);
        self.stats.with_stats(|stats| {
            stats.pulls = stats.pulls.wrapping_add(1);
            if overlapped {
                stats.overlapping_pulls = stats.overlapping_pulls.wrapping_add(1);
            }
        });
        trace!("scripted pull #{} ({:?})", self.stats.snapshot().pulls, self.kind);
        if let Err(thrown) = self.produce(controller) {
            self.in_flight.set(false);
            return Err(thrown);
        }
        Ok(Some(self.finish_later()))
    }

    fn cancel(&self, reason: Value) -> HookResult {
        debug!("scripted source canceled: {reason:?}");
        self.stats.with_stats(|stats| stats.cancels = stats.cancels.wrapping_add(1));
        Ok(None)
    }
}
