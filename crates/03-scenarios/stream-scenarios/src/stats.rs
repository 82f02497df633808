use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ScenarioStats {
    pub produced: u32,
    pub pulls: u32,
    pub overlapping_pulls: u32,
    pub max_queued: u32,
    pub backpressure_stops: u32,
    pub cancels: u32,
}

impl ScenarioStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub trait StatsSink: Clone + 'static {
    fn with_stats<R>(&self, f: impl FnOnce(&mut ScenarioStats) -> R) -> R;

    fn snapshot(&self) -> ScenarioStats {
        self.with_stats(|stats| *stats)
    }
}

#[derive(Clone, Default, Debug)]
pub struct SharedStats(pub Rc<RefCell<ScenarioStats>>);

impl SharedStats {
    pub fn new(stats: Rc<RefCell<ScenarioStats>>) -> Self {
        Self(stats)
    }
}

impl StatsSink for SharedStats {
    fn with_stats<R>(&self, f: impl FnOnce(&mut ScenarioStats) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}
