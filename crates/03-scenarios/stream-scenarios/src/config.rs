use readable::{QueuingStrategy, StreamResult};
use serde::{Deserialize, Serialize};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioType {
    Flood = 0,
    Burst = 1,
    Backpressure = 2,
    Failing = 3,
}

impl ScenarioType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ScenarioType::Flood),
            1 => Some(ScenarioType::Burst),
            2 => Some(ScenarioType::Backpressure),
            3 => Some(ScenarioType::Failing),
            _ => None,
        }
    }
}

/// Flat, serializable scenario description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfig {
    pub test_type: u32,
    pub param1: u32,
    pub param2: u32,
}

impl TestConfig {
    pub fn flood(chunk_count: u32) -> Self {
        Self {
            test_type: ScenarioType::Flood as u32,
            param1: chunk_count,
            param2: 0,
        }
    }

    pub fn burst(bursts: u32, burst_size: u32) -> Self {
        Self {
            test_type: ScenarioType::Burst as u32,
            param1: bursts,
            param2: burst_size,
        }
    }

    pub fn backpressure(chunks: u32, high_water_mark: u32) -> Self {
        Self {
            test_type: ScenarioType::Backpressure as u32,
            param1: chunks,
            param2: high_water_mark,
        }
    }

    pub fn failing(after: u32) -> Self {
        Self {
            test_type: ScenarioType::Failing as u32,
            param1: after,
            param2: 0,
        }
    }

    pub fn scenario_kind(&self) -> Option<ScenarioKind> {
        let ty = ScenarioType::from_u32(self.test_type)?;
        Some(match ty {
            ScenarioType::Flood => ScenarioKind::Flood {
                chunk_count: self.param1,
            },
            ScenarioType::Burst => ScenarioKind::Burst {
                bursts: self.param1,
                burst_size: self.param2,
            },
            ScenarioType::Backpressure => ScenarioKind::Backpressure {
                chunks: self.param1,
                high_water_mark: self.param2,
            },
            ScenarioType::Failing => ScenarioKind::Failing { after: self.param1 },
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Everything is enqueued during start, regardless of demand.
    Flood { chunk_count: u32 },
    /// Each pull enqueues `burst_size` chunks.
    Burst { bursts: u32, burst_size: u32 },
    /// Each pull enqueues one chunk; the queue never grows past the mark.
    Backpressure { chunks: u32, high_water_mark: u32 },
    /// Produces `after` chunks on demand, then errors the stream.
    Failing { after: u32 },
}

impl ScenarioKind {
    /// Total chunks the source will produce.
    pub fn expected_chunks(&self) -> u32 {
        match *self {
            ScenarioKind::Flood { chunk_count } => chunk_count,
            ScenarioKind::Burst { bursts, burst_size } => bursts.saturating_mul(burst_size),
            ScenarioKind::Backpressure { chunks, .. } => chunks,
            ScenarioKind::Failing { after } => after,
        }
    }

    pub fn strategy(&self) -> StreamResult<QueuingStrategy> {
        let high_water_mark = match *self {
            ScenarioKind::Flood { .. } | ScenarioKind::Failing { .. } => 1,
            ScenarioKind::Burst { burst_size, .. } => burst_size,
            ScenarioKind::Backpressure {
                high_water_mark, ..
            } => high_water_mark,
        };
        QueuingStrategy::count(f64::from(high_water_mark))
    }
}
