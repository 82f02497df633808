//! Queuing strategies: high-water mark plus chunk size function.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};
use crate::value::Value;

/// Default high-water mark for value streams.
pub const DEFAULT_HIGH_WATER_MARK: f64 = 1.0;
/// Default high-water mark for byte streams.
pub const DEFAULT_BYTE_HIGH_WATER_MARK: f64 = 0.0;

/// Size function: `Err` carries the thrown value.
pub type SizeFn = Rc<dyn Fn(&Value) -> Result<f64, Value>>;

/// Validates a high-water mark: non-negative and not NaN. Infinity is allowed.
pub fn validate_high_water_mark(high_water_mark: f64) -> StreamResult<f64> {
    if high_water_mark.is_nan() || high_water_mark < 0.0 {
        return Err(StreamError::InvalidHighWaterMark(high_water_mark));
    }
    Ok(high_water_mark)
}

/// Validated strategy used by value streams.
#[derive(Clone)]
pub struct QueuingStrategy {
    high_water_mark: f64,
    size: Option<SizeFn>,
}

impl QueuingStrategy {
    /// Every chunk counts as 1.
    pub fn count(high_water_mark: f64) -> StreamResult<Self> {
        Ok(Self {
            high_water_mark: validate_high_water_mark(high_water_mark)?,
            size: None,
        })
    }

    /// Chunks are charged by byte length. Non-byte chunks measure as NaN and
    /// are rejected at enqueue time.
    pub fn byte_length(high_water_mark: f64) -> StreamResult<Self> {
        Self::custom(high_water_mark, |chunk: &Value| {
            Ok(match chunk {
                Value::Bytes(bytes) => bytes.len() as f64,
                Value::String(s) => s.len() as f64,
                _ => f64::NAN,
            })
        })
    }

    /// Caller-supplied size function.
    pub fn custom(
        high_water_mark: f64,
        size: impl Fn(&Value) -> Result<f64, Value> + 'static,
    ) -> StreamResult<Self> {
        Ok(Self {
            high_water_mark: validate_high_water_mark(high_water_mark)?,
            size: Some(Rc::new(size)),
        })
    }

    /// Target amount of buffered data.
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub(crate) fn size_fn(&self) -> Option<SizeFn> {
        self.size.clone()
    }
}

impl Default for QueuingStrategy {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            size: None,
        }
    }
}

impl fmt::Debug for QueuingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("custom_size", &self.size.is_some())
            .finish()
    }
}

/// Built-in size policies selectable from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One unit per chunk.
    #[default]
    Count,
    /// Byte length per chunk.
    ByteLength,
}

/// Serializable description of a strategy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Missing means [`DEFAULT_HIGH_WATER_MARK`].
    #[serde(default)]
    pub high_water_mark: Option<f64>,
    #[serde(default)]
    pub kind: StrategyKind,
}

impl StrategyConfig {
    /// Builds and validates the described strategy.
    pub fn build(&self) -> StreamResult<QueuingStrategy> {
        let high_water_mark = self.high_water_mark.unwrap_or(DEFAULT_HIGH_WATER_MARK);
        match self.kind {
            StrategyKind::Count => QueuingStrategy::count(high_water_mark),
            StrategyKind::ByteLength => QueuingStrategy::byte_length(high_water_mark),
        }
    }
}

/// Construction options for byte streams.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ByteStreamOptions {
    /// Buffered bytes the controller aims to keep queued.
    pub high_water_mark: f64,
    /// When set, every read allocates a pull-into buffer of this size and
    /// takes queued bytes into it in whole elements.
    pub auto_allocate_chunk_size: Option<usize>,
    /// Bytes per element; pull-into requests commit in whole elements.
    pub element_size: usize,
}

impl ByteStreamOptions {
    /// Enables pull-into requests of `chunk_size` bytes per read.
    pub fn with_auto_allocate(mut self, chunk_size: usize) -> Self {
        self.auto_allocate_chunk_size = Some(chunk_size);
        self
    }

    /// Sets the commit granularity of pull-into requests.
    pub fn with_element_size(mut self, element_size: usize) -> Self {
        self.element_size = element_size;
        self
    }

    /// Overrides the default mark of zero bytes.
    pub fn with_high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub(crate) fn validate(&self) -> StreamResult<()> {
        validate_high_water_mark(self.high_water_mark)?;
        if self.auto_allocate_chunk_size == Some(0) {
            return Err(StreamError::InvalidChunkSize(
                "auto-allocate chunk size must be greater than zero",
            ));
        }
        if self.element_size == 0 {
            return Err(StreamError::InvalidChunkSize(
                "element size must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for ByteStreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_BYTE_HIGH_WATER_MARK,
            auto_allocate_chunk_size: None,
            element_size: 1,
        }
    }
}
