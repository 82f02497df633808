use thiserror::Error;

use crate::boundary::{BoundaryError, Domain};
use crate::value::{ErrorName, Value};

pub type StreamResult<T> = Result<T, StreamError>;

/// Synchronous usage errors raised at the call site.
///
/// Stream errors proper (the value a stream is errored with) are opaque
/// [`Value`]s and never pass through this type unless a size function threw.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is already locked")]
    AlreadyLocked,

    #[error("reader is not attached to a stream")]
    NotOwned,

    #[error("reader still has {0} pending read requests")]
    NotEmpty(usize),

    #[error("cannot {0} a stream that is closing or no longer readable")]
    InvalidState(&'static str),

    #[error("chunk size {0} is not a finite, non-negative number")]
    InvalidSize(f64),

    #[error("high-water mark {0} is not a non-negative number")]
    InvalidHighWaterMark(f64),

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(&'static str),

    #[error("byte stream closed with a partially filled pull-into request")]
    PartialPullInto,

    #[error("no pending pull-into request to respond to")]
    NoPullIntoRequest,

    #[error("response of {written} bytes exceeds the {remaining} bytes left in the view")]
    RespondOverflow { written: usize, remaining: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("realm has no external byte-source host installed")]
    NoExternalHost,

    #[error("stream has been disposed")]
    Detached,

    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    #[error("queuing strategy size function threw {0:?}")]
    Thrown(Value),
}

impl StreamError {
    /// Converts the error into a value suitable for erroring a stream in `domain`.
    pub fn to_value(&self, domain: &Domain) -> Value {
        let name = match self {
            StreamError::Thrown(value) => return value.clone(),
            StreamError::InvalidSize(_)
            | StreamError::InvalidHighWaterMark(_)
            | StreamError::InvalidChunkSize(_)
            | StreamError::RespondOverflow { .. } => ErrorName::RangeError,
            _ => ErrorName::TypeError,
        };
        Value::error(domain, name, self.to_string())
    }
}
