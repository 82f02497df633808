//! Readable stream engine.
//!
//! A [`Realm`] owns an isolation [`Domain`], a microtask queue and an arena of
//! stream slots. Producers feed a [`ReadableStream`] through a
//! [`DefaultController`] or [`ByteController`]; consumers lock it with a
//! [`DefaultReader`] and receive results as [`StreamPromise`]s that settle
//! when the realm's queue is driven.
//!
//! Everything here is single-threaded. Values that cross from one realm to
//! another always pass through [`Boundary::adapt`].

mod boundary;
mod config;
mod controller;
mod error;
mod queue;
mod reader;
mod realm;
mod source;
mod strategy;
mod stream;
mod tee;
mod value;

pub use boundary::{Boundary, BoundaryError, Domain, DomainId};
pub use config::RealmConfig;
pub use controller::{ByobRequest, ByteController, ControllerKind, DefaultController};
pub use error::{StreamError, StreamResult};
pub use queue::{QueueEntry, SizedQueue};
pub use reader::{DefaultReader, ReadResult};
pub use realm::Realm;
pub use source::{ExternalSource, ExternalSourceHost, HookResult, UnderlyingSource};
pub use strategy::{
    validate_high_water_mark, ByteStreamOptions, QueuingStrategy, SizeFn, StrategyConfig,
    StrategyKind, DEFAULT_BYTE_HIGH_WATER_MARK, DEFAULT_HIGH_WATER_MARK,
};
pub use stream::{ReadableStream, StreamState};
pub use value::{ErrorName, ErrorObject, Object, ObjectKind, Value};

/// Promise type used throughout the engine: rejections carry a [`Value`].
pub type StreamPromise<T> = microtask::Promise<T, Value>;
