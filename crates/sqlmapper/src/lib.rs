//! SQLMapper: a SQL mapping engine with declarative result shapes,
//! two-level caching, and arena-based object materialization.
//!
//! This crate re-exports the public surface of the workspace:
//!
//! - [`core`] — values, rows, codecs, statements, shapes, and the object
//!   arena.
//! - [`cache`] — composite cache keys, session caches, and transactional
//!   shared caches.
//! - [`executor`] — sessions, the row materializer, and streaming cursors.

pub use sqlmapper_cache as cache;
pub use sqlmapper_core as core;
pub use sqlmapper_executor as executor;

pub use sqlmapper_cache::{CacheKey, InMemoryCache, SharedCache};
pub use sqlmapper_core::{
    Configuration, Error, ParamBag, Result, ResultShape, Row, RowBounds, StatementDescriptor,
    StatementKind, Value,
};
pub use sqlmapper_executor::{Backend, CachingSession, ResultList, RowValue, Session};
