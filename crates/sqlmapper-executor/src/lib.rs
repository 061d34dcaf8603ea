//! Execution engine for SQLMapper: sessions, first- and second-level
//! caching, row materialization, deferred and lazy loads, and streaming
//! cursors.

pub mod backend;
pub mod caching;
pub mod cursor;
mod materializer;
pub mod result;
pub mod session;
pub mod stream;

pub use backend::{Backend, QueryOutput, RowCursor, VecCursor};
pub use caching::CachingSession;
pub use cursor::ColumnAnalysis;
pub use result::{ResultList, RowValue};
pub use session::Session;
pub use stream::QueryCursor;
