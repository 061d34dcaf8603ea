//! Caching layers for SQLMapper: composite cache keys, the per-session
//! first-level cache, and transactional second-level caches shared across
//! sessions.

pub mod key;
pub mod session;
pub mod shared;
pub mod transactional;

pub use key::CacheKey;
pub use session::{CacheLookup, SessionCache};
pub use shared::{InMemoryCache, SharedCache};
pub use transactional::{TransactionalCache, TransactionalCacheManager};
