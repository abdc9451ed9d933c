//! Confluo server: the three stateful cores (TTL cache, sliding-window block
//! store, NATS-backed route layer) plus the cache-aside repository wrappers
//! that exercise the cache's write-through contract.

pub mod blockstore;
pub mod cache;
pub mod config;
pub mod repo;
pub mod route;
pub mod util;

pub use cache::ttl::TtlCache;
pub use cache::wrapper::CachedWrapper;
pub use config::Config;
