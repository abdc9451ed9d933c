//! Cache-aside repository wrappers exercising the cached-method wrapper's
//! write-through contract. Each module wraps its own backend trait —
//! declared with no provided implementation, since the persistence backend
//! is always an external collaborator — and calls
//! [`crate::cache::wrapper::CachedWrapper`] directly rather than through
//! any reflection layer.

pub mod processor;
pub mod project;
pub mod provider;
pub mod state;
pub mod ttl_defaults;
pub mod user;
