//! Broker-agnostic, backend-agnostic types shared by the Confluo server
//! crate: opaque records, combine strategies, route configuration and
//! directory lookup, and wire encoding helpers.

pub mod combine;
pub mod error;
pub mod record;
pub mod route_config;
pub mod wire;

pub use combine::{Combine, Join, Merge};
pub use error::RouteDirectoryError;
pub use record::Record;
pub use route_config::{Mode, RouteConfig, RouteDirectory};
