pub mod broker;
pub mod directory_loader;
pub mod endpoint;
pub mod envelope;

pub use broker::{Broker, BrokerError, BrokerMessage, NatsBroker, PushSubscription};
pub use endpoint::{ConnectionState, Route, RouteError};
pub use envelope::Envelope;
