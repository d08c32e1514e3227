//! Request/response and stream bridges over eventlink subscriptions.
//!
//! A transport pushes events in through `receive`; consumers get either a
//! future that resolves exactly once (`PendingRequest`) or a `Stream` that
//! ends on cancellation or a terminal event (`EventStream`). The `Hub` wires
//! both to one transport's channels.

pub mod config;
pub mod error;
pub mod hub;
mod latch;
pub mod request;
pub mod stream;

pub use config::BridgeConfig;
pub use error::{ConfigError, RequestError, StreamEnd, UnknownKey};
pub use hub::{CapabilityEvent, Disconnected, Hub};
pub use request::{PendingRequest, RequestBuilder};
pub use stream::{CapabilityControl, EventStream, StreamBuilder};
