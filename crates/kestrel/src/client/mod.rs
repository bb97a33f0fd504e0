//! Client side: per-endpoint sessions and the fan-out multiplexer.

pub mod service_client;
pub mod session;

pub use service_client::{ResponseCallback, ServiceClient};
pub use session::{ClientSession, ResponseContinuation};
