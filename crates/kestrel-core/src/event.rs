//! Connection events and callback aliases.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::EndpointDescriptor;

/// Microseconds on a process-local monotonic clock.
pub fn monotonic_micros() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}

/// Event kinds a service client can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Connected,
    Disconnected,
    Timeout,
}

/// Payload handed to client event callbacks.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub kind: ClientEventKind,
    /// Timestamp from [`monotonic_micros`].
    pub time_us: i64,
    /// Set for connect and disconnect events.
    pub endpoint: Option<EndpointDescriptor>,
}

/// Callback registered on a service client, keyed by event kind. The first
/// argument is the service name.
pub type ClientEventCallback = Arc<dyn Fn(&str, &ClientEvent) + Send + Sync>;

/// Listener attached to a single client session: kind plus a short message.
pub type SessionEventCallback = Arc<dyn Fn(ClientEventKind, &str) + Send + Sync>;

/// Event kinds a server reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Connected,
    Disconnected,
}

/// Listener attached to a server: kind plus a short message.
pub type ServerEventCallback = Arc<dyn Fn(ServerEventKind, &str) + Send + Sync>;
