//! kestrel-core: Core types for the kestrel service transport.
//!
//! This crate defines:
//! - Error taxonomy ([`CallError`], [`TransportError`], [`FramingError`], [`DecodeError`])
//! - Session lifecycle states ([`SessionState`], [`ServerSessionState`], [`CallState`])
//! - Wire framing for protocol v0 and v1 ([`framing`])
//! - Request/response envelopes ([`RequestEnvelope`], [`ResponseEnvelope`])
//! - Endpoint descriptors and version negotiation ([`EndpointDescriptor`])
//! - Registry and registration traits ([`ServiceRegistry`], [`RegistrationProvider`])
//! - Event types and callback aliases ([`ClientEvent`], [`ServerEventKind`])
//! - The service handler contract ([`ServiceCallback`], [`ServiceCallResponse`])

mod endpoint;
mod envelope;
mod error;
mod event;
pub mod framing;
mod registry;
mod service;
mod state;

pub use endpoint::*;
pub use envelope::*;
pub use error::*;
pub use event::*;
pub use framing::{FrameKind, PROTOCOL_V1, V0_MAX_PAYLOAD, V1_MAX_PAYLOAD};
pub use registry::*;
pub use service::*;
pub use state::*;
