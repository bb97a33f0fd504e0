//! kestrel: the RPC transport core of a service middleware.
//!
//! A process discovers named services on peer hosts through a registry and
//! invokes remote methods on them over long-lived TCP sessions. This crate
//! provides both halves:
//!
//! - The **client side**: a per-endpoint [`ClientSession`] that serializes
//!   outbound requests and correlates responses positionally, and a
//!   [`ServiceClient`] multiplexer that fans one logical call out across
//!   every known endpoint of a service and aggregates the outcomes under a
//!   deadline.
//! - The **server side**: a [`ServiceServer`] acceptor that drives a
//!   per-connection protocol state machine and invokes a user-supplied
//!   service callback.
//! - The [`SessionManager`] that owns the runtime threads driving all
//!   socket I/O.
//!
//! # Architecture
//!
//! ```text
//!  caller ──► ServiceClient ──► ClientSession ──► network ──► ServerSession ──► callback
//!                  ▲                (per endpoint)                 │
//!                  └──────────── aggregation record ◄──────────────┘
//! ```
//!
//! Wire formats, envelopes, endpoint descriptors and the error taxonomy
//! live in [`kestrel_core`] and are re-exported here.

pub mod client;
pub mod manager;
pub mod server;

pub use client::{ClientSession, ResponseCallback, ResponseContinuation, ServiceClient};
pub use kestrel_core::*;
pub use manager::{ClientSessionManager, ServerSessionManager, SessionManager, SessionManagerConfig};
pub use server::{ServerSession, ServiceServer};
