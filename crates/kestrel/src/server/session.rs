//! A server session: one accepted connection.
//!
//! The per-connection state machine is strictly single in flight:
//!
//! ```text
//! [Reading] --frame complete--> [Handling] --callback returns--> [Writing]
//!     ^                                                              |
//!     +------------------------- response sent ---------------------+
//! ```
//!
//! Exactly one handler invocation and exactly one response write happen per
//! complete request frame, which also means responses leave in request
//! order. Any terminal condition (peer close, I/O or framing error, handler
//! panic, stop) lands in `Closed` and reports the session's id to the
//! acceptor's shutdown callback exactly once.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;

use kestrel_core::framing::{
    expect_frame_v1, read_frame_v0, read_frame_v1, write_frame_v0, write_frame_v1, FrameKind,
    PROTOCOL_V1, V0_MAX_PAYLOAD,
};
use kestrel_core::{
    CallError, FramingError, RequestEnvelope, ResponseEnvelope, ServerSessionState,
    ServiceCallback, ServiceIdentity, TransportError,
};

/// Reports a terminally closed session back to its acceptor by id.
pub(crate) type ShutdownCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// One accepted connection, driven by its own run task.
///
/// The run task holds the only strong reference needed to keep the session
/// alive while I/O is outstanding; the acceptor tracks it weakly.
pub struct ServerSession {
    id: u64,
    peer: std::net::SocketAddr,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
    // Created together with the sender, so a stop() issued before start()
    // is still observed. Taken by the first (and only honoured) start.
    shutdown_rx: Mutex<Option<watch::Receiver<bool>>>,
}

impl ServerSession {
    pub(crate) fn new(id: u64, peer: std::net::SocketAddr) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            id,
            peer,
            state: AtomicU8::new(ServerSessionState::Reading.as_u8()),
            shutdown: shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        })
    }

    /// Start the run task for an accepted connection. At most one start is
    /// honoured per session; later calls are ignored.
    pub(crate) fn start(
        self: &Arc<Self>,
        handle: &Handle,
        stream: TcpStream,
        protocol_version: u8,
        identity: ServiceIdentity,
        service_callback: ServiceCallback,
        shutdown_callback: ShutdownCallback,
    ) {
        let Some(shutdown_rx) = self.shutdown_rx.lock().take() else {
            return;
        };
        handle.spawn(run(
            self.clone(),
            stream,
            protocol_version,
            identity,
            service_callback,
            shutdown_callback,
            shutdown_rx,
        ));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> std::net::SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ServerSessionState {
        ServerSessionState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(ServerSessionState::Closed)
    }

    /// Request a graceful close. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn set_state(&self, state: ServerSessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

async fn run(
    session: Arc<ServerSession>,
    mut stream: TcpStream,
    protocol_version: u8,
    identity: ServiceIdentity,
    service_callback: ServiceCallback,
    shutdown_callback: ShutdownCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    if protocol_version >= PROTOCOL_V1 {
        let greeted = tokio::select! {
            _ = shutdown.changed() => Err(CallError::Transport(TransportError::Cancelled)),
            r = handshake(&mut stream) => r,
        };
        if let Err(err) = greeted {
            tracing::debug!(peer = %session.peer, error = %err, "handshake failed");
            close(&session, &shutdown_callback);
            return;
        }
    }

    loop {
        session.set_state(ServerSessionState::Reading);
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            r = read_request(&mut stream, protocol_version) => match r {
                Ok(bytes) => bytes,
                Err(CallError::Transport(TransportError::Closed)) => {
                    tracing::debug!(peer = %session.peer, "peer closed connection");
                    break;
                }
                Err(err) => {
                    tracing::warn!(peer = %session.peer, error = %err, "request read failed");
                    break;
                }
            },
        };

        session.set_state(ServerSessionState::Handling);
        let envelope = match RequestEnvelope::decode(&request) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(peer = %session.peer, error = %err, "undecodable request");
                break;
            }
        };

        // The callback may block; that stalls this session (and occupies a
        // worker thread) until it returns.
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            service_callback(&envelope.method, &envelope.payload)
        }));
        let reply = match outcome {
            Ok(reply) => reply,
            Err(_) => {
                tracing::error!(peer = %session.peer, method = %envelope.method, "service callback panicked");
                break;
            }
        };

        session.set_state(ServerSessionState::Writing);
        let response = ResponseEnvelope {
            host_name: identity.host_name.clone(),
            service_name: identity.service_name.clone(),
            service_id: identity.service_id.clone(),
            method: envelope.method,
            error: reply.error,
            ret_state: reply.ret_state,
            call_state: reply.call_state,
            payload: reply.payload,
        };
        let encoded = match response.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(peer = %session.peer, error = %err, "response envelope rejected");
                break;
            }
        };

        let written = tokio::select! {
            _ = shutdown.changed() => Err(CallError::Transport(TransportError::Cancelled)),
            r = write_response(&mut stream, protocol_version, &encoded) => r,
        };
        if let Err(err) = written {
            tracing::warn!(peer = %session.peer, error = %err, "response write failed");
            break;
        }
    }

    close(&session, &shutdown_callback);
}

fn close(session: &Arc<ServerSession>, shutdown_callback: &ShutdownCallback) {
    session.set_state(ServerSessionState::Closed);
    shutdown_callback(session.id);
}

/// Answer the client's version offer. No overlap closes the connection.
async fn handshake(stream: &mut TcpStream) -> Result<(), CallError> {
    let offer = expect_frame_v1(stream, FrameKind::HandshakeRequest).await?;
    let (min, max) = match offer.as_slice() {
        [min, max, ..] => (*min, *max),
        _ => return Err(FramingError::Truncated.into()),
    };
    if min > PROTOCOL_V1 || max < PROTOCOL_V1 {
        return Err(FramingError::HandshakeRejected { offered: max }.into());
    }
    write_frame_v1(stream, FrameKind::HandshakeResponse, &[PROTOCOL_V1]).await
}

async fn read_request(stream: &mut TcpStream, protocol_version: u8) -> Result<Vec<u8>, CallError> {
    if protocol_version == 0 {
        read_frame_v0(stream, V0_MAX_PAYLOAD).await
    } else {
        let (kind, payload) = read_frame_v1(stream).await?;
        if kind != FrameKind::Request {
            return Err(FramingError::UnexpectedKind {
                expected: FrameKind::Request,
                got: kind,
            }
            .into());
        }
        Ok(payload)
    }
}

async fn write_response(
    stream: &mut TcpStream,
    protocol_version: u8,
    payload: &[u8],
) -> Result<(), CallError> {
    if protocol_version == 0 {
        write_frame_v0(stream, payload).await
    } else {
        write_frame_v1(stream, FrameKind::Response, payload).await
    }
}
