//! A client session: one TCP connection to one endpoint.
//!
//! # Key invariant
//!
//! Only the session's run task touches the socket. Requests are queued to
//! that task, which writes one request, reads exactly one response and
//! resolves the head-of-line continuation before looking at the next queued
//! request. That makes response correlation positional, which is exactly the
//! contract of protocol v0 and v1: neither pipelines, so the k-th response
//! always belongs to the k-th request. If pipelining is ever wanted, a
//! correlation id has to come with a new protocol version; it cannot be
//! retrofitted here.
//!
//! While the queue is idle the task watches the socket for a peer close, so
//! an endpoint that dies between calls still moves the session to `Failed`
//! without waiting for the next request to trip over it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use kestrel_core::framing::{
    expect_frame_v1, read_frame_v0, read_frame_v1, write_frame_v0, write_frame_v1, FrameKind,
    PROTOCOL_V1, V1_MAX_PAYLOAD,
};
use kestrel_core::{
    CallError, ClientEventKind, FramingError, SessionEventCallback, SessionState, TransportError,
};

/// Invoked exactly once per request with the raw response bytes or the error
/// that ended the attempt.
pub type ResponseContinuation = Box<dyn FnOnce(Result<Vec<u8>, CallError>) + Send + 'static>;

struct QueuedCall {
    request: Bytes,
    continuation: ResponseContinuation,
}

struct SessionShared {
    address: String,
    port: u16,
    protocol_version: u8,
    state: AtomicU8,
    event_callback: SessionEventCallback,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(SessionState::Failed)
    }

    /// Advance the lifecycle; terminal states are never left. Returns false
    /// when the session was already terminal.
    fn transition(&self, next: SessionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match SessionState::from_u8(current) {
                Some(state) if state.is_terminal() => return false,
                _ => {}
            }
            match self.state.compare_exchange(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn emit(&self, kind: ClientEventKind, message: &str) {
        (self.event_callback)(kind, message);
    }
}

/// One outgoing connection to one endpoint.
///
/// Dropping the session cancels its run task; every queued continuation is
/// then resolved with a cancellation error.
pub struct ClientSession {
    shared: Arc<SessionShared>,
    queue: mpsc::UnboundedSender<QueuedCall>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("address", &self.shared.address)
            .field("port", &self.shared.port)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl ClientSession {
    /// Spawn the session's run task on the given runtime handle and return
    /// the session. The connection is established asynchronously; requests
    /// queued before the connect completes are sent once it does.
    pub(crate) fn spawn(
        handle: &Handle,
        protocol_version: u8,
        address: String,
        port: u16,
        event_callback: SessionEventCallback,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            address,
            port,
            protocol_version,
            state: AtomicU8::new(SessionState::Connecting.as_u8()),
            event_callback,
        });
        handle.spawn(run(shared.clone(), queue_rx, shutdown_rx));
        Arc::new(Self {
            shared,
            queue: queue_tx,
            shutdown: shutdown_tx,
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn protocol_version(&self) -> u8 {
        self.shared.protocol_version
    }

    /// Enqueue a request. The continuation fires exactly once, on the
    /// session task, with either the raw response bytes or an error.
    ///
    /// Calls against a `Failed` or `Stopped` session fail fast without
    /// touching the queue.
    pub fn async_call(&self, request: Bytes, continuation: ResponseContinuation) {
        match self.state() {
            SessionState::Failed => {
                continuation(Err(CallError::Transport(TransportError::Closed)));
            }
            SessionState::Stopped => {
                continuation(Err(CallError::Transport(TransportError::Cancelled)));
            }
            _ => {
                if let Err(mpsc::error::SendError(call)) = self.queue.send(QueuedCall {
                    request,
                    continuation,
                }) {
                    // Run task already gone.
                    (call.continuation)(Err(CallError::Transport(TransportError::Closed)));
                }
            }
        }
    }

    /// Request a close. Idempotent. Queued and in-flight continuations
    /// resolve with a cancellation error shortly after.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run(
    shared: Arc<SessionShared>,
    mut queue: mpsc::UnboundedReceiver<QueuedCall>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = {
        let established = tokio::select! {
            _ = shutdown.changed() => {
                finish(&shared, &mut queue, SessionState::Stopped, false);
                return;
            }
            r = establish(&shared) => r,
        };
        match established {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(
                    address = %shared.address,
                    port = shared.port,
                    error = %err,
                    "session could not connect"
                );
                finish(&shared, &mut queue, SessionState::Failed, false);
                return;
            }
        }
    };

    if !shared.transition(SessionState::Connected) {
        // Stopped while the handshake was completing.
        finish(&shared, &mut queue, SessionState::Stopped, false);
        return;
    }
    tracing::debug!(address = %shared.address, port = shared.port, "session connected");
    shared.emit(ClientEventKind::Connected, "connected");

    let mut peek_buf = [0u8; 1];
    loop {
        let queued = tokio::select! {
            _ = shutdown.changed() => {
                finish(&shared, &mut queue, SessionState::Stopped, true);
                return;
            }
            q = queue.recv() => match q {
                Some(q) => q,
                // Session handle dropped; nothing can be queued anymore.
                None => {
                    finish(&shared, &mut queue, SessionState::Stopped, true);
                    return;
                }
            },
            r = stream.peek(&mut peek_buf) => {
                // Nothing is in flight, so any readable byte is a protocol
                // violation and a clean EOF is the peer going away.
                let err = match r {
                    Ok(0) => CallError::Transport(TransportError::Closed),
                    Ok(_) => CallError::Framing(FramingError::Unsolicited),
                    Err(e) => CallError::Transport(TransportError::Io(e)),
                };
                tracing::debug!(
                    address = %shared.address,
                    port = shared.port,
                    error = %err,
                    "idle session lost its peer"
                );
                finish(&shared, &mut queue, SessionState::Failed, true);
                return;
            }
        };

        let result = tokio::select! {
            _ = shutdown.changed() => Err(CallError::Transport(TransportError::Cancelled)),
            r = roundtrip(&mut stream, shared.protocol_version, &queued.request) => r,
        };

        match result {
            Ok(payload) => (queued.continuation)(Ok(payload)),
            Err(err) => {
                let terminal = match &err {
                    CallError::Transport(TransportError::Cancelled) => SessionState::Stopped,
                    _ => SessionState::Failed,
                };
                tracing::debug!(
                    address = %shared.address,
                    port = shared.port,
                    error = %err,
                    "session request failed"
                );
                (queued.continuation)(Err(err));
                finish(&shared, &mut queue, terminal, true);
                return;
            }
        }
    }
}

/// Connect and, for v1, run the protocol handshake.
async fn establish(shared: &SessionShared) -> Result<TcpStream, CallError> {
    let mut stream = TcpStream::connect((shared.address.as_str(), shared.port))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                CallError::Transport(TransportError::Refused(e))
            } else {
                CallError::Transport(TransportError::Io(e))
            }
        })?;
    stream
        .set_nodelay(true)
        .map_err(|e| CallError::Transport(TransportError::Io(e)))?;

    if shared.protocol_version >= PROTOCOL_V1 {
        write_frame_v1(
            &mut stream,
            FrameKind::HandshakeRequest,
            &[PROTOCOL_V1, PROTOCOL_V1],
        )
        .await?;
        let accepted = expect_frame_v1(&mut stream, FrameKind::HandshakeResponse).await?;
        if accepted.first() != Some(&PROTOCOL_V1) {
            return Err(FramingError::HandshakeRejected { offered: PROTOCOL_V1 }.into());
        }
    }
    Ok(stream)
}

async fn roundtrip(
    stream: &mut TcpStream,
    protocol_version: u8,
    request: &[u8],
) -> Result<Vec<u8>, CallError> {
    if protocol_version == 0 {
        write_frame_v0(stream, request).await?;
        read_frame_v0(stream, V1_MAX_PAYLOAD).await
    } else {
        write_frame_v1(stream, FrameKind::Request, request).await?;
        let (kind, payload) = read_frame_v1(stream).await?;
        if kind != FrameKind::Response {
            return Err(FramingError::UnexpectedKind {
                expected: FrameKind::Response,
                got: kind,
            }
            .into());
        }
        Ok(payload)
    }
}

/// Enter a terminal state and resolve everything still queued. The drain is
/// what bounds the time any continuation can stay unresolved after the
/// session dies.
fn finish(
    shared: &SessionShared,
    queue: &mut mpsc::UnboundedReceiver<QueuedCall>,
    terminal: SessionState,
    was_connected: bool,
) {
    let transitioned = shared.transition(terminal);
    queue.close();
    while let Ok(call) = queue.try_recv() {
        let err = match terminal {
            SessionState::Stopped => TransportError::Cancelled,
            _ => TransportError::Closed,
        };
        (call.continuation)(Err(CallError::Transport(err)));
    }
    if transitioned && was_connected {
        shared.emit(ClientEventKind::Disconnected, "disconnected");
    }
}
