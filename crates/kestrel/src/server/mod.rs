//! Server side: the acceptor and its per-connection sessions.

pub mod session;

pub use session::ServerSession;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;

use kestrel_core::{ServerEventCallback, ServerEventKind, ServiceCallback, ServiceIdentity};

use session::ShutdownCallback;

/// Sessions the acceptor knows about, tracked weakly: a session keeps
/// itself alive through its run task and removes its id on its terminal
/// transition.
struct AcceptorShared {
    sessions: Mutex<HashMap<u64, Weak<ServerSession>>>,
    next_session_id: AtomicU64,
    stopped: AtomicBool,
    event_callback: ServerEventCallback,
}

impl AcceptorShared {
    fn emit(&self, kind: ServerEventKind, message: &str) {
        (self.event_callback)(kind, message);
    }
}

/// Accepts client connections for one service endpoint and wraps each in a
/// [`ServerSession`] speaking the configured protocol version.
pub struct ServiceServer {
    local_port: u16,
    shared: Arc<AcceptorShared>,
    shutdown: watch::Sender<bool>,
}

impl ServiceServer {
    /// Bind `port` (zero picks an ephemeral port) and start accepting on
    /// the given runtime handle. The bound port is available immediately
    /// via [`local_port`](Self::local_port).
    pub(crate) fn create(
        handle: &Handle,
        protocol_version: u8,
        port: u16,
        identity: ServiceIdentity,
        service_callback: ServiceCallback,
        event_callback: ServerEventCallback,
    ) -> std::io::Result<Arc<Self>> {
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let local_port = listener.local_addr()?.port();

        let shared = Arc::new(AcceptorShared {
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            event_callback,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        handle.spawn(accept_loop(
            handle.clone(),
            listener,
            protocol_version,
            identity,
            service_callback,
            shared.clone(),
            shutdown_rx,
        ));

        tracing::debug!(port = local_port, protocol_version, "service server created");
        Ok(Arc::new(Self {
            local_port,
            shared,
            shutdown: shutdown_tx,
        }))
    }

    /// Port the listener is actually bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Number of sessions currently alive.
    pub fn connection_count(&self) -> usize {
        let mut sessions = self.shared.sessions.lock();
        sessions.retain(|_, weak| weak.strong_count() > 0);
        sessions.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_count() > 0
    }

    /// Stop accepting, then stop every still-reachable session. Outstanding
    /// I/O completes with cancellation and the sessions retire themselves.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);

        let sessions: Vec<Arc<ServerSession>> = {
            let map = self.shared.sessions.lock();
            map.values().filter_map(Weak::upgrade).collect()
        };
        for session in sessions {
            session.stop();
        }
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    handle: Handle,
    listener: std::net::TcpListener,
    protocol_version: u8,
    identity: ServiceIdentity,
    service_callback: ServiceCallback,
    shared: Arc<AcceptorShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "listener registration failed");
            return;
        }
    };

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            a = listener.accept() => a,
        };

        match accepted {
            Ok((stream, peer)) => {
                let id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
                let shutdown_callback: ShutdownCallback = {
                    let shared = Arc::downgrade(&shared);
                    Arc::new(move |session_id| {
                        if let Some(shared) = shared.upgrade() {
                            shared.sessions.lock().remove(&session_id);
                            shared.emit(ServerEventKind::Disconnected, "client disconnected");
                        }
                    })
                };

                tracing::debug!(%peer, id, "client connected");
                let session = ServerSession::new(id, peer);
                {
                    // Checked under the same lock stop() uses to collect
                    // sessions, so a racing stop either sees this session or
                    // the stopped flag is already visible here.
                    let mut sessions = shared.sessions.lock();
                    if shared.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    sessions.insert(id, Arc::downgrade(&session));
                }
                shared.emit(ServerEventKind::Connected, "client connected");

                session.start(
                    &handle,
                    stream,
                    protocol_version,
                    identity.clone(),
                    service_callback.clone(),
                    shutdown_callback,
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed, no longer accepting");
                break;
            }
        }
    }
    // Dropping the listener closes the socket.
}
