//! The session manager: owns the runtime threads that drive all socket I/O.
//!
//! There is deliberately no process-wide instance. The embedding
//! application builds one manager at its composition root and passes the
//! client and server sub-managers into whatever needs to create sessions.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

use kestrel_core::{
    CallError, ServerEventCallback, ServiceCallback, ServiceIdentity, SessionEventCallback,
};

use crate::client::session::ClientSession;
use crate::server::ServiceServer;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Worker threads of the I/O runtime.
    pub worker_threads: usize,
    /// How long `stop` waits for outstanding session tasks to drain.
    pub shutdown_timeout: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns the I/O runtime and hands out sessions wired to it.
///
/// `start` is idempotent; `stop` blocks until every session task has
/// drained (bounded by the configured shutdown timeout) and is idempotent
/// as well. After `stop`, the sub-managers refuse to create sessions with
/// [`CallError::NotReady`] until `start` is called again.
pub struct SessionManager {
    config: SessionManagerConfig,
    runtime: Mutex<Option<Runtime>>,
    clients: Arc<ClientSessionManager>,
    servers: Arc<ServerSessionManager>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            runtime: Mutex::new(None),
            clients: Arc::new(ClientSessionManager::new()),
            servers: Arc::new(ServerSessionManager::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(SessionManagerConfig::default())
    }

    /// Create the runtime if it does not exist yet.
    pub fn start(&self) -> std::io::Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }
        let built = Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads)
            .thread_name("kestrel-io")
            .enable_all()
            .build()?;
        self.clients.set_handle(built.handle().clone());
        self.servers.set_handle(built.handle().clone());
        *runtime = Some(built);
        tracing::debug!(worker_threads = self.config.worker_threads, "session manager started");
        Ok(())
    }

    /// Stop every session and server, then tear the runtime down.
    ///
    /// Blocks the calling thread; must not be invoked from a runtime
    /// worker.
    pub fn stop(&self) {
        let runtime = { self.runtime.lock().take() };
        self.clients.shut_down();
        self.servers.shut_down();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(self.config.shutdown_timeout);
            tracing::debug!("session manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    pub fn client_manager(&self) -> Arc<ClientSessionManager> {
        self.clients.clone()
    }

    pub fn server_manager(&self) -> Arc<ServerSessionManager> {
        self.servers.clone()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Creates client sessions and retires them on global stop.
pub struct ClientSessionManager {
    handle: Mutex<Option<Handle>>,
    sessions: Mutex<Vec<Weak<ClientSession>>>,
}

impl ClientSessionManager {
    fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn set_handle(&self, handle: Handle) {
        *self.handle.lock() = Some(handle);
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.lock().is_none()
    }

    /// Create a session to `address:port` speaking the given protocol
    /// version. Fails with [`CallError::NotReady`] when the manager is
    /// stopped.
    pub fn create_client(
        &self,
        protocol_version: u8,
        address: &str,
        port: u16,
        event_callback: SessionEventCallback,
    ) -> Result<Arc<ClientSession>, CallError> {
        let handle = self.handle.lock().clone().ok_or(CallError::NotReady)?;
        let session = ClientSession::spawn(
            &handle,
            protocol_version,
            address.to_string(),
            port,
            event_callback,
        );
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        Ok(session)
    }

    fn shut_down(&self) {
        *self.handle.lock() = None;
        let sessions: Vec<Weak<ClientSession>> = std::mem::take(&mut *self.sessions.lock());
        for session in sessions.iter().filter_map(Weak::upgrade) {
            session.stop();
        }
    }
}

/// Creates servers and retires them on global stop.
pub struct ServerSessionManager {
    handle: Mutex<Option<Handle>>,
    servers: Mutex<Vec<Weak<ServiceServer>>>,
}

impl ServerSessionManager {
    fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            servers: Mutex::new(Vec::new()),
        }
    }

    fn set_handle(&self, handle: Handle) {
        *self.handle.lock() = Some(handle);
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.lock().is_none()
    }

    /// Bind a server for one service endpoint. `port` zero picks an
    /// ephemeral port.
    pub fn create_server(
        &self,
        protocol_version: u8,
        port: u16,
        identity: ServiceIdentity,
        service_callback: ServiceCallback,
        event_callback: ServerEventCallback,
    ) -> Result<Arc<ServiceServer>, CallError> {
        let handle = self.handle.lock().clone().ok_or(CallError::NotReady)?;
        let server = ServiceServer::create(
            &handle,
            protocol_version,
            port,
            identity,
            service_callback,
            event_callback,
        )
        .map_err(|e| CallError::Transport(kestrel_core::TransportError::Io(e)))?;
        let mut servers = self.servers.lock();
        servers.retain(|weak| weak.strong_count() > 0);
        servers.push(Arc::downgrade(&server));
        Ok(server)
    }

    fn shut_down(&self) {
        *self.handle.lock() = None;
        let servers: Vec<Weak<ServiceServer>> = std::mem::take(&mut *self.servers.lock());
        for server in servers.iter().filter_map(Weak::upgrade) {
            server.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_client_requires_a_running_manager() {
        let manager = SessionManager::with_defaults();
        let err = manager
            .client_manager()
            .create_client(1, "127.0.0.1", 1, Arc::new(|_, _| {}))
            .expect_err("manager never started");
        assert!(matches!(err, CallError::NotReady));
    }

    #[test]
    fn start_is_idempotent_and_stop_allows_restart() {
        let manager = SessionManager::with_defaults();
        manager.start().expect("start");
        manager.start().expect("second start");
        assert!(manager.is_running());

        manager.stop();
        assert!(!manager.is_running());
        assert!(manager.client_manager().is_stopped());
        manager.stop();

        manager.start().expect("restart");
        assert!(manager.is_running());
        manager.stop();
    }
}
