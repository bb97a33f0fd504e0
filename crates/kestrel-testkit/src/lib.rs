//! kestrel-testkit: shared test support.
//!
//! Provides an in-memory registry with snapshot semantics, a registration
//! provider that records every call, and small helpers for building test
//! identities and handlers. Integration tests of the main crate use these
//! to stand up real loopback servers without a discovery deployment.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_core::{
    ClientAdvertisement, EndpointDescriptor, ProcessInfo, RegistrationProvider, ServerEventCallback,
    ServiceCallResponse, ServiceCallback, ServiceIdentity, ServiceRegistry, SessionEventCallback,
};

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory endpoint table. `get_service_endpoints` clones the current
/// table, so mutations after a snapshot never leak into it.
#[derive(Default)]
pub struct StaticRegistry {
    endpoints: Mutex<HashMap<String, Vec<EndpointDescriptor>>>,
}

impl StaticRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the endpoint list for a service.
    pub fn set_endpoints(&self, service_name: &str, endpoints: Vec<EndpointDescriptor>) {
        self.endpoints
            .lock()
            .insert(service_name.to_string(), endpoints);
    }

    pub fn clear(&self, service_name: &str) {
        self.endpoints.lock().remove(service_name);
    }
}

impl ServiceRegistry for StaticRegistry {
    fn get_service_endpoints(&self, service_name: &str) -> Vec<EndpointDescriptor> {
        self.endpoints
            .lock()
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }
}

/// Registration provider that remembers every register/unregister call.
#[derive(Default)]
pub struct RecordingRegistration {
    registered: Mutex<Vec<(String, String)>>,
    unregistered: Mutex<Vec<(String, String)>>,
}

impl RecordingRegistration {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn unregister_count(&self) -> usize {
        self.unregistered.lock().len()
    }
}

impl RegistrationProvider for RecordingRegistration {
    fn register_client(
        &self,
        service_name: &str,
        service_id: &str,
        _sample: &ClientAdvertisement,
        _force: bool,
    ) {
        self.registered
            .lock()
            .push((service_name.to_string(), service_id.to_string()));
    }

    fn unregister_client(
        &self,
        service_name: &str,
        service_id: &str,
        _sample: &ClientAdvertisement,
    ) {
        self.unregistered
            .lock()
            .push((service_name.to_string(), service_id.to_string()));
    }
}

/// Process identity for tests.
pub fn test_process(host_name: &str) -> ProcessInfo {
    ProcessInfo {
        host_name: host_name.to_string(),
        process_name: "kestrel-test".to_string(),
        unit_name: "test".to_string(),
        process_id: std::process::id(),
    }
}

/// Server identity for tests.
pub fn test_identity(host_name: &str, service_name: &str, service_id: &str) -> ServiceIdentity {
    ServiceIdentity {
        host_name: host_name.to_string(),
        service_name: service_name.to_string(),
        service_id: service_id.to_string(),
    }
}

/// Endpoint descriptor for a loopback server.
pub fn loopback_endpoint(
    key: &str,
    host_name: &str,
    service_name: &str,
    port_v0: u16,
    port_v1: u16,
    protocol_version: u8,
) -> EndpointDescriptor {
    EndpointDescriptor {
        key: key.to_string(),
        host_name: host_name.to_string(),
        address: "127.0.0.1".to_string(),
        service_name: service_name.to_string(),
        service_id: key.to_string(),
        port_v0,
        port_v1,
        protocol_version,
    }
}

/// Handler answering every request with its own payload.
pub fn echo_callback() -> ServiceCallback {
    Arc::new(|_method, request| ServiceCallResponse::executed(request.to_vec(), 0))
}

/// Handler answering with a fixed payload.
pub fn fixed_callback(payload: Vec<u8>) -> ServiceCallback {
    Arc::new(move |_method, _request| ServiceCallResponse::executed(payload.clone(), 0))
}

/// Handler that sleeps before answering, to simulate a slow service.
pub fn sleepy_callback(delay: std::time::Duration, payload: Vec<u8>) -> ServiceCallback {
    Arc::new(move |_method, _request| {
        std::thread::sleep(delay);
        ServiceCallResponse::executed(payload.clone(), 0)
    })
}

pub fn null_session_events() -> SessionEventCallback {
    Arc::new(|_, _| {})
}

pub fn null_server_events() -> ServerEventCallback {
    Arc::new(|_, _| {})
}
