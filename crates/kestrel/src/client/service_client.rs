//! The service client: fans one logical call out across every known
//! endpoint of a service and aggregates the outcomes.
//!
//! The client keeps one [`ClientSession`] per endpoint key it has seen in
//! the registry. Sessions are only ever added here; removal is the job of
//! the periodic [`refresh_registration`](ServiceClient::refresh_registration)
//! sweep, which also turns observed session failures into `Disconnected`
//! events. A failed session left in the map between sweeps fails calls fast
//! rather than touching the wire.
//!
//! # Blocking fan-out
//!
//! `call` dispatches to every selected endpoint and parks the calling
//! thread on a condition variable owned by a shared aggregation record. The
//! record is jointly owned by the caller and by every outstanding
//! continuation, so continuations that fire after a deadline has already
//! returned the call still find their slot alive; they mutate it and are
//! otherwise inert.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use kestrel_core::{
    monotonic_micros, CallError, CallState, ClientAdvertisement, ClientEvent, ClientEventCallback,
    ClientEventKind, EndpointDescriptor, ProcessInfo, RegistrationProvider, RequestEnvelope,
    ResponseEnvelope, ServiceRegistry, ServiceResponse, SessionEventCallback, PROTOCOL_V1,
};

use crate::client::session::{ClientSession, ResponseContinuation};
use crate::manager::ClientSessionManager;

/// Callback receiving every per-endpoint response of an asynchronous call.
pub type ResponseCallback = Arc<dyn Fn(&ServiceResponse) + Send + Sync>;

struct SessionEntry {
    endpoint: EndpointDescriptor,
    session: Arc<ClientSession>,
}

/// Aggregation record for one blocking fan-out call.
///
/// Slots are pre-populated as failed with the error string `"Timeout"`, so
/// an endpoint that never answers needs no further bookkeeping.
struct CallAggregation {
    expected: usize,
    state: Mutex<AggregationState>,
    done: Condvar,
}

struct AggregationState {
    slots: Vec<ServiceResponse>,
    finished: usize,
}

impl CallAggregation {
    fn new(slots: Vec<ServiceResponse>) -> Arc<Self> {
        Arc::new(Self {
            expected: slots.len(),
            state: Mutex::new(AggregationState { slots, finished: 0 }),
            done: Condvar::new(),
        })
    }

    fn complete(&self, index: usize, result: Result<Vec<u8>, CallError>) {
        let mut state = self.state.lock();
        let slot = &mut state.slots[index];
        match result {
            Ok(bytes) => match ResponseEnvelope::decode(&bytes) {
                Ok(envelope) => *slot = ServiceResponse::from(envelope),
                Err(err) => {
                    slot.error_msg = err.to_string();
                    slot.call_state = CallState::Failed;
                    slot.ret_state = 0;
                }
            },
            Err(err) => {
                slot.error_msg = err.to_string();
                slot.call_state = CallState::Failed;
                slot.ret_state = 0;
            }
        }
        state.finished += 1;
        self.done.notify_all();
    }

    /// Wait until every continuation finished or the deadline passed.
    /// Returns true when all continuations finished in time.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.finished < self.expected {
                    if self.done.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while state.finished < self.expected {
                    self.done.wait(&mut state);
                }
            }
        }
        state.finished >= self.expected
    }

    fn snapshot(&self) -> Vec<ServiceResponse> {
        self.state.lock().slots.clone()
    }
}

/// Client handle for one logical service.
pub struct ServiceClient {
    service_name: String,
    service_id: String,
    advertisement: ClientAdvertisement,
    host_filter: Mutex<String>,
    session_map: Mutex<HashMap<String, SessionEntry>>,
    connected: Mutex<HashMap<String, EndpointDescriptor>>,
    response_callback: Mutex<Option<ResponseCallback>>,
    event_callbacks: Mutex<HashMap<ClientEventKind, ClientEventCallback>>,
    registry: Arc<dyn ServiceRegistry>,
    registration: Arc<dyn RegistrationProvider>,
    clients: Arc<ClientSessionManager>,
}

fn next_service_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}-{}",
        std::process::id(),
        monotonic_micros(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

impl ServiceClient {
    /// Create a client for `service_name` and register its advertisement.
    ///
    /// Dependencies are explicit: the registry supplies endpoint snapshots,
    /// the registration provider receives the advertisement, and the client
    /// session manager supplies sessions wired to the runtime.
    pub fn new(
        service_name: impl Into<String>,
        process: ProcessInfo,
        registry: Arc<dyn ServiceRegistry>,
        registration: Arc<dyn RegistrationProvider>,
        clients: Arc<ClientSessionManager>,
    ) -> Arc<Self> {
        let service_name = service_name.into();
        let service_id = next_service_id();
        let advertisement =
            ClientAdvertisement::new(&process, service_name.clone(), service_id.clone(), PROTOCOL_V1);
        let client = Arc::new(Self {
            service_name,
            service_id,
            advertisement,
            host_filter: Mutex::new(String::new()),
            session_map: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashMap::new()),
            response_callback: Mutex::new(None),
            event_callbacks: Mutex::new(HashMap::new()),
            registry,
            registration,
            clients,
        });
        client.registration.register_client(
            &client.service_name,
            &client.service_id,
            &client.advertisement,
            false,
        );
        client
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Restrict fan-out to one host. `""` or `"*"` clears the filter.
    pub fn set_host_filter(&self, host_name: &str) {
        let mut filter = self.host_filter.lock();
        if host_name == "*" {
            filter.clear();
        } else {
            *filter = host_name.to_string();
        }
    }

    pub fn add_response_callback(&self, callback: ResponseCallback) {
        *self.response_callback.lock() = Some(callback);
    }

    pub fn remove_response_callback(&self) {
        *self.response_callback.lock() = None;
    }

    pub fn add_event_callback(&self, kind: ClientEventKind, callback: ClientEventCallback) {
        self.event_callbacks.lock().insert(kind, callback);
    }

    pub fn remove_event_callback(&self, kind: ClientEventKind) {
        self.event_callbacks.lock().remove(&kind);
    }

    /// True iff at least one endpoint session is currently connected.
    pub fn is_connected(&self) -> bool {
        !self.connected.lock().is_empty()
    }

    /// Blocking fan-out to every endpoint passing the host filter.
    ///
    /// Returns the summary flag (true iff any endpoint executed the call)
    /// and one result slot per selected endpoint, in snapshot order. With
    /// `timeout = None` the call waits indefinitely; otherwise slots of
    /// endpoints that missed the deadline stay failed with error `"Timeout"`.
    pub fn call(
        &self,
        method_name: &str,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> (bool, Vec<ServiceResponse>) {
        if self.service_name.is_empty() || method_name.is_empty() {
            return (false, Vec::new());
        }
        if self.clients.is_stopped() {
            return (false, Vec::new());
        }

        self.check_for_new_services();

        let encoded = match RequestEnvelope::new(method_name, request).encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                tracing::warn!(service = %self.service_name, error = %err, "request envelope rejected");
                return (false, Vec::new());
            }
        };

        let selected = self.select_sessions();
        if selected.is_empty() {
            return (false, Vec::new());
        }

        let slots = selected
            .iter()
            .map(|(endpoint, _)| {
                ServiceResponse::failure(endpoint, method_name, CallError::Timeout.to_string())
            })
            .collect();
        let aggregation = CallAggregation::new(slots);

        for (index, (_, session)) in selected.iter().enumerate() {
            let record = aggregation.clone();
            let continuation: ResponseContinuation =
                Box::new(move |result| record.complete(index, result));
            session.async_call(encoded.clone(), continuation);
        }

        let all_finished = aggregation.wait(timeout);
        if !all_finished {
            self.emit_event(ClientEventKind::Timeout, None);
        }

        let slots = aggregation.snapshot();
        let any_executed = slots.iter().any(|s| s.call_state == CallState::Executed);
        (any_executed, slots)
    }

    /// Blocking fan-out that feeds every result slot to the response
    /// callback instead of returning the vector.
    pub fn call_with_callback(
        &self,
        method_name: &str,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> bool {
        let (any_executed, slots) = self.call(method_name, request, timeout);
        let callback = self.response_callback.lock().clone();
        if let Some(callback) = callback {
            for slot in &slots {
                callback(slot);
            }
        }
        any_executed
    }

    /// Fire-and-forget fan-out. Each per-endpoint outcome reaches the
    /// response callback as it arrives; there is no client-side deadline.
    /// Returns true iff at least one endpoint was dispatched to.
    pub fn call_async(self: &Arc<Self>, method_name: &str, request: &[u8]) -> bool {
        if self.service_name.is_empty() || method_name.is_empty() {
            self.error_response(method_name, "invalid service or method name");
            return false;
        }
        if self.clients.is_stopped() {
            self.error_response(method_name, &CallError::NotReady.to_string());
            return false;
        }

        self.check_for_new_services();

        let encoded = match RequestEnvelope::new(method_name, request).encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                self.error_response(method_name, &err.to_string());
                return false;
            }
        };

        let selected = self.select_sessions();
        if selected.is_empty() {
            self.error_response(method_name, &CallError::NotFound.to_string());
            return false;
        }

        for (endpoint, session) in selected {
            let weak = Arc::downgrade(self);
            let method = method_name.to_string();
            let continuation: ResponseContinuation = Box::new(move |result| {
                let Some(client) = weak.upgrade() else { return };
                let response = match result {
                    Ok(bytes) => match ResponseEnvelope::decode(&bytes) {
                        Ok(envelope) => ServiceResponse::from(envelope),
                        Err(err) => {
                            ServiceResponse::failure(&endpoint, &method, err.to_string())
                        }
                    },
                    Err(err) => ServiceResponse::failure(&endpoint, &method, err.to_string()),
                };
                client.deliver_response(&response);
            });
            session.async_call(encoded.clone(), continuation);
        }
        true
    }

    /// Periodic registration sweep, driven externally at roughly 1 Hz.
    ///
    /// Re-publishes the advertisement, creates sessions for endpoints that
    /// newly appeared in the registry, and retires sessions that have
    /// reached a terminal state since the last sweep: each one is removed
    /// from the session map so a later snapshot can replace it, and a
    /// single `Disconnected` event fires for its endpoint. Stopped sessions
    /// are swept the same way as failed ones, so a manager-wide stop does
    /// not leave the client looking connected.
    pub fn refresh_registration(&self) {
        self.registration.register_client(
            &self.service_name,
            &self.service_id,
            &self.advertisement,
            false,
        );

        self.check_for_new_services();

        let retired: Vec<(String, EndpointDescriptor)> = {
            let mut map = self.session_map.lock();
            let keys: Vec<String> = map
                .iter()
                .filter(|(_, entry)| entry.session.state().is_terminal())
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| map.remove(&key).map(|entry| (key, entry.endpoint)))
                .collect()
        };

        for (key, endpoint) in retired {
            let was_connected = self.connected.lock().remove(&key).is_some();
            if was_connected {
                tracing::debug!(service = %self.service_name, endpoint = %key, "endpoint lost");
                self.emit_event(ClientEventKind::Disconnected, Some(endpoint));
            }
        }
    }

    /// Create sessions for registry endpoints this client has not seen yet.
    /// Never removes anything; that is the sweep's job. The lookup and the
    /// insert happen under one hold of the map lock, so two concurrent
    /// callers cannot both create a session for the same key.
    fn check_for_new_services(&self) {
        let snapshot = self.registry.get_service_endpoints(&self.service_name);
        for endpoint in snapshot {
            {
                let mut map = self.session_map.lock();
                if map.contains_key(&endpoint.key) {
                    continue;
                }

                let noop: SessionEventCallback = Arc::new(|_, _| {});
                let session = match self.clients.create_client(
                    endpoint.negotiated_version(),
                    &endpoint.address,
                    endpoint.connect_port(),
                    noop,
                ) {
                    Ok(session) => session,
                    Err(err) => {
                        tracing::warn!(
                            service = %self.service_name,
                            endpoint = %endpoint.key,
                            error = %err,
                            "could not create session"
                        );
                        return;
                    }
                };

                map.insert(
                    endpoint.key.clone(),
                    SessionEntry {
                        endpoint: endpoint.clone(),
                        session,
                    },
                );
            }
            self.mark_connected(endpoint);
        }
    }

    fn mark_connected(&self, endpoint: EndpointDescriptor) {
        {
            let mut connected = self.connected.lock();
            if connected.contains_key(&endpoint.key) {
                return;
            }
            connected.insert(endpoint.key.clone(), endpoint.clone());
        }
        self.emit_event(ClientEventKind::Connected, Some(endpoint));
    }

    /// Endpoints passing the host filter that have a session, in registry
    /// snapshot order. The order is stable within one call only.
    fn select_sessions(&self) -> Vec<(EndpointDescriptor, Arc<ClientSession>)> {
        let filter = self.host_filter.lock().clone();
        let snapshot = self.registry.get_service_endpoints(&self.service_name);
        let map = self.session_map.lock();
        snapshot
            .into_iter()
            .filter(|endpoint| filter.is_empty() || endpoint.host_name == filter)
            .filter_map(|endpoint| {
                map.get(&endpoint.key)
                    .map(|entry| (endpoint, entry.session.clone()))
            })
            .collect()
    }

    /// Clone the callback out under the lock, invoke it unlocked. Listeners
    /// may re-enter the client.
    fn emit_event(&self, kind: ClientEventKind, endpoint: Option<EndpointDescriptor>) {
        let callback = self.event_callbacks.lock().get(&kind).cloned();
        if let Some(callback) = callback {
            let event = ClientEvent {
                kind,
                time_us: monotonic_micros(),
                endpoint,
            };
            callback(&self.service_name, &event);
        }
    }

    fn deliver_response(&self, response: &ServiceResponse) {
        let callback = self.response_callback.lock().clone();
        if let Some(callback) = callback {
            callback(response);
        }
    }

    /// Route a synchronous failure through the response callback, matching
    /// the asynchronous delivery path.
    fn error_response(&self, method_name: &str, message: &str) {
        let response = ServiceResponse::synthetic_failure(method_name, message);
        self.deliver_response(&response);
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.session_map.lock().clear();
        self.connected.lock().clear();
        *self.response_callback.lock() = None;
        self.event_callbacks.lock().clear();
        self.registration.unregister_client(
            &self.service_name,
            &self.service_id,
            &self.advertisement,
        );
    }
}
