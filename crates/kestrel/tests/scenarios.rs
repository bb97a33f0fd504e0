//! End-to-end scenarios over loopback TCP.
//!
//! Every test stands up real servers through the session manager, points an
//! in-memory registry at them and drives a service client against that.
//! Blocking calls run on the test thread; all I/O runs on the manager's
//! runtime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use kestrel::{
    CallState, ClientEventKind, RequestEnvelope, ServiceCallResponse, ServiceCallback,
    ServiceClient, ServiceResponse, SessionManager, SessionManagerConfig, SessionState,
};
use kestrel_testkit::{
    echo_callback, fixed_callback, init_test_tracing, loopback_endpoint, null_server_events,
    null_session_events, sleepy_callback, test_identity, test_process, RecordingRegistration,
    StaticRegistry,
};

const SERVICE: &str = "mirror";

fn manager() -> Arc<SessionManager> {
    init_test_tracing();
    let manager = SessionManager::new(SessionManagerConfig {
        worker_threads: 4,
        ..SessionManagerConfig::default()
    });
    manager.start().expect("runtime");
    manager
}

struct EventLog {
    events: Mutex<Vec<(ClientEventKind, String)>>,
}

impl EventLog {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn install(self: &Arc<Self>, client: &ServiceClient) {
        for kind in [
            ClientEventKind::Connected,
            ClientEventKind::Disconnected,
            ClientEventKind::Timeout,
        ] {
            let log = self.clone();
            client.add_event_callback(
                kind,
                Arc::new(move |_service, event| {
                    let key = event
                        .endpoint
                        .as_ref()
                        .map(|e| e.key.clone())
                        .unwrap_or_default();
                    log.events.lock().push((event.kind, key));
                }),
            );
        }
    }

    fn count(&self, kind: ClientEventKind, key: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(k, e)| *k == kind && e == key)
            .count()
    }

    fn position(&self, kind: ClientEventKind, key: &str) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .position(|(k, e)| *k == kind && e == key)
    }
}

#[test]
fn single_endpoint_executes() {
    let manager = manager();
    let handler: ServiceCallback = Arc::new(|method, request| {
        assert_eq!(method, "echo");
        assert_eq!(request, [0x01, 0x02, 0x03]);
        ServiceCallResponse::executed(vec![0x04], 0)
    });
    let server = manager
        .server_manager()
        .create_server(1, 0, test_identity("hostA", SERVICE, "srv-1"), handler, null_server_events())
        .expect("server");

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![loopback_endpoint("k1", "hostA", SERVICE, 0, server.local_port(), 1)],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );

    let (ok, responses) = client.call("echo", &[0x01, 0x02, 0x03], Some(Duration::from_millis(1000)));
    assert!(ok);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].call_state, CallState::Executed);
    assert_eq!(responses[0].payload, vec![0x04]);
    assert_eq!(responses[0].host_name, "hostA");
    assert_eq!(responses[0].service_name, SERVICE);
    assert!(client.is_connected());

    manager.stop();
}

#[test]
fn slow_endpoint_keeps_its_timeout_slot() {
    let manager = manager();
    let fast = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostA", SERVICE, "fast"),
            fixed_callback(vec![0xAA]),
            null_server_events(),
        )
        .expect("server");
    let slow = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostB", SERVICE, "slow"),
            sleepy_callback(Duration::from_millis(2000), vec![0xBB]),
            null_server_events(),
        )
        .expect("server");

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![
            loopback_endpoint("fast", "hostA", SERVICE, 0, fast.local_port(), 1),
            loopback_endpoint("slow", "hostB", SERVICE, 0, slow.local_port(), 1),
        ],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );
    let events = EventLog::new();
    events.install(&client);

    let started = Instant::now();
    let (ok, responses) = client.call("poke", &[], Some(Duration::from_millis(500)));
    let elapsed = started.elapsed();

    assert!(ok);
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    assert_eq!(responses.len(), 2);

    let by_id = |id: &str| -> &ServiceResponse {
        responses.iter().find(|r| r.service_id == id).expect(id)
    };
    assert_eq!(by_id("fast").call_state, CallState::Executed);
    assert_eq!(by_id("fast").payload, vec![0xAA]);
    assert_eq!(by_id("slow").call_state, CallState::Failed);
    assert_eq!(by_id("slow").error_msg, "Timeout");
    assert!(events.count(ClientEventKind::Timeout, "") >= 1);

    // The slow endpoint answers long after the call returned. Its
    // continuation still finds its slot in the aggregation record alive.
    std::thread::sleep(Duration::from_millis(2000));

    manager.stop();
}

#[test]
fn stopping_a_session_fails_the_inflight_call() {
    let manager = manager();
    let server = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostA", SERVICE, "nap"),
            sleepy_callback(Duration::from_millis(1000), vec![0x01]),
            null_server_events(),
        )
        .expect("server");

    let session = manager
        .client_manager()
        .create_client(1, "127.0.0.1", server.local_port(), null_session_events())
        .expect("session");

    let request = RequestEnvelope::new("nap", Vec::new()).encode().expect("encode");
    let (tx, rx) = std::sync::mpsc::channel();
    session.async_call(
        Bytes::from(request),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    std::thread::sleep(Duration::from_millis(100));
    session.stop();

    let result = rx.recv_timeout(Duration::from_secs(1)).expect("continuation fired");
    let err = result.expect_err("call must fail");
    let rendered = err.to_string();
    assert_ne!(rendered, "Timeout");
    assert!(rendered.contains("transport error"), "got {rendered}");

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(session.state(), SessionState::Stopped);

    manager.stop();
}

#[test]
fn host_filter_restricts_fanout() {
    let manager = manager();
    let registry = StaticRegistry::new();
    let mut endpoints = Vec::new();
    let mut counters = Vec::new();
    for host in ["h1", "h2", "h3"] {
        let counter = Arc::new(AtomicUsize::new(0));
        let handler: ServiceCallback = {
            let counter = counter.clone();
            Arc::new(move |_method, _request| {
                counter.fetch_add(1, Ordering::SeqCst);
                ServiceCallResponse::executed(Vec::new(), 0)
            })
        };
        let server = manager
            .server_manager()
            .create_server(1, 0, test_identity(host, SERVICE, host), handler, null_server_events())
            .expect("server");
        endpoints.push(loopback_endpoint(host, host, SERVICE, 0, server.local_port(), 1));
        counters.push((host, counter, server));
    }
    registry.set_endpoints(SERVICE, endpoints);

    let client = ServiceClient::new(
        SERVICE,
        test_process("h1"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );
    client.set_host_filter("h2");

    let (ok, responses) = client.call("touch", &[], Some(Duration::from_millis(1000)));
    assert!(ok);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].host_name, "h2");

    for (host, counter, _server) in &counters {
        let expected = usize::from(*host == "h2");
        assert_eq!(counter.load(Ordering::SeqCst), expected, "host {host}");
    }

    client.set_host_filter("*");
    let (_, responses) = client.call("touch", &[], Some(Duration::from_millis(1000)));
    assert_eq!(responses.len(), 3);

    manager.stop();
}

#[test]
fn sweep_retires_dead_endpoints() {
    let manager = manager();
    let alive = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostA", SERVICE, "alive"),
            echo_callback(),
            null_server_events(),
        )
        .expect("server");
    let doomed = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostB", SERVICE, "doomed"),
            echo_callback(),
            null_server_events(),
        )
        .expect("server");

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![
            loopback_endpoint("alive", "hostA", SERVICE, 0, alive.local_port(), 1),
            loopback_endpoint("doomed", "hostB", SERVICE, 0, doomed.local_port(), 1),
        ],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        registry.clone(),
        RecordingRegistration::new(),
        manager.client_manager(),
    );
    let events = EventLog::new();
    events.install(&client);

    let (ok, responses) = client.call("echo", &[1], Some(Duration::from_millis(1000)));
    assert!(ok);
    assert_eq!(responses.len(), 2);
    assert_eq!(events.count(ClientEventKind::Connected, "alive"), 1);
    assert_eq!(events.count(ClientEventKind::Connected, "doomed"), 1);

    // The registry drops the endpoint and its server dies.
    registry.set_endpoints(
        SERVICE,
        vec![loopback_endpoint("alive", "hostA", SERVICE, 0, alive.local_port(), 1)],
    );
    doomed.stop();
    std::thread::sleep(Duration::from_millis(300));

    client.refresh_registration();
    assert_eq!(events.count(ClientEventKind::Disconnected, "doomed"), 1);

    // A second sweep stays quiet and connect events are not repeated.
    client.refresh_registration();
    assert_eq!(events.count(ClientEventKind::Disconnected, "doomed"), 1);
    assert_eq!(events.count(ClientEventKind::Connected, "alive"), 1);

    // Disconnect never precedes the matching connect.
    let connected = events.position(ClientEventKind::Connected, "doomed").expect("connect seen");
    let disconnected = events
        .position(ClientEventKind::Disconnected, "doomed")
        .expect("disconnect seen");
    assert!(connected < disconnected);

    let (ok, responses) = client.call("echo", &[2], Some(Duration::from_millis(1000)));
    assert!(ok);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].service_id, "alive");

    manager.stop();
}

#[test]
fn protocol_version_selection() {
    let manager = manager();
    let v1_server = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostX", SERVICE, "x"),
            fixed_callback(vec![0x11]),
            null_server_events(),
        )
        .expect("server");
    let v0_server = manager
        .server_manager()
        .create_server(
            0,
            0,
            test_identity("hostY", SERVICE, "y"),
            fixed_callback(vec![0x22]),
            null_server_events(),
        )
        .expect("server");

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![
            // The v0 port of X is deliberately bogus: a correct client
            // never dials it because X advertises a v1 port.
            loopback_endpoint("x", "hostX", SERVICE, 5000, v1_server.local_port(), 1),
            // Y advertises no v1 port, so v0 framing applies regardless of
            // the advertised version.
            loopback_endpoint("y", "hostY", SERVICE, v0_server.local_port(), 0, 0),
        ],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostX"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );

    let (ok, responses) = client.call("ping", &[], Some(Duration::from_millis(1000)));
    assert!(ok);
    assert_eq!(responses.len(), 2);
    let by_id = |id: &str| -> &ServiceResponse {
        responses.iter().find(|r| r.service_id == id).expect(id)
    };
    assert_eq!(by_id("x").call_state, CallState::Executed);
    assert_eq!(by_id("x").payload, vec![0x11]);
    assert_eq!(by_id("y").call_state, CallState::Executed);
    assert_eq!(by_id("y").payload, vec![0x22]);

    manager.stop();
}

#[test]
fn requests_never_overlap_on_one_session() {
    let manager = manager();
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let handler: ServiceCallback = {
        let in_flight = in_flight.clone();
        let overlapped = overlapped.clone();
        Arc::new(move |_method, request| {
            if in_flight.swap(true, Ordering::SeqCst) {
                overlapped.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(5));
            in_flight.store(false, Ordering::SeqCst);
            ServiceCallResponse::executed(request.to_vec(), 0)
        })
    };
    let server = manager
        .server_manager()
        .create_server(1, 0, test_identity("hostA", SERVICE, "one"), handler, null_server_events())
        .expect("server");

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![loopback_endpoint("one", "hostA", SERVICE, 0, server.local_port(), 1)],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );

    let client_a = client.clone();
    let client_b = client.clone();
    let spam = |client: Arc<ServiceClient>| {
        std::thread::spawn(move || {
            for i in 0..5u8 {
                let (ok, responses) = client.call("echo", &[i], Some(Duration::from_millis(2000)));
                assert!(ok);
                assert_eq!(responses[0].payload, vec![i]);
            }
        })
    };
    let a = spam(client_a);
    let b = spam(client_b);
    a.join().expect("thread a");
    b.join().expect("thread b");

    assert!(!overlapped.load(Ordering::SeqCst));

    manager.stop();
}

#[test]
fn round_trip_preserves_handler_bytes() {
    let manager = manager();
    let server = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostA", SERVICE, "echo"),
            echo_callback(),
            null_server_events(),
        )
        .expect("server");

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![loopback_endpoint("echo", "hostA", SERVICE, 0, server.local_port(), 1)],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );

    let request: Vec<u8> = (0u16..1024).map(|i| (i % 251) as u8).collect();
    let (ok, responses) = client.call("echo", &request, Some(Duration::from_millis(1000)));
    assert!(ok);
    assert_eq!(responses[0].payload, request);

    manager.stop();
}

#[test]
fn async_call_reports_through_response_callback() {
    let manager = manager();
    let server = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostA", SERVICE, "echo"),
            echo_callback(),
            null_server_events(),
        )
        .expect("server");

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![loopback_endpoint("echo", "hostA", SERVICE, 0, server.local_port(), 1)],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );

    let (tx, rx) = std::sync::mpsc::channel::<ServiceResponse>();
    client.add_response_callback(Arc::new(move |response| {
        let _ = tx.send(response.clone());
    }));

    assert!(client.call_async("echo", &[9]));
    let response = rx.recv_timeout(Duration::from_secs(2)).expect("response");
    assert_eq!(response.call_state, CallState::Executed);
    assert_eq!(response.payload, vec![9]);

    manager.stop();
}

#[test]
fn missing_endpoints_fail_without_io() {
    let manager = manager();
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        StaticRegistry::new(),
        RecordingRegistration::new(),
        manager.client_manager(),
    );

    let started = Instant::now();
    let (ok, responses) = client.call("echo", &[1], None);
    assert!(!ok);
    assert!(responses.is_empty());
    // An indefinite wait over zero endpoints must still return at once.
    assert!(started.elapsed() < Duration::from_millis(100));

    let (tx, rx) = std::sync::mpsc::channel::<ServiceResponse>();
    client.add_response_callback(Arc::new(move |response| {
        let _ = tx.send(response.clone());
    }));
    assert!(!client.call_async("echo", &[1]));
    let response = rx.recv_timeout(Duration::from_secs(1)).expect("error response");
    assert_eq!(response.call_state, CallState::Failed);

    manager.stop();
}

#[test]
fn stopped_manager_refuses_new_sessions() {
    let manager = manager();
    manager.stop();

    let err = manager
        .client_manager()
        .create_client(1, "127.0.0.1", 1, null_session_events())
        .expect_err("stopped manager");
    assert!(matches!(err, kestrel::CallError::NotReady));

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![loopback_endpoint("k", "hostA", SERVICE, 0, 1, 1)],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );
    let (ok, responses) = client.call("echo", &[1], Some(Duration::from_millis(200)));
    assert!(!ok);
    assert!(responses.is_empty());
}

#[test]
fn manager_stop_retires_existing_sessions() {
    let manager = manager();
    let server = manager
        .server_manager()
        .create_server(
            1,
            0,
            test_identity("hostA", SERVICE, "echo"),
            echo_callback(),
            null_server_events(),
        )
        .expect("server");

    let registry = StaticRegistry::new();
    registry.set_endpoints(
        SERVICE,
        vec![loopback_endpoint("k1", "hostA", SERVICE, 0, server.local_port(), 1)],
    );
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        registry,
        RecordingRegistration::new(),
        manager.client_manager(),
    );
    let events = EventLog::new();
    events.install(&client);

    let (ok, responses) = client.call("echo", &[1], Some(Duration::from_millis(1000)));
    assert!(ok);
    assert_eq!(responses.len(), 1);
    assert!(client.is_connected());

    manager.stop();

    // A stopped manager is reported synchronously, with no per-slot noise.
    let (ok, responses) = client.call("echo", &[1], Some(Duration::from_millis(200)));
    assert!(!ok);
    assert!(responses.is_empty());

    // The sweep retires the stopped session and the client no longer looks
    // connected.
    client.refresh_registration();
    assert!(!client.is_connected());
    assert_eq!(events.count(ClientEventKind::Disconnected, "k1"), 1);
}

#[test]
fn registration_lifecycle_is_reported() {
    let manager = manager();
    let registration = RecordingRegistration::new();
    let client = ServiceClient::new(
        SERVICE,
        test_process("hostA"),
        StaticRegistry::new(),
        registration.clone(),
        manager.client_manager(),
    );
    assert_eq!(registration.register_count(), 1);

    client.refresh_registration();
    assert_eq!(registration.register_count(), 2);

    drop(client);
    assert_eq!(registration.unregister_count(), 1);

    manager.stop();
}
