use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use mudband_client::Client;
use mudband_client::api::ApiClient;
use mudband_client::confsync::{ConfigError, FetchOutcome};
use mudband_client::engine::{EngineError, EngineEvent, KeyPair, TunnelEngine, generate_key_pair};
use mudband_client::enroll::{EnrollError, EnrollOutcome, UnenrollOutcome};
use mudband_client::error::ErrorKind;
use mudband_client::platform::{PlatformError, PlatformTunnelController, TunnelHandle, TunnelSettings};
use mudband_client::session::{ConnectOutcome, SessionError};
use mudband_client::status::{ConnectionStatus, LifecycleGate};
use mudband_client::store::BandStore;
use mudband_types::api::{ControlReply, FetchType};
use mudband_types::conf::BandConfig;
use mudband_types::{BandAdmin, Enrollment, NatType};

// -- Shared call journal, so ordering across engine and platform is visible --

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// -- Fake engine --

struct FakeEngine {
    journal: Journal,
    ping_replies: Mutex<VecDeque<ControlReply>>,
    fail_start: AtomicBool,
    events: Mutex<Option<mpsc::Sender<EngineEvent>>>,
    applied: Mutex<Vec<BandConfig>>,
}

impl FakeEngine {
    fn new(journal: Journal) -> Self {
        Self {
            journal,
            ping_replies: Mutex::new(VecDeque::new()),
            fail_start: AtomicBool::new(false),
            events: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> mpsc::Sender<EngineEvent> {
        self.events.lock().unwrap().clone().expect("packet loop not started")
    }
}

impl TunnelEngine for FakeEngine {
    fn create_key_pair(&self) -> Result<KeyPair, EngineError> {
        Ok(generate_key_pair())
    }

    fn local_interface_addresses(&self) -> Vec<String> {
        vec!["192.168.1.10".into()]
    }

    fn listen_port(&self) -> u16 {
        51820
    }

    fn stun_mapped_address(&self) -> Option<String> {
        Some("203.0.113.7".into())
    }

    fn stun_nat_type(&self) -> NatType {
        NatType::Open
    }

    async fn start_packet_loop(
        &self,
        tunnel: &TunnelHandle,
        _enrollment: &Enrollment,
        config: &BandConfig,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), EngineError> {
        if self.fail_start.load(Ordering::SeqCst) {
            self.journal.push("engine:start-failed");
            return Err(EngineError::Device("rejected".into()));
        }
        self.journal.push(format!("engine:start:{}", tunnel.interface));
        self.applied.lock().unwrap().push(config.clone());
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn update_config(&self, config: &BandConfig) -> Result<(), EngineError> {
        self.journal.push("engine:update");
        self.applied.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn stop_packet_loop(&self) -> Result<(), EngineError> {
        self.journal.push("engine:stop");
        self.events.lock().unwrap().take();
        Ok(())
    }

    async fn send_control_message(&self, message: &str) -> Result<ControlReply, EngineError> {
        assert_eq!(message, "ping");
        Ok(self
            .ping_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ControlReply::okay))
    }
}

// -- Fake platform --

struct FakePlatform {
    journal: Journal,
    running: Mutex<Option<String>>,
}

impl FakePlatform {
    fn new(journal: Journal) -> Self {
        Self {
            journal,
            running: Mutex::new(None),
        }
    }
}

impl PlatformTunnelController for FakePlatform {
    async fn ensure_profile(&self) -> Result<(), PlatformError> {
        self.journal.push("platform:ensure_profile");
        Ok(())
    }

    async fn start(&self, settings: &TunnelSettings) -> Result<TunnelHandle, PlatformError> {
        self.journal.push(format!(
            "platform:start:{}:{}/{}",
            settings.interface, settings.address, settings.prefix_len
        ));
        *self.running.lock().unwrap() = Some(settings.interface.clone());
        Ok(TunnelHandle {
            interface: settings.interface.clone(),
        })
    }

    async fn stop(&self, tunnel: &TunnelHandle) -> Result<(), PlatformError> {
        self.journal.push(format!("platform:stop:{}", tunnel.interface));
        self.running.lock().unwrap().take();
        Ok(())
    }

    async fn status(&self) -> Result<ConnectionStatus, PlatformError> {
        Ok(if self.running.lock().unwrap().is_some() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        })
    }
}

// -- Scripted control plane --

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    delay: Duration,
}

impl MockResponse {
    fn json(body: Value) -> Self {
        Self::raw(200, &body.to_string())
    }

    fn raw(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    fn not_modified() -> Self {
        Self::raw(304, "")
    }

    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

struct MockServer {
    addr: SocketAddr,
    script: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    _shutdown: oneshot::Sender<()>,
}

impl MockServer {
    fn push(&self, response: MockResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Spawn a tiny HTTP server answering requests with scripted responses, one
/// connection per request.
async fn spawn_mock_api(script: Vec<MockResponse>) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let script = Arc::new(Mutex::new(VecDeque::from(script)));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = oneshot::channel();

    let (s, r) = (Arc::clone(&script), Arc::clone(&requests));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let (stream, _) = accept.unwrap();
                    tokio::spawn(serve_one(stream, Arc::clone(&s), Arc::clone(&r)));
                }
                _ = &mut rx => break,
            }
        }
    });

    MockServer {
        addr,
        script,
        requests,
        _shutdown: tx,
    }
}

async fn serve_one(
    mut stream: TcpStream,
    script: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split(' ');
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    let response = {
        requests.lock().unwrap().push(RecordedRequest {
            method,
            path,
            headers,
            body,
        });
        script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockResponse::raw(500, "no scripted response"))
    };

    tokio::time::sleep(response.delay).await;

    let mut raw = format!("HTTP/1.1 {} OK\r\n", response.status);
    for (name, value) in &response.headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    if response.status != 304 {
        raw.push_str("Content-Type: application/json\r\n");
    }
    raw.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.body.len(),
        response.body
    ));
    let _ = stream.write_all(raw.as_bytes()).await;
    let _ = stream.shutdown().await;
}

// -- Harness --

type TestClient = Client<FakeEngine, FakePlatform>;

struct Harness {
    client: Arc<TestClient>,
    engine: Arc<FakeEngine>,
    platform: Arc<FakePlatform>,
    journal: Journal,
    server: MockServer,
    _dir: tempfile::TempDir,
}

async fn harness(script: Vec<MockResponse>) -> Harness {
    harness_with_ping(script, Duration::from_secs(3600)).await
}

async fn harness_with_ping(script: Vec<MockResponse>, ping: Duration) -> Harness {
    let server = spawn_mock_api(script).await;
    let dir = tempfile::tempdir().unwrap();
    let store = BandStore::open(dir.path().join("state")).await.unwrap();
    let api = ApiClient::new(&format!("http://{}", server.addr)).unwrap();
    let journal = Journal::default();
    let engine = Arc::new(FakeEngine::new(journal.clone()));
    let platform = Arc::new(FakePlatform::new(journal.clone()));
    let client = Client::new(api, store, Arc::clone(&engine), Arc::clone(&platform), ping);
    Harness {
        client: Arc::new(client),
        engine,
        platform,
        journal,
        server,
        _dir: dir,
    }
}

fn enrollment(uuid: &str, name: &str) -> Enrollment {
    Enrollment {
        band_uuid: uuid.into(),
        band_name: name.into(),
        jwt: format!("jwt-{uuid}"),
        wireguard_privkey: generate_key_pair().private_key,
        opt_public: false,
        device_name: "laptop".into(),
        enrolled_at: Utc::now(),
    }
}

async fn seed(h: &Harness, uuid: &str) -> Enrollment {
    let e = enrollment(uuid, "Home");
    h.client.store.persist_enrollment(&e).await.unwrap();
    e
}

fn conf_body(peer_names: &[&str]) -> Value {
    let peers: Vec<Value> = peer_names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            json!({
                "name": name,
                "private_ip": format!("10.0.0.{}", i + 3),
                "private_mask": "255.255.255.0",
                "nat_type": 7,
                "wireguard_pubkey": generate_key_pair().public_key,
                "device_addresses": [{"address": "192.0.2.4", "port": 51820, "type": "local"}]
            })
        })
        .collect();
    json!({
        "status": 200,
        "conf": {
            "interface": {
                "name": "mudband",
                "private_ip": "10.0.0.2",
                "private_mask": "255.255.255.0",
                "mtu": 1420,
                "listen_port": 51820,
                "nat_type": 2
            },
            "peers": peers,
            "links": [{"name": "wiki", "url": "https://wiki.example"}]
        }
    })
}

fn conf_response(etag: &str, peer_names: &[&str]) -> MockResponse {
    MockResponse::json(conf_body(peer_names)).header("ETag", etag)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// -- Enrollment --

#[tokio::test]
async fn enroll_persists_and_becomes_default() {
    let h = harness(vec![MockResponse::json(json!({
        "status": 200,
        "band": {"uuid": "b1", "name": "Home", "opt_public": 1},
        "jwt": "J1"
    }))])
    .await;
    let stale = h.client.store.config_path("b1");
    std::fs::write(&stale, conf_body(&[])["conf"].to_string()).unwrap();

    let outcome = h
        .client
        .enrollment
        .enroll("TOKEN-1", "laptop", None)
        .await
        .unwrap();

    let EnrollOutcome::Enrolled(enrolled) = outcome else {
        panic!("expected enrollment, got {outcome:?}");
    };
    assert_eq!(enrolled.band_uuid, "b1");
    assert_eq!(enrolled.jwt, "J1");
    assert!(enrolled.opt_public);
    assert_eq!(h.client.store.default_band_uuid().await.as_deref(), Some("b1"));
    assert!(!stale.exists(), "stale config must be dropped");

    let stored = h.client.store.load_enrollment("b1").await.unwrap().unwrap();
    assert_eq!(stored, enrolled);

    let requests = h.server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/api/band/enroll");
    let body = requests[0].json();
    assert_eq!(body["token"], "TOKEN-1");
    assert_eq!(body["name"], "laptop");
    assert_eq!(body["secret"], "");

    let private = STANDARD.decode(&stored.wireguard_privkey).unwrap();
    let private: [u8; 32] = private.try_into().unwrap();
    let public = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(private));
    assert_eq!(body["wireguard_pubkey"], STANDARD.encode(public.as_bytes()));
}

#[tokio::test]
async fn enroll_falls_back_to_band_jwt() {
    let h = harness(vec![MockResponse::json(json!({
        "status": 200,
        "band": {"uuid": "b1", "name": "Home", "opt_public": 0, "jwt": "NESTED"}
    }))])
    .await;

    let outcome = h
        .client
        .enrollment
        .enroll("T", "laptop", Some("s3cret"))
        .await
        .unwrap();

    assert!(matches!(outcome, EnrollOutcome::Enrolled(ref e) if e.jwt == "NESTED"));
    assert_eq!(h.server.requests()[0].json()["secret"], "s3cret");
}

#[tokio::test]
async fn enroll_mfa_is_distinct_outcome() {
    let h = harness(vec![MockResponse::json(json!({
        "status": 301,
        "sso_url": "https://sso.example/login"
    }))])
    .await;

    let outcome = h.client.enrollment.enroll("T", "laptop", None).await.unwrap();

    assert_eq!(
        outcome,
        EnrollOutcome::MfaRequired {
            sso_url: "https://sso.example/login".into()
        }
    );
    assert!(h.client.store.default_band_uuid().await.is_none());
    assert!(h.client.enrollment.list_enrollments().await.unwrap().is_empty());
}

#[tokio::test]
async fn enroll_rejection_carries_server_message() {
    let h = harness(vec![MockResponse::json(json!({
        "status": 400,
        "msg": "The enrollment token has expired."
    }))])
    .await;

    let err = h.client.enrollment.enroll("T", "laptop", None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerRejected);
    assert_eq!(err.user_message(), "The enrollment token has expired.");
    assert!(h.client.store.default_band_uuid().await.is_none());
}

#[tokio::test]
async fn enroll_transport_failure() {
    let h = harness(vec![]).await;
    let dead = ApiClient::new("http://127.0.0.1:1").unwrap();
    let manager = mudband_client::enroll::EnrollmentManager::new(
        dead,
        h.client.store.clone(),
        Arc::clone(&h.engine),
        h.client.status.clone(),
        LifecycleGate::default(),
    );

    let err = manager.enroll("T", "laptop", None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn concurrent_enroll_is_refused() {
    let h = harness(vec![
        MockResponse::json(json!({
            "status": 200,
            "band": {"uuid": "b1", "name": "Home", "opt_public": 0},
            "jwt": "J1"
        }))
        .delayed(Duration::from_millis(300)),
    ])
    .await;

    let client = Arc::clone(&h.client);
    let first = tokio::spawn(async move { client.enrollment.enroll("T", "laptop", None).await });
    wait_until("first enroll request", || !h.server.requests().is_empty()).await;

    let second = h.client.enrollment.enroll("T", "laptop", None).await;
    assert!(matches!(second, Err(EnrollError::InProgress)));
    assert!(matches!(first.await.unwrap(), Ok(EnrollOutcome::Enrolled(_))));
}

#[tokio::test]
async fn change_enrollment_during_enroll_is_refused() {
    let h = harness(vec![
        MockResponse::json(json!({
            "status": 200,
            "band": {"uuid": "b2", "name": "Work", "opt_public": 0},
            "jwt": "J2"
        }))
        .delayed(Duration::from_millis(300)),
    ])
    .await;
    seed(&h, "b1").await;

    let client = Arc::clone(&h.client);
    let enroll = tokio::spawn(async move { client.enrollment.enroll("T", "laptop", None).await });
    wait_until("enroll request", || !h.server.requests().is_empty()).await;

    let change = h.client.enrollment.change_enrollment("b1").await;
    assert!(matches!(change, Err(EnrollError::InProgress)));
    assert!(matches!(enroll.await.unwrap(), Ok(EnrollOutcome::Enrolled(_))));
    assert_eq!(h.client.store.default_band_uuid().await.as_deref(), Some("b2"));
}

#[tokio::test]
async fn unenroll_holds_off_connect() {
    let h = harness(vec![
        MockResponse::json(json!({"status": 200})).delayed(Duration::from_millis(400)),
    ])
    .await;
    seed(&h, "b1").await;

    let client = Arc::clone(&h.client);
    let unenroll = tokio::spawn(async move { client.enrollment.unenroll("b1").await });
    wait_until("unenroll request", || h.server.requests().len() == 1).await;

    let connect = h.client.session.connect().await;
    assert!(matches!(connect, Err(SessionError::InProgress)));
    assert_eq!(connect.unwrap_err().kind(), ErrorKind::LocalState);
    assert!(h.journal.entries().is_empty(), "connect must not touch the tunnel");
    assert_eq!(h.client.session.status(), ConnectionStatus::NotReady);

    assert_eq!(unenroll.await.unwrap().unwrap(), UnenrollOutcome::Removed);
    assert!(!h.client.store.enrollment_path("b1").exists());
    assert_eq!(h.server.requests().len(), 1);
}

#[tokio::test]
async fn connect_holds_off_enrollment_changes() {
    let h = harness(vec![conf_response("\"v1\"", &["A"]).delayed(Duration::from_millis(400))]).await;
    seed(&h, "b1").await;

    let client = Arc::clone(&h.client);
    let connect = tokio::spawn(async move { client.session.connect().await });
    wait_until("configuration request", || h.server.requests().len() == 1).await;

    let enrollment = &h.client.enrollment;
    let connecting = ConnectionStatus::Connecting;
    assert!(matches!(enrollment.unenroll("b1").await, Err(EnrollError::Busy(s)) if s == connecting));
    assert!(matches!(enrollment.change_enrollment("b1").await, Err(EnrollError::Busy(s)) if s == connecting));
    assert!(matches!(enrollment.enroll("T", "laptop", None).await, Err(EnrollError::Busy(s)) if s == connecting));

    assert_eq!(connect.await.unwrap().unwrap(), ConnectOutcome::Connected);
    assert!(matches!(
        enrollment.unenroll("b1").await,
        Err(EnrollError::Busy(ConnectionStatus::Connected))
    ));
    assert!(h.client.store.enrollment_path("b1").exists());
    assert_eq!(h.server.requests().len(), 1, "refused changes must not reach the server");
}

#[tokio::test]
async fn unenroll_with_device_not_found_removes_local_state() {
    let h = harness(vec![MockResponse::json(json!({"status": 506, "msg": "device not found"}))]).await;
    seed(&h, "b1").await;
    let store = &h.client.store;
    store.persist_config("b1", &BandConfig::default()).await.unwrap();
    store
        .save_admin(&BandAdmin {
            band_uuid: "b1".into(),
            jwt: "ADMIN".into(),
        })
        .await
        .unwrap();

    let outcome = h.client.enrollment.unenroll("b1").await.unwrap();

    assert_eq!(outcome, UnenrollOutcome::Removed);
    assert!(!store.enrollment_path("b1").exists());
    assert!(!store.config_path("b1").exists());
    assert!(!store.admin_path("b1").exists());
    assert!(store.default_band_uuid().await.is_none());

    let requests = h.server.requests();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/api/band/unenroll");
    assert_eq!(requests[0].header("authorization"), Some("jwt-b1"));
}

#[tokio::test]
async fn unenroll_band_not_found_is_success() {
    let h = harness(vec![MockResponse::json(json!({"status": 505}))]).await;
    seed(&h, "b1").await;

    assert_eq!(
        h.client.enrollment.unenroll("b1").await.unwrap(),
        UnenrollOutcome::Removed
    );
}

#[tokio::test]
async fn unenroll_is_idempotent() {
    let h = harness(vec![MockResponse::json(json!({"status": 200}))]).await;
    seed(&h, "b1").await;

    assert_eq!(
        h.client.enrollment.unenroll("b1").await.unwrap(),
        UnenrollOutcome::Removed
    );
    assert_eq!(
        h.client.enrollment.unenroll("b1").await.unwrap(),
        UnenrollOutcome::NotEnrolled
    );
    assert_eq!(h.server.requests().len(), 1, "second call must not reach the server");
}

#[tokio::test]
async fn unenroll_rejection_keeps_local_state() {
    let h = harness(vec![MockResponse::json(json!({"status": 500, "msg": "try again later"}))]).await;
    seed(&h, "b1").await;

    let err = h.client.enrollment.unenroll("b1").await.unwrap_err();

    assert_eq!(err.user_message(), "try again later");
    assert!(h.client.store.enrollment_path("b1").exists());
    assert_eq!(h.client.store.default_band_uuid().await.as_deref(), Some("b1"));
}

#[tokio::test]
async fn enrollment_changes_blocked_while_tunnel_active() {
    let h = harness(vec![]).await;
    seed(&h, "b1").await;

    for status in [
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Reasserting,
    ] {
        h.client.status.set(status);
        let enrollment = &h.client.enrollment;
        assert!(matches!(enrollment.change_enrollment("b1").await, Err(EnrollError::Busy(s)) if s == status));
        assert!(matches!(enrollment.unenroll("b1").await, Err(EnrollError::Busy(_))));
        assert!(matches!(enrollment.enroll("T", "laptop", None).await, Err(EnrollError::Busy(_))));
    }
    assert!(h.server.requests().is_empty());
    assert!(h.client.store.enrollment_path("b1").exists());

    h.client.status.set(ConnectionStatus::Disconnected);
    assert!(h.client.enrollment.change_enrollment("b1").await.unwrap());
}

#[tokio::test]
async fn change_enrollment_switches_default() {
    let h = harness(vec![]).await;
    h.client.store.persist_enrollment(&enrollment("b2", "Work")).await.unwrap();
    h.client.store.persist_enrollment(&enrollment("b1", "Home")).await.unwrap();

    assert!(!h.client.enrollment.change_enrollment("unknown").await.unwrap());
    assert_eq!(h.client.store.default_band_uuid().await.as_deref(), Some("b1"));

    assert!(h.client.enrollment.change_enrollment("b2").await.unwrap());
    let list = h.client.enrollment.list_enrollments().await.unwrap();
    let defaults: Vec<_> = list.iter().filter(|s| s.is_default).map(|s| s.band_uuid.as_str()).collect();
    assert_eq!(defaults, ["b2"]);
}

// -- Configuration sync --

#[tokio::test]
async fn first_fetch_stores_etag_and_config() {
    let h = harness(vec![conf_response("W/\"v1\"", &["A", "B"])]).await;
    seed(&h, "b1").await;

    let outcome = h
        .client
        .sync
        .fetch_config(FetchType::WhenItRunsFirst)
        .await
        .unwrap();

    let FetchOutcome::Updated(conf) = outcome else {
        panic!("expected update, got {outcome:?}");
    };
    assert_eq!(conf.etag.as_deref(), Some("\"v1\""));
    assert_eq!(conf.peers.len(), 2);
    assert_eq!(conf.links[0].url, "https://wiki.example");

    let on_disk: BandConfig =
        serde_json::from_slice(&std::fs::read(h.client.store.config_path("b1")).unwrap()).unwrap();
    assert_eq!(on_disk, conf);

    let request = &h.server.requests()[0];
    assert_eq!(request.path, "/api/band/conf");
    assert_eq!(request.header("authorization"), Some("jwt-b1"));
    assert_eq!(request.header("if-none-match"), None);
    let body = request.json();
    assert_eq!(body["fetch_type"], "when_it_runs_first");
    assert_eq!(body["stun_mapped_addr"], "203.0.113.7");
    assert_eq!(body["stun_nattype"], 2);
    assert_eq!(body["interface"]["listen_port"], 51820);
    assert_eq!(body["interface"]["addresses"], json!(["192.168.1.10", "203.0.113.7"]));

    // Not connected, so the engine is not touched.
    assert!(h.journal.entries().is_empty());
}

#[tokio::test]
async fn not_modified_keeps_cache_byte_identical() {
    let h = harness(vec![conf_response("\"v1\"", &["A"]), MockResponse::not_modified()]).await;
    seed(&h, "b1").await;
    let sync = &h.client.sync;

    sync.fetch_config(FetchType::WhenItRunsFirst).await.unwrap();
    let path = h.client.store.config_path("b1");
    let before = std::fs::read(&path).unwrap();
    let modified_before = std::fs::metadata(&path).unwrap().modified().unwrap();

    let outcome = sync.fetch_config(FetchType::WhenItGotsAEvent).await.unwrap();

    assert_eq!(outcome, FetchOutcome::NotModified);
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified_before);

    let requests = h.server.requests();
    assert_eq!(requests[1].header("if-none-match"), Some("\"v1\""));
    assert_eq!(requests[1].json()["fetch_type"], "when_it_gots_a_event");
}

#[tokio::test]
async fn fetch_mfa_sets_flag_until_next_success() {
    let h = harness(vec![
        MockResponse::json(json!({"status": 301, "sso_url": "https://sso.example/mfa"})),
        conf_response("\"v1\"", &[]),
    ])
    .await;
    seed(&h, "b1").await;

    let outcome = h.client.sync.fetch_config(FetchType::WhenItRunsFirst).await.unwrap();
    assert_eq!(
        outcome,
        FetchOutcome::MfaRequired {
            sso_url: "https://sso.example/mfa".into()
        }
    );
    assert_eq!(h.client.mfa.current().as_deref(), Some("https://sso.example/mfa"));
    assert!(!h.client.store.config_path("b1").exists());

    h.client.sync.fetch_config(FetchType::WhenItRunsFirst).await.unwrap();
    assert!(h.client.mfa.current().is_none());
}

#[tokio::test]
async fn fetch_rejection_keeps_cache() {
    let h = harness(vec![
        conf_response("\"v1\"", &["A"]),
        MockResponse::json(json!({"status": 403, "msg": "device disabled"})),
    ])
    .await;
    seed(&h, "b1").await;
    h.client.sync.fetch_config(FetchType::WhenItRunsFirst).await.unwrap();

    let err = h
        .client
        .sync
        .fetch_config(FetchType::WhenItGotsAEvent)
        .await
        .unwrap_err();

    assert!(matches!(err, ConfigError::Rejected { status: 403, ref msg } if msg == "device disabled"));
    let cached = h.client.store.load_config("b1").await.unwrap().unwrap();
    assert_eq!(cached.etag.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn fetch_without_enrollment_fails_locally() {
    let h = harness(vec![]).await;
    let err = h.client.sync.fetch_config(FetchType::WhenItRunsFirst).await.unwrap_err();
    assert!(matches!(err, ConfigError::NotEnrolled));
    assert_eq!(err.kind(), ErrorKind::LocalState);
    assert!(h.server.requests().is_empty());
}

#[tokio::test]
async fn later_fetch_wins_over_slow_earlier_fetch() {
    let h = harness(vec![
        conf_response("\"f1\"", &["old"]).delayed(Duration::from_millis(400)),
        conf_response("\"f2\"", &["new"]),
    ])
    .await;
    seed(&h, "b1").await;

    let sync = h.client.sync.clone();
    let f1 = tokio::spawn(async move { sync.fetch_config(FetchType::WhenItRunsFirst).await });
    wait_until("first fetch to reach the server", || h.server.requests().len() == 1).await;

    let f2 = h.client.sync.fetch_config(FetchType::WhenItGotsAEvent).await.unwrap();
    assert!(matches!(f2, FetchOutcome::Updated(ref c) if c.etag.as_deref() == Some("\"f2\"")));

    let f1 = f1.await.unwrap().unwrap();
    assert_eq!(f1, FetchOutcome::Superseded);

    let cached = h.client.store.load_config("b1").await.unwrap().unwrap();
    assert_eq!(cached.etag.as_deref(), Some("\"f2\""));
    assert_eq!(cached.peers[0].name, "new");
}

#[tokio::test]
async fn disconnect_cancels_in_flight_refresh() {
    let h = harness(vec![
        conf_response("\"v1\"", &["A"]),
        conf_response("\"v2\"", &["B"]).delayed(Duration::from_millis(300)),
    ])
    .await;
    seed(&h, "b1").await;
    h.client.session.connect().await.unwrap();

    h.client.sync.request_fetch(FetchType::WhenItGotsAEvent);
    wait_until("refresh request", || h.server.requests().len() == 2).await;
    h.client.session.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let cached = h.client.store.load_config("b1").await.unwrap().unwrap();
    assert_eq!(cached.etag.as_deref(), Some("\"v1\""));
    assert!(!h.journal.entries().iter().any(|e| e == "engine:update"));
}

#[tokio::test]
async fn new_background_fetch_aborts_previous() {
    let h = harness(vec![
        conf_response("\"v1\"", &["A"]).delayed(Duration::from_millis(400)),
        MockResponse::raw(502, "bad gateway"),
    ])
    .await;
    seed(&h, "b1").await;

    h.client.sync.request_fetch(FetchType::WhenItRunsFirst);
    wait_until("first background request", || h.server.requests().len() == 1).await;
    h.client.sync.request_fetch(FetchType::WhenItGotsAEvent);
    wait_until("second background request", || h.server.requests().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The second fetch failed and applied nothing; a surviving first worker
    // would have stored v1.
    assert!(!h.client.store.config_path("b1").exists());
}

// -- Session --

#[tokio::test]
async fn connect_and_disconnect_lifecycle() {
    let h = harness(vec![conf_response("\"v1\"", &["A"])]).await;
    seed(&h, "b1").await;
    let session = &h.client.session;
    assert_eq!(session.status(), ConnectionStatus::NotReady);

    let mut watcher = session.subscribe();
    assert_eq!(session.connect().await.unwrap(), ConnectOutcome::Connected);
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(watcher.has_changed().unwrap());
    assert_eq!(session.refresh_status().await, ConnectionStatus::Connected);

    assert!(matches!(
        session.connect().await,
        Err(SessionError::IllegalState { status: ConnectionStatus::Connected, .. })
    ));

    session.disconnect().await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    assert_eq!(
        h.journal.entries(),
        [
            "platform:ensure_profile",
            "platform:start:mudband:10.0.0.2/24",
            "engine:start:mudband",
            "engine:stop",
            "platform:stop:mudband",
        ]
    );
}

#[tokio::test]
async fn platform_loss_is_reported_and_torn_down() {
    let h = harness(vec![conf_response("\"v1\"", &[])]).await;
    seed(&h, "b1").await;
    h.client.session.connect().await.unwrap();

    h.platform.running.lock().unwrap().take();
    assert_eq!(h.client.session.refresh_status().await, ConnectionStatus::Disconnected);

    h.client.session.disconnect().await.unwrap();
    let entries = h.journal.entries();
    assert_eq!(&entries[entries.len() - 2..], ["engine:stop", "platform:stop:mudband"]);

    // Nothing left to tear down.
    h.client.session.disconnect().await.unwrap();
    assert_eq!(h.journal.entries().len(), entries.len());
}

#[tokio::test]
async fn invalid_status_survives_platform_poll() {
    let h = harness(vec![conf_response("\"v1\"", &[])]).await;
    seed(&h, "b1").await;
    h.client.session.connect().await.unwrap();

    h.engine
        .events()
        .send(EngineEvent::Fatal("socket closed".into()))
        .await
        .unwrap();
    wait_until("invalid status", || {
        h.client.session.status() == ConnectionStatus::Invalid
    })
    .await;

    assert_eq!(h.client.session.refresh_status().await, ConnectionStatus::Invalid);
}

#[tokio::test]
async fn platform_poll_cannot_reconnect() {
    let h = harness(vec![conf_response("\"v1\"", &[])]).await;
    seed(&h, "b1").await;
    h.client.session.connect().await.unwrap();

    // The platform still reports the tunnel up, but only connect may lock
    // enrollment again.
    h.client.status.set(ConnectionStatus::Disconnected);
    assert_eq!(h.client.session.refresh_status().await, ConnectionStatus::Disconnected);
    assert!(h.client.enrollment.change_enrollment("b1").await.unwrap());
}

#[tokio::test]
async fn disconnect_from_not_ready_is_illegal() {
    let h = harness(vec![]).await;
    assert!(matches!(
        h.client.session.disconnect().await,
        Err(SessionError::IllegalState { status: ConnectionStatus::NotReady, .. })
    ));
}

#[tokio::test]
async fn connect_with_mfa_returns_to_disconnected() {
    let h = harness(vec![MockResponse::json(json!({
        "status": 301,
        "sso_url": "https://sso.example/mfa"
    }))])
    .await;
    seed(&h, "b1").await;

    let outcome = h.client.session.connect().await.unwrap();

    assert_eq!(
        outcome,
        ConnectOutcome::MfaRequired {
            sso_url: "https://sso.example/mfa".into()
        }
    );
    assert_eq!(h.client.session.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.client.session.mfa_required().as_deref(), Some("https://sso.example/mfa"));
    assert_eq!(h.journal.entries(), ["platform:ensure_profile"]);

    h.client.session.clear_mfa();
    assert!(h.client.session.mfa_required().is_none());
}

#[tokio::test]
async fn connect_prefers_stale_config_over_none() {
    let h = harness(vec![
        conf_response("\"v1\"", &["A"]),
        MockResponse::raw(502, "bad gateway"),
    ])
    .await;
    seed(&h, "b1").await;
    h.client.sync.fetch_config(FetchType::WhenItRunsFirst).await.unwrap();

    assert_eq!(h.client.session.connect().await.unwrap(), ConnectOutcome::Connected);
    assert_eq!(h.engine.applied.lock().unwrap()[0].etag.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn connect_without_any_config_fails() {
    let h = harness(vec![MockResponse::raw(502, "bad gateway")]).await;
    seed(&h, "b1").await;

    let err = h.client.session.connect().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerRejected);
    assert_eq!(h.client.session.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.journal.entries(), ["platform:ensure_profile"]);
}

#[tokio::test]
async fn connect_with_not_modified_uses_cache() {
    let h = harness(vec![conf_response("\"v1\"", &["A"]), MockResponse::not_modified()]).await;
    seed(&h, "b1").await;
    h.client.sync.fetch_config(FetchType::WhenItRunsFirst).await.unwrap();

    assert_eq!(h.client.session.connect().await.unwrap(), ConnectOutcome::Connected);
    assert_eq!(h.engine.applied.lock().unwrap()[0].peers[0].name, "A");
}

#[tokio::test]
async fn engine_start_failure_marks_invalid() {
    let h = harness(vec![conf_response("\"v1\"", &[])]).await;
    seed(&h, "b1").await;
    h.engine.fail_start.store(true, Ordering::SeqCst);

    let err = h.client.session.connect().await.unwrap_err();

    assert!(matches!(err, SessionError::Engine(_)));
    assert_eq!(h.client.session.status(), ConnectionStatus::Invalid);
    assert_eq!(
        h.journal.entries(),
        [
            "platform:ensure_profile",
            "platform:start:mudband:10.0.0.2/24",
            "engine:start-failed",
            "platform:stop:mudband",
        ]
    );

    h.client.session.disconnect().await.unwrap();
    assert_eq!(h.client.session.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn ping_mfa_reply_sets_flag() {
    let h = harness_with_ping(vec![conf_response("\"v1\"", &[])], Duration::from_millis(20)).await;
    seed(&h, "b1").await;
    h.engine
        .ping_replies
        .lock()
        .unwrap()
        .push_back(ControlReply::mfa_required("https://sso.example/ping"));

    h.client.session.connect().await.unwrap();
    wait_until("MFA flag from ping", || h.client.mfa.is_required()).await;

    assert_eq!(h.client.mfa.current().as_deref(), Some("https://sso.example/ping"));
    assert_eq!(h.client.session.status(), ConnectionStatus::Connected);
    h.client.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn engine_refresh_event_reapplies_config() {
    let h = harness(vec![conf_response("\"v1\"", &["A"]), conf_response("\"v2\"", &["A", "B"])]).await;
    seed(&h, "b1").await;
    h.client.session.connect().await.unwrap();

    h.engine
        .events()
        .send(EngineEvent::ConfigRefreshRequired)
        .await
        .unwrap();
    wait_until("engine update", || {
        h.journal.entries().iter().any(|e| e == "engine:update")
    })
    .await;
    wait_until("status back to connected", || {
        h.client.session.status() == ConnectionStatus::Connected
    })
    .await;

    let requests = h.server.requests();
    assert_eq!(requests[1].json()["fetch_type"], "when_it_gots_a_event");
    assert_eq!(requests[1].header("if-none-match"), Some("\"v1\""));
    let cached = h.client.store.load_config("b1").await.unwrap().unwrap();
    assert_eq!(cached.etag.as_deref(), Some("\"v2\""));
    assert_eq!(h.engine.applied.lock().unwrap().last().unwrap().peers.len(), 2);
}

#[tokio::test]
async fn fatal_engine_event_marks_invalid() {
    let h = harness(vec![conf_response("\"v1\"", &[])]).await;
    seed(&h, "b1").await;
    h.client.session.connect().await.unwrap();

    h.engine
        .events()
        .send(EngineEvent::Fatal("socket closed".into()))
        .await
        .unwrap();
    wait_until("invalid status", || {
        h.client.session.status() == ConnectionStatus::Invalid
    })
    .await;

    h.client.session.disconnect().await.unwrap();
    assert_eq!(h.client.session.status(), ConnectionStatus::Disconnected);
}

// -- Guest bands and web CLI --

#[tokio::test]
async fn guest_band_flow() {
    let h = harness(vec![
        MockResponse::json(json!({"status": 200, "band_uuid": "g1", "jwt": "ADMIN"})),
        MockResponse::json(json!({"status": 200, "token": "T-GUEST"})),
        MockResponse::json(json!({
            "status": 200,
            "band": {"uuid": "g1", "name": "Guest band", "opt_public": 0},
            "jwt": "DEVICE"
        })),
        MockResponse::json(json!({"status": 200, "token_uuid": "SHARE-ME"})),
    ])
    .await;

    let outcome = h
        .client
        .enrollment
        .create_band_as_guest("Guest band", "for testing", "laptop")
        .await
        .unwrap();
    assert!(matches!(outcome, EnrollOutcome::Enrolled(ref e) if e.band_uuid == "g1"));

    let admin = h.client.store.load_admin("g1").await.unwrap().unwrap();
    assert_eq!(admin.jwt, "ADMIN");

    let token = h.client.enrollment.issue_enrollment_token().await.unwrap();
    assert_eq!(token, "SHARE-ME");

    let requests = h.server.requests();
    let paths: Vec<_> = requests.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        [
            "/api/band/anonymous/create",
            "/api/band/anonymous/enrollment/token/create",
            "/api/band/enroll",
            "/api/band/anonymous/enrollment/token",
        ]
    );
    assert_eq!(requests[0].json(), json!({"name": "Guest band", "description": "for testing"}));
    assert_eq!(requests[1].header("authorization"), Some("ADMIN"));
    assert_eq!(requests[2].json()["token"], "T-GUEST");
    assert_eq!(requests[3].header("authorization"), Some("ADMIN"));
}

#[tokio::test]
async fn concurrent_guest_band_creation_is_refused() {
    let h = harness(vec![
        MockResponse::json(json!({"status": 200, "band_uuid": "g1", "jwt": "ADMIN"}))
            .delayed(Duration::from_millis(300)),
        MockResponse::json(json!({"status": 200, "token": "T-GUEST"})),
        MockResponse::json(json!({
            "status": 200,
            "band": {"uuid": "g1", "name": "Guest band", "opt_public": 0},
            "jwt": "DEVICE"
        })),
    ])
    .await;

    let client = Arc::clone(&h.client);
    let first = tokio::spawn(async move {
        client
            .enrollment
            .create_band_as_guest("Guest band", "first", "laptop")
            .await
    });
    wait_until("band creation request", || !h.server.requests().is_empty()).await;

    let second = h
        .client
        .enrollment
        .create_band_as_guest("Guest band", "second", "laptop")
        .await;
    assert!(matches!(second, Err(EnrollError::InProgress)));
    assert!(matches!(first.await.unwrap(), Ok(EnrollOutcome::Enrolled(_))));

    let creates = h
        .server
        .requests()
        .iter()
        .filter(|r| r.path == "/api/band/anonymous/create")
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn token_requires_admin_record() {
    let h = harness(vec![]).await;
    seed(&h, "b1").await;

    let err = h.client.enrollment.issue_enrollment_token().await.unwrap_err();

    assert!(matches!(err, EnrollError::NotAdmin(ref uuid) if uuid == "b1"));
    assert!(h.server.requests().is_empty());
}

#[tokio::test]
async fn webcli_only_for_public_bands() {
    let h = harness(vec![MockResponse::json(json!({
        "status": 200,
        "url": "https://www.mud.band/webcli/s/abc"
    }))])
    .await;
    seed(&h, "b1").await;

    let err = h.client.enrollment.webcli_url().await.unwrap_err();
    assert!(matches!(err, EnrollError::NotPublic(_)));
    assert!(h.server.requests().is_empty());

    let public = Enrollment {
        opt_public: true,
        ..enrollment("b2", "Public")
    };
    h.client.store.persist_enrollment(&public).await.unwrap();

    let url = h.client.enrollment.webcli_url().await.unwrap();
    assert_eq!(url, "https://www.mud.band/webcli/s/abc");
    let request = &h.server.requests()[0];
    assert_eq!(request.path, "/webcli/signin");
    assert_eq!(request.header("authorization"), Some("jwt-b2"));
}

#[tokio::test]
async fn webcli_without_url_is_rejected() {
    let h = harness(vec![MockResponse::json(json!({"status": 200}))]).await;
    let public = Enrollment {
        opt_public: true,
        ..enrollment("b1", "Public")
    };
    h.client.store.persist_enrollment(&public).await.unwrap();

    let err = h.client.enrollment.webcli_url().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerRejected);
    assert_eq!(err.user_message(), "response did not include a sign-in URL");
}
