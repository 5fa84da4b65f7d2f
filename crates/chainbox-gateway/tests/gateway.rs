use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use chainbox_gateway::{
    gate::AccessGate,
    routes,
    state::{AppState, PROXY_TIMEOUT},
};
use chainbox_instance::{InstanceId, InstanceRecord};
use chainbox_node::{
    InstanceManager, InstanceStore, LaunchError, LaunchedNode, MemoryStore, NodeHandle,
    NodeLauncher, launcher::generate_mnemonic,
};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &str = "correct-horse-battery-staple";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum StubMode {
    #[default]
    Echo,
    /// Answers every call with HTTP 500 and a JSON-RPC error.
    Fail,
    /// Never answers.
    Hang,
}

#[derive(Clone)]
struct StubNode {
    forwarded: Arc<AtomicUsize>,
    mode: StubMode,
    tag: Option<&'static str>,
}

async fn stub_rpc(State(node): State<StubNode>, Json(req): Json<Value>) -> Response {
    node.forwarded.fetch_add(1, Ordering::SeqCst);
    match node.mode {
        StubMode::Echo => {}
        StubMode::Fail => {
            let body = json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": {"code": -32000, "message": "fork upstream failed"},
            });
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
        StubMode::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }
    let result = match (node.tag, req["method"].as_str()) {
        (Some(tag), _) => json!(tag),
        (None, Some("eth_chainId")) => json!("0x539"),
        (None, Some(other)) => json!(format!("called {other}")),
        (None, None) => Value::Null,
    };
    (
        [("x-stub-node", "1")],
        Json(json!({"jsonrpc": "2.0", "id": req["id"], "result": result})),
    )
        .into_response()
}

async fn spawn_stub(node: StubNode) -> std::io::Result<(u16, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let app = Router::new().route("/", post(stub_rpc)).with_state(node);
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((port, server))
}

struct StubHandle {
    server: tokio::task::AbortHandle,
    terminations: Arc<AtomicUsize>,
}

impl NodeHandle for StubHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(self: Box<Self>) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.server.abort();
    }
}

/// Serves a fake JSON-RPC node in-process instead of spawning anvil.
#[derive(Default)]
struct StubLauncher {
    forwarded: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
    fail: bool,
    mode: StubMode,
}

#[async_trait::async_trait]
impl NodeLauncher for StubLauncher {
    async fn launch(&self) -> Result<LaunchedNode, LaunchError> {
        if self.fail {
            return Err(LaunchError::Exited("exit status: 101 (fork url unreachable)".to_string()));
        }
        let node = StubNode {
            forwarded: self.forwarded.clone(),
            mode: self.mode,
            tag: None,
        };
        let (port, server) = spawn_stub(node).await.map_err(|source| LaunchError::Spawn {
            bin: "stub".to_string(),
            source,
        })?;

        Ok(LaunchedNode {
            id: InstanceId::new(),
            mnemonic: generate_mnemonic()?,
            port,
            pid: None,
            handle: Box::new(StubHandle {
                server: server.abort_handle(),
                terminations: self.terminations.clone(),
            }),
        })
    }
}

struct Harness {
    app: Router,
    manager: InstanceManager,
    forwarded: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
}

fn build(
    launcher: StubLauncher,
    store: Arc<MemoryStore>,
    ttl: Duration,
    proxy_timeout: Duration,
) -> Harness {
    let forwarded = launcher.forwarded.clone();
    let terminations = launcher.terminations.clone();
    let manager = InstanceManager::new(store, Arc::new(launcher), ttl);
    let state = AppState::with_proxy_timeout(manager.clone(), AccessGate::new(SECRET), proxy_timeout);
    Harness {
        app: routes::router(state),
        manager,
        forwarded,
        terminations,
    }
}

fn harness_with(launcher: StubLauncher, ttl: Duration) -> Harness {
    build(launcher, Arc::new(MemoryStore::new()), ttl, PROXY_TIMEOUT)
}

fn harness() -> Harness {
    harness_with(StubLauncher::default(), Duration::from_secs(600))
}

fn post_json(uri: &str, body: &Value, auth: bool) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if auth {
        req = req.header(header::AUTHORIZATION, format!("Bearer {SECRET}"));
    }
    req.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Bytes) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body)
}

async fn send_json(app: &Router, req: Request<Body>) -> Value {
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

async fn new_instance(app: &Router) -> String {
    let v = send_json(app, post_json("/new", &json!({}), true)).await;
    assert_eq!(v["ok"], true, "{v}");
    v["uuid"].as_str().unwrap().to_string()
}

fn chain_id_call(id: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": "eth_chainId", "params": []})
}

#[tokio::test]
async fn index_is_a_liveness_probe() {
    let h = harness();
    let (status, body) = send(&h.app, Request::get("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn new_requires_the_shared_secret() {
    let h = harness();
    let v = send_json(&h.app, post_json("/new", &json!({}), false)).await;
    assert_eq!(v, json!({"ok": false, "error": "nice try"}));

    let mut wrong = post_json("/new", &json!({}), false);
    wrong
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer not-it".parse().unwrap());
    let v = send_json(&h.app, wrong).await;
    assert_eq!(v["error"], "nice try");
}

#[tokio::test]
async fn new_returns_uuid_and_seed_material() {
    let h = harness();
    let v = send_json(&h.app, post_json("/new", &json!({}), true)).await;
    assert_eq!(v["ok"], true);
    let uuid = v["uuid"].as_str().unwrap();
    assert!(InstanceId::parse(uuid).is_some());
    let seed = v["seed_material"].as_str().unwrap();
    assert_eq!(seed.split_whitespace().count(), 12);
}

#[tokio::test]
async fn launch_failure_is_reported_generically() {
    let h = harness_with(
        StubLauncher {
            fail: true,
            ..Default::default()
        },
        Duration::from_secs(600),
    );
    let v = send_json(&h.app, post_json("/new", &json!({}), true)).await;
    assert_eq!(
        v,
        json!({
            "ok": false,
            "error": "error_starting_chain",
            "message": "An error occurred while starting the chain",
        })
    );
    assert!(!v.to_string().contains("fork url"));
}

#[tokio::test]
async fn unknown_instance_echoes_request_id() {
    let h = harness();
    let unknown = InstanceId::new();
    for id in [json!(1), json!("req-7"), json!(null), json!({"nested": [1, 2]})] {
        for path in [format!("/{unknown}"), "/not-a-uuid".to_string()] {
            let v = send_json(&h.app, post_json(&path, &chain_id_call(id.clone()), false)).await;
            assert_eq!(
                v,
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": "invalid uuid specified"},
                })
            );
        }
    }
    assert_eq!(h.forwarded.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_bodies_are_never_forwarded() {
    let h = harness();
    let uuid = new_instance(&h.app).await;
    let path = format!("/{uuid}");

    let v = send_json(&h.app, post_json(&path, &json!({"id": 3, "params": []}), true)).await;
    assert_eq!(v["id"], 3);
    assert_eq!(v["error"]["code"], -32600);
    assert_eq!(v["error"]["message"], "invalid request");

    let v = send_json(&h.app, post_json(&path, &json!({"id": 4, "method": ["eth_chainId"]}), true)).await;
    assert_eq!(v["id"], 4);
    assert_eq!(v["error"]["code"], -32600);

    // Notifications and batches get an empty reply.
    for body in [json!({"method": "eth_chainId"}), json!([chain_id_call(json!(1))])] {
        let (status, bytes) = send(&h.app, post_json(&path, &body, true)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(bytes.is_empty());
    }

    let not_json = Request::post(&path)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(chain_id_call(json!(1)).to_string()))
        .unwrap();
    let (_, bytes) = send(&h.app, not_json).await;
    assert_eq!(&bytes[..], b"invalid content type, only application/json is supported");

    let broken = Request::post(&path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"id\": 1, \"method\":"))
        .unwrap();
    let (_, bytes) = send(&h.app, broken).await;
    assert_eq!(&bytes[..], b"invalid content type, only application/json is supported");

    assert_eq!(h.forwarded.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn allow_listed_methods_need_no_credential() {
    let h = harness();
    let uuid = new_instance(&h.app).await;

    let resp = h
        .app
        .clone()
        .oneshot(post_json(&format!("/{uuid}"), &chain_id_call(json!(1)), false))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-stub-node").unwrap(), "1");
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v, json!({"jsonrpc": "2.0", "id": 1, "result": "0x539"}));

    for method in ["eth_blockNumber", "eth_sendRawTransaction", "web3_clientVersion"] {
        let call = json!({"jsonrpc": "2.0", "id": 2, "method": method, "params": []});
        let v = send_json(&h.app, post_json(&format!("/{uuid}"), &call, false)).await;
        assert_eq!(v["result"], format!("called {method}"));
    }
    assert_eq!(h.forwarded.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn privileged_methods_require_escalation() {
    let h = harness();
    let uuid = new_instance(&h.app).await;
    let path = format!("/{uuid}");
    let call = json!({"jsonrpc": "2.0", "id": "set", "method": "anvil_setBalance", "params": ["0x00", "0x1"]});

    let v = send_json(&h.app, post_json(&path, &call, false)).await;
    assert_eq!(
        v,
        json!({
            "jsonrpc": "2.0",
            "id": "set",
            "error": {"code": -32600, "message": "invalid request"},
        })
    );
    assert_eq!(h.forwarded.load(Ordering::SeqCst), 0);

    let v = send_json(&h.app, post_json(&path, &call, true)).await;
    assert_eq!(v["result"], "called anvil_setBalance");
    assert_eq!(h.forwarded.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn kill_is_authenticated_and_idempotent() {
    let h = harness();
    let uuid = new_instance(&h.app).await;

    let v = send_json(&h.app, post_json("/kill", &json!({"uuid": uuid}), false)).await;
    assert_eq!(v["error"], "nice try");

    let v = send_json(&h.app, post_json("/kill", &json!({"uuid": uuid}), true)).await;
    assert_eq!(v, json!({"ok": true, "message": "Instance killed"}));

    let v = send_json(&h.app, post_json("/kill", &json!({"uuid": uuid}), true)).await;
    assert_eq!(
        v,
        json!({"ok": false, "error": "not_running", "message": "No instance is running!"})
    );
    assert_eq!(h.terminations.load(Ordering::SeqCst), 1);

    let v = send_json(&h.app, post_json(&format!("/{uuid}"), &chain_id_call(json!(9)), false)).await;
    assert_eq!(v["error"]["code"], -32602);
    assert_eq!(v["id"], 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_kills_terminate_once() {
    let h = harness();
    let uuid = new_instance(&h.app).await;

    let (a, b) = tokio::join!(
        send_json(&h.app, post_json("/kill", &json!({"uuid": uuid}), true)),
        send_json(&h.app, post_json("/kill", &json!({"uuid": uuid}), true)),
    );
    let oks = [&a, &b].iter().filter(|v| v["ok"] == true).count();
    assert_eq!(oks, 1, "{a} {b}");
    for v in [&a, &b] {
        if v["ok"] == false {
            assert_eq!(v["error"], "not_running");
        }
    }
    assert_eq!(h.terminations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn kill_rejects_bodies_without_uuid() {
    let h = harness();
    let v = send_json(&h.app, post_json("/kill", &json!({"id": 1}), true)).await;
    assert_eq!(v["ok"], false);
    assert_eq!(v["error"], "invalid_request");

    let v = send_json(&h.app, post_json("/kill", &json!({"uuid": "nope"}), true)).await;
    assert_eq!(v["error"], "not_running");
}

#[tokio::test]
async fn instance_expires_after_ttl() {
    let h = harness_with(StubLauncher::default(), Duration::from_millis(300));
    let uuid = new_instance(&h.app).await;
    let path = format!("/{uuid}");

    let v = send_json(&h.app, post_json(&path, &chain_id_call(json!(1)), false)).await;
    assert_eq!(v["id"], 1);
    assert_eq!(v["result"], "0x539");

    tokio::time::sleep(Duration::from_millis(700)).await;

    let v = send_json(&h.app, post_json(&path, &chain_id_call(json!(1)), false)).await;
    assert_eq!(v["id"], 1);
    assert_eq!(v["error"]["code"], -32602);
    assert_eq!(v["error"]["message"], "invalid uuid specified");
    assert_eq!(h.terminations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn responses_carry_cors_headers() {
    let h = harness();
    let req = Request::get("/")
        .header(header::ORIGIN, "https://ctf.example")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn upstream_error_status_is_relayed() {
    let h = harness_with(
        StubLauncher {
            mode: StubMode::Fail,
            ..Default::default()
        },
        Duration::from_secs(600),
    );
    let uuid = new_instance(&h.app).await;

    let (status, body) = send(&h.app, post_json(&format!("/{uuid}"), &chain_id_call(json!(5)), false)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["id"], 5);
    assert_eq!(v["error"]["message"], "fork upstream failed");
    assert_eq!(h.forwarded.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hung_node_times_out_as_internal_error() {
    let h = build(
        StubLauncher {
            mode: StubMode::Hang,
            ..Default::default()
        },
        Arc::new(MemoryStore::new()),
        Duration::from_secs(600),
        Duration::from_millis(200),
    );
    let uuid = new_instance(&h.app).await;

    let call = send_json(&h.app, post_json(&format!("/{uuid}"), &chain_id_call(json!("slow")), false));
    let v = tokio::time::timeout(Duration::from_secs(10), call)
        .await
        .expect("proxy must give up on a hung node");
    assert_eq!(
        v,
        json!({
            "jsonrpc": "2.0",
            "id": "slow",
            "error": {"code": -32603, "message": "internal error"},
        })
    );
}

#[tokio::test]
async fn records_from_a_previous_run_are_purged_at_boot() {
    // Another participant's node now listens on the port the old record names.
    let foreign_calls = Arc::new(AtomicUsize::new(0));
    let (foreign_port, _foreign) = spawn_stub(StubNode {
        forwarded: foreign_calls.clone(),
        mode: StubMode::Echo,
        tag: Some("someone-elses-node"),
    })
    .await
    .unwrap();

    let now = chrono::Utc::now();
    let orphan = InstanceRecord {
        uuid: InstanceId::new(),
        port: foreign_port,
        mnemonic: "test test test test test test test test test test test junk".to_string(),
        pid: Some(99999),
        created_at: now - chrono::Duration::hours(2),
        expires_at: now - chrono::Duration::hours(1),
    };
    let store = Arc::new(MemoryStore::new());
    store.put(&orphan).await.unwrap();

    let h = build(StubLauncher::default(), store, Duration::from_millis(100), PROXY_TIMEOUT);
    assert_eq!(h.manager.purge_stale().await.unwrap(), vec![orphan.uuid.clone()]);
    assert!(!h.manager.is_live(&orphan.uuid).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let v = send_json(&h.app, post_json(&format!("/{}", orphan.uuid), &chain_id_call(json!(1)), false)).await;
    assert_eq!(
        v,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32602, "message": "invalid uuid specified"},
        })
    );
    assert_eq!(foreign_calls.load(Ordering::SeqCst), 0);
}
