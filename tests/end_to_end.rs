//! End-to-end scenarios: a real coordinator serving its API on an ephemeral
//! port, real agent sessions over WebSocket, and a local echo target. All
//! fixtures stay on IPv4 loopback so they run on any host.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use dispatcher_core::agent::session::{self, SessionConfig};
use dispatcher_core::config::CoordinatorSettings;
use dispatcher_core::coordinator::{api, CoordinatorState};

struct TestCoordinator {
    base: String,
    state: Arc<CoordinatorState>,
    shutdown: CancellationToken,
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_coordinator() -> TestCoordinator {
    let shutdown = CancellationToken::new();
    let state = CoordinatorState::new(&CoordinatorSettings::default(), shutdown.clone()).unwrap();
    let app = api::router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
    });

    TestCoordinator {
        base: format!("http://{addr}"),
        state,
        shutdown,
    }
}

fn start_agent(coordinator_base: &str, agent_id: &str, ips: &[&str]) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let config = SessionConfig {
        coordinator_url: coordinator_base.replace("http://", "ws://"),
        agent_id: agent_id.to_string(),
        hostname: "test-host".to_string(),
        agent_version: "0.0.0-test".to_string(),
        max_in_flight: 8,
        heartbeat_interval: Duration::from_secs(15),
        advertise_addresses: Some(ips.iter().map(|s| s.to_string()).collect()),
    };
    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = session::run(config, token).await;
    });
    shutdown
}

/// Local target: `/echo` answers immediately, `/slow` sleeps 10 s first
async fn start_echo_server() -> SocketAddr {
    let app = Router::new()
        .route("/echo", get(|| async { "echo-ok" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "finally"
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn wait_for_pool_size(client: &reqwest::Client, base: &str, size: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status: Value = client
            .get(format!("{base}/api/pool/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["size"].as_u64() == Some(size) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "pool never reached size {size}: {status}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn execute(
    client: &reqwest::Client,
    base: &str,
    body: Value,
) -> (reqwest::StatusCode, Value) {
    let response = client
        .post(format!("{base}/api/execute"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    let body: Value = response.json().await.unwrap();
    (status, body)
}

#[tokio::test]
async fn single_agent_happy_path_rotates_source_ips() {
    let coordinator = start_coordinator().await;
    let echo = start_echo_server().await;
    let client = reqwest::Client::new();

    let agent = start_agent(&coordinator.base, "a1", &["127.0.0.1", "127.0.0.2"]);
    wait_for_pool_size(&client, &coordinator.base, 2).await;

    let mut sources = Vec::new();
    for _ in 0..5 {
        let (status, body) = execute(
            &client,
            &coordinator.base,
            json!({ "url": format!("http://{echo}/echo"), "method": "GET", "timeout": 5 }),
        )
        .await;
        assert_eq!(status, reqwest::StatusCode::OK, "body: {body}");
        assert_eq!(body["status"], 200);
        assert_eq!(body["body"], "echo-ok");
        assert_eq!(body["agent_id"], "a1");
        assert!(body["elapsed_sec"].as_f64().unwrap() < 5.0);
        sources.push(body["source_ip"].as_str().unwrap().to_string());
    }

    // deterministic rotation over the sorted pool view, starting at index 0
    assert_eq!(
        sources,
        vec!["127.0.0.1", "127.0.0.2", "127.0.0.1", "127.0.0.2", "127.0.0.1"]
    );

    // the dispatch landed in history and metrics
    let history: Value = client
        .get(format!("{}/api/history?limit=10", coordinator.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 5);

    let metrics = client
        .get(format!("{}/metrics", coordinator.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("http_dispatcher_requests_total"));
    assert!(metrics.contains("agent=\"a1\""));

    agent.cancel();
}

#[tokio::test]
async fn empty_pool_returns_503() {
    let coordinator = start_coordinator().await;
    let client = reqwest::Client::new();

    let (status, body) = execute(
        &client,
        &coordinator.base,
        json!({ "url": "http://127.0.0.1:9/never", "method": "GET", "timeout": 1 }),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "NoAgentsAvailable");
}

#[tokio::test]
async fn invalid_request_is_rejected_synchronously() {
    let coordinator = start_coordinator().await;
    let client = reqwest::Client::new();

    let (status, body) = execute(
        &client,
        &coordinator.base,
        json!({ "url": "not-a-url", "method": "GET" }),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidRequest");
}

#[tokio::test]
async fn coordinator_deadline_beats_slow_upstream() {
    let coordinator = start_coordinator().await;
    let echo = start_echo_server().await;
    let client = reqwest::Client::new();

    let agent = start_agent(&coordinator.base, "a1", &["127.0.0.1"]);
    wait_for_pool_size(&client, &coordinator.base, 1).await;

    let started = Instant::now();
    let (status, body) = execute(
        &client,
        &coordinator.base,
        json!({ "url": format!("http://{echo}/slow"), "method": "GET", "timeout": 1 }),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::GATEWAY_TIMEOUT, "body: {body}");
    assert_eq!(body["error"], "Timeout");
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "job must terminate near its deadline"
    );

    // the job is terminal; a late agent reply must not add history entries
    let before = coordinator.state.history.len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.state.history.len(), before);

    agent.cancel();
}

#[tokio::test]
async fn agent_disconnect_fails_pending_jobs_and_empties_pool() {
    let coordinator = start_coordinator().await;
    let echo = start_echo_server().await;
    let client = reqwest::Client::new();

    let agent = start_agent(&coordinator.base, "a1", &["127.0.0.1"]);
    wait_for_pool_size(&client, &coordinator.base, 1).await;

    let base = coordinator.base.clone();
    let slow_client = client.clone();
    let pending = tokio::spawn(async move {
        execute(
            &slow_client,
            &base,
            json!({ "url": format!("http://{echo}/slow"), "method": "GET", "timeout": 30 }),
        )
        .await
    });

    // let the dispatch reach the agent, then kill the agent
    tokio::time::sleep(Duration::from_millis(300)).await;
    agent.cancel();

    let (status, body) = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("job must fail within 2s of the disconnect")
        .unwrap();
    assert_eq!(status, reqwest::StatusCode::BAD_GATEWAY, "body: {body}");
    assert_eq!(body["error"], "AgentLost");

    wait_for_pool_size(&client, &coordinator.base, 0).await;
}

#[tokio::test]
async fn replacement_session_takes_over_with_new_addresses() {
    let coordinator = start_coordinator().await;
    let client = reqwest::Client::new();

    let first = start_agent(&coordinator.base, "a1", &["127.0.0.1"]);
    wait_for_pool_size(&client, &coordinator.base, 1).await;

    // a second session with the same id displaces the first
    let second = start_agent(&coordinator.base, "a1", &["127.0.0.2"]);
    // stop the first session's reconnect loop so the takeover sticks
    first.cancel();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status: Value = client
            .get(format!("{}/api/pool/status", coordinator.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let entries = status["entries"].as_array().unwrap().clone();
        if entries.len() == 1 && entries[0]["ip"] == "127.0.0.2" {
            break;
        }
        assert!(Instant::now() < deadline, "takeover never settled: {status}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // exactly one live agent under the id
    let agents: Value = client
        .get(format!("{}/api/agents", coordinator.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let live: Vec<&Value> = agents
        .as_array()
        .unwrap()
        .iter()
        .filter(|a| a["state"] == "Live")
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0]["agent_id"], "a1");

    second.cancel();
}

#[tokio::test]
async fn stored_request_config_drives_get_execute() {
    let coordinator = start_coordinator().await;
    let echo = start_echo_server().await;
    let client = reqwest::Client::new();

    // no config stored yet
    let response = client
        .get(format!("{}/api/execute", coordinator.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let agent = start_agent(&coordinator.base, "a1", &["127.0.0.1"]);
    wait_for_pool_size(&client, &coordinator.base, 1).await;

    let stored = json!({ "url": format!("http://{echo}/echo"), "method": "GET", "timeout_sec": 5.0 });
    let response = client
        .post(format!("{}/api/config/request", coordinator.base))
        .json(&stored)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // the template reads back unchanged
    let fetched: Value = client
        .get(format!("{}/api/config/request", coordinator.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["url"], stored["url"]);

    let body: Value = client
        .get(format!("{}/api/execute", coordinator.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], 200);
    assert_eq!(body["body"], "echo-ok");

    agent.cancel();
}

#[tokio::test]
async fn agents_endpoint_reports_sessions_and_pseudo_registrations() {
    let coordinator = start_coordinator().await;
    let client = reqwest::Client::new();

    // HTTP pseudo-registration reserves an id without touching the pool
    let reserved: Value = client
        .post(format!("{}/api/agents/register", coordinator.base))
        .json(&json!({ "agent_id": "warm-spare" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reserved["agent_id"], "warm-spare");

    let agent = start_agent(&coordinator.base, "a1", &["127.0.0.1"]);
    wait_for_pool_size(&client, &coordinator.base, 1).await;

    let agents: Value = client
        .get(format!("{}/api/agents", coordinator.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let agents = agents.as_array().unwrap();
    assert_eq!(agents.len(), 2);
    assert!(agents.iter().any(|a| a["agent_id"] == "a1" && a["state"] == "Live"));
    assert!(agents
        .iter()
        .any(|a| a["agent_id"] == "warm-spare" && a["state"] == "Registered"));

    // removing the live agent drains the pool
    let removed: Value = client
        .delete(format!("{}/api/agents/a1", coordinator.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(removed["removed"], true);
    agent.cancel();
    wait_for_pool_size(&client, &coordinator.base, 0).await;
}
