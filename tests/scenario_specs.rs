//! End-to-end scenarios: basic dispatch, proxy short-circuit, timeout
//! recovery, capacity queueing.

use crate::prelude::*;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::routing::{get, post};
use axum::Router;
use futures::{SinkExt, StreamExt};

#[tokio::test(flavor = "multi_thread")]
async fn basic_dispatch() {
    let apps = AppsFixture::new();
    apps.add_app("hello", "1.0.0").with_builtin("hello");
    let rt = TestRuntime::new(apps);

    let res = rt.get("/hello/").await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.text(), "hi");

    assert_eq!(rt.live_worker_count(), 1);
    assert_eq!(rt.metrics()["totalRequests"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_short_circuits_before_the_pool() {
    let upstream = StubUpstream::start(Router::new().route(
        "/v1/things",
        post(|| async { (StatusCode::CREATED, "made upstream") }),
    ))
    .await;

    let apps = AppsFixture::new();
    let config = serde_json::json!({
        "proxy": [{
            "pattern": "^/api/(.*)",
            "target": upstream.url(),
            "rewrite": "/v1/$1"
        }]
    });
    apps.add_app("web", "1.0.0")
        .with_config(&config.to_string())
        .with_file("index.html", "<html><head></head></html>");
    let rt = TestRuntime::new(apps);

    let res = rt.request("POST", "/web/api/things", b"{}").await;
    assert_eq!(res.status, StatusCode::CREATED);
    assert_eq!(res.text(), "made upstream");

    // The rule fired before the worker stage: no worker exists.
    assert_eq!(rt.live_worker_count(), 0);
    assert_eq!(rt.metrics()["workersSpawned"], 0);
    assert_eq!(rt.metrics()["totalRequests"], 0);
    assert_eq!(rt.metrics()["proxiedRequests"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_unreachable_upstream_is_502() {
    let apps = AppsFixture::new();
    apps.add_app("web", "1.0.0").with_config(
        r#"{"proxy": [{"pattern": "^/api/", "target": "http://127.0.0.1:9"}]}"#,
    );
    let rt = TestRuntime::new(apps);

    let res = rt.get("/web/api/x").await;
    assert_eq!(res.status, StatusCode::BAD_GATEWAY);
    assert!(res.json()["error"].as_str().unwrap().contains("upstream"));
}

#[tokio::test(flavor = "multi_thread")]
async fn non_matching_paths_fall_through_to_the_worker() {
    let upstream =
        StubUpstream::start(Router::new().route("/v1/x", get(|| async { "upstream" }))).await;

    let apps = AppsFixture::new();
    let config = serde_json::json!({
        "proxy": [{ "pattern": "^/api/", "target": upstream.url() }]
    });
    apps.add_app("web", "1.0.0")
        .with_config(&config.to_string())
        .with_file("index.html", "<html><head></head><body>site</body></html>");
    let rt = TestRuntime::new(apps);

    let res = rt.get("/web/").await;
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.text().contains("site"));
    assert_eq!(rt.metrics()["workersSpawned"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_terminates_and_recovery_respawns() {
    let apps = AppsFixture::new();
    let app = apps
        .add_app("stuck", "1.0.0")
        .with_config(r#"{"entrypoint": "builtin:hang", "timeout": 0.5}"#);
    let rt = TestRuntime::new(apps);

    let started = std::time::Instant::now();
    let res = rt.get("/stuck/").await;
    assert_eq!(res.status, StatusCode::GATEWAY_TIMEOUT);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(450) && elapsed < Duration::from_secs(3),
        "timeout fired after {elapsed:?}"
    );
    assert_eq!(rt.live_worker_count(), 0);

    // The app is "fixed" on disk; the next miss re-reads config and a
    // fresh worker serves normally.
    std::fs::write(
        app.dir().join("worker.config.json"),
        r#"{"entrypoint": "builtin:hello", "timeout": 0.5}"#,
    )
    .unwrap();

    let res = rt.get("/stuck/").await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.text(), "hi");
    assert_eq!(rt.metrics()["workersSpawned"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_queueing_serves_all_three() {
    let apps = AppsFixture::new();
    for name in ["a", "b", "c"] {
        apps.add_app(name, "1.0.0")
            .with_config(r#"{"entrypoint": "builtin:sleep"}"#);
    }
    let rt = TestRuntime::with_pool_size(apps, 2);

    let mut tasks = Vec::new();
    for name in ["a", "b", "c"] {
        let state = rt.state.clone();
        let uri = format!("/{name}/?ms=100");
        tasks.push(tokio::spawn(async move {
            let req = Request::builder()
                .method("GET")
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let res = router(state).oneshot(req).await.unwrap();
            res.status()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    // Three keys went through a two-slot pool.
    assert_eq!(rt.metrics()["workersSpawned"], 3);
    assert!(rt.live_worker_count() <= 2);
    assert_eq!(rt.metrics()["totalRequests"], 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_rule_pipes_frames_both_ways() {
    // Upstream that echoes every text frame.
    let upstream = StubUpstream::start(Router::new().route(
        "/ws",
        get(|ws: WebSocketUpgrade| async move {
            ws.on_upgrade(|mut socket| async move {
                while let Some(Ok(Message::Text(text))) = socket.next().await {
                    if socket
                        .send(Message::Text(format!("echo:{text}")))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        }),
    ))
    .await;

    let apps = AppsFixture::new();
    let config = serde_json::json!({
        "proxy": [{ "pattern": "^/ws", "target": upstream.url(), "ws": true }]
    });
    apps.add_app("chat", "1.0.0").with_config(&config.to_string());
    let rt = TestRuntime::new(apps);

    // A real listener: upgrades need an actual connection.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(rt.state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat/ws"))
        .await
        .expect("ws connect through proxy");

    socket
        .send(tokio_tungstenite::tungstenite::Message::Text(
            "ping".to_string(),
        ))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("ws reply in time")
        .expect("ws stream open")
        .expect("ws frame");
    assert_eq!(
        reply,
        tokio_tungstenite::tungstenite::Message::Text("echo:ping".to_string())
    );

    // Frames went through the proxy leg, not a worker.
    assert_eq!(rt.metrics()["workersSpawned"], 0);
    assert_eq!(rt.metrics()["proxiedRequests"], 1);
}
