//! Pool lifecycle specs: single-flight creation, FIFO queueing, LRU
//! eviction, idle/TTL reaping, request accounting.

use crate::prelude::*;

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_share_one_worker() {
    let apps = AppsFixture::new();
    apps.add_app("solo", "1.0.0")
        .with_config(r#"{"entrypoint": "builtin:sleep"}"#);
    let rt = TestRuntime::new(apps);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let state = rt.state.clone();
        tasks.push(tokio::spawn(async move {
            let req = Request::builder()
                .method("GET")
                .uri("/solo/?ms=30")
                .body(Body::empty())
                .unwrap();
            let res = router(state).oneshot(req).await.unwrap();
            res.status()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    // At most one live worker per key, ever: a single spawn covers all
    // eight queued requests.
    assert_eq!(rt.metrics()["workersSpawned"], 1);
    assert_eq!(rt.live_worker_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_accounting_balances() {
    let apps = AppsFixture::new();
    apps.add_app("a", "1.0.0").with_builtin("hello");
    apps.add_app("b", "1.0.0").with_builtin("hello");
    let rt = TestRuntime::new(apps);

    for _ in 0..3 {
        assert_eq!(rt.get("/a/").await.status, StatusCode::OK);
    }
    for _ in 0..2 {
        assert_eq!(rt.get("/b/").await.status, StatusCode::OK);
    }

    let stats = rt.stats();
    assert_eq!(stats["pool"]["totalRequests"], 5);
    assert_eq!(stats["pool"]["pendingRequests"], 0);
    assert_eq!(stats["pool"]["totalErrors"], 0);

    let counted: u64 = stats["workers"]
        .as_object()
        .unwrap()
        .values()
        .map(|w| w["requestCount"].as_u64().unwrap())
        .sum();
    assert_eq!(counted, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_2xx_outcomes_count_as_errors() {
    let apps = AppsFixture::new();
    apps.add_app("web", "1.0.0")
        .with_routes(r#"{"routes": {"/": {"status": 200, "body": "ok"}}}"#);
    let rt = TestRuntime::new(apps);

    assert_eq!(rt.get("/web/").await.status, StatusCode::OK);
    // App-level 404 via the manifest's default fallback.
    assert_eq!(rt.get("/web/missing").await.status, StatusCode::NOT_FOUND);
    // Resolver 404.
    assert_eq!(rt.get("/ghost/").await.status, StatusCode::NOT_FOUND);

    assert_eq!(rt.metrics()["totalErrors"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn lru_ready_worker_is_evicted_at_capacity() {
    let apps = AppsFixture::new();
    for name in ["a", "b", "c"] {
        apps.add_app(name, "1.0.0").with_builtin("hello");
    }
    let rt = TestRuntime::with_pool_size(apps, 2);

    assert_eq!(rt.get("/a/").await.status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(rt.get("/b/").await.status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(30)).await;
    // Pool is full; `a` has the smallest lastActive and must go.
    assert_eq!(rt.get("/c/").await.status, StatusCode::OK);

    let stats = rt.stats();
    let keys: Vec<String> = stats["workers"]
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .collect();
    assert_eq!(keys.len(), 2, "workers: {keys:?}");
    assert!(!keys.iter().any(|k| k.contains("/a/")), "a survived: {keys:?}");
    assert_eq!(stats["pool"]["workersReaped"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_worker_is_reaped() {
    let apps = AppsFixture::new();
    apps.add_app("nap", "1.0.0")
        .with_config(r#"{"entrypoint": "builtin:hello", "idleTimeout": 0.3}"#);
    let rt = TestRuntime::new(apps);

    assert_eq!(rt.get("/nap/").await.status, StatusCode::OK);
    assert_eq!(rt.live_worker_count(), 1);

    let reaped = wait_until(Duration::from_secs(2), || rt.live_worker_count() == 0).await;
    assert!(reaped, "idle worker was not reaped");

    // The next request spawns a fresh worker.
    assert_eq!(rt.get("/nap/").await.status, StatusCode::OK);
    assert_eq!(rt.metrics()["workersSpawned"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn ttl_expires_worker_regardless_of_activity() {
    let apps = AppsFixture::new();
    apps.add_app("mayfly", "1.0.0")
        .with_config(r#"{"entrypoint": "builtin:hello", "ttl": 0.3, "idleTimeout": 0}"#);
    let rt = TestRuntime::new(apps);

    assert_eq!(rt.get("/mayfly/").await.status, StatusCode::OK);

    // Keep it active: TTL must still take it down.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(250);
    while tokio::time::Instant::now() < deadline {
        let _ = rt.get("/mayfly/").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let reaped = wait_until(Duration::from_secs(2), || rt.live_worker_count() == 0).await;
    assert!(reaped, "expired worker was not reaped");
}

#[tokio::test(flavor = "multi_thread")]
async fn max_requests_retires_worker_after_response() {
    let apps = AppsFixture::new();
    apps.add_app("limited", "1.0.0")
        .with_config(r#"{"entrypoint": "builtin:hello", "maxRequests": 2}"#);
    let rt = TestRuntime::new(apps);

    assert_eq!(rt.get("/limited/").await.status, StatusCode::OK);
    assert_eq!(rt.get("/limited/").await.status, StatusCode::OK);

    let retired = wait_until(Duration::from_secs(2), || rt.live_worker_count() == 0).await;
    assert!(retired, "worker outlived its request budget");

    // Still serves; a fresh worker picks up.
    assert_eq!(rt.get("/limited/").await.status, StatusCode::OK);
    assert_eq!(rt.metrics()["workersSpawned"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_requests_fail_when_the_worker_crashes() {
    let apps = AppsFixture::new();
    apps.add_app("doomed", "1.0.0")
        .with_config(r#"{"entrypoint": "builtin:sleep"}"#);
    let launcher = KillableLauncher::new();
    let rt = TestRuntime::with_launcher(apps, launcher.clone());

    let spawn_request = |state: SharedState| {
        tokio::spawn(async move {
            let req = Request::builder()
                .method("GET")
                .uri("/doomed/?ms=2000")
                .body(Body::empty())
                .unwrap();
            let res = router(state).oneshot(req).await.unwrap();
            res.status()
        })
    };

    // First request is in flight; second queues behind it.
    let first = spawn_request(rt.state.clone());
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = spawn_request(rt.state.clone());
    tokio::time::sleep(Duration::from_millis(150)).await;

    launcher.kill_all();

    // Both fail as crashed: the in-flight request and the queued one.
    // Neither is silently retried on a fresh worker.
    assert_eq!(first.await.unwrap(), StatusCode::BAD_GATEWAY);
    assert_eq!(second.await.unwrap(), StatusCode::BAD_GATEWAY);
    assert_eq!(rt.metrics()["workersSpawned"], 1);
    assert_eq!(rt.metrics()["totalErrors"], 2);
    assert_eq!(rt.live_worker_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_refuses_new_requests() {
    let apps = AppsFixture::new();
    apps.add_app("app", "1.0.0").with_builtin("hello");
    let rt = TestRuntime::new(apps);

    assert_eq!(rt.get("/app/").await.status, StatusCode::OK);
    rt.pool().shutdown().await;

    let res = rt.get("/app/").await;
    assert_eq!(res.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(rt.live_worker_count(), 0);
}
