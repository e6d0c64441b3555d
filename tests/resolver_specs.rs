//! Version selection specs (S2 plus semver monotonicity).

use crate::prelude::*;

fn hello_app(apps: &AppsFixture, name: &str, version: &str) {
    apps.add_app(name, version).with_builtin("hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn selector_picks_highest_in_major() {
    let apps = AppsFixture::new();
    for version in ["1.0.0", "1.5.3", "2.0.0"] {
        hello_app(&apps, "api", version);
    }
    let rt = TestRuntime::new(apps);

    let res = rt.get("/api@1/").await;
    assert_eq!(res.status, StatusCode::OK);

    // The worker key is the resolved directory: 1.5.3 must have won.
    let stats = rt.stats();
    let keys: Vec<&String> = stats["workers"].as_object().unwrap().keys().collect();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].ends_with("api/1.5.3"), "resolved {keys:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn no_selector_picks_maximum() {
    let apps = AppsFixture::new();
    for version in ["1.0.0", "1.5.3", "2.0.0"] {
        hello_app(&apps, "api", version);
    }
    let rt = TestRuntime::new(apps);

    let res = rt.get("/api/").await;
    assert_eq!(res.status, StatusCode::OK);

    let stats = rt.stats();
    let keys: Vec<&String> = stats["workers"].as_object().unwrap().keys().collect();
    assert!(keys[0].ends_with("api/2.0.0"), "resolved {keys:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unsatisfiable_selector_is_404_with_message() {
    let apps = AppsFixture::new();
    for version in ["1.0.0", "1.5.3", "2.0.0"] {
        hello_app(&apps, "api", version);
    }
    let rt = TestRuntime::new(apps);

    let res = rt.get("/api@3/").await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.json()["error"], "App not found: api@3");
}

#[tokio::test(flavor = "multi_thread")]
async fn url_encoded_selector_is_decoded() {
    let apps = AppsFixture::new();
    hello_app(&apps, "api", "1.2.0");
    hello_app(&apps, "api", "2.0.0");
    let rt = TestRuntime::new(apps);

    let res = rt.get("/api%401.2.0/").await;
    assert_eq!(res.status, StatusCode::OK);

    let stats = rt.stats();
    let keys: Vec<&String> = stats["workers"].as_object().unwrap().keys().collect();
    assert!(keys[0].ends_with("api/1.2.0"), "resolved {keys:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn same_directory_across_selectors_is_one_worker() {
    let apps = AppsFixture::new();
    hello_app(&apps, "api", "1.5.0");
    let rt = TestRuntime::new(apps);

    // Different AppKeys, one resolved directory, one worker.
    assert_eq!(rt.get("/api/").await.status, StatusCode::OK);
    assert_eq!(rt.get("/api@1/").await.status, StatusCode::OK);
    assert_eq!(rt.get("/api@1.5.0/").await.status, StatusCode::OK);

    assert_eq!(rt.live_worker_count(), 1);
    assert_eq!(rt.metrics()["workersSpawned"], 1);
}
