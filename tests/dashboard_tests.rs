
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use sisyphus_lite::dashboard::{router, DashboardState};
use sisyphus_lite::scheduler::Scheduler;
use test_harness::{linux_host, pool, simple_matrix, test_run_config, Rule, ScriptedConnector};

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_report_before_run_is_empty() {
    let connector = ScriptedConnector::new();
    let pool = pool(vec![linux_host("gpu-1", 1)], &connector);
    let scheduler = Scheduler::new(pool.clone(), test_run_config());
    let app = router(DashboardState {
        progress: scheduler.subscribe(),
        pool,
    });

    let (status, json) = get_json(app, "/api/report").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["complete"], false);
    assert_eq!(json["summary"]["total"], 0);
    assert!(json["targets"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_report_after_run() {
    let connector = ScriptedConnector::new();
    connector.script().add(Rule::on("build-b").exit(2));
    let pool = pool(vec![linux_host("gpu-1", 1)], &connector);
    let scheduler = Scheduler::new(pool.clone(), test_run_config());
    let state = DashboardState {
        progress: scheduler.subscribe(),
        pool,
    };

    scheduler
        .run(&simple_matrix(&["a", "b"]), 1, CancellationToken::new())
        .await
        .unwrap();
    let (status, json) = get_json(router(state), "/api/report").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["complete"], true);
    assert_eq!(json["summary"]["succeeded"], 1);
    assert_eq!(json["summary"]["failed"], 1);
    let targets = json["targets"].as_array().unwrap();
    assert_eq!(targets[0]["key"], "a/linux-x86_64/cuda-12.4");
    assert_eq!(targets[0]["state"], "succeeded");
    assert_eq!(targets[1]["state"], "failed");
    assert_eq!(targets[1]["failure"]["kind"], "execution");
    assert_eq!(targets[1]["failure"]["exit_code"], 2);
}

#[tokio::test]
async fn test_hosts_endpoint() {
    let connector = ScriptedConnector::new();
    let pool = pool(
        vec![linux_host("gpu-1", 2), linux_host("gpu-2", 1)],
        &connector,
    );
    let scheduler = Scheduler::new(pool.clone(), test_run_config());
    let lease = pool.try_acquire(&Default::default()).unwrap();
    let app = router(DashboardState {
        progress: scheduler.subscribe(),
        pool: pool.clone(),
    });

    let (status, json) = get_json(app, "/api/hosts").await;
    drop(lease);

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["leased"], 1);
    let hosts = json["hosts"].as_array().unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0]["name"], "gpu-1");
    assert_eq!(hosts[0]["os"], "linux");
    assert_eq!(hosts[0]["health"], "healthy");
    assert_eq!(hosts[0]["preparation"], "not_required");
    assert_eq!(hosts[0]["max_channels"], 2);
    assert!(hosts[0]["tags"]
        .as_array()
        .unwrap()
        .contains(&Value::from("os:linux")));
}

#[tokio::test]
async fn test_index_page() {
    let connector = ScriptedConnector::new();
    let pool = pool(vec![linux_host("gpu-1", 1)], &connector);
    let scheduler = Scheduler::new(pool.clone(), test_run_config());
    let app = router(DashboardState {
        progress: scheduler.subscribe(),
        pool,
    });

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let html = String::from_utf8(body.to_vec()).unwrap();
    assert!(html.contains("/api/report"));
    assert!(html.contains("/api/hosts"));
    // Report values reach the page as text, never as markup
    assert!(!html.contains("innerHTML"));
    assert!(html.contains("textContent = String(cell.text ?? cell)"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let connector = ScriptedConnector::new();
    let pool = pool(vec![linux_host("gpu-1", 1)], &connector);
    let scheduler = Scheduler::new(pool.clone(), test_run_config());
    let app = router(DashboardState {
        progress: scheduler.subscribe(),
        pool,
    });

    let response = app
        .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
