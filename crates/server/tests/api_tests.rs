//! Integration tests for the HTTP API, driven through the real router

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use fleet_lib::{
    capacity::PlanService,
    channel::scripted::{HostScript, ScriptedConnector},
    health::HealthRegistry,
    monitor::{probes::StaticReachability, HealthMonitor, MonitorConfig},
    objects::{FsObjectStore, ScenarioFileService},
    orchestrator::{Orchestrator, OrchestratorConfig},
    scheduler::{SchedulerConfig, SweepScheduler},
    store::{FleetStore, MemoryStore},
};
use fleet_server::api::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const UP_HOST: &str = "10.1.0.1";
const DOWN_HOST: &str = "10.1.0.2";

struct TestApp {
    router: Router,
    health: HealthRegistry,
    _objects: TempDir,
}

async fn setup_test_app() -> TestApp {
    let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
    let connector = Arc::new(ScriptedConnector::new().with_host(UP_HOST, HostScript::healthy()));
    let reachability = Arc::new(StaticReachability::new().unreachable(DOWN_HOST));

    let monitor = Arc::new(HealthMonitor::new(
        store.clone(),
        connector.clone(),
        reachability,
        MonitorConfig::default(),
    ));
    let health = HealthRegistry::new();
    health.register_all().await;

    let objects = tempfile::tempdir().unwrap();
    let files = ScenarioFileService::new(
        store.clone(),
        Arc::new(FsObjectStore::new(objects.path())),
    )
    .with_max_file_size(1024);

    let state = AppState {
        store: store.clone(),
        monitor: monitor.clone(),
        plans: Arc::new(PlanService::new(store.clone())),
        orchestrator: Arc::new(Orchestrator::new(
            store.clone(),
            connector,
            OrchestratorConfig::default(),
        )),
        scheduler: SweepScheduler::new(monitor, health.clone(), SchedulerConfig::default()),
        files: Arc::new(files),
        health_registry: health.clone(),
        max_file_size: 1024,
    };

    TestApp {
        router: create_router(state),
        health,
        _objects: objects,
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = tokio_test::assert_ok!(app.router.clone().oneshot(request).await);
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn call(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let (status, bytes) = send(app, request).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_agent(app: &TestApp, name: &str, host: &str) -> u64 {
    let (status, body) = call(
        app,
        "POST",
        "/agents",
        Some(json!({
            "name": name,
            "host": host,
            "username": "locust",
            "password": "secret",
            "capacity": {"cpu_cores": 8, "memory_gb": 16.0, "network_mbps": 1000, "disk_gb": 100.0}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_u64().unwrap()
}

/// Agent, task, strategy and plan ready for an execution
struct Catalog {
    agent_id: u64,
    task_id: u64,
    strategy_id: u64,
    plan_id: u64,
}

async fn seed_catalog(app: &TestApp, plan: Value) -> Catalog {
    let agent_id = create_agent(app, "gen", UP_HOST).await;

    let (_, task) = call(
        app,
        "POST",
        "/tasks",
        Some(json!({"name": "checkout", "target_host": "https://shop.example"})),
    )
    .await;
    let task_id = task["id"].as_u64().unwrap();
    let (status, _) = call(
        app,
        "POST",
        &format!("/tasks/{}/scenarios", task_id),
        Some(json!({"interface_name": "home", "interface_url": "/"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, strategy) = call(
        app,
        "POST",
        "/strategies",
        Some(json!({"name": "smoke", "user_count": 10, "spawn_rate": 2, "run_time_secs": 60})),
    )
    .await;

    let mut plan = plan;
    plan["agent_id"] = json!(agent_id);
    let (status, plan) = call(app, "POST", "/plans", Some(plan)).await;
    assert_eq!(status, StatusCode::CREATED);

    Catalog {
        agent_id,
        task_id,
        strategy_id: strategy["id"].as_u64().unwrap(),
        plan_id: plan["id"].as_u64().unwrap(),
    }
}

async fn create_execution(app: &TestApp, catalog: &Catalog) -> u64 {
    let (status, body) = call(
        app,
        "POST",
        "/executions",
        Some(json!({
            "task_id": catalog.task_id,
            "strategy_id": catalog.strategy_id,
            "agent_id": catalog.agent_id,
            "plan_id": catalog.plan_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    body["id"].as_u64().unwrap()
}

#[tokio::test]
async fn test_healthz_and_readyz() {
    let app = setup_test_app().await;

    let (status, body) = call(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = call(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    app.health.set_ready(true).await;
    let (status, body) = call(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup_test_app().await;
    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("fleet_"));
}

#[tokio::test]
async fn test_agent_crud_hides_password() {
    let app = setup_test_app().await;
    let id = create_agent(&app, "gen", UP_HOST).await;

    let (status, body) = call(&app, "GET", &format!("/agents/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "offline");
    assert_eq!(body["has_password"], true);
    assert!(body.get("password").is_none());

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/agents/{}", id),
        Some(json!({"maintenance": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "maintenance");

    let (status, _) = call(&app, "DELETE", &format!("/agents/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, "GET", "/agents", None).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_error_mapping() {
    let app = setup_test_app().await;

    let (status, body) = call(&app, "GET", "/agents/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("999"));

    let (status, _) = call(
        &app,
        "POST",
        "/agents",
        Some(json!({"name": " ", "host": "h", "username": "u"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "POST", "/plans", Some(json!({"name": "orphan"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "POST", "/plans", Some(json!({"agent_id": 42}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_plan_validation_reports_overcommit() {
    let app = setup_test_app().await;
    let agent_id = create_agent(&app, "gen", UP_HOST).await;

    let (status, plan) = call(
        &app,
        "POST",
        "/plans",
        Some(json!({"agent_id": agent_id, "name": "huge", "worker_count": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(plan["is_valid"], false);

    let id = plan["id"].as_u64().unwrap();
    let (status, body) = call(&app, "POST", &format!("/plans/{}/validate", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("CPU cores exceed capacity"));

    let (_, plan) = call(
        &app,
        "PUT",
        &format!("/plans/{}", id),
        Some(json!({"worker_count": 2})),
    )
    .await;
    assert_eq!(plan["is_valid"], true);
}

#[tokio::test]
async fn test_liveness_check_then_execution_start_and_stop() {
    let app = setup_test_app().await;
    let catalog = seed_catalog(&app, json!({"name": "default"})).await;
    let down = create_agent(&app, "down", DOWN_HOST).await;

    let execution_id = create_execution(&app, &catalog).await;

    // Agent has never been seen, so starting is refused
    let (status, _) = call(
        &app,
        "POST",
        &format!("/executions/{}/start", execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, "POST", "/heartbeat/check", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_checked"], 2);
    assert_eq!(body["data"]["successful"], 1);

    let (_, agent) = call(&app, "GET", &format!("/agents/{}", down), None).await;
    assert_eq!(agent["status"], "offline");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/executions/{}/start", execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/executions/{}/stop", execution_id),
        Some(json!({"reason": "enough"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");
    assert_eq!(body["data"]["error_message"], "enough");

    // A second start is rejected by the state guard
    let (status, _) = call(
        &app,
        "POST",
        &format!("/executions/{}/start", execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, list) = call(&app, "GET", "/executions?status=cancelled", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_plan_blocks_start() {
    let app = setup_test_app().await;
    let catalog = seed_catalog(&app, json!({"name": "huge", "worker_count": 10})).await;
    call(&app, "POST", "/heartbeat/check", None).await;

    let execution_id = create_execution(&app, &catalog).await;
    let (status, body) = call(
        &app,
        "POST",
        &format!("/executions/{}/start", execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("is not valid"));

    let (_, execution) = call(&app, "GET", &format!("/executions/{}", execution_id), None).await;
    assert_eq!(execution["status"], "pending");
}

#[tokio::test]
async fn test_cleanup_and_fleet_status() {
    let app = setup_test_app().await;
    create_agent(&app, "gen", UP_HOST).await;

    let (status, _) = call(&app, "POST", "/heartbeat/cleanup?threshold_minutes=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, "POST", "/heartbeat/cleanup?threshold_minutes=60", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["threshold_minutes"], 60);

    let (status, body) = call(&app, "GET", "/heartbeat/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["offline"], 1);
}

#[tokio::test]
async fn test_async_check_is_tracked() {
    let app = setup_test_app().await;
    create_agent(&app, "gen", UP_HOST).await;

    let (status, body) = call(&app, "POST", "/heartbeat/check-async", None).await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    let mut record = Value::Null;
    for _ in 0..50 {
        let (status, body) = call(&app, "GET", &format!("/heartbeat/tasks/{}", task_id), None).await;
        assert_eq!(status, StatusCode::OK);
        record = body;
        if record["status"] == "succeeded" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(record["status"], "succeeded");
    assert_eq!(record["result"]["total_checked"], 1);

    let (status, _) = call(
        &app,
        "GET",
        "/heartbeat/tasks/7f1c0a52-7c9e-4a55-9f0e-5e2d6f0d1a3b",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scenario_file_upload_and_integrity() {
    let app = setup_test_app().await;
    let (_, task) = call(&app, "POST", "/tasks", Some(json!({"name": "files"}))).await;
    let task_id = task["id"].as_u64().unwrap();
    let (_, scenario) = call(
        &app,
        "POST",
        &format!("/tasks/{}/scenarios", task_id),
        Some(json!({"interface_name": "login", "interface_url": "/login", "method": "POST"})),
    )
    .await;
    let scenario_id = scenario["id"].as_u64().unwrap();

    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/scenarios/{}/files?file_name=users.csv&description=accounts",
            scenario_id
        ))
        .header(header::CONTENT_TYPE, "text/csv")
        .body(Body::from("user,password\nalice,pw\n"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::CREATED);
    let file: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(file["file_size"], 23);
    assert_eq!(file["is_script"], false);
    let file_id = file["id"].as_u64().unwrap();

    let request = Request::builder()
        .uri(format!("/files/{}/content", file_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"user,password\nalice,pw\n");

    let (status, body) = call(&app, "POST", &format!("/files/{}/verify", file_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["intact"], true);

    // Disallowed extension
    let request = Request::builder()
        .method("POST")
        .uri(format!("/scenarios/{}/files?file_name=tool.exe", scenario_id))
        .body(Body::from("MZ"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "DELETE", &format!("/scenarios/{}", scenario_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", &format!("/files/{}", file_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
