//! HTTP surface exercised through the router without a socket

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::*;
use flowd::runtime::service::{ServiceExecutionStatus, StartServiceResponse};
use flowd::server::create_app;
use flowd::workflow::{params, ExecutionState, TaskType};
use flowd::EngineContext;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

/// Local workflow offered as a service; returns (pipeline, service id)
async fn offered_service(ctx: &EngineContext) -> (Pipeline, i64) {
    let pipeline = single_task_workflow(ctx, "double", TaskType::Script, INT, &[("code", "output = input * 2")]).await;
    let node = ctx.store.insert_node("self", "http://127.0.0.1:5000").await.unwrap();
    let service = ctx
        .store
        .insert_service("doubler", node, pipeline.workflow_id, "1", "double")
        .await
        .unwrap();
    (pipeline, service)
}

#[tokio::test]
async fn test_healthz() {
    let app = create_app(test_context().await);
    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn test_queue_count_counts_pending_runs() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let pipeline = single_task_workflow(&ctx, "echo", TaskType::Script, INT, &[("code", "output = input")]).await;
    submit(&ctx, pipeline.workflow_id, INT, &["1"]).await;
    submit(&ctx, pipeline.workflow_id, INT, &["2"]).await;

    let (status, body) = send(&app, get("/queueCount")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "count": 2 }));
}

#[tokio::test]
async fn test_service_start_submits_run_with_callback() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let (pipeline, service) = offered_service(&ctx).await;

    let request = post_json(
        &format!("/service/{}/start", service),
        json!({ "values": ["3"], "callBack": "/taskInstanceExecution/9/end", "callBackAddr": "10.0.0.1:5000" }),
    );
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let started: StartServiceResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(started.title, format!("doubler#{} Input", pipeline.workflow_id));

    let run = ctx
        .store
        .get_workflow_execution(started.workflow_execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, ExecutionState::Loaded);
    assert_eq!(run.workflow_id, pipeline.workflow_id);
    assert_eq!(run.param(params::CALL_BACK), Some("/taskInstanceExecution/9/end"));
    assert_eq!(run.param(params::REMOTE_ADDR), Some("10.0.0.1:5000"));

    let input = ctx.store.require_data(run.input_data_id.unwrap()).await.unwrap();
    assert_eq!(input.values, vec!["3".to_string()]);
    assert_eq!(input.title, started.title);
}

#[tokio::test]
async fn test_service_start_falls_back_to_forwarded_for() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let (_, service) = offered_service(&ctx).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/service/{}/start", service))
        .header("content-type", "application/json")
        .header("x-forwarded-for", "192.168.1.9, 10.0.0.1")
        .body(Body::from(json!({ "values": ["3"], "callBack": "/cb" }).to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let started: StartServiceResponse = serde_json::from_slice(&body).unwrap();

    let run = ctx
        .store
        .get_workflow_execution(started.workflow_execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.param(params::REMOTE_ADDR), Some("192.168.1.9"));
}

#[tokio::test]
async fn test_unknown_service_is_not_found() {
    let app = create_app(test_context().await);
    let request = post_json("/service/404/start", json!({ "values": [], "callBack": "/cb" }));
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_service_execution_reports_output_once_ended() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let engine = test_engine(&ctx);
    let (pipeline, _) = offered_service(&ctx).await;
    let run = submit(&ctx, pipeline.workflow_id, INT, &["21"]).await;

    let (status, body) = send(&app, get(&format!("/service/execution/{}", run))).await;
    assert_eq!(status, StatusCode::OK);
    let pending: ServiceExecutionStatus = serde_json::from_slice(&body).unwrap();
    assert_eq!(pending.execution_state, ExecutionState::Loaded);
    assert!(pending.output_data_values.is_none());

    run_to_completion(&engine, run, 10).await;

    let (status, body) = send(&app, get(&format!("/service/execution/{}", run))).await;
    assert_eq!(status, StatusCode::OK);
    let done: ServiceExecutionStatus = serde_json::from_slice(&body).unwrap();
    assert_eq!(done.workflow_execution_id, run);
    assert_eq!(done.execution_state, ExecutionState::Ended);
    assert_eq!(done.output_data_values, Some(vec!["42".to_string()]));
    assert!(done.end_time.is_some());

    let (status, _) = send(&app, get("/service/execution/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_kill_cancels_run_and_its_rows() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let pipeline = single_task_workflow(&ctx, "slow", TaskType::Service, INT, &[("uniformServiceId", "none")]).await;
    let run = submit(&ctx, pipeline.workflow_id, INT, &["1"]).await;
    let shape = flowd::workflow::validation::validate_workflow(&ctx.store, pipeline.workflow_id)
        .await
        .unwrap();
    assert!(ctx
        .store
        .start_workflow_execution(run, shape.start_instance_id, None)
        .await
        .unwrap());
    ctx.store.insert_queued_task_instance_execution(run, pipeline.task).await.unwrap();

    let (status, body) = send(&app, post_json(&format!("/service/execution/{}/kill", run), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({ "success": true }));

    let execution = ctx.store.get_workflow_execution(run).await.unwrap().unwrap();
    assert_eq!(execution.state, ExecutionState::Killed);
    let rows = ctx.store.task_instance_executions_for_run(run).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.state == ExecutionState::Killed));

    let (status, _) = send(&app, post_json("/service/execution/999/kill", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_kill_leaves_finished_run_alone() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let engine = test_engine(&ctx);
    let pipeline = single_task_workflow(&ctx, "echo", TaskType::Script, INT, &[("code", "output = input")]).await;
    let run = submit(&ctx, pipeline.workflow_id, INT, &["1"]).await;
    let finished = run_to_completion(&engine, run, 10).await;
    assert_eq!(finished.state, ExecutionState::Ended);

    let (status, _) = send(&app, post_json(&format!("/service/execution/{}/kill", run), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let execution = ctx.store.get_workflow_execution(run).await.unwrap().unwrap();
    assert_eq!(execution.state, ExecutionState::Ended);
}

#[tokio::test]
async fn test_service_input_is_checked_and_canonicalised() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let (_, service) = offered_service(&ctx).await;
    let uri = format!("/service/{}/start", service);

    let (status, body) = send(&app, post_json(&uri, json!({ "values": ["+03"], "callBack": "/cb" }))).await;
    assert_eq!(status, StatusCode::OK);
    let started: StartServiceResponse = serde_json::from_slice(&body).unwrap();
    let run = ctx
        .store
        .get_workflow_execution(started.workflow_execution_id)
        .await
        .unwrap()
        .unwrap();
    let input = ctx.store.require_data(run.input_data_id.unwrap()).await.unwrap();
    assert_eq!(input.values, vec!["3".to_string()]);

    let (status, _) = send(&app, post_json(&uri, json!({ "values": ["three"], "callBack": "/cb" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, post_json(&uri, json!({ "values": ["1", "2"], "callBack": "/cb" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// A SERVICE row in STARTED, as left behind by a dispatch
async fn pending_service_row(ctx: &EngineContext) -> (Pipeline, i64) {
    let pipeline = single_task_workflow(ctx, "remote", TaskType::Service, INT, &[("uniformServiceId", "svc")]).await;
    let run = submit(ctx, pipeline.workflow_id, INT, &["1"]).await;
    let input = ctx.store.save_data(INT, &["1".to_string()], "remote Input").await.unwrap();
    let row = ctx.store.insert_queued_task_instance_execution(run, pipeline.task).await.unwrap();
    assert!(ctx.store.load_task_instance_execution(row, input).await.unwrap());
    assert!(ctx
        .store
        .transition_task_instance_execution(row, ExecutionState::Loaded, ExecutionState::Started)
        .await
        .unwrap());
    (pipeline, row)
}

#[tokio::test]
async fn test_completion_callback_resolves_once() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let (_, row) = pending_service_row(&ctx).await;
    let uri = format!("/taskInstanceExecution/{}/end", row);

    let (status, body) = send(&app, post_json(&uri, json!({ "values": ["5"] }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({ "success": true }));

    let resolved = ctx.store.get_task_instance_execution(row).await.unwrap().unwrap();
    assert_eq!(resolved.state, ExecutionState::Ended);
    let output = ctx.store.require_data(resolved.output_data_id.unwrap()).await.unwrap();
    assert_eq!(output.values, vec!["5".to_string()]);
    assert_eq!(output.title, "remote Result");

    // a late poll or duplicate callback changes nothing
    let (status, body) = send(&app, post_json(&uri, json!({ "values": ["6"] }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({ "success": false }));
}

#[tokio::test]
async fn test_completion_with_wrong_arity_is_rejected() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let (_, row) = pending_service_row(&ctx).await;

    let uri = format!("/taskInstanceExecution/{}/end", row);
    let (status, _) = send(&app, post_json(&uri, json!({ "values": ["5", "6"] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let row = ctx.store.get_task_instance_execution(row).await.unwrap().unwrap();
    assert_eq!(row.state, ExecutionState::Started);
}

#[tokio::test]
async fn test_execute_workflow_submits_loaded_run() {
    let ctx = test_context().await;
    let app = create_app(ctx.clone());
    let pipeline = single_task_workflow(&ctx, "echo", TaskType::Script, INT, &[("code", "output = input")]).await;
    let data_id = ctx.store.save_data(INT, &["8".to_string()], "echo input").await.unwrap();

    let (status, body) = send(
        &app,
        post_json(&format!("/workflow/{}/execute", pipeline.workflow_id), json!({ "dataId": data_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["workflowId"], json!(pipeline.workflow_id));
    assert_eq!(body["dataId"], json!(data_id));

    let run_id = body["id"].as_i64().unwrap();
    let run = ctx.store.get_workflow_execution(run_id).await.unwrap().unwrap();
    assert_eq!(run.state, ExecutionState::Loaded);
    assert_eq!(run.input_data_id, Some(data_id));

    let (status, _) = send(&app, post_json("/workflow/999/execute", json!({ "dataId": data_id }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
