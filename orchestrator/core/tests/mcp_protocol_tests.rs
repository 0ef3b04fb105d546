// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use stackpilot_core::presentation::api::{app, AppState};
use stackpilot_core::presentation::mcp;
use tower::ServiceExt;

use common::{TestStack, STACK};

fn router(stack: &TestStack) -> Router {
    app(AppState::new(stack.operator.clone(), None, Vec::new()))
}

async fn rpc_raw(router: &Router, body: String) -> (StatusCode, Option<Value>) {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = (!bytes.is_empty()).then(|| serde_json::from_slice(&bytes).unwrap());
    (status, value)
}

async fn rpc(router: &Router, method: &str, params: Value) -> Value {
    let body = json!({ "jsonrpc": "2.0", "id": 7, "method": method, "params": params });
    let (status, value) = rpc_raw(router, body.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    let value = value.unwrap();
    assert_eq!(value["jsonrpc"], "2.0");
    assert_eq!(value["id"], 7);
    value
}

async fn call(router: &Router, tool: &str, arguments: Value) -> Value {
    rpc(router, "tools/call", json!({ "name": tool, "arguments": arguments })).await
}

#[tokio::test]
async fn test_handshake_and_catalog() {
    let stack = TestStack::new();
    let router = router(&stack);

    let init = rpc(&router, "initialize", json!({})).await;
    assert_eq!(init["result"]["protocolVersion"], mcp::PROTOCOL_VERSION);
    assert_eq!(init["result"]["serverInfo"]["name"], "stackpilot");

    let (status, body) = rpc_raw(
        &router,
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body.is_none());

    assert_eq!(rpc(&router, "ping", Value::Null).await["result"], json!({}));

    let tools = rpc(&router, "tools/list", json!({})).await;
    let names: Vec<&str> = tools["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.len(), 18);
    for expected in ["deploy", "deploy_rollback", "credentials_set", "agent_logs"] {
        assert!(names.contains(&expected), "missing {}", expected);
    }
}

#[tokio::test]
async fn test_null_id_is_a_request_not_a_notification() {
    let stack = TestStack::new();
    let router = router(&stack);

    let (status, body) = rpc_raw(
        &router,
        json!({ "jsonrpc": "2.0", "id": null, "method": "ping" }).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = body.unwrap();
    assert_eq!(body["id"], Value::Null);
    assert_eq!(body["result"], json!({}));

    let (status, body) = rpc_raw(&router, json!({ "jsonrpc": "2.0", "method": "ping" }).to_string()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body.is_none());
}

#[tokio::test]
async fn test_protocol_errors() {
    let stack = TestStack::new();
    let router = router(&stack);

    let (_, body) = rpc_raw(&router, "{oops".to_string()).await;
    let body = body.unwrap();
    assert_eq!(body["error"]["code"], mcp::PARSE_ERROR);
    assert_eq!(body["id"], Value::Null);

    let (_, body) = rpc_raw(&router, json!({ "jsonrpc": "1.0", "id": 1, "method": "ping" }).to_string()).await;
    assert_eq!(body.unwrap()["error"]["code"], mcp::INVALID_REQUEST);

    let (_, body) = rpc_raw(&router, json!({ "jsonrpc": "2.0", "id": 1 }).to_string()).await;
    assert_eq!(body.unwrap()["error"]["code"], mcp::INVALID_REQUEST);

    let unknown = rpc(&router, "resources/list", json!({})).await;
    assert_eq!(unknown["error"]["code"], mcp::METHOD_NOT_FOUND);
    assert!(unknown.get("result").is_none());

    let no_tool = call(&router, "launch_rockets", json!({})).await;
    assert_eq!(no_tool["error"]["code"], mcp::INVALID_PARAMS);

    let bad_args = call(&router, "service_scale", json!({ "service": "api" })).await;
    assert_eq!(bad_args["error"]["code"], mcp::INVALID_PARAMS);
}

#[tokio::test]
async fn test_failing_tool_is_a_result_with_is_error() {
    let stack = TestStack::new();
    stack.write_spec(STACK);
    let router = router(&stack);

    let response = call(&router, "agent_start", json!({ "name": "api" })).await;
    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["isError"], true);
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("agent 'api'"));

    let deploy = call(&router, "deploy", json!({})).await;
    assert_eq!(deploy["result"]["isError"], true);
    assert!(deploy["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("db-password"));
}

#[tokio::test]
async fn test_config_and_credentials_tools() {
    let stack = TestStack::new();
    let router = router(&stack);

    let spec: Value = serde_yaml::from_str(STACK).unwrap();
    let set = call(&router, "config_set", json!({ "spec": spec })).await;
    assert_eq!(set["result"]["isError"], false);

    let stored = call(
        &router,
        "credentials_set",
        json!({ "name": "db-password", "value": "hunter2" }),
    )
    .await;
    assert_eq!(stored["result"]["isError"], false);

    let listing = call(&router, "credentials_list", Value::Null).await;
    let text = listing["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("DB_PASSWORD"));
    assert!(!text.contains("hunter2"));

    let deploy = call(&router, "deploy", json!({})).await;
    assert_eq!(deploy["result"]["isError"], false);
    assert_eq!(stack.runner.calls_matching("up -d --remove-orphans").len(), 1);

    let history = call(&router, "history", json!({ "n": 5 })).await;
    let text = history["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("config: update stack spec"));
}
