// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Tool-calling protocol (JSON-RPC 2.0)
//!
//! `POST /mcp` exposes the operator as a catalog of tools for autonomous
//! agents. Protocol faults become JSON-RPC error objects; a tool whose
//! operation fails still answers with a normal result flagged `isError`.
//!
//! | Code | Meaning |
//! |------|---------|
//! | -32700 | body is not JSON |
//! | -32600 | not a JSON-RPC 2.0 request |
//! | -32601 | unknown method |
//! | -32602 | unknown tool or invalid arguments |

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::application::operator::{Operator, OperatorError};
use crate::domain::runtime::{LogOptions, LogStream};
use crate::domain::stack::StackSpec;

use super::api::AppState;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "stackpilot";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

const DEFAULT_LOG_LINES: u32 = 200;
const MAX_LOG_BYTES: usize = 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
}

pub async fn handle(State(state): State<AppState>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return Json(RpcResponse::error(Value::Null, PARSE_ERROR, format!("parse error: {}", e)))
                .into_response()
        }
    };

    // Only an absent id makes a notification; `"id": null` still gets a reply.
    let id = value.get("id").cloned();
    let request: RpcRequest = match serde_json::from_value::<RpcRequest>(value) {
        Ok(request) if request.jsonrpc == "2.0" => request,
        Ok(_) => {
            return Json(RpcResponse::error(
                id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            ))
            .into_response()
        }
        Err(e) => {
            return Json(RpcResponse::error(
                id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                format!("invalid request: {}", e),
            ))
            .into_response()
        }
    };

    let Some(id) = id else {
        debug!(method = %request.method, "notification received");
        return StatusCode::ACCEPTED.into_response();
    };

    let response = match dispatch(&state.operator, &request.method, request.params).await {
        Ok(result) => RpcResponse::result(id, result),
        Err(error) => RpcResponse::error(id, error.code, error.message),
    };
    Json(response).into_response()
}

async fn dispatch(operator: &Operator, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_catalog() })),
        "tools/call" => {
            let call: ToolCall = serde_json::from_value(params).map_err(|e| RpcError {
                code: INVALID_PARAMS,
                message: format!("invalid tools/call params: {}", e),
            })?;
            call_tool(operator, &call.name, call.arguments).await
        }
        other => Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {}", other),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

// ============================================================================
// Tool catalog
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn no_args() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

pub fn tool_catalog() -> Vec<ToolDescriptor> {
    let logs_props = |key: &str| {
        json!({
            key: { "type": "string" },
            "lines": { "type": "integer", "minimum": 1 },
            "since": { "type": "string", "description": "duration (10m) or RFC 3339 timestamp" },
        })
    };
    vec![
        ToolDescriptor {
            name: "platform_health",
            description: "Operator liveness, version and uptime.",
            input_schema: no_args(),
        },
        ToolDescriptor {
            name: "platform_status",
            description: "Run state, health and replica counts of every workload.",
            input_schema: no_args(),
        },
        ToolDescriptor {
            name: "config_get",
            description: "Current stack spec.",
            input_schema: no_args(),
        },
        ToolDescriptor {
            name: "config_set",
            description: "Validate, save and commit a new stack spec.",
            input_schema: schema(json!({ "spec": { "type": "object" } }), &["spec"]),
        },
        ToolDescriptor {
            name: "deploy",
            description: "Compile the stack spec and converge the runtime onto it.",
            input_schema: no_args(),
        },
        ToolDescriptor {
            name: "deploy_plan",
            description: "Services a deploy would add, update and remove.",
            input_schema: no_args(),
        },
        ToolDescriptor {
            name: "deploy_rollback",
            description: "Restore the stack spec of an earlier commit and redeploy.",
            input_schema: schema(json!({ "sha": { "type": "string" } }), &["sha"]),
        },
        ToolDescriptor {
            name: "service_logs",
            description: "Recent log output of a service.",
            input_schema: schema(logs_props("service"), &["service"]),
        },
        ToolDescriptor {
            name: "service_scale",
            description: "Set the running replica count of a service.",
            input_schema: schema(
                json!({
                    "service": { "type": "string" },
                    "replicas": { "type": "integer", "minimum": 0 },
                }),
                &["service", "replicas"],
            ),
        },
        ToolDescriptor {
            name: "platform_down",
            description: "Stop and remove every container of the stack.",
            input_schema: no_args(),
        },
        ToolDescriptor {
            name: "agent_list",
            description: "Declared agents with their skills, tool servers and state.",
            input_schema: no_args(),
        },
        ToolDescriptor {
            name: "agent_start",
            description: "Start an agent container.",
            input_schema: schema(json!({ "name": { "type": "string" } }), &["name"]),
        },
        ToolDescriptor {
            name: "agent_stop",
            description: "Stop an agent container.",
            input_schema: schema(json!({ "name": { "type": "string" } }), &["name"]),
        },
        ToolDescriptor {
            name: "agent_logs",
            description: "Recent log output of an agent.",
            input_schema: schema(logs_props("name"), &["name"]),
        },
        ToolDescriptor {
            name: "history",
            description: "Commits of the stack spec, newest first.",
            input_schema: schema(json!({ "n": { "type": "integer", "minimum": 1 } }), &[]),
        },
        ToolDescriptor {
            name: "credentials_list",
            description: "Declared and stored credentials (names only, never values).",
            input_schema: no_args(),
        },
        ToolDescriptor {
            name: "credentials_set",
            description: "Store a credential value.",
            input_schema: schema(
                json!({
                    "name": { "type": "string" },
                    "value": { "type": "string" },
                }),
                &["name", "value"],
            ),
        },
        ToolDescriptor {
            name: "credentials_delete",
            description: "Remove a stored credential.",
            input_schema: schema(json!({ "name": { "type": "string" } }), &["name"]),
        },
    ]
}

// ============================================================================
// Tool calls
// ============================================================================

#[derive(Debug, Deserialize)]
struct ConfigSetArgs {
    spec: StackSpec,
}

#[derive(Debug, Deserialize)]
struct RollbackArgs {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct LogsArgs {
    #[serde(alias = "name")]
    service: String,
    lines: Option<u32>,
    since: Option<String>,
}

impl LogsArgs {
    fn options(&self) -> LogOptions {
        LogOptions {
            lines: Some(self.lines.unwrap_or(DEFAULT_LOG_LINES)),
            follow: false,
            since: self.since.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScaleArgs {
    service: String,
    replicas: u32,
}

#[derive(Debug, Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HistoryArgs {
    n: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CredentialArgs {
    name: String,
    value: String,
}

fn args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, RpcError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| RpcError {
        code: INVALID_PARAMS,
        message: format!("invalid arguments for {}: {}", tool, e),
    })
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn to_result<T: Serialize>(outcome: Result<T, OperatorError>) -> Value {
    match outcome {
        Ok(value) => {
            let text = serde_json::to_string_pretty(&value).unwrap_or_else(|e| e.to_string());
            text_result(text, false)
        }
        Err(err) => {
            warn!("tool call failed: {}", err);
            let details = err.details();
            let text = if details.is_empty() {
                err.to_string()
            } else {
                format!("{}\n- {}", err, details.join("\n- "))
            };
            text_result(text, true)
        }
    }
}

async fn collect_logs(stream: Result<LogStream, OperatorError>) -> Result<String, OperatorError> {
    let mut stream = stream?;
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        if buffer.len() >= MAX_LOG_BYTES {
            buffer.truncate(MAX_LOG_BYTES);
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn call_tool(operator: &Operator, name: &str, arguments: Value) -> Result<Value, RpcError> {
    debug!(tool = name, "tool call");
    let result = match name {
        "platform_health" => to_result(Ok::<_, OperatorError>(operator.health())),
        "platform_status" => to_result(operator.status().await),
        "config_get" => to_result(operator.config_get().await),
        "config_set" => {
            let a: ConfigSetArgs = args(name, arguments)?;
            to_result(operator.config_set(a.spec).await)
        }
        "deploy" => to_result(operator.deploy().await),
        "deploy_plan" => to_result(operator.plan().await),
        "deploy_rollback" => {
            let a: RollbackArgs = args(name, arguments)?;
            to_result(operator.rollback(&a.sha).await)
        }
        "service_logs" => {
            let a: LogsArgs = args(name, arguments)?;
            let logs = collect_logs(operator.logs(&a.service, &a.options()).await).await;
            match logs {
                Ok(text) => text_result(text, false),
                Err(e) => to_result::<()>(Err(e)),
            }
        }
        "service_scale" => {
            let a: ScaleArgs = args(name, arguments)?;
            to_result(
                operator
                    .scale(&a.service, a.replicas)
                    .await
                    .map(|_| json!({ "service": a.service, "replicas": a.replicas })),
            )
        }
        "platform_down" => to_result(operator.down().await.map(|_| json!({ "status": "down" }))),
        "agent_list" => to_result(operator.agents().await),
        "agent_start" => {
            let a: NameArgs = args(name, arguments)?;
            to_result(
                operator
                    .agent_start(&a.name)
                    .await
                    .map(|_| json!({ "agent": a.name, "status": "started" })),
            )
        }
        "agent_stop" => {
            let a: NameArgs = args(name, arguments)?;
            to_result(
                operator
                    .agent_stop(&a.name)
                    .await
                    .map(|_| json!({ "agent": a.name, "status": "stopped" })),
            )
        }
        "agent_logs" => {
            let a: LogsArgs = args(name, arguments)?;
            let logs = collect_logs(operator.agent_logs(&a.service, &a.options()).await).await;
            match logs {
                Ok(text) => text_result(text, false),
                Err(e) => to_result::<()>(Err(e)),
            }
        }
        "history" => {
            let a: HistoryArgs = args(name, arguments)?;
            to_result(operator.history(a.n.unwrap_or(20)).await)
        }
        "credentials_list" => to_result(operator.credentials_list().await),
        "credentials_set" => {
            let a: CredentialArgs = args(name, arguments)?;
            to_result(operator.credentials_set(&a.name, &a.value).await)
        }
        "credentials_delete" => {
            let a: NameArgs = args(name, arguments)?;
            to_result(
                operator
                    .credentials_delete(&a.name)
                    .await
                    .map(|_| json!({ "deleted": a.name })),
            )
        }
        unknown => {
            return Err(RpcError {
                code: INVALID_PARAMS,
                message: format!("unknown tool: {}", unknown),
            })
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_names_are_unique_and_complete() {
        let catalog = tool_catalog();
        let names: HashSet<_> = catalog.iter().map(|t| t.name).collect();
        assert_eq!(names.len(), 18);
        assert_eq!(catalog.len(), 18);
        for tool in &catalog {
            assert_eq!(tool.input_schema["type"], "object");
        }
    }

    #[test]
    fn test_logs_args_accept_name_alias() {
        let a: LogsArgs = args("agent_logs", json!({ "name": "coder", "lines": 5 })).unwrap();
        assert_eq!(a.service, "coder");
        assert_eq!(a.options().lines, Some(5));
        assert!(!a.options().follow);
    }

    #[test]
    fn test_bad_arguments_are_invalid_params() {
        let err = args::<ScaleArgs>("service_scale", json!({ "service": "api" })).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(err.message.contains("service_scale"));
    }
}
