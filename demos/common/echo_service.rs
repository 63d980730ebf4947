//! Echo service used by the demo server and the integration tests.
//!
//! Exposes two tools (`echo` and `start-notification-stream`) and one static
//! text resource.

#![allow(dead_code)]

use std::time::Duration;

use mcp_session_http::{ErrorData, HandlerRegistry, RequestContext};
use serde_json::{Value, json};

pub const SERVER_NAME: &str = "echo-server";
pub const GREETING_URI: &str = "https://example.com/greetings/default";
const PROTOCOL_VERSION: &str = "2025-03-26";

/// Builds the method table for the echo service.
pub fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with_method("initialize", |params, _| async move { Ok(initialize(params)) })
        .with_method("ping", |_, _| async { Ok(json!({})) })
        .with_method("tools/list", |_, _| async { Ok(list_tools()) })
        .with_method("tools/call", call_tool)
        .with_method("resources/list", |_, _| async { Ok(list_resources()) })
        .with_method("resources/read", |params, _| async move { read_resource(params) })
}

fn initialize(params: Option<Value>) -> Value {
    let version = params
        .as_ref()
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(PROTOCOL_VERSION)
        .to_owned();
    json!({
        "protocolVersion": version,
        "capabilities": {"tools": {}, "resources": {}, "logging": {}},
        "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")}
    })
}

fn list_tools() -> Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Echoes back the provided message",
                "inputSchema": {
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }
            },
            {
                "name": "start-notification-stream",
                "description": "Sends periodic notifications over the session stream",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "interval": {"type": "number", "description": "Milliseconds between notifications", "default": 100},
                        "count": {"type": "number", "description": "Number of notifications, 0 for unlimited", "default": 10}
                    }
                }
            }
        ]
    })
}

fn text_content(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

async fn call_tool(params: Option<Value>, ctx: RequestContext) -> Result<Value, ErrorData> {
    let params = params.unwrap_or_default();
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorData::invalid_params("missing tool name", None))?;
    let arguments = params.get("arguments").cloned().unwrap_or_default();

    match name {
        "echo" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| ErrorData::invalid_params("echo requires a string message", None))?;
            Ok(text_content(format!("Echo: {message}")))
        }
        "start-notification-stream" => {
            let interval = arguments.get("interval").and_then(Value::as_u64).unwrap_or(100);
            let count = arguments.get("count").and_then(Value::as_u64).unwrap_or(10);
            stream_notifications(&ctx, Duration::from_millis(interval), count).await;
            Ok(text_content(format!(
                "Started sending periodic notifications every {interval}ms"
            )))
        }
        other => Err(ErrorData::invalid_params(
            format!("unknown tool: {other}"),
            None,
        )),
    }
}

async fn stream_notifications(ctx: &RequestContext, interval: Duration, count: u64) {
    let mut sent = 0u64;
    while count == 0 || sent < count {
        sent += 1;
        let data = format!(
            "Periodic notification #{sent} at {}",
            chrono::Utc::now().to_rfc3339()
        );
        ctx.peer
            .notify(
                "notifications/message",
                Some(json!({"level": "info", "data": data})),
            )
            .await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = ctx.ct.cancelled() => break,
        }
    }
}

fn list_resources() -> Value {
    json!({
        "resources": [{
            "uri": GREETING_URI,
            "name": "greeting-resource",
            "mimeType": "text/plain"
        }]
    })
}

fn read_resource(params: Option<Value>) -> Result<Value, ErrorData> {
    let uri = params
        .as_ref()
        .and_then(|p| p.get("uri"))
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorData::invalid_params("missing resource uri", None))?;
    if uri != GREETING_URI {
        return Err(ErrorData::invalid_params(
            format!("resource not found: {uri}"),
            Some(json!({"uri": uri})),
        ));
    }
    Ok(json!({
        "contents": [{"uri": GREETING_URI, "mimeType": "text/plain", "text": "Hello, world!"}]
    }))
}
