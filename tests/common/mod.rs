//! Common test utilities for the integration tests.
//!
//! Provides the echo service shared with the demo server, plus helpers to
//! build dispatchers, bind a real server and read SSE frames.

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use actix_web::{App, HttpServer, web};
use futures::StreamExt;
use mcp_session_http::{Dispatcher, DispatcherConfig, StreamableHttpService};
use serde_json::{Value, json};

/// Echo service with a notification stream tool and a greeting resource.
#[path = "../../demos/common/echo_service.rs"]
pub mod echo_service;

pub const MCP_PATH: &str = "/mcp";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mcp_session_http=debug")
        .with_test_writer()
        .try_init();
}

pub fn dispatcher() -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        echo_service::handlers(),
        DispatcherConfig {
            close_grace_period: Duration::from_millis(500),
            ..Default::default()
        },
    ))
}

pub fn initialize_request(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "1.0.0"}
        }
    })
}

pub fn echo_request(id: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": "echo", "arguments": {"message": message}}
    })
}

/// Binds `service` on an ephemeral port under [`MCP_PATH`] and runs it in the
/// background.
pub async fn spawn_server(service: StreamableHttpService) -> SocketAddr {
    let server = HttpServer::new(move || {
        App::new().service(web::scope(MCP_PATH).service(service.clone().scope()))
    })
    .workers(1)
    .bind("127.0.0.1:0")
    .expect("Failed to bind server");

    let addr = *server.addrs().first().expect("bound address");
    let server_handle = server.run();
    tokio::spawn(async move {
        let _ = server_handle.await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    addr
}

/// Incremental reader for `data:` payloads of an SSE response.
pub struct SseReader {
    stream: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: String,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
            buffer: String::new(),
        }
    }

    /// Next `data:` payload, or `None` when the stream ended or stalled.
    pub async fn next_data(&mut self) -> Option<Value> {
        loop {
            let frame = self.next_frame().await?;
            if let Some(data) = frame.lines().find_map(|line| line.strip_prefix("data: ")) {
                return serde_json::from_str(data).ok();
            }
        }
    }

    /// Next raw frame, keep-alive comments included.
    pub async fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                return Some(self.buffer.drain(..end + 2).collect());
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .ok()??
                .ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}
