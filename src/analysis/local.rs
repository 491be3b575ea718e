// Copyright 2025 Muvon Un Limited
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process RPC channel to the analysis engine.
//!
//! Requests travel over an mpsc channel to a serve task that runs each call
//! on its own task; replies come back on a second channel read by a reader
//! task that correlates them by request id, the same way a subprocess
//! backend's stdout reader does.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::AnalysisEngine;
use crate::gateway::error::GatewayError;
use crate::gateway::pending::{PendingRequests, RpcReply};
use crate::mcp::types::McpTool;

const CHANNEL_CAPACITY: usize = 256;

struct LocalRequest {
	id: u64,
	tool: String,
	arguments: Value,
}

pub struct LocalBackend {
	id: String,
	namespace: String,
	tools: Vec<McpTool>,
	requests: mpsc::Sender<LocalRequest>,
	pending: Arc<PendingRequests>,
	request_ids: AtomicU64,
	request_timeout: Duration,
}

impl LocalBackend {
	/// Start the serve and reader tasks. Needs a Tokio runtime.
	pub fn start(
		id: &str,
		engine: Arc<dyn AnalysisEngine>,
		request_timeout: Duration,
	) -> Arc<Self> {
		let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
		let (reply_tx, reply_rx) = mpsc::unbounded_channel();
		let pending = Arc::new(PendingRequests::new(id));

		let tools = engine.tools();
		debug!(
			backend = id,
			engine = engine.name(),
			tool_count = tools.len(),
			"Starting local analysis backend"
		);

		tokio::spawn(Self::serve_loop(engine, request_rx, reply_tx));
		tokio::spawn(Self::reader_loop(id.to_string(), reply_rx, pending.clone()));

		Arc::new(Self {
			id: id.to_string(),
			namespace: id.to_string(),
			tools,
			requests: request_tx,
			pending,
			request_ids: AtomicU64::new(1),
			request_timeout,
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn tools(&self) -> Vec<McpTool> {
		self.tools.clone()
	}

	pub fn next_request_id(&self) -> u64 {
		self.request_ids.fetch_add(1, Ordering::SeqCst)
	}

	pub async fn call_tool(
		&self,
		request_id: u64,
		tool: &str,
		arguments: Value,
	) -> Result<Value, GatewayError> {
		let rx = self.pending.register(request_id)?;
		let request = LocalRequest {
			id: request_id,
			tool: tool.to_string(),
			arguments,
		};
		if self.requests.send(request).await.is_err() {
			self.pending.remove(request_id);
			return Err(GatewayError::unavailable(&self.id, "analysis engine stopped"));
		}
		self.pending.wait(request_id, rx, self.request_timeout).await
	}

	async fn serve_loop(
		engine: Arc<dyn AnalysisEngine>,
		mut requests: mpsc::Receiver<LocalRequest>,
		replies: mpsc::UnboundedSender<(u64, RpcReply)>,
	) {
		while let Some(request) = requests.recv().await {
			let engine = engine.clone();
			let replies = replies.clone();
			tokio::spawn(async move {
				let reply = engine.call(&request.tool, request.arguments).await;
				if replies.send((request.id, reply)).is_err() {
					warn!(id = request.id, "Local reply channel closed");
				}
			});
		}
		debug!("Local analysis serve loop ended");
	}

	async fn reader_loop(
		backend_id: String,
		mut replies: mpsc::UnboundedReceiver<(u64, RpcReply)>,
		pending: Arc<PendingRequests>,
	) {
		while let Some((id, reply)) = replies.recv().await {
			pending.complete(id, reply);
		}
		debug!(backend = %backend_id, "Local analysis reader loop ended");
		pending.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mcp::types::JsonRpcError;
	use async_trait::async_trait;
	use serde_json::json;

	struct SlowEcho;

	#[async_trait]
	impl AnalysisEngine for SlowEcho {
		fn name(&self) -> &str {
			"slow-echo"
		}

		fn tools(&self) -> Vec<McpTool> {
			vec![McpTool::new("echo", "Echo", json!({"type": "object"}))]
		}

		async fn call(&self, tool: &str, arguments: Value) -> Result<Value, JsonRpcError> {
			if tool != "echo" {
				return Err(JsonRpcError::new(-32602, format!("Unknown tool: {}", tool)));
			}
			let delay = arguments.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
			tokio::time::sleep(Duration::from_millis(delay)).await;
			Ok(arguments)
		}
	}

	#[tokio::test]
	async fn test_replies_correlate_out_of_order() {
		let backend = LocalBackend::start("local", Arc::new(SlowEcho), Duration::from_secs(5));
		let slow_id = backend.next_request_id();
		let fast_id = backend.next_request_id();

		let (slow, fast) = tokio::join!(
			backend.call_tool(slow_id, "echo", json!({"delay_ms": 80, "tag": "slow"})),
			backend.call_tool(fast_id, "echo", json!({"tag": "fast"})),
		);
		assert_eq!(slow.unwrap()["tag"], "slow");
		assert_eq!(fast.unwrap()["tag"], "fast");
	}

	#[tokio::test]
	async fn test_engine_error_passes_through() {
		let backend = LocalBackend::start("local", Arc::new(SlowEcho), Duration::from_secs(5));
		let id = backend.next_request_id();
		let err = backend.call_tool(id, "missing", json!({})).await.unwrap_err();
		assert!(matches!(err, GatewayError::BackendError(e) if e.code == -32602));
	}

	#[tokio::test]
	async fn test_timeout_is_unavailable() {
		let backend = LocalBackend::start("local", Arc::new(SlowEcho), Duration::from_millis(20));
		let id = backend.next_request_id();
		let err = backend
			.call_tool(id, "echo", json!({"delay_ms": 500}))
			.await
			.unwrap_err();
		assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
	}
}
