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

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::gateway::Gateway;
use crate::mcp::types::{
	JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, INVALID_REQUEST, PARSE_ERROR,
};

const WRITER_DRAIN_TIMEOUT_MS: u64 = 2_000;

/// MCP server over stdio: one client session per process.
///
/// stdout carries protocol messages only; every log line goes to the log
/// file or stderr.
pub struct McpServer {
	gateway: Gateway,
	debug: bool,
}

impl McpServer {
	pub fn new(gateway: Gateway, debug: bool) -> Self {
		Self { gateway, debug }
	}

	pub async fn run(&self) -> Result<()> {
		if self.debug {
			eprintln!("MCP gateway started on stdio");
			for status in self.gateway.backend_status() {
				eprintln!(
					"  backend {} ({}): {} with {} tools, {} restarts",
					status.id, status.kind, status.state, status.tool_count, status.restarts
				);
				if let Some(checked) = status.last_health_check {
					eprintln!("    last health check {}ms ago", checked.elapsed().as_millis());
				}
				for line in &status.stderr_tail {
					eprintln!("    stderr: {}", line);
				}
			}
		}

		self.serve(tokio::io::stdin(), tokio::io::stdout()).await?;

		if self.debug {
			eprintln!("MCP gateway stopped");
		}
		Ok(())
	}

	/// Serve one session over any byte stream pair until the reader hits EOF.
	pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
		let writer_task = tokio::spawn(write_loop(writer, out_rx));

		let mut lines = BufReader::new(reader).lines();
		let mut session_id: Option<String> = None;
		let mut catalog_changes = self.gateway.subscribe_catalog();
		let mut catalog_open = true;

		loop {
			tokio::select! {
				// next_line is cancel safe, partial lines are kept
				line = lines.next_line() => {
					match line {
						Ok(Some(line)) => self.handle_line(&line, &mut session_id, &out_tx),
						Ok(None) => break, // EOF
						Err(e) => {
							warn!(error = %e, "Error reading from stdin");
							break;
						}
					}
				}

				changed = catalog_changes.changed(), if catalog_open => {
					if changed.is_err() {
						catalog_open = false;
						continue;
					}
					if session_id.is_some() {
						let notification =
							JsonRpcRequest::notification("notifications/tools/list_changed", None);
						queue(&out_tx, &notification);
					}
				}
			}
		}

		if let Some(id) = session_id.take() {
			self.gateway.close_session(&id);
		}

		// Replies already queued still get written
		drop(out_tx);
		if tokio::time::timeout(Duration::from_millis(WRITER_DRAIN_TIMEOUT_MS), writer_task)
			.await
			.is_err()
		{
			debug!("Writer did not drain before shutdown");
		}
		Ok(())
	}

	fn handle_line(
		&self,
		line: &str,
		session_id: &mut Option<String>,
		out: &mpsc::UnboundedSender<String>,
	) {
		let trimmed = line.trim();
		if trimmed.is_empty() {
			return;
		}

		let value: Value = match serde_json::from_str(trimmed) {
			Ok(value) => value,
			Err(e) => {
				debug!(error = %e, "Unparseable message from client");
				let error = JsonRpcError::new(PARSE_ERROR, format!("Parse error: {}", e));
				queue(out, &JsonRpcResponse::failure(None, error));
				return;
			}
		};

		if value.is_array() {
			let error = JsonRpcError::new(INVALID_REQUEST, "Batch requests are not supported");
			queue(out, &JsonRpcResponse::failure(None, error));
			return;
		}

		let id = value.get("id").cloned();
		let message: JsonRpcMessage = match serde_json::from_value(value) {
			Ok(message) => message,
			Err(e) => {
				let error = JsonRpcError::new(INVALID_REQUEST, format!("Invalid request: {}", e));
				queue(out, &JsonRpcResponse::failure(id, error));
				return;
			}
		};

		match message {
			JsonRpcMessage::Request(request) => {
				if request.method == "initialize" {
					if let Some(previous) = session_id.take() {
						info!(session_id = %previous, "Client re-initialized, closing previous session");
						self.gateway.close_session(&previous);
					}
				}

				let prepared = self.gateway.prepare(session_id.as_deref(), request);
				if let Some(id) = prepared.session_id() {
					*session_id = Some(id.to_string());
				}

				let out = out.clone();
				tokio::spawn(async move {
					let reply = prepared.run().await;
					if let Some(response) = &reply.response {
						queue(&out, response);
					}
					// Turn released only after the response is queued
					drop(reply.turn);
				});
			}
			JsonRpcMessage::Notification(notification) => {
				self.gateway
					.handle_notification(session_id.as_deref(), &notification);
			}
			JsonRpcMessage::Response(response) => {
				debug!(id = %response.id, "Ignoring response from client");
			}
		}
	}
}

fn queue<T: serde::Serialize>(out: &mpsc::UnboundedSender<String>, message: &T) {
	match serde_json::to_string(message) {
		Ok(json) => {
			if out.send(json).is_err() {
				debug!("Output closed, dropping message");
			}
		}
		Err(e) => warn!(error = %e, "Failed to serialize outgoing message"),
	}
}

async fn write_loop<W>(mut writer: W, mut out: mpsc::UnboundedReceiver<String>)
where
	W: AsyncWrite + Unpin,
{
	while let Some(line) = out.recv().await {
		let written = async {
			writer.write_all(line.as_bytes()).await?;
			writer.write_all(b"\n").await?;
			writer.flush().await
		}
		.await;
		if let Err(e) = written {
			warn!(error = %e, "Failed to write to stdout");
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::analysis::{AnalysisEngine, RuleEngine};
	use crate::config::{AnalysisConfig, Config};
	use crate::gateway::Manifest;
	use serde_json::json;
	use std::sync::Arc;
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

	async fn gateway() -> Gateway {
		let engine: Arc<dyn AnalysisEngine> =
			Arc::new(RuleEngine::new(&AnalysisConfig::default()).unwrap());
		Gateway::start(&Config::default(), Manifest::default(), Some(engine))
			.await
			.unwrap()
	}

	async fn next_response<R: tokio::io::AsyncBufRead + Unpin>(
		lines: &mut tokio::io::Lines<R>,
	) -> Value {
		loop {
			let line = lines.next_line().await.unwrap().unwrap();
			let value: Value = serde_json::from_str(&line).unwrap();
			// Skip server-initiated notifications
			if value.get("method").is_none() {
				return value;
			}
		}
	}

	#[tokio::test]
	async fn test_stdio_session_round_trip() {
		let gw = gateway().await;
		let (client, server) = tokio::io::duplex(64 * 1024);
		let (server_read, server_write) = tokio::io::split(server);
		let server_gw = gw.clone();
		let serve = tokio::spawn(async move {
			McpServer::new(server_gw, false)
				.serve(server_read, server_write)
				.await
		});

		let (client_read, mut client_write) = tokio::io::split(client);
		let mut responses = BufReader::new(client_read).lines();

		let send = |v: Value| format!("{}\n", v);
		client_write
			.write_all(send(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2024-11-05"}})).as_bytes())
			.await
			.unwrap();
		let init = next_response(&mut responses).await;
		assert_eq!(init["id"], 1);
		assert_eq!(init["result"]["protocolVersion"], "2024-11-05");

		client_write
			.write_all(send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).as_bytes())
			.await
			.unwrap();
		client_write
			.write_all(send(json!({"jsonrpc": "2.0", "id": "list", "method": "tools/list"})).as_bytes())
			.await
			.unwrap();
		let list = next_response(&mut responses).await;
		assert_eq!(list["id"], "list");
		let names: Vec<&str> = list["result"]["tools"]
			.as_array()
			.unwrap()
			.iter()
			.filter_map(|t| t["name"].as_str())
			.collect();
		assert!(names.contains(&"analyze_code_snippet"));

		client_write.write_all(b"{broken\n").await.unwrap();
		let parse = next_response(&mut responses).await;
		assert_eq!(parse["error"]["code"], PARSE_ERROR);
		assert_eq!(parse["id"], Value::Null);

		client_write.write_all(b"[{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"ping\"}]\n").await.unwrap();
		let batch = next_response(&mut responses).await;
		assert_eq!(batch["error"]["code"], INVALID_REQUEST);

		assert_eq!(gw.session_count(), 1);
		client_write.shutdown().await.unwrap();
		serve.await.unwrap().unwrap();
		assert_eq!(gw.session_count(), 0, "EOF closes the session");
	}
}
