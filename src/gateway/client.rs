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

//! MCP client over a child process's stdio

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::error::GatewayError;
use super::manifest::ProxiedServerSpec;
use super::pending::PendingRequests;
use crate::constants::STDERR_TAIL_LINES;
use crate::mcp::logging::log_stderr_line;
use crate::mcp::types::{
	JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
};

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// Connection to one running proxied server process.
///
/// A client lives exactly as long as the process it spawned; restarts create
/// a new client that shares the backend's request id counter.
pub struct StdioClient {
	backend_id: String,
	process: Mutex<Option<Child>>,
	stdin: SharedStdin,
	request_ids: Arc<AtomicU64>,
	pending: Arc<PendingRequests>,
	closed: watch::Receiver<bool>,
	close_reason: Arc<parking_lot::Mutex<Option<String>>>,
	stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
	pid: Option<u32>,
}

impl StdioClient {
	/// Spawn the process and start its reader tasks.
	///
	/// The child inherits the parent environment with the spec's `env` laid
	/// over it.
	pub fn spawn(
		spec: &ProxiedServerSpec,
		request_ids: Arc<AtomicU64>,
		tools_changed: Arc<Notify>,
	) -> Result<Self, GatewayError> {
		debug!(
			backend = %spec.id,
			command = %spec.command,
			args = ?spec.args,
			"Spawning proxied server"
		);

		let mut command = tokio::process::Command::new(&spec.command);
		command
			.args(&spec.args)
			.envs(&spec.env)
			.stdin(std::process::Stdio::piped())
			.stdout(std::process::Stdio::piped())
			.stderr(std::process::Stdio::piped())
			.kill_on_drop(true);
		if let Some(dir) = &spec.working_directory {
			command.current_dir(dir);
		}

		let mut child = command.spawn().map_err(|e| GatewayError::HandshakeFailure {
			backend: spec.id.clone(),
			reason: format!("failed to start '{}': {}", spec.command, e),
		})?;

		let missing = |stream: &str| GatewayError::HandshakeFailure {
			backend: spec.id.clone(),
			reason: format!("failed to capture {}", stream),
		};
		let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
		let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
		let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
		let pid = child.id();

		let stdin: SharedStdin = Arc::new(Mutex::new(Some(stdin)));
		let pending = Arc::new(PendingRequests::new(&spec.id));
		let (closed_tx, closed_rx) = watch::channel(false);
		let close_reason = Arc::new(parking_lot::Mutex::new(None));
		let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(
			STDERR_TAIL_LINES,
		)));

		tokio::spawn(Self::communication_loop(
			spec.id.clone(),
			stdout,
			stdin.clone(),
			pending.clone(),
			tools_changed,
			closed_tx,
			close_reason.clone(),
		));
		tokio::spawn(Self::stderr_loop(
			spec.id.clone(),
			stderr,
			stderr_tail.clone(),
		));

		info!(backend = %spec.id, pid = ?pid, "Proxied server process started");

		Ok(Self {
			backend_id: spec.id.clone(),
			process: Mutex::new(Some(child)),
			stdin,
			request_ids,
			pending,
			closed: closed_rx,
			close_reason,
			stderr_tail,
			pid,
		})
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	pub fn next_request_id(&self) -> u64 {
		self.request_ids.fetch_add(1, Ordering::SeqCst)
	}

	/// Send a request with a fresh id and wait for its reply
	pub async fn request(
		&self,
		method: &str,
		params: Value,
		limit: Duration,
	) -> Result<Value, GatewayError> {
		let id = self.next_request_id();
		self.request_with_id(id, method, params, limit).await
	}

	/// Send a request under an id the caller already allocated
	pub async fn request_with_id(
		&self,
		id: u64,
		method: &str,
		params: Value,
		limit: Duration,
	) -> Result<Value, GatewayError> {
		let rx = self.pending.register(id)?;
		let request = JsonRpcRequest::new(Value::from(id), method, params);
		if let Err(e) = self.send_message(&request).await {
			self.pending.remove(id);
			return Err(e);
		}
		self.pending.wait(id, rx, limit).await
	}

	pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError> {
		self.send_message(&JsonRpcRequest::notification(method, params))
			.await
	}

	async fn send_message<T: serde::Serialize>(&self, message: &T) -> Result<(), GatewayError> {
		write_line(&self.stdin, message)
			.await
			.map_err(|e| GatewayError::unavailable(&self.backend_id, e))
	}

	/// Resolves once the process's stdout has closed or broken protocol.
	pub async fn closed(&self) {
		let mut closed = self.closed.clone();
		let _ = closed.wait_for(|c| *c).await;
	}

	pub fn close_reason(&self) -> Option<String> {
		self.close_reason.lock().clone()
	}

	/// Most recent stderr lines, oldest first
	pub fn stderr_tail(&self) -> Vec<String> {
		self.stderr_tail.lock().iter().cloned().collect()
	}

	/// Close stdin, give the process `grace` to exit, then kill it.
	pub async fn shutdown(&self, grace: Duration) {
		// Dropping stdin delivers EOF
		self.stdin.lock().await.take();

		let mut process_guard = self.process.lock().await;
		if let Some(mut process) = process_guard.take() {
			match timeout(grace, process.wait()).await {
				Ok(Ok(status)) => {
					debug!(backend = %self.backend_id, status = %status, "Proxied server exited");
				}
				Ok(Err(e)) => {
					warn!(backend = %self.backend_id, error = %e, "Failed to wait for proxied server");
				}
				Err(_) => {
					warn!(
						backend = %self.backend_id,
						grace_ms = grace.as_millis() as u64,
						"Proxied server did not exit in time, killing"
					);
					if let Err(e) = process.kill().await {
						warn!(backend = %self.backend_id, error = %e, "Failed to kill proxied server");
					}
				}
			}
		}
		drop(process_guard);

		self.pending.close();
	}

	async fn communication_loop(
		backend_id: String,
		stdout: ChildStdout,
		stdin: SharedStdin,
		pending: Arc<PendingRequests>,
		tools_changed: Arc<Notify>,
		closed_tx: watch::Sender<bool>,
		close_reason: Arc<parking_lot::Mutex<Option<String>>>,
	) {
		let mut reader = BufReader::new(stdout);
		let mut line = String::new();

		let reason = loop {
			line.clear();
			match reader.read_line(&mut line).await {
				Ok(0) => break "process closed stdout".to_string(),
				Ok(_) => {
					let trimmed = line.trim();
					if trimmed.is_empty() {
						continue;
					}

					let message = match serde_json::from_str::<JsonRpcMessage>(trimmed) {
						Ok(message) => message,
						Err(e) => {
							warn!(
								backend = %backend_id,
								error = %e,
								line = %trimmed,
								"Protocol violation from proxied server"
							);
							break format!("protocol violation: {}", e);
						}
					};

					match message {
						JsonRpcMessage::Response(response) => {
							let Some(id) = response.id.as_u64() else {
								warn!(backend = %backend_id, id = %response.id, "Reply with non-numeric id");
								continue;
							};
							let reply = match response.error {
								Some(error) => Err(error),
								None => Ok(response.result.unwrap_or(Value::Null)),
							};
							pending.complete(id, reply);
						}
						JsonRpcMessage::Request(request) => {
							debug!(
								backend = %backend_id,
								method = %request.method,
								"Rejecting server-initiated request"
							);
							let reply = JsonRpcResponse::failure(
								Some(request.id),
								JsonRpcError::new(
									METHOD_NOT_FOUND,
									format!("Method not supported by gateway: {}", request.method),
								),
							);
							if let Err(e) = write_line(&stdin, &reply).await {
								break format!("write failed: {}", e);
							}
						}
						JsonRpcMessage::Notification(notification) => {
							if notification.method == "notifications/tools/list_changed" {
								info!(backend = %backend_id, "Proxied server tool list changed");
								tools_changed.notify_one();
							} else {
								debug!(
									backend = %backend_id,
									method = %notification.method,
									params = ?notification.params,
									"Notification from proxied server"
								);
							}
						}
					}
				}
				Err(e) => break format!("read failed: {}", e),
			}
		};

		debug!(backend = %backend_id, reason = %reason, "Proxied server reader stopped");
		*close_reason.lock() = Some(reason);
		pending.close();
		closed_tx.send_replace(true);
	}

	async fn stderr_loop(
		backend_id: String,
		stderr: ChildStderr,
		tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
	) {
		let mut lines = BufReader::new(stderr).lines();
		while let Ok(Some(line)) = lines.next_line().await {
			log_stderr_line(&backend_id, &line);
			let mut ring = tail.lock();
			if ring.len() == STDERR_TAIL_LINES {
				ring.pop_front();
			}
			ring.push_back(line);
		}
	}
}

async fn write_line<T: serde::Serialize>(stdin: &SharedStdin, message: &T) -> Result<(), String> {
	// Compact serde_json output never contains a raw newline
	let mut payload = serde_json::to_vec(message).map_err(|e| e.to_string())?;
	payload.push(b'\n');

	let mut guard = stdin.lock().await;
	match guard.as_mut() {
		Some(stdin) => {
			stdin.write_all(&payload).await.map_err(|e| e.to_string())?;
			stdin.flush().await.map_err(|e| e.to_string())
		}
		None => Err("stdin closed".to_string()),
	}
}
