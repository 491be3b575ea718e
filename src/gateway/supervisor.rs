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

//! Lifecycle supervision of proxied MCP server processes.
//!
//! Each [`ManagedServer`] runs a single supervisor task that owns every
//! state transition:
//!
//! ```text
//! NotStarted -> Starting -> Ready -> Degraded -> Starting ...
//!                   \          \         \
//!                    +----------+---------+--> Terminated
//! ```
//!
//! Dispatch never drives the process directly. Callers wait on the state
//! channel for `Ready` (bounded) and then use whatever client is current.
//!
//! A lazily started server is still spawned once at activation to learn its
//! tools. That discovery process is shut down again and the server stays
//! `NotStarted` until the first call asks for it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use super::client::StdioClient;
use super::error::GatewayError;
use super::manifest::ProxiedServerSpec;
use crate::config::Config;
use crate::constants::{CLIENT_PROTOCOL_VERSION, MAX_TOOL_PAGES, SERVER_NAME};
use crate::mcp::logging::log_backend_transition;
use crate::mcp::types::McpTool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
	NotStarted,
	Starting,
	Ready,
	Degraded,
	Terminated,
}

impl LifecycleState {
	pub fn as_str(&self) -> &'static str {
		match self {
			LifecycleState::NotStarted => "not_started",
			LifecycleState::Starting => "starting",
			LifecycleState::Ready => "ready",
			LifecycleState::Degraded => "degraded",
			LifecycleState::Terminated => "terminated",
		}
	}
}

impl std::fmt::Display for LifecycleState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
	pub handshake_timeout: Duration,
	pub health_probe_timeout: Duration,
	pub health_interval: Duration,
	pub request_timeout: Duration,
	pub termination_timeout: Duration,
	pub max_failures: u32,
	pub backoff_base: Duration,
	pub backoff_max: Duration,
}

impl From<&Config> for SupervisorSettings {
	fn from(config: &Config) -> Self {
		Self {
			handshake_timeout: config.timeouts.handshake(),
			health_probe_timeout: config.timeouts.health_probe(),
			health_interval: config.timeouts.health_interval(),
			request_timeout: config.timeouts.request(),
			termination_timeout: config.timeouts.termination(),
			max_failures: config.restart.max_failures.max(1),
			backoff_base: Duration::from_millis(config.restart.backoff_base_ms),
			backoff_max: Duration::from_millis(config.restart.backoff_max_ms),
		}
	}
}

impl Default for SupervisorSettings {
	fn default() -> Self {
		Self::from(&Config::default())
	}
}

impl SupervisorSettings {
	/// Delay before restart attempt `n` (1-based): `base * 2^(n-1)`, capped.
	pub fn backoff_for(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(20);
		let factor = 1u32 << exponent;
		self.backoff_base
			.checked_mul(factor)
			.unwrap_or(self.backoff_max)
			.min(self.backoff_max)
	}
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
	let _ = rx.wait_for(|s| *s).await;
}

enum MonitorExit {
	Shutdown,
	Failed(String),
}

/// A proxied server under supervision.
pub struct ManagedServer {
	spec: ProxiedServerSpec,
	settings: SupervisorSettings,
	state: watch::Sender<LifecycleState>,
	client: RwLock<Option<Arc<StdioClient>>>,
	spawn_lock: tokio::sync::Mutex<()>,
	request_ids: Arc<AtomicU64>,
	tools: RwLock<Vec<McpTool>>,
	consecutive_failures: AtomicU32,
	restarts: AtomicU32,
	last_health_check: parking_lot::Mutex<Option<Instant>>,
	last_restart: parking_lot::Mutex<Option<DateTime<Utc>>>,
	activated: AtomicBool,
	settled: watch::Sender<bool>,
	start_signal: Notify,
	tools_changed: Arc<Notify>,
	shutdown: watch::Sender<bool>,
	refresh_tx: mpsc::UnboundedSender<String>,
}

impl ManagedServer {
	pub fn new(
		spec: ProxiedServerSpec,
		settings: SupervisorSettings,
		refresh_tx: mpsc::UnboundedSender<String>,
	) -> Arc<Self> {
		let (state, _) = watch::channel(LifecycleState::NotStarted);
		let (shutdown, _) = watch::channel(false);
		let (settled, _) = watch::channel(false);
		Arc::new(Self {
			spec,
			settings,
			state,
			client: RwLock::new(None),
			spawn_lock: tokio::sync::Mutex::new(()),
			request_ids: Arc::new(AtomicU64::new(1)),
			tools: RwLock::new(Vec::new()),
			consecutive_failures: AtomicU32::new(0),
			restarts: AtomicU32::new(0),
			last_health_check: parking_lot::Mutex::new(None),
			last_restart: parking_lot::Mutex::new(None),
			activated: AtomicBool::new(false),
			settled,
			start_signal: Notify::new(),
			tools_changed: Arc::new(Notify::new()),
			shutdown,
			refresh_tx,
		})
	}

	pub fn id(&self) -> &str {
		&self.spec.id
	}

	pub fn namespace(&self) -> &str {
		&self.spec.namespace
	}

	pub fn state(&self) -> LifecycleState {
		*self.state.borrow()
	}

	/// Last known tool list; survives crashes and termination.
	pub fn tools(&self) -> Vec<McpTool> {
		self.tools.read().clone()
	}

	pub fn restart_count(&self) -> u32 {
		self.restarts.load(Ordering::SeqCst)
	}

	pub fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures.load(Ordering::SeqCst)
	}

	pub fn last_health_check(&self) -> Option<Instant> {
		*self.last_health_check.lock()
	}

	pub fn last_restart(&self) -> Option<DateTime<Utc>> {
		*self.last_restart.lock()
	}

	pub fn stderr_tail(&self) -> Vec<String> {
		self.client
			.read()
			.as_ref()
			.map(|c| c.stderr_tail())
			.unwrap_or_default()
	}

	pub fn next_request_id(&self) -> u64 {
		self.request_ids.fetch_add(1, Ordering::SeqCst)
	}

	/// Spawn the supervisor task. With `eager` the process starts right away,
	/// otherwise its tools are discovered now and the process starts on
	/// first use.
	pub fn activate(self: &Arc<Self>, eager: bool) {
		if !self.activated.swap(true, Ordering::SeqCst) {
			tokio::spawn(self.clone().run(eager));
		}
	}

	pub fn request_start(&self) {
		if self.state() == LifecycleState::NotStarted {
			// notify_one stores a permit if the task is not waiting yet
			self.start_signal.notify_one();
		}
	}

	/// Wait until the server is Ready, starting it if needed.
	pub async fn await_ready(&self, limit: Duration) -> Result<(), GatewayError> {
		match self.state() {
			LifecycleState::Ready => return Ok(()),
			LifecycleState::Terminated => {
				return Err(GatewayError::unavailable(self.id(), "server terminated"))
			}
			_ => {}
		}
		self.request_start();

		let mut rx = self.state.subscribe();
		let reached = timeout(
			limit,
			rx.wait_for(|s| matches!(s, LifecycleState::Ready | LifecycleState::Terminated)),
		)
		.await
		.map(|r| r.map(|state| *state));

		match reached {
			Ok(Ok(LifecycleState::Ready)) => Ok(()),
			Ok(Ok(_)) => Err(GatewayError::unavailable(self.id(), "server terminated")),
			Ok(Err(_)) => Err(GatewayError::unavailable(self.id(), "supervisor stopped")),
			Err(_) => Err(GatewayError::unavailable(
				self.id(),
				format!("not ready within {}ms", limit.as_millis()),
			)),
		}
	}

	/// Wait until the first start or discovery attempt finished, whatever its
	/// outcome. Returns false when `limit` passed first.
	pub async fn await_settled(&self, limit: Duration) -> bool {
		let mut rx = self.settled.subscribe();
		let settled = matches!(timeout(limit, rx.wait_for(|s| *s)).await, Ok(Ok(_)));
		settled
	}

	/// Forward a `tools/call` to the running process.
	pub async fn call_tool(
		&self,
		request_id: u64,
		origin_name: &str,
		arguments: Value,
	) -> Result<Value, GatewayError> {
		let client = self
			.client
			.read()
			.clone()
			.ok_or_else(|| GatewayError::unavailable(self.id(), "no running process"))?;
		client
			.request_with_id(
				request_id,
				"tools/call",
				json!({ "name": origin_name, "arguments": arguments }),
				self.settings.request_timeout,
			)
			.await
	}

	/// Stop the process for good and wait for the supervisor to settle.
	pub async fn shutdown(&self) {
		self.shutdown.send_replace(true);
		self.settled.send_replace(true);
		self.stop_client().await;

		if self.activated.load(Ordering::SeqCst) {
			let mut rx = self.state.subscribe();
			let settle = self.settings.termination_timeout + Duration::from_secs(1);
			let _ = timeout(settle, rx.wait_for(|s| *s == LifecycleState::Terminated)).await;
		} else {
			self.transition(LifecycleState::Terminated, Some("shutdown"));
		}
	}

	fn transition(&self, to: LifecycleState, reason: Option<&str>) {
		let from = self.state.send_replace(to);
		if from != to {
			log_backend_transition(self.id(), from.as_str(), to.as_str(), reason);
		}
	}

	async fn stop_client(&self) {
		let client = self.client.write().take();
		if let Some(client) = client {
			client.shutdown(self.settings.termination_timeout).await;
		}
	}

	fn request_catalog_refresh(&self) {
		if self.refresh_tx.send(self.spec.id.clone()).is_err() {
			debug!(backend = %self.spec.id, "Catalog refresh channel closed");
		}
	}

	async fn run(self: Arc<Self>, eager: bool) {
		let mut shutdown = self.shutdown.subscribe();

		if !eager {
			tokio::select! {
				_ = self.discover() => {}
				_ = shutdown_requested(&mut shutdown) => {
					self.transition(LifecycleState::Terminated, Some("shutdown"));
					return;
				}
			}
			self.settled.send_replace(true);

			// Calls that arrived during discovery left a permit behind
			tokio::select! {
				_ = self.start_signal.notified() => {}
				_ = shutdown_requested(&mut shutdown) => {
					self.transition(LifecycleState::Terminated, Some("shutdown"));
					return;
				}
			}
		}

		loop {
			let failure = tokio::select! {
				started = self.start_once() => match started {
					Ok(client) => {
						self.transition(LifecycleState::Ready, None);
						self.request_catalog_refresh();
						self.settled.send_replace(true);
						match self.monitor(&client, &mut shutdown).await {
							MonitorExit::Shutdown => break,
							MonitorExit::Failed(reason) => reason,
						}
					}
					Err(e) => {
						warn!(backend = %self.spec.id, error = %e, "Handshake failed");
						self.settled.send_replace(true);
						e.to_string()
					}
				},
				_ = shutdown_requested(&mut shutdown) => break,
			};

			self.transition(LifecycleState::Degraded, Some(&failure));
			self.stop_client().await;

			let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
			if failures >= self.settings.max_failures {
				warn!(
					backend = %self.spec.id,
					failures,
					"Giving up on proxied server after consecutive failures"
				);
				self.transition(LifecycleState::Terminated, Some("restart limit reached"));
				return;
			}

			let delay = self.settings.backoff_for(failures);
			debug!(
				backend = %self.spec.id,
				attempt = failures,
				delay_ms = delay.as_millis() as u64,
				"Restarting proxied server after backoff"
			);
			tokio::select! {
				_ = sleep(delay) => {}
				_ = shutdown_requested(&mut shutdown) => break,
			}

			self.restarts.fetch_add(1, Ordering::SeqCst);
			*self.last_restart.lock() = Some(Utc::now());
		}

		self.stop_client().await;
		self.transition(LifecycleState::Terminated, Some("shutdown"));
	}

	/// One-off handshake that records the tool list without keeping the
	/// process. Failures leave the tool list empty until the real start.
	async fn discover(&self) {
		let _guard = self.spawn_lock.lock().await;

		let client = match StdioClient::spawn(
			&self.spec,
			self.request_ids.clone(),
			self.tools_changed.clone(),
		) {
			Ok(client) => client,
			Err(e) => {
				warn!(backend = %self.spec.id, error = %e, "Tool discovery could not spawn server");
				return;
			}
		};

		match timeout(self.settings.handshake_timeout, self.handshake(&client)).await {
			Ok(Ok(tools)) => {
				info!(
					backend = %self.spec.id,
					tool_count = tools.len(),
					"Discovered tools of lazily started server"
				);
				*self.tools.write() = tools;
				self.request_catalog_refresh();
			}
			Ok(Err(e)) => {
				warn!(backend = %self.spec.id, error = %e, "Tool discovery handshake failed");
			}
			Err(_) => {
				warn!(
					backend = %self.spec.id,
					timeout_ms = self.settings.handshake_timeout.as_millis() as u64,
					"Tool discovery timed out"
				);
			}
		}
		client.shutdown(self.settings.termination_timeout).await;
	}

	/// Spawn, handshake and list tools. The client is installed before the
	/// caller flips the state to Ready.
	async fn start_once(&self) -> Result<Arc<StdioClient>, GatewayError> {
		let _guard = self.spawn_lock.lock().await;
		self.transition(LifecycleState::Starting, None);

		let client = Arc::new(StdioClient::spawn(
			&self.spec,
			self.request_ids.clone(),
			self.tools_changed.clone(),
		)?);

		let handshake = timeout(self.settings.handshake_timeout, self.handshake(&client)).await;
		let tools = match handshake {
			Ok(Ok(tools)) => tools,
			Ok(Err(e)) => {
				client.shutdown(self.settings.termination_timeout).await;
				return Err(GatewayError::HandshakeFailure {
					backend: self.spec.id.clone(),
					reason: e.to_string(),
				});
			}
			Err(_) => {
				client.shutdown(self.settings.termination_timeout).await;
				return Err(GatewayError::HandshakeFailure {
					backend: self.spec.id.clone(),
					reason: format!(
						"no handshake within {}ms",
						self.settings.handshake_timeout.as_millis()
					),
				});
			}
		};

		info!(
			backend = %self.spec.id,
			tool_count = tools.len(),
			pid = ?client.pid(),
			"Proxied server ready"
		);
		*self.tools.write() = tools;
		*self.client.write() = Some(client.clone());
		Ok(client)
	}

	async fn handshake(&self, client: &StdioClient) -> Result<Vec<McpTool>, GatewayError> {
		let params = json!({
			"protocolVersion": CLIENT_PROTOCOL_VERSION,
			"capabilities": {},
			"clientInfo": {
				"name": SERVER_NAME,
				"version": env!("CARGO_PKG_VERSION"),
			}
		});
		let result = client
			.request("initialize", params, self.settings.handshake_timeout)
			.await?;
		debug!(
			backend = %self.spec.id,
			server_info = ?result.get("serverInfo"),
			protocol_version = ?result.get("protocolVersion"),
			"Proxied server initialized"
		);

		client.notify("notifications/initialized", None).await?;
		self.list_tools(client).await
	}

	/// Fetch the full tool list, following `nextCursor`.
	async fn list_tools(&self, client: &StdioClient) -> Result<Vec<McpTool>, GatewayError> {
		let mut tools = Vec::new();
		let mut cursor: Option<String> = None;

		for _ in 0..MAX_TOOL_PAGES {
			let params = match &cursor {
				Some(cursor) => json!({ "cursor": cursor }),
				None => json!({}),
			};
			let page = client
				.request("tools/list", params, self.settings.handshake_timeout)
				.await?;

			if let Some(entries) = page.get("tools").and_then(Value::as_array) {
				for entry in entries {
					match serde_json::from_value::<McpTool>(entry.clone()) {
						Ok(tool) => tools.push(tool),
						Err(e) => warn!(
							backend = %self.spec.id,
							error = %e,
							"Ignoring malformed tool descriptor"
						),
					}
				}
			}

			cursor = page
				.get("nextCursor")
				.and_then(Value::as_str)
				.map(str::to_string);
			if cursor.is_none() {
				return Ok(tools);
			}
		}

		warn!(backend = %self.spec.id, pages = MAX_TOOL_PAGES, "Tool list pagination truncated");
		Ok(tools)
	}

	async fn monitor(
		&self,
		client: &Arc<StdioClient>,
		shutdown: &mut watch::Receiver<bool>,
	) -> MonitorExit {
		loop {
			tokio::select! {
				_ = shutdown_requested(shutdown) => return MonitorExit::Shutdown,
				_ = client.closed() => {
					let reason = client
						.close_reason()
						.unwrap_or_else(|| "process exited".to_string());
					let tail = client.stderr_tail();
					warn!(
						backend = %self.spec.id,
						reason = %reason,
						stderr_tail = ?&tail[tail.len().saturating_sub(5)..],
						"Proxied server connection lost"
					);
					return MonitorExit::Failed(reason);
				}
				_ = self.tools_changed.notified() => {
					match self.list_tools(client).await {
						Ok(tools) => {
							*self.tools.write() = tools;
							self.request_catalog_refresh();
						}
						Err(e) => return MonitorExit::Failed(format!("tool refresh failed: {}", e)),
					}
				}
				_ = sleep(self.settings.health_interval) => {
					if let Err(reason) = self.probe(client).await {
						return MonitorExit::Failed(reason);
					}
				}
			}
		}
	}

	/// `ping` the process. Any reply, even a JSON-RPC error, proves it alive.
	async fn probe(&self, client: &StdioClient) -> Result<(), String> {
		match client
			.request("ping", json!({}), self.settings.health_probe_timeout)
			.await
		{
			Ok(_) | Err(GatewayError::BackendError(_)) => {
				*self.last_health_check.lock() = Some(Instant::now());
				let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
				if previous > 0 {
					debug!(backend = %self.spec.id, previous, "Health probe reset failure count");
				}
				Ok(())
			}
			Err(e) => {
				warn!(backend = %self.spec.id, error = %e, "Health probe failed");
				Err(format!("health probe failed: {}", e))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn settings() -> SupervisorSettings {
		SupervisorSettings {
			backoff_base: Duration::from_millis(100),
			backoff_max: Duration::from_millis(1000),
			..SupervisorSettings::default()
		}
	}

	#[test]
	fn test_backoff_doubles_and_caps() {
		let s = settings();
		assert_eq!(s.backoff_for(1), Duration::from_millis(100));
		assert_eq!(s.backoff_for(2), Duration::from_millis(200));
		assert_eq!(s.backoff_for(3), Duration::from_millis(400));
		assert_eq!(s.backoff_for(5), Duration::from_millis(1000));
		assert_eq!(s.backoff_for(u32::MAX), Duration::from_millis(1000));
	}

	#[test]
	fn test_max_failures_never_zero() {
		let mut config = Config::default();
		config.restart.max_failures = 0;
		assert_eq!(SupervisorSettings::from(&config).max_failures, 1);
	}

	fn missing_binary_spec() -> ProxiedServerSpec {
		ProxiedServerSpec {
			id: "ghost".to_string(),
			namespace: "ghost".to_string(),
			command: "/nonexistent/mcp-gateway-test-binary".to_string(),
			args: Vec::new(),
			env: Default::default(),
			working_directory: None,
			required: false,
			supported_transports: vec![crate::config::TransportMode::Stdio],
			instructions: None,
		}
	}

	#[tokio::test]
	async fn test_lazy_server_stays_not_started() {
		let (tx, _rx) = mpsc::unbounded_channel();
		let server = ManagedServer::new(missing_binary_spec(), settings(), tx);
		server.activate(false);
		assert!(server.await_settled(Duration::from_secs(5)).await);
		assert_eq!(server.state(), LifecycleState::NotStarted);
		assert!(server.tools().is_empty());
		assert_eq!(server.restart_count(), 0);
		server.shutdown().await;
		assert_eq!(server.state(), LifecycleState::Terminated);
	}

	#[tokio::test]
	async fn test_lazy_server_starts_on_first_wait() {
		let (tx, _rx) = mpsc::unbounded_channel();
		let s = SupervisorSettings {
			backoff_base: Duration::from_millis(5),
			backoff_max: Duration::from_millis(20),
			max_failures: 2,
			..SupervisorSettings::default()
		};
		let server = ManagedServer::new(missing_binary_spec(), s, tx);
		server.activate(false);
		assert!(server.await_settled(Duration::from_secs(5)).await);

		// The first call drives the real start; this binary never comes up
		let err = server
			.await_ready(Duration::from_secs(5))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("terminated"));
		assert_eq!(server.state(), LifecycleState::Terminated);
		assert_eq!(server.restart_count(), 1);
	}

	#[tokio::test]
	async fn test_unspawnable_server_terminates_after_max_failures() {
		let (tx, _rx) = mpsc::unbounded_channel();
		let s = SupervisorSettings {
			backoff_base: Duration::from_millis(5),
			backoff_max: Duration::from_millis(20),
			max_failures: 3,
			..SupervisorSettings::default()
		};
		let server = ManagedServer::new(missing_binary_spec(), s, tx);
		server.activate(true);

		let err = server
			.await_ready(Duration::from_secs(5))
			.await
			.unwrap_err();
		assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
		assert_eq!(server.state(), LifecycleState::Terminated);
		assert_eq!(server.restart_count(), 2);

		// Terminal: no further attempts
		let err = server
			.await_ready(Duration::from_millis(10))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("terminated"));
	}
}
