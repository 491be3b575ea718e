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

//! Request routing and process orchestration core.
//!
//! [`Gateway`] is transport agnostic: the stdio and HTTP adapters hand it
//! decoded JSON-RPC messages together with the session they belong to and
//! write back whatever [`Reply`] it produces.

pub mod catalog;
pub mod client;
pub mod error;
pub mod inflight;
pub mod manifest;
pub mod ordering;
pub mod pending;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;


pub use catalog::{Catalog, ToolDescriptor};
pub use error::{GatewayError, ManifestError};
pub use manifest::{Manifest, ProxiedServerSpec};
pub use registry::Backend;
pub use session::SessionOptions;
pub use supervisor::LifecycleState;

use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::analysis::{AnalysisEngine, LocalBackend};
use crate::config::Config;
use crate::mcp::logging::{log_mcp_request, log_mcp_response};
use crate::mcp::types::{
	IncomingNotification, IncomingRequest, JsonRpcError, JsonRpcResponse, McpTool,
	METHOD_NOT_FOUND,
};
use catalog::CatalogHandle;
use inflight::InFlightTable;
use manifest::{compose_instructions, LOCAL_BACKEND_ID};
use ordering::{DeliveryGate, DeliveryTurn};
use registry::BackendRegistry;
use router::{Admission, Router};
use session::{ClientSession, SessionManager};
use supervisor::{ManagedServer, SupervisorSettings};

const INSTRUCTIONS: &str = "This server exposes code analysis tools from an embedded analysis engine and from external MCP servers it manages. Call tools/list for the merged catalog. When two servers offer a tool with the same name, the later one is published as '<namespace>/<name>'.";

/// Response for one client request, plus the delivery turn the transport
/// must hold until the response is queued.
pub struct Reply {
	/// `None` when nothing may be sent (the session closed meanwhile)
	pub response: Option<JsonRpcResponse>,
	pub turn: DeliveryTurn,
	/// Session the request belongs to; set by `initialize`
	pub session_id: Option<String>,
}

enum Work {
	Done(Result<Value, JsonRpcError>),
	Call(Box<Admission>, Value),
}

/// A request that passed the synchronous part of handling.
///
/// Preparing in arrival order is what gives same-backend calls of a session
/// their delivery order; `run` may then happen on any task.
pub struct PreparedRequest {
	gateway: Gateway,
	id: Value,
	method: String,
	session_id: Option<String>,
	started: Instant,
	work: Work,
}

impl PreparedRequest {
	pub fn session_id(&self) -> Option<&str> {
		self.session_id.as_deref()
	}

	pub async fn run(self) -> Reply {
		let PreparedRequest {
			gateway,
			id,
			method,
			session_id,
			started,
			work,
		} = self;

		let (outcome, turn) = match work {
			Work::Done(result) => (Some(result), DeliveryTurn::unordered()),
			Work::Call(admission, arguments) => {
				let dispatched = gateway.inner.router.execute(*admission, arguments).await;
				let outcome = match dispatched.outcome {
					Err(GatewayError::SessionClosed(_)) => None,
					Err(e) => Some(Err(e.to_rpc_error())),
					Ok(value) => Some(Ok(value)),
				};
				(outcome, dispatched.turn)
			}
		};

		let duration_ms = Some(started.elapsed().as_millis() as u64);
		let response = match outcome {
			Some(Ok(result)) => {
				log_mcp_response(&method, true, Some(&id), duration_ms);
				Some(JsonRpcResponse::success(Some(id), result))
			}
			Some(Err(error)) => {
				debug!(method = %method, code = error.code, message = %error.message, "Request failed");
				log_mcp_response(&method, false, Some(&id), duration_ms);
				Some(JsonRpcResponse::failure(Some(id), error))
			}
			None => None,
		};

		Reply {
			response,
			turn,
			session_id,
		}
	}
}

#[derive(Debug, Clone)]
pub struct BackendStatus {
	pub id: String,
	pub kind: &'static str,
	pub state: LifecycleState,
	pub restarts: u32,
	pub consecutive_failures: u32,
	pub last_restart: Option<chrono::DateTime<chrono::Utc>>,
	pub last_health_check: Option<Instant>,
	pub tool_count: usize,
	/// Recent stderr of the running process, oldest first
	pub stderr_tail: Vec<String>,
}

struct GatewayInner {
	server_name: String,
	instructions: String,
	read_only: bool,
	catalog: Arc<CatalogHandle>,
	registry: Arc<BackendRegistry>,
	sessions: Arc<SessionManager>,
	inflight: Arc<InFlightTable>,
	router: Router,
	background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Gateway {
	inner: Arc<GatewayInner>,
}

impl Gateway {
	/// Start with the bundled engine (if any) as the `local` backend.
	pub async fn start(
		config: &Config,
		manifest: Manifest,
		engine: Option<Arc<dyn AnalysisEngine>>,
	) -> Result<Self, GatewayError> {
		let engines = engine
			.map(|e| vec![(LOCAL_BACKEND_ID.to_string(), e)])
			.unwrap_or_default();
		Self::start_with_engines(config, manifest, engines).await
	}

	/// Register local engines first, then the manifest's servers that speak
	/// the configured transport. The first catalog is published once every
	/// proxied server made its first attempt, then required servers are
	/// awaited.
	pub async fn start_with_engines(
		config: &Config,
		manifest: Manifest,
		engines: Vec<(String, Arc<dyn AnalysisEngine>)>,
	) -> Result<Self, GatewayError> {
		let Manifest { servers, rejected } = manifest;
		for rejection in rejected {
			if rejection.is_required() {
				error!(error = %rejection, "Required manifest entry rejected");
				return Err(GatewayError::Manifest(rejection));
			}
			warn!(error = %rejection, "Manifest entry skipped");
		}

		let transport = config.server.transport;
		let (servers, unsupported): (Vec<_>, Vec<_>) =
			servers.into_iter().partition(|spec| spec.supports(transport));
		for spec in &unsupported {
			warn!(
				backend = %spec.id,
				transport = %transport,
				required = spec.required,
				"Proxied server does not support this transport, not loaded"
			);
		}
		let instructions = compose_instructions(INSTRUCTIONS, &servers);

		let catalog = Arc::new(CatalogHandle::new());
		let inflight = Arc::new(InFlightTable::new());
		let ordering = Arc::new(DeliveryGate::new());
		let sessions = Arc::new(SessionManager::new(inflight.clone(), ordering.clone()));
		let registry = Arc::new(BackendRegistry::new(
			catalog.clone(),
			config.proxy.eager_start,
		));

		for (id, engine) in engines {
			let local = LocalBackend::start(&id, engine, config.timeouts.request());
			registry.register(Backend::Local(local));
		}

		let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel::<String>();
		let settings = SupervisorSettings::from(config);
		let mut required = Vec::new();
		for spec in servers {
			let is_required = spec.required;
			let server = ManagedServer::new(spec, settings.clone(), refresh_tx.clone());
			if is_required {
				required.push(server.clone());
			}
			registry.register(Backend::Proxied(server));
		}
		drop(refresh_tx);

		// Names go to the first claimant in registration order, not to
		// whichever server answered first
		let readiness = config.timeouts.readiness();
		let proxied = registry.proxied();
		let settled = join_all(proxied.iter().map(|s| s.await_settled(readiness))).await;
		for (server, done) in proxied.iter().zip(settled) {
			if !done {
				warn!(backend = %server.id(), "Proxied server still starting, its tools join later");
			}
		}
		registry.rebuild_catalog();

		// Single publisher after startup, so versions follow rebuild order
		let rebuild_registry = registry.clone();
		let rebuild_task = tokio::spawn(async move {
			while let Some(backend_id) = refresh_rx.recv().await {
				let mut batch = vec![backend_id];
				while let Ok(more) = refresh_rx.try_recv() {
					batch.push(more);
				}
				debug!(backends = ?batch, "Rebuilding tool catalog");
				rebuild_registry.rebuild_catalog();
			}
		});
		let mut background = vec![rebuild_task];
		if let Some(max_idle) = config.timeouts.session_idle() {
			background.push(spawn_idle_sweep(sessions.clone(), max_idle));
		}

		let router = Router::new(
			registry.clone(),
			inflight.clone(),
			ordering,
			sessions.clone(),
			readiness,
		);

		let gateway = Gateway {
			inner: Arc::new(GatewayInner {
				server_name: config.server.name.clone(),
				instructions,
				read_only: config.server.read_only,
				catalog,
				registry,
				sessions,
				inflight,
				router,
				background: parking_lot::Mutex::new(background),
			}),
		};

		if !required.is_empty() {
			let results = join_all(required.iter().map(|s| s.await_ready(readiness))).await;
			for (server, result) in required.iter().zip(results) {
				if let Err(e) = result {
					error!(backend = %server.id(), error = %e, "Required proxied server failed to start");
					gateway.shutdown().await;
					return Err(GatewayError::unavailable(
						server.id(),
						format!("required server did not become ready: {}", e),
					));
				}
			}
			// Required servers' tools are in before the first client arrives
			gateway.inner.registry.rebuild_catalog();
		}

		info!(
			backends = gateway.inner.registry.len(),
			tools = gateway.catalog().len(),
			read_only = config.server.read_only,
			"Gateway started"
		);
		Ok(gateway)
	}

	/// Synchronous part of request handling; call in arrival order.
	pub fn prepare(&self, session_id: Option<&str>, request: IncomingRequest) -> PreparedRequest {
		self.prepare_with(session_id, request, SessionOptions::default())
	}

	/// Like [`Gateway::prepare`], with transport options. They shape the
	/// session `initialize` opens; `read_only` also applies to this request.
	pub fn prepare_with(
		&self,
		session_id: Option<&str>,
		request: IncomingRequest,
		options: SessionOptions,
	) -> PreparedRequest {
		log_mcp_request(&request.method, request.params.as_ref(), Some(&request.id));

		let session = session_id.and_then(|id| self.inner.sessions.get(id));
		if let Some(session) = &session {
			session.touch();
		}
		let read_only = options.read_only
			|| session.as_ref().is_some_and(|s| s.options.read_only);

		let mut session_out = session_id.map(str::to_string);
		let work = match request.method.as_str() {
			"initialize" => {
				let params = request.params.unwrap_or_else(|| json!({}));
				let options = SessionOptions {
					read_only: options.read_only || self.inner.read_only,
					..options
				};
				let session = self.inner.sessions.open(&params, options);
				session_out = Some(session.id.clone());
				Work::Done(Ok(self.initialize_result(&session)))
			}
			"ping" => Work::Done(Ok(json!({}))),
			"tools/list" => Work::Done(
				self.require_session(session_id)
					.map(|_| json!({ "tools": self.visible_tools(read_only) }))
					.map_err(|e| e.to_rpc_error()),
			),
			"tools/call" => match self.admit_call(session_id, &request.id, request.params, read_only) {
				Ok((admission, arguments)) => Work::Call(Box::new(admission), arguments),
				Err(e) => Work::Done(Err(e.to_rpc_error())),
			},
			other => Work::Done(Err(JsonRpcError::new(
				METHOD_NOT_FOUND,
				format!("Method not found: {}", other),
			))),
		};

		PreparedRequest {
			gateway: self.clone(),
			id: request.id,
			method: request.method,
			session_id: session_out,
			started: Instant::now(),
			work,
		}
	}

	pub async fn handle_request(&self, session_id: Option<&str>, request: IncomingRequest) -> Reply {
		self.prepare(session_id, request).run().await
	}

	/// Catalog as a client sees it; read-only clients only get tools
	/// annotated `readOnlyHint: true`
	fn visible_tools(&self, read_only: bool) -> Vec<McpTool> {
		self.catalog()
			.tools()
			.iter()
			.filter(|tool| !read_only || tool.is_read_only())
			.map(ToolDescriptor::to_mcp_tool)
			.collect()
	}

	pub fn handle_notification(&self, session_id: Option<&str>, notification: &IncomingNotification) {
		if let Some(session) = session_id.and_then(|id| self.inner.sessions.get(id)) {
			session.touch();
		}
		match notification.method.as_str() {
			"notifications/initialized" => {
				if let Some(session) = session_id.and_then(|id| self.inner.sessions.get(id)) {
					session.mark_initialized();
					debug!(session_id = %session.id, "Client finished initialization");
				}
			}
			"notifications/cancelled" => {
				// Backend calls run to completion; the client ignores the reply
				info!(
					session_id = ?session_id,
					params = ?notification.params,
					"Cancellation received, request continues"
				);
			}
			other => {
				debug!(session_id = ?session_id, method = %other, "Ignoring notification");
			}
		}
	}

	fn require_session(&self, session_id: Option<&str>) -> Result<Arc<ClientSession>, GatewayError> {
		session_id
			.and_then(|id| self.inner.sessions.get(id))
			.ok_or(GatewayError::NotInitialized)
	}

	fn admit_call(
		&self,
		session_id: Option<&str>,
		request_id: &Value,
		params: Option<Value>,
		read_only: bool,
	) -> Result<(Admission, Value), GatewayError> {
		let session = self.require_session(session_id)?;

		let mut params = match params {
			Some(Value::Object(map)) => map,
			_ => {
				return Err(GatewayError::InvalidParams(
					"params must be an object with a 'name' field".to_string(),
				))
			}
		};
		let name = match params.remove("name") {
			Some(Value::String(name)) => name,
			_ => {
				return Err(GatewayError::InvalidParams(
					"'name' must be a string".to_string(),
				))
			}
		};
		let arguments = match params.remove("arguments") {
			None | Some(Value::Null) => json!({}),
			Some(Value::Object(map)) => Value::Object(map),
			Some(_) => {
				return Err(GatewayError::InvalidParams(
					"'arguments' must be an object".to_string(),
				))
			}
		};

		let admission = self
			.inner
			.router
			.admit(&session.id, request_id, &name, read_only)?;
		Ok((admission, arguments))
	}

	fn initialize_result(&self, session: &ClientSession) -> Value {
		json!({
			"protocolVersion": session.protocol_version,
			"capabilities": {
				"tools": { "listChanged": true }
			},
			"serverInfo": {
				"name": self.inner.server_name,
				"version": env!("CARGO_PKG_VERSION")
			},
			"instructions": self.inner.instructions
		})
	}

	pub fn close_session(&self, session_id: &str) -> bool {
		self.inner.sessions.close(session_id)
	}

	pub fn has_session(&self, session_id: &str) -> bool {
		self.inner.sessions.contains(session_id)
	}

	pub fn session_count(&self) -> usize {
		self.inner.sessions.count()
	}

	pub fn catalog(&self) -> Arc<Catalog> {
		self.inner.catalog.snapshot()
	}

	/// Fires with the catalog version whenever its content changes
	pub fn subscribe_catalog(&self) -> watch::Receiver<u64> {
		self.inner.catalog.subscribe()
	}

	pub fn backends(&self) -> Vec<Backend> {
		self.inner.registry.list()
	}

	pub fn backend(&self, backend_id: &str) -> Option<Backend> {
		self.inner.registry.get(backend_id)
	}

	pub fn in_flight(&self) -> usize {
		self.inner.inflight.len()
	}

	pub fn backend_status(&self) -> Vec<BackendStatus> {
		self.inner
			.registry
			.list()
			.iter()
			.map(|backend| {
				let mut status = BackendStatus {
					id: backend.id().to_string(),
					kind: backend.kind(),
					state: backend.state(),
					restarts: 0,
					consecutive_failures: 0,
					last_restart: None,
					last_health_check: None,
					tool_count: backend.tools().len(),
					stderr_tail: Vec::new(),
				};
				if let Backend::Proxied(server) = backend {
					status.restarts = server.restart_count();
					status.consecutive_failures = server.consecutive_failures();
					status.last_restart = server.last_restart();
					status.last_health_check = server.last_health_check();
					status.stderr_tail = server.stderr_tail();
				}
				status
			})
			.collect()
	}

	/// Terminate every proxied server and stop background tasks.
	pub async fn shutdown(&self) {
		info!("Shutting down gateway");
		for status in self.backend_status() {
			if status.restarts > 0 || status.consecutive_failures > 0 {
				info!(
					backend = %status.id,
					state = %status.state,
					restarts = status.restarts,
					consecutive_failures = status.consecutive_failures,
					last_restart = ?status.last_restart,
					"Backend history at shutdown"
				);
			}
		}
		let servers = self.inner.registry.proxied();
		join_all(servers.iter().map(|s| s.shutdown())).await;

		for task in self.inner.background.lock().drain(..) {
			task.abort();
		}
		for id in self.inner.sessions.ids() {
			self.inner.sessions.close(&id);
		}
		debug!(
			remaining_in_flight = self.inner.inflight.len(),
			"Gateway shutdown complete"
		);
	}
}

/// Periodically close sessions idle for `max_idle`.
fn spawn_idle_sweep(sessions: Arc<SessionManager>, max_idle: Duration) -> JoinHandle<()> {
	let period = (max_idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(60));
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			let expired = sessions.expire_idle(max_idle);
			if !expired.is_empty() {
				debug!(count = expired.len(), remaining = sessions.count(), "Idle sweep closed sessions");
			}
		}
	})
}

/// Wait at most `limit` for `predicate` to hold on the catalog.
pub async fn wait_for_catalog<F>(gateway: &Gateway, limit: Duration, predicate: F) -> bool
where
	F: Fn(&Catalog) -> bool,
{
	let mut changes = gateway.subscribe_catalog();
	let deadline = Instant::now() + limit;
	loop {
		if predicate(gateway.catalog().as_ref()) {
			return true;
		}
		match tokio::time::timeout_at(deadline, changes.changed()).await {
			Ok(Ok(())) => continue,
			_ => return predicate(gateway.catalog().as_ref()),
		}
	}
}
