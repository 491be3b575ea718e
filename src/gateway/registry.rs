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

//! Registered backends and tool ownership lookup

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

use super::catalog::{BackendTools, Catalog, CatalogHandle, ToolDescriptor};
use super::error::GatewayError;
use super::supervisor::{LifecycleState, ManagedServer};
use crate::analysis::LocalBackend;
use crate::mcp::types::McpTool;

/// A tool-serving backend. Both variants share one dispatch surface.
#[derive(Clone)]
pub enum Backend {
	Local(Arc<LocalBackend>),
	Proxied(Arc<ManagedServer>),
}

impl Backend {
	pub fn id(&self) -> &str {
		match self {
			Backend::Local(local) => local.id(),
			Backend::Proxied(server) => server.id(),
		}
	}

	pub fn namespace(&self) -> &str {
		match self {
			Backend::Local(local) => local.namespace(),
			Backend::Proxied(server) => server.namespace(),
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Backend::Local(_) => "local",
			Backend::Proxied(_) => "proxied",
		}
	}

	/// Last known tools, in the order the backend reported them
	pub fn tools(&self) -> Vec<McpTool> {
		match self {
			Backend::Local(local) => local.tools(),
			Backend::Proxied(server) => server.tools(),
		}
	}

	/// Local backends are always ready
	pub fn state(&self) -> LifecycleState {
		match self {
			Backend::Local(_) => LifecycleState::Ready,
			Backend::Proxied(server) => server.state(),
		}
	}

	pub fn next_request_id(&self) -> u64 {
		match self {
			Backend::Local(local) => local.next_request_id(),
			Backend::Proxied(server) => server.next_request_id(),
		}
	}

	pub async fn ensure_ready(&self, limit: Duration) -> Result<(), GatewayError> {
		match self {
			Backend::Local(_) => Ok(()),
			Backend::Proxied(server) => server.await_ready(limit).await,
		}
	}

	pub async fn call_tool(
		&self,
		request_id: u64,
		origin_name: &str,
		arguments: Value,
	) -> Result<Value, GatewayError> {
		match self {
			Backend::Local(local) => local.call_tool(request_id, origin_name, arguments).await,
			Backend::Proxied(server) => server.call_tool(request_id, origin_name, arguments).await,
		}
	}
}

pub struct BackendRegistry {
	backends: RwLock<Vec<Backend>>,
	catalog: Arc<CatalogHandle>,
	eager_start: bool,
}

impl BackendRegistry {
	pub fn new(catalog: Arc<CatalogHandle>, eager_start: bool) -> Self {
		Self {
			backends: RwLock::new(Vec::new()),
			catalog,
			eager_start,
		}
	}

	/// Add a backend. Proxied backends get their supervisor task started
	/// here; readiness is not awaited.
	pub fn register(&self, backend: Backend) {
		if let Backend::Proxied(server) = &backend {
			server.activate(self.eager_start);
		}
		info!(
			backend = %backend.id(),
			kind = backend.kind(),
			namespace = %backend.namespace(),
			"Registered backend"
		);
		self.backends.write().push(backend);
	}

	/// Registration order: local first, then proxied in manifest order
	pub fn list(&self) -> Vec<Backend> {
		self.backends.read().clone()
	}

	pub fn get(&self, backend_id: &str) -> Option<Backend> {
		self.backends
			.read()
			.iter()
			.find(|b| b.id() == backend_id)
			.cloned()
	}

	pub fn proxied(&self) -> Vec<Arc<ManagedServer>> {
		self.backends
			.read()
			.iter()
			.filter_map(|b| match b {
				Backend::Proxied(server) => Some(server.clone()),
				Backend::Local(_) => None,
			})
			.collect()
	}

	/// Owner of a merged tool name in the current snapshot
	pub fn resolve(&self, tool_name: &str) -> Result<(Backend, ToolDescriptor), GatewayError> {
		let snapshot = self.catalog.snapshot();
		let descriptor = snapshot
			.get(tool_name)
			.cloned()
			.ok_or_else(|| GatewayError::UnknownTool(tool_name.to_string()))?;
		let backend = self
			.get(&descriptor.backend_id)
			.ok_or_else(|| GatewayError::UnknownTool(tool_name.to_string()))?;
		Ok((backend, descriptor))
	}

	pub fn sources(&self) -> Vec<BackendTools> {
		self.backends
			.read()
			.iter()
			.map(|b| BackendTools {
				backend_id: b.id().to_string(),
				namespace: b.namespace().to_string(),
				tools: b.tools(),
			})
			.collect()
	}

	/// Merge the last known tools of every backend and publish the result
	pub fn rebuild_catalog(&self) -> Arc<Catalog> {
		let sources = self.sources();
		self.catalog.publish(&sources)
	}

	pub fn len(&self) -> usize {
		self.backends.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.backends.read().is_empty()
	}
}
