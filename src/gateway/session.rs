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

//! Client sessions

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::inflight::InFlightTable;
use super::ordering::DeliveryGate;
use crate::constants::SUPPORTED_PROTOCOL_VERSIONS;

/// Transport-chosen properties of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
	/// Only tools annotated `readOnlyHint: true` are visible
	pub read_only: bool,
	/// Closed by the idle sweep; stdio sessions live as long as the pipe
	pub expires_when_idle: bool,
}

#[derive(Debug)]
pub struct ClientSession {
	pub id: String,
	pub protocol_version: String,
	pub client_info: Value,
	pub capabilities: Value,
	pub opened_at: DateTime<Utc>,
	pub options: SessionOptions,
	initialized: AtomicBool,
	last_seen: Mutex<Instant>,
}

impl ClientSession {
	/// Set once the client sent `notifications/initialized`
	pub fn is_initialized(&self) -> bool {
		self.initialized.load(Ordering::SeqCst)
	}

	pub fn mark_initialized(&self) {
		self.initialized.store(true, Ordering::SeqCst);
	}

	pub fn touch(&self) {
		*self.last_seen.lock() = Instant::now();
	}

	pub fn idle_for(&self) -> Duration {
		self.last_seen.lock().elapsed()
	}

	pub fn client_name(&self) -> &str {
		self.client_info
			.get("name")
			.and_then(Value::as_str)
			.unwrap_or("unknown")
	}
}

/// Pick the client's revision when we speak it, otherwise our newest.
pub fn negotiate_protocol_version(requested: Option<&str>) -> &'static str {
	requested
		.and_then(|r| SUPPORTED_PROTOCOL_VERSIONS.iter().find(|v| **v == r))
		.copied()
		.unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

pub struct SessionManager {
	sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
	inflight: Arc<InFlightTable>,
	ordering: Arc<DeliveryGate>,
}

impl SessionManager {
	pub fn new(inflight: Arc<InFlightTable>, ordering: Arc<DeliveryGate>) -> Self {
		Self {
			sessions: RwLock::new(HashMap::new()),
			inflight,
			ordering,
		}
	}

	/// Open a session from `initialize` params.
	pub fn open(&self, params: &Value, options: SessionOptions) -> Arc<ClientSession> {
		let requested = params.get("protocolVersion").and_then(Value::as_str);
		let session = Arc::new(ClientSession {
			id: uuid::Uuid::new_v4().to_string(),
			protocol_version: negotiate_protocol_version(requested).to_string(),
			client_info: params.get("clientInfo").cloned().unwrap_or(Value::Null),
			capabilities: params
				.get("capabilities")
				.cloned()
				.unwrap_or_else(|| Value::Object(Default::default())),
			opened_at: Utc::now(),
			options,
			initialized: AtomicBool::new(false),
			last_seen: Mutex::new(Instant::now()),
		});

		self.sessions
			.write()
			.insert(session.id.clone(), session.clone());

		info!(
			session_id = %session.id,
			client = %session.client_name(),
			protocol_version = %session.protocol_version,
			requested_version = ?requested,
			read_only = options.read_only,
			"Client session opened"
		);
		session
	}

	pub fn get(&self, session_id: &str) -> Option<Arc<ClientSession>> {
		self.sessions.read().get(session_id).cloned()
	}

	pub fn contains(&self, session_id: &str) -> bool {
		self.sessions.read().contains_key(session_id)
	}

	/// Close a session. In-flight calls are abandoned, not cancelled.
	pub fn close(&self, session_id: &str) -> bool {
		let removed = self.sessions.write().remove(session_id);
		let Some(session) = removed else {
			debug!(session_id = %session_id, "Close for unknown session");
			return false;
		};

		let abandoned = self.inflight.abandon_session(session_id);
		self.ordering.drop_session(session_id);
		info!(
			session_id = %session.id,
			abandoned_requests = abandoned,
			lifetime_secs = (Utc::now() - session.opened_at).num_seconds(),
			"Client session closed"
		);
		true
	}

	/// Close every expiring session idle for at least `max_idle`; returns
	/// their ids.
	pub fn expire_idle(&self, max_idle: Duration) -> Vec<String> {
		let stale: Vec<String> = self
			.sessions
			.read()
			.values()
			.filter(|s| s.options.expires_when_idle && s.idle_for() >= max_idle)
			.map(|s| s.id.clone())
			.collect();

		let mut expired = Vec::new();
		for id in stale {
			// A request may have touched it since the scan
			let still_idle = self.get(&id).is_some_and(|s| s.idle_for() >= max_idle);
			if !still_idle {
				continue;
			}
			info!(
				session_id = %id,
				idle_limit_ms = max_idle.as_millis() as u64,
				"Expiring idle session"
			);
			if self.close(&id) {
				expired.push(id);
			}
		}
		expired
	}

	pub fn count(&self) -> usize {
		self.sessions.read().len()
	}

	pub fn ids(&self) -> Vec<String> {
		self.sessions.read().keys().cloned().collect()
	}
}
