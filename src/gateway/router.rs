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

//! Tool call routing.
//!
//! Dispatch is split in two. [`Router::admit`] runs synchronously in the
//! order requests arrive: it resolves the owner, records the in-flight entry
//! and takes the ordering ticket. [`Router::execute`] then does the waiting.

use serde_json::Value;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::error::GatewayError;
use super::inflight::{InFlightRequest, InFlightTable};
use super::ordering::{DeliveryGate, DeliveryTurn, Ticket};
use super::registry::{Backend, BackendRegistry};
use super::session::SessionManager;

/// A call that passed admission and holds its delivery slot
pub struct Admission {
	session_id: String,
	client_request_id: Value,
	backend: Backend,
	origin_name: String,
	backend_request_id: u64,
	ticket: Ticket,
}

pub struct Dispatched {
	pub outcome: Result<Value, GatewayError>,
	pub turn: DeliveryTurn,
}

pub struct Router {
	registry: Arc<BackendRegistry>,
	inflight: Arc<InFlightTable>,
	ordering: Arc<DeliveryGate>,
	sessions: Arc<SessionManager>,
	readiness_timeout: Duration,
}

impl Router {
	pub fn new(
		registry: Arc<BackendRegistry>,
		inflight: Arc<InFlightTable>,
		ordering: Arc<DeliveryGate>,
		sessions: Arc<SessionManager>,
		readiness_timeout: Duration,
	) -> Self {
		Self {
			registry,
			inflight,
			ordering,
			sessions,
			readiness_timeout,
		}
	}

	pub fn admit(
		&self,
		session_id: &str,
		client_request_id: &Value,
		tool_name: &str,
		read_only: bool,
	) -> Result<Admission, GatewayError> {
		let (backend, descriptor) = self.registry.resolve(tool_name)?;
		if read_only && !descriptor.is_read_only() {
			return Err(GatewayError::ToolNotFound(tool_name.to_string()));
		}
		let backend_request_id = backend.next_request_id();

		self.inflight.insert(InFlightRequest {
			session_id: session_id.to_string(),
			client_request_id: client_request_id.clone(),
			backend_id: backend.id().to_string(),
			backend_request_id,
			submitted_at: Instant::now(),
			abandoned: false,
		})?;

		let ticket = self.ordering.ticket(session_id, backend.id());
		debug!(
			session_id = %session_id,
			tool = %tool_name,
			backend = %backend.id(),
			backend_request_id,
			"Admitted tool call"
		);

		Ok(Admission {
			session_id: session_id.to_string(),
			client_request_id: client_request_id.clone(),
			backend,
			origin_name: descriptor.origin_name,
			backend_request_id,
			ticket,
		})
	}

	/// Forward an admitted call and wait for the delivery turn.
	///
	/// Never drops a request: every path ends in an outcome, and a call
	/// whose session closed meanwhile ends in `SessionClosed`.
	pub async fn execute(&self, admission: Admission, arguments: Value) -> Dispatched {
		let Admission {
			session_id,
			client_request_id,
			backend,
			origin_name,
			backend_request_id,
			ticket,
		} = admission;

		let outcome = match backend.ensure_ready(self.readiness_timeout).await {
			Ok(()) => {
				backend
					.call_tool(backend_request_id, &origin_name, arguments)
					.await
			}
			Err(e) => Err(e),
		};

		let record = self.inflight.remove(&session_id, &client_request_id);
		if let Some(record) = &record {
			debug!(
				session_id = %session_id,
				backend = %record.backend_id,
				backend_request_id = record.backend_request_id,
				elapsed_ms = record.submitted_at.elapsed().as_millis() as u64,
				ok = outcome.is_ok(),
				"Tool call completed"
			);
		}
		let abandoned = record.map(|r| r.abandoned).unwrap_or(true)
			|| !self.sessions.contains(&session_id);

		if abandoned {
			debug!(
				session_id = %session_id,
				client_request_id = %client_request_id,
				"Discarding result for closed session"
			);
			drop(ticket);
			return Dispatched {
				outcome: Err(GatewayError::SessionClosed(session_id)),
				turn: DeliveryTurn::unordered(),
			};
		}

		let turn = ticket.wait_turn().await;
		Dispatched { outcome, turn }
	}
}
