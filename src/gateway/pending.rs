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

//! Reply correlation for one backend channel

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::error::GatewayError;
use crate::mcp::types::JsonRpcError;

pub type RpcReply = Result<Value, JsonRpcError>;

/// Waiting callers keyed by backend request id.
///
/// Once closed the map refuses new registrations and every waiter still
/// registered sees its channel drop.
pub struct PendingRequests {
	backend_id: String,
	waiters: Mutex<Option<HashMap<u64, oneshot::Sender<RpcReply>>>>,
}

impl PendingRequests {
	pub fn new(backend_id: &str) -> Self {
		Self {
			backend_id: backend_id.to_string(),
			waiters: Mutex::new(Some(HashMap::new())),
		}
	}

	pub fn register(&self, id: u64) -> Result<oneshot::Receiver<RpcReply>, GatewayError> {
		let (tx, rx) = oneshot::channel();
		let mut guard = self.waiters.lock();
		match guard.as_mut() {
			Some(waiters) => {
				waiters.insert(id, tx);
				Ok(rx)
			}
			None => Err(GatewayError::unavailable(
				&self.backend_id,
				"channel closed",
			)),
		}
	}

	/// Hand a reply to its waiter. Returns false for unknown ids.
	pub fn complete(&self, id: u64, reply: RpcReply) -> bool {
		let sender = self.waiters.lock().as_mut().and_then(|w| w.remove(&id));
		match sender {
			Some(tx) => {
				if tx.send(reply).is_err() {
					debug!(backend = %self.backend_id, id, "Reply arrived after caller gave up");
				}
				true
			}
			None => {
				warn!(backend = %self.backend_id, id, "Received reply for unknown request id");
				false
			}
		}
	}

	pub fn remove(&self, id: u64) {
		if let Some(waiters) = self.waiters.lock().as_mut() {
			waiters.remove(&id);
		}
	}

	/// Fail every waiter and refuse new ones.
	pub fn close(&self) -> usize {
		let drained = self.waiters.lock().take();
		let count = drained.as_ref().map(HashMap::len).unwrap_or(0);
		if count > 0 {
			debug!(backend = %self.backend_id, count, "Failing pending requests");
		}
		count
	}

	pub fn len(&self) -> usize {
		self.waiters.lock().as_ref().map(HashMap::len).unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Await a registered reply, bounded by `limit`.
	pub async fn wait(
		&self,
		id: u64,
		rx: oneshot::Receiver<RpcReply>,
		limit: Duration,
	) -> Result<Value, GatewayError> {
		match timeout(limit, rx).await {
			Ok(Ok(Ok(value))) => Ok(value),
			Ok(Ok(Err(error))) => Err(GatewayError::BackendError(error)),
			Ok(Err(_)) => Err(GatewayError::unavailable(
				&self.backend_id,
				"channel closed before reply",
			)),
			Err(_) => {
				self.remove(id);
				Err(GatewayError::unavailable(
					&self.backend_id,
					format!("no reply within {}ms", limit.as_millis()),
				))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn test_complete_delivers_reply() {
		let pending = PendingRequests::new("echo");
		let rx = pending.register(1).unwrap();
		assert!(pending.complete(1, Ok(json!({"pong": true}))));
		let value = pending.wait(1, rx, Duration::from_secs(1)).await.unwrap();
		assert_eq!(value, json!({"pong": true}));
		assert!(pending.is_empty());
	}

	#[tokio::test]
	async fn test_close_fails_waiters() {
		let pending = PendingRequests::new("echo");
		let rx = pending.register(7).unwrap();
		assert_eq!(pending.close(), 1);
		let err = pending.wait(7, rx, Duration::from_secs(1)).await.unwrap_err();
		assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
		assert!(pending.register(8).is_err());
	}

	#[tokio::test]
	async fn test_timeout_removes_entry() {
		let pending = PendingRequests::new("echo");
		let rx = pending.register(3).unwrap();
		let err = pending
			.wait(3, rx, Duration::from_millis(20))
			.await
			.unwrap_err();
		assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
		assert!(!pending.complete(3, Ok(Value::Null)));
	}

	#[tokio::test]
	async fn test_structured_error_is_backend_error() {
		let pending = PendingRequests::new("echo");
		let rx = pending.register(2).unwrap();
		pending.complete(2, Err(JsonRpcError::new(-32050, "boom")));
		let err = pending.wait(2, rx, Duration::from_secs(1)).await.unwrap_err();
		assert!(matches!(err, GatewayError::BackendError(e) if e.code == -32050));
	}
}
