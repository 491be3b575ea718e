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

//! Lock-striped table of requests awaiting a backend reply

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tokio::time::Instant;

use super::error::GatewayError;
use crate::constants::INFLIGHT_SHARDS;

#[derive(Debug, Clone)]
pub struct InFlightRequest {
	pub session_id: String,
	pub client_request_id: Value,
	pub backend_id: String,
	pub backend_request_id: u64,
	pub submitted_at: Instant,
	pub abandoned: bool,
}

/// `(session id, canonical JSON of the client id)`; `1` and `"1"` differ.
type Key = (String, String);

fn key_for(session_id: &str, client_request_id: &Value) -> Key {
	(session_id.to_string(), client_request_id.to_string())
}

pub struct InFlightTable {
	shards: Vec<Mutex<HashMap<Key, InFlightRequest>>>,
}

impl Default for InFlightTable {
	fn default() -> Self {
		Self::new()
	}
}

impl InFlightTable {
	pub fn new() -> Self {
		Self::with_shards(INFLIGHT_SHARDS)
	}

	pub fn with_shards(count: usize) -> Self {
		let count = count.max(1);
		Self {
			shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
		}
	}

	fn shard(&self, key: &Key) -> &Mutex<HashMap<Key, InFlightRequest>> {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		&self.shards[(hasher.finish() as usize) % self.shards.len()]
	}

	/// Record a request. A live entry for the same session and client id
	/// is a `DuplicateRequestId`.
	pub fn insert(&self, request: InFlightRequest) -> Result<(), GatewayError> {
		let key = key_for(&request.session_id, &request.client_request_id);
		let mut shard = self.shard(&key).lock();
		match shard.entry(key) {
			Entry::Occupied(entry) => Err(GatewayError::DuplicateRequestId(entry.key().1.clone())),
			Entry::Vacant(entry) => {
				entry.insert(request);
				Ok(())
			}
		}
	}

	pub fn remove(&self, session_id: &str, client_request_id: &Value) -> Option<InFlightRequest> {
		let key = key_for(session_id, client_request_id);
		self.shard(&key).lock().remove(&key)
	}

	/// Mark every entry of a closed session. Backend calls keep running;
	/// their results are dropped when they arrive.
	pub fn abandon_session(&self, session_id: &str) -> usize {
		let mut abandoned = 0;
		for shard in &self.shards {
			for request in shard.lock().values_mut() {
				if request.session_id == session_id && !request.abandoned {
					request.abandoned = true;
					abandoned += 1;
				}
			}
		}
		abandoned
	}

	pub fn len(&self) -> usize {
		self.shards.iter().map(|s| s.lock().len()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Entries waiting on one backend
	pub fn count_for_backend(&self, backend_id: &str) -> usize {
		self.shards
			.iter()
			.map(|s| {
				s.lock()
					.values()
					.filter(|r| r.backend_id == backend_id)
					.count()
			})
			.sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn request(session: &str, id: Value, backend_request_id: u64) -> InFlightRequest {
		InFlightRequest {
			session_id: session.to_string(),
			client_request_id: id,
			backend_id: "echo".to_string(),
			backend_request_id,
			submitted_at: Instant::now(),
			abandoned: false,
		}
	}

	#[test]
	fn test_duplicate_key_rejected() {
		let table = InFlightTable::new();
		table.insert(request("s1", json!(1), 10)).unwrap();
		let err = table.insert(request("s1", json!(1), 11)).unwrap_err();
		assert!(matches!(err, GatewayError::DuplicateRequestId(_)));

		// Same id in another session, or a string id, is a different key
		table.insert(request("s2", json!(1), 12)).unwrap();
		table.insert(request("s1", json!("1"), 13)).unwrap();
		assert_eq!(table.len(), 3);
	}

	#[test]
	fn test_id_reusable_after_removal() {
		let table = InFlightTable::new();
		table.insert(request("s1", json!(5), 1)).unwrap();
		let removed = table.remove("s1", &json!(5)).unwrap();
		assert_eq!(removed.backend_request_id, 1);
		table.insert(request("s1", json!(5), 2)).unwrap();
	}

	#[test]
	fn test_abandon_marks_only_that_session() {
		let table = InFlightTable::with_shards(4);
		for i in 0..10 {
			table.insert(request("gone", json!(i), i)).unwrap();
			table.insert(request("alive", json!(i), 100 + i)).unwrap();
		}
		assert_eq!(table.abandon_session("gone"), 10);
		assert!(table.remove("gone", &json!(3)).unwrap().abandoned);
		assert!(!table.remove("alive", &json!(3)).unwrap().abandoned);
		assert_eq!(table.count_for_backend("echo"), 18);
	}
}
