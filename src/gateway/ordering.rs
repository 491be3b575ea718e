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

//! Per `(session, backend)` delivery order.
//!
//! A [`Ticket`] is taken when a call is admitted. Once its reply is ready the
//! ticket waits for its turn and becomes a [`DeliveryTurn`], which the
//! transport holds until the response is queued for writing. Dropping either
//! one releases the slot so later tickets never stall behind it. A lane with
//! no outstanding slots is removed from the gate.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

type LaneKey = (String, String);
type LaneMap = Mutex<HashMap<LaneKey, Arc<Lane>>>;

struct LaneState {
	next_ticket: u64,
	serving: u64,
	released: BTreeSet<u64>,
}

impl LaneState {
	fn is_idle(&self) -> bool {
		self.serving == self.next_ticket
	}
}

struct Lane {
	key: LaneKey,
	gate: Weak<LaneMap>,
	state: Mutex<LaneState>,
	serving: watch::Sender<u64>,
}

impl Lane {
	fn new(key: LaneKey, gate: Weak<LaneMap>) -> Self {
		let (serving, _) = watch::channel(0);
		Self {
			key,
			gate,
			state: Mutex::new(LaneState {
				next_ticket: 0,
				serving: 0,
				released: BTreeSet::new(),
			}),
			serving,
		}
	}

	fn release(&self, seq: u64) {
		let idle = {
			let mut state = self.state.lock();
			state.released.insert(seq);
			let before = state.serving;
			loop {
				let serving = state.serving;
				if !state.released.remove(&serving) {
					break;
				}
				state.serving += 1;
			}
			if state.serving != before {
				self.serving.send_replace(state.serving);
			}
			state.is_idle()
		};
		if idle {
			self.forget_if_idle();
		}
	}

	/// Map lock before lane lock, same order as `DeliveryGate::ticket`.
	fn forget_if_idle(&self) {
		let Some(gate) = self.gate.upgrade() else {
			return;
		};
		let mut lanes = gate.lock();
		let still_idle = self.state.lock().is_idle();
		let registered = lanes
			.get(&self.key)
			.is_some_and(|lane| std::ptr::eq(Arc::as_ptr(lane), self));
		if still_idle && registered {
			lanes.remove(&self.key);
		}
	}
}

pub struct DeliveryGate {
	lanes: Arc<LaneMap>,
}

impl Default for DeliveryGate {
	fn default() -> Self {
		Self::new()
	}
}

impl DeliveryGate {
	pub fn new() -> Self {
		Self {
			lanes: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Take the next slot for `(session, backend)`.
	pub fn ticket(&self, session_id: &str, backend_id: &str) -> Ticket {
		let mut lanes = self.lanes.lock();
		let key = (session_id.to_string(), backend_id.to_string());
		let lane = lanes
			.entry(key.clone())
			.or_insert_with(|| Arc::new(Lane::new(key, Arc::downgrade(&self.lanes))))
			.clone();
		let seq = {
			let mut state = lane.state.lock();
			let seq = state.next_ticket;
			state.next_ticket += 1;
			seq
		};
		drop(lanes);
		Ticket {
			slot: Some((lane, seq)),
		}
	}

	/// Forget a closed session's lanes. Outstanding tickets keep their lane
	/// alive until they are dropped.
	pub fn drop_session(&self, session_id: &str) {
		self.lanes.lock().retain(|(session, _), _| session != session_id);
	}

	pub fn lane_count(&self) -> usize {
		self.lanes.lock().len()
	}
}

pub struct Ticket {
	slot: Option<(Arc<Lane>, u64)>,
}

impl Ticket {
	/// Wait until every earlier ticket of the lane was delivered or dropped.
	pub async fn wait_turn(mut self) -> DeliveryTurn {
		// Built first so a cancelled wait still releases the slot
		let turn = DeliveryTurn {
			slot: self.slot.take(),
		};
		if let Some((lane, seq)) = &turn.slot {
			let seq = *seq;
			let mut serving = lane.serving.subscribe();
			let _ = serving.wait_for(|current| *current >= seq).await;
		}
		turn
	}
}

impl Drop for Ticket {
	fn drop(&mut self) {
		if let Some((lane, seq)) = self.slot.take() {
			lane.release(seq);
		}
	}
}

/// Exclusive right to deliver the next response of a lane.
pub struct DeliveryTurn {
	slot: Option<(Arc<Lane>, u64)>,
}

impl DeliveryTurn {
	/// A turn that orders nothing, for replies that bypass the router
	pub fn unordered() -> Self {
		Self { slot: None }
	}
}

impl Drop for DeliveryTurn {
	fn drop(&mut self) {
		if let Some((lane, seq)) = self.slot.take() {
			lane.release(seq);
		}
	}
}
