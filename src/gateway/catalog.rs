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

//! Merged tool catalog and its snapshot publication

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants::MAX_TOOL_NAME_LEN;
use crate::mcp::types::McpTool;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
	pub name: String,
	pub description: Option<String>,
	pub input_schema: Value,
	pub backend_id: String,
	pub origin_name: String,
	pub extra: Map<String, Value>,
}

impl ToolDescriptor {
	/// Tool carries `annotations.readOnlyHint: true`
	pub fn is_read_only(&self) -> bool {
		self.extra
			.get("annotations")
			.and_then(|a| a.get("readOnlyHint"))
			.and_then(Value::as_bool)
			.unwrap_or(false)
	}

	/// Wire form advertised to clients under the merged name
	pub fn to_mcp_tool(&self) -> McpTool {
		McpTool {
			name: self.name.clone(),
			description: self.description.clone(),
			input_schema: self.input_schema.clone(),
			extra: self.extra.clone(),
		}
	}
}

/// Tools reported by one backend, in the order it reported them
#[derive(Debug, Clone)]
pub struct BackendTools {
	pub backend_id: String,
	pub namespace: String,
	pub tools: Vec<McpTool>,
}

/// Immutable snapshot of the merged catalog.
#[derive(Debug)]
pub struct Catalog {
	version: u64,
	digest: String,
	tools: Vec<ToolDescriptor>,
	index: HashMap<String, usize>,
}

impl Catalog {
	pub fn empty() -> Self {
		Self::merge(&[])
	}

	/// Merge backends in registration order.
	///
	/// The first backend to claim a name keeps it. Later claimants become
	/// `<namespace>/<name>`, then `<namespace>/<name>_2`, `_3` and so on.
	/// Merging the same input always yields the same names.
	pub fn merge(sources: &[BackendTools]) -> Self {
		Self::merge_with(sources, &mut NameAssignments::new())
	}

	/// Merge against names handed out by earlier merges.
	///
	/// A `(backend, tool)` pair that was ever assigned a name keeps it, even
	/// while the tool is absent, so a client holding a merged name never
	/// reaches a different backend after a rebuild. Only tools seen for the
	/// first time compete for names, in registration order.
	pub fn merge_with(sources: &[BackendTools], assignments: &mut NameAssignments) -> Self {
		let mut claimed: HashSet<String> = assignments.values().cloned().collect();
		let mut accepted: Vec<(&BackendTools, &McpTool, Option<String>)> = Vec::new();

		for source in sources {
			let mut seen_in_backend = HashSet::new();

			for tool in &source.tools {
				if let Err(reason) = validate_tool_name(&tool.name) {
					warn!(
						backend = %source.backend_id,
						tool = %tool.name,
						reason = %reason,
						"Skipping tool with invalid name"
					);
					continue;
				}
				if !seen_in_backend.insert(tool.name.as_str()) {
					warn!(
						backend = %source.backend_id,
						tool = %tool.name,
						"Backend reported the same tool twice, keeping the first"
					);
					continue;
				}

				let key = (source.backend_id.clone(), tool.name.clone());
				accepted.push((source, tool, assignments.get(&key).cloned()));
			}
		}

		for (source, tool, name) in accepted.iter_mut().filter(|(_, _, name)| name.is_none()) {
			let Some(merged) = claim_name(&mut claimed, &source.namespace, &tool.name) else {
				warn!(
					backend = %source.backend_id,
					tool = %tool.name,
					"No valid merged name for colliding tool, skipping"
				);
				continue;
			};
			if merged != tool.name {
				debug!(
					backend = %source.backend_id,
					tool = %tool.name,
					merged = %merged,
					"Renamed colliding tool"
				);
			}
			assignments.insert(
				(source.backend_id.clone(), tool.name.clone()),
				merged.clone(),
			);
			*name = Some(merged);
		}

		let tools: Vec<ToolDescriptor> = accepted
			.into_iter()
			.filter_map(|(source, tool, name)| {
				Some(ToolDescriptor {
					name: name?,
					description: tool.description.clone(),
					input_schema: tool.input_schema.clone(),
					backend_id: source.backend_id.clone(),
					origin_name: tool.name.clone(),
					extra: tool.extra.clone(),
				})
			})
			.collect();

		let index = tools
			.iter()
			.enumerate()
			.map(|(i, t)| (t.name.clone(), i))
			.collect();
		let digest = digest_of(&tools);

		Self {
			version: 0,
			digest,
			tools,
			index,
		}
	}

	pub fn version(&self) -> u64 {
		self.version
	}

	pub fn digest(&self) -> &str {
		&self.digest
	}

	pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
		self.index.get(name).map(|&i| &self.tools[i])
	}

	pub fn tools(&self) -> &[ToolDescriptor] {
		&self.tools
	}

	pub fn to_mcp_tools(&self) -> Vec<McpTool> {
		self.tools.iter().map(ToolDescriptor::to_mcp_tool).collect()
	}

	pub fn len(&self) -> usize {
		self.tools.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tools.is_empty()
	}
}

/// Merged name per `(backend id, origin tool name)`
pub type NameAssignments = HashMap<(String, String), String>;

fn claim_name(claimed: &mut HashSet<String>, namespace: &str, origin: &str) -> Option<String> {
	if claimed.insert(origin.to_string()) {
		return Some(origin.to_string());
	}

	let base = format!("{}/{}", namespace, origin);
	let mut candidate = base.clone();
	let mut suffix = 2;
	loop {
		validate_tool_name(&candidate).ok()?;
		if claimed.insert(candidate.clone()) {
			return Some(candidate);
		}
		candidate = format!("{}_{}", base, suffix);
		suffix += 1;
	}
}

fn digest_of(tools: &[ToolDescriptor]) -> String {
	let mut hasher = Sha256::new();
	// Map is ordered, so serialization is deterministic
	match serde_json::to_vec(tools) {
		Ok(bytes) => hasher.update(&bytes),
		Err(e) => warn!(error = %e, "Failed to serialize catalog for digest"),
	}
	format!("{:x}", hasher.finalize())
}

/// Tool names: 1 to 64 characters from `[A-Za-z0-9_-./]`.
pub fn validate_tool_name(name: &str) -> Result<(), String> {
	if name.is_empty() {
		return Err("name is empty".to_string());
	}
	if name.len() > MAX_TOOL_NAME_LEN {
		return Err(format!(
			"name is {} characters, limit is {}",
			name.len(),
			MAX_TOOL_NAME_LEN
		));
	}
	if let Some(bad) = name
		.chars()
		.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')))
	{
		return Err(format!("invalid character '{}'", bad));
	}
	Ok(())
}

/// Holder of the current catalog snapshot.
///
/// Readers clone the `Arc`; the write lock is held only for the swap.
pub struct CatalogHandle {
	current: RwLock<Arc<Catalog>>,
	assignments: Mutex<NameAssignments>,
	changes: watch::Sender<u64>,
}

impl Default for CatalogHandle {
	fn default() -> Self {
		Self::new()
	}
}

impl CatalogHandle {
	pub fn new() -> Self {
		let (changes, _) = watch::channel(0);
		Self {
			current: RwLock::new(Arc::new(Catalog::empty())),
			assignments: Mutex::new(NameAssignments::new()),
			changes,
		}
	}

	pub fn snapshot(&self) -> Arc<Catalog> {
		self.current.read().clone()
	}

	/// Merge and publish. Subscribers are only woken when the content
	/// digest changed. Names assigned by earlier publishes stay put.
	pub fn publish(&self, sources: &[BackendTools]) -> Arc<Catalog> {
		let mut next = Catalog::merge_with(sources, &mut self.assignments.lock());

		let (published, changed) = {
			let mut current = self.current.write();
			next.version = current.version + 1;
			let changed = next.digest != current.digest;
			let published = Arc::new(next);
			*current = published.clone();
			(published, changed)
		};

		if changed {
			info!(
				version = published.version,
				tool_count = published.len(),
				digest = %&published.digest[..12],
				"Published tool catalog"
			);
			self.changes.send_replace(published.version);
		} else {
			debug!(version = published.version, "Catalog rebuilt without changes");
		}
		published
	}

	/// Receives the version of each catalog whose content changed
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.changes.subscribe()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn tool(name: &str) -> McpTool {
		McpTool::new(name, &format!("{} tool", name), json!({"type": "object"}))
	}

	fn source(id: &str, names: &[&str]) -> BackendTools {
		BackendTools {
			backend_id: id.to_string(),
			namespace: id.to_string(),
			tools: names.iter().map(|n| tool(n)).collect(),
		}
	}

	#[test]
	fn test_collision_renames_later_backend() {
		let catalog = Catalog::merge(&[
			source("local", &["search", "analyze_code_snippet"]),
			source("echo", &["search", "ping"]),
		]);

		let names: Vec<&str> = catalog.tools().iter().map(|t| t.name.as_str()).collect();
		assert_eq!(names, ["search", "analyze_code_snippet", "echo/search", "ping"]);

		let renamed = catalog.get("echo/search").unwrap();
		assert_eq!(renamed.backend_id, "echo");
		assert_eq!(renamed.origin_name, "search");
		assert_eq!(catalog.get("search").unwrap().backend_id, "local");
	}

	#[test]
	fn test_numeric_suffix_when_namespaced_name_taken() {
		let catalog = Catalog::merge(&[
			source("a", &["search", "echo/search"]),
			source("echo", &["search"]),
		]);
		assert_eq!(catalog.get("echo/search_2").unwrap().backend_id, "echo");
	}

	#[test]
	fn test_invalid_and_duplicate_names_skipped() {
		let long = "x".repeat(65);
		let catalog = Catalog::merge(&[source(
			"echo",
			&["ok", "has space", "", long.as_str(), "ok"],
		)]);
		assert_eq!(catalog.len(), 1);
		assert_eq!(catalog.tools()[0].name, "ok");
	}

	#[test]
	fn test_read_only_hint() {
		let mut hinted = tool("list_rules");
		hinted
			.extra
			.insert("annotations".to_string(), json!({"readOnlyHint": true}));
		let mut writer = tool("change_status");
		writer
			.extra
			.insert("annotations".to_string(), json!({"readOnlyHint": false}));
		let catalog = Catalog::merge(&[BackendTools {
			backend_id: "sonar".to_string(),
			namespace: "sonar".to_string(),
			tools: vec![hinted, writer, tool("plain")],
		}]);

		assert!(catalog.get("list_rules").unwrap().is_read_only());
		assert!(!catalog.get("change_status").unwrap().is_read_only());
		assert!(!catalog.get("plain").unwrap().is_read_only());
	}

	#[test]
	fn test_validate_tool_name() {
		assert!(validate_tool_name("sonar.analyze/v2_x-y").is_ok());
		assert!(validate_tool_name(&"a".repeat(64)).is_ok());
		assert!(validate_tool_name(&"a".repeat(65)).is_err());
		assert!(validate_tool_name("tool@1").is_err());
		assert!(validate_tool_name("").is_err());
	}

	#[test]
	fn test_identical_rebuilds_share_digest() {
		let handle = CatalogHandle::new();
		let mut changes = handle.subscribe();
		let sources = [source("local", &["a"]), source("echo", &["a", "b"])];

		let first = handle.publish(&sources);
		assert!(changes.has_changed().unwrap());
		changes.borrow_and_update();

		let second = handle.publish(&sources);
		assert_eq!(first.digest(), second.digest());
		assert!(second.version() > first.version());
		assert_eq!(first.to_mcp_tools(), second.to_mcp_tools());
		assert!(!changes.has_changed().unwrap());
	}

	#[test]
	fn test_late_tools_do_not_take_published_names() {
		let handle = CatalogHandle::new();
		let first = handle.publish(&[source("echo", &[]), source("aux", &["search"])]);
		assert_eq!(first.get("search").unwrap().backend_id, "aux");

		// echo registered first but reported its tools later
		let second = handle.publish(&[source("echo", &["search"]), source("aux", &["search"])]);
		assert_eq!(second.get("search").unwrap().backend_id, "aux");
		assert_eq!(second.get("echo/search").unwrap().backend_id, "echo");
		let names: Vec<&str> = second.tools().iter().map(|t| t.name.as_str()).collect();
		assert_eq!(names, ["echo/search", "search"]);
	}

	#[test]
	fn test_assigned_name_reserved_while_tool_absent() {
		let handle = CatalogHandle::new();
		handle.publish(&[source("echo", &["search"]), source("aux", &[])]);

		// echo lost its tool for a while; aux must not inherit the name
		let gap = handle.publish(&[source("echo", &[]), source("aux", &["search"])]);
		assert!(gap.get("search").is_none());
		assert_eq!(gap.get("aux/search").unwrap().backend_id, "aux");

		let back = handle.publish(&[source("echo", &["search"]), source("aux", &["search"])]);
		assert_eq!(back.get("search").unwrap().backend_id, "echo");
		assert_eq!(back.get("aux/search").unwrap().backend_id, "aux");
	}

	#[test]
	fn test_snapshot_survives_swap() {
		let handle = CatalogHandle::new();
		handle.publish(&[source("local", &["a"])]);
		let old = handle.snapshot();
		handle.publish(&[source("local", &["a", "b"])]);
		assert_eq!(old.len(), 1);
		assert_eq!(handle.snapshot().len(), 2);
	}
}
