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

//! Declarative list of external MCP servers the gateway supervises.
//!
//! The file is JSON, either a bare array of entries or an object with a
//! `servers` array:
//!
//! ```json
//! [
//!   { "id": "echo", "namespace": "echo", "command": "mcp-echo-server",
//!     "args": ["--tools", "ping,search"], "env": { "LOG": "1" },
//!     "workingDirectory": "/tmp", "required": false,
//!     "supportedTransports": ["stdio", "http"],
//!     "instructions": "Use echo tools to test connectivity." }
//! ]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::error::ManifestError;
use crate::config::TransportMode;

/// Backend id reserved for the embedded analysis backend.
pub const LOCAL_BACKEND_ID: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxiedServerSpec {
	pub id: String,
	pub namespace: String,
	pub command: String,
	pub args: Vec<String>,
	pub env: BTreeMap<String, String>,
	#[serde(rename = "workingDirectory", skip_serializing_if = "Option::is_none")]
	pub working_directory: Option<PathBuf>,
	pub required: bool,
	/// Client transports this server may be offered on
	#[serde(rename = "supportedTransports")]
	pub supported_transports: Vec<TransportMode>,
	/// Appended to the gateway's `initialize` instructions
	#[serde(skip_serializing_if = "Option::is_none")]
	pub instructions: Option<String>,
}

impl ProxiedServerSpec {
	pub fn supports(&self, transport: TransportMode) -> bool {
		self.supported_transports.contains(&transport)
	}
}

#[derive(Debug, Deserialize)]
struct RawEntry {
	#[serde(default, alias = "name")]
	id: Option<String>,
	#[serde(default)]
	namespace: Option<String>,
	#[serde(default)]
	command: Option<String>,
	#[serde(default)]
	args: Vec<String>,
	#[serde(default)]
	env: BTreeMap<String, String>,
	#[serde(default, rename = "workingDirectory", alias = "working_directory")]
	working_directory: Option<String>,
	#[serde(default)]
	required: bool,
	#[serde(default, rename = "supportedTransports", alias = "supported_transports")]
	supported_transports: Option<Vec<TransportMode>>,
	#[serde(default)]
	instructions: Option<String>,
}

/// Parsed manifest: accepted servers in file order plus the entries that
/// were rejected.
#[derive(Debug, Default)]
pub struct Manifest {
	pub servers: Vec<ProxiedServerSpec>,
	pub rejected: Vec<ManifestError>,
}

impl Manifest {
	/// Load a manifest from disk. A missing file is an empty manifest.
	pub fn load(path: &Path) -> Result<Self, ManifestError> {
		if !path.exists() {
			debug!(path = %path.display(), "No manifest file, no proxied servers");
			return Ok(Self::default());
		}

		let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Unreadable {
			path: path.to_path_buf(),
			source,
		})?;

		Self::parse(&content, &path.display().to_string())
	}

	pub fn parse(content: &str, origin: &str) -> Result<Self, ManifestError> {
		let root: Value = serde_json::from_str(content).map_err(|e| ManifestError::Malformed {
			path: origin.to_string(),
			reason: e.to_string(),
		})?;

		let entries = match root {
			Value::Array(entries) => entries,
			Value::Object(mut map) => match map.remove("servers") {
				Some(Value::Array(entries)) => entries,
				Some(_) => {
					return Err(ManifestError::Malformed {
						path: origin.to_string(),
						reason: "'servers' must be an array".to_string(),
					})
				}
				None => {
					return Err(ManifestError::Malformed {
						path: origin.to_string(),
						reason: "expected an array or an object with a 'servers' array".to_string(),
					})
				}
			},
			_ => {
				return Err(ManifestError::Malformed {
					path: origin.to_string(),
					reason: "expected an array or an object with a 'servers' array".to_string(),
				})
			}
		};

		let mut manifest = Manifest::default();
		let mut ids = HashSet::new();
		let mut namespaces = HashSet::new();

		for (index, entry) in entries.into_iter().enumerate() {
			match validate_entry(index, entry, &mut ids, &mut namespaces) {
				Ok(spec) => manifest.servers.push(spec),
				Err(error) => {
					warn!(error = %error, "Skipping manifest entry");
					manifest.rejected.push(error);
				}
			}
		}

		Ok(manifest)
	}

	/// First rejected entry that was marked `required`, if any.
	pub fn required_failure(&self) -> Option<&ManifestError> {
		self.rejected.iter().find(|e| e.is_required())
	}

	pub fn is_empty(&self) -> bool {
		self.servers.is_empty()
	}
}

fn validate_entry(
	index: usize,
	entry: Value,
	ids: &mut HashSet<String>,
	namespaces: &mut HashSet<String>,
) -> Result<ProxiedServerSpec, ManifestError> {
	// Collected before deserializing so a broken entry still reports them
	let required = entry
		.get("required")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	let label = entry
		.get("id")
		.or_else(|| entry.get("name"))
		.and_then(Value::as_str)
		.unwrap_or("<unnamed>")
		.to_string();

	let invalid = |reason: String| ManifestError::InvalidEntry {
		index,
		id: label.clone(),
		required,
		reason,
	};

	let raw: RawEntry = serde_json::from_value(entry).map_err(|e| invalid(e.to_string()))?;

	let id = raw
		.id
		.as_deref()
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.ok_or_else(|| invalid("'id' is required".to_string()))?;
	let command = raw
		.command
		.as_deref()
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.ok_or_else(|| invalid("'command' is required".to_string()))?
		.to_string();

	let id = sanitize_identifier(id);
	if id == LOCAL_BACKEND_ID {
		return Err(invalid(format!("id '{}' is reserved", LOCAL_BACKEND_ID)));
	}

	let namespace = match raw.namespace.as_deref().map(str::trim) {
		Some(ns) if !ns.is_empty() => sanitize_identifier(ns),
		_ => id.clone(),
	};

	let supported_transports = match raw.supported_transports {
		None => vec![TransportMode::Stdio, TransportMode::Http],
		Some(modes) if modes.is_empty() => {
			return Err(invalid("must support at least one transport mode".to_string()))
		}
		Some(mut modes) => {
			modes.dedup();
			modes
		}
	};

	if !ids.insert(id.clone()) {
		return Err(invalid(format!("duplicate id '{}'", id)));
	}
	if !namespaces.insert(namespace.clone()) {
		ids.remove(&id);
		return Err(invalid(format!("duplicate namespace '{}'", namespace)));
	}

	Ok(ProxiedServerSpec {
		id,
		namespace,
		command,
		args: raw.args,
		env: raw.env,
		working_directory: raw.working_directory.map(PathBuf::from),
		required: raw.required,
		supported_transports,
		instructions: raw
			.instructions
			.map(|text| text.trim().to_string())
			.filter(|text| !text.is_empty()),
	})
}

/// Base instructions followed by each server's own, space separated.
pub fn compose_instructions<'a, I>(base: &str, servers: I) -> String
where
	I: IntoIterator<Item = &'a ProxiedServerSpec>,
{
	let mut composed = base.to_string();
	for text in servers.into_iter().filter_map(|s| s.instructions.as_deref()) {
		composed.push(' ');
		composed.push_str(text);
	}
	composed
}

/// Lowercase and replace anything outside `[a-z0-9_-]` with `_`.
pub fn sanitize_identifier(raw: &str) -> String {
	raw.trim()
		.to_lowercase()
		.chars()
		.map(|c| {
			if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
				c
			} else {
				'_'
			}
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_array_and_object_forms() {
		let array = r#"[{"id": "echo", "command": "echo-server"}]"#;
		let object = r#"{"servers": [{"name": "echo", "command": "echo-server"}]}"#;

		let a = Manifest::parse(array, "a.json").unwrap();
		let b = Manifest::parse(object, "b.json").unwrap();
		assert_eq!(a.servers, b.servers);
		assert_eq!(a.servers[0].namespace, "echo");
		assert!(!a.servers[0].required);
	}

	#[test]
	fn test_sanitizes_ids_and_namespaces() {
		let manifest = Manifest::parse(
			r#"[{"id": "My Server", "namespace": "Sonar.Cloud", "command": "x"}]"#,
			"m.json",
		)
		.unwrap();
		assert_eq!(manifest.servers[0].id, "my_server");
		assert_eq!(manifest.servers[0].namespace, "sonar_cloud");
	}

	#[test]
	fn test_rejects_missing_fields_and_duplicates() {
		let manifest = Manifest::parse(
			r#"[
				{"id": "one", "command": "a"},
				{"id": "", "command": "b"},
				{"id": "two"},
				{"id": "ONE", "command": "c"},
				{"id": "three", "namespace": "one", "command": "d"},
				{"id": "four", "command": "e", "args": "not-a-list"}
			]"#,
			"m.json",
		)
		.unwrap();

		assert_eq!(manifest.servers.len(), 1);
		assert_eq!(manifest.rejected.len(), 5);
		assert!(manifest.required_failure().is_none());
	}

	#[test]
	fn test_required_rejection_is_reported() {
		let manifest = Manifest::parse(
			r#"[{"id": "sonar", "required": true}, {"id": "ok", "command": "x"}]"#,
			"m.json",
		)
		.unwrap();
		let failure = manifest.required_failure().unwrap();
		assert!(matches!(
			failure,
			ManifestError::InvalidEntry { index: 0, required: true, .. }
		));
		assert_eq!(manifest.servers.len(), 1);
	}

	#[test]
	fn test_reserved_id() {
		let manifest = Manifest::parse(r#"[{"id": "local", "command": "x"}]"#, "m.json").unwrap();
		assert!(manifest.servers.is_empty());
	}

	#[test]
	fn test_unparseable_is_fatal() {
		assert!(matches!(
			Manifest::parse("{not json", "m.json"),
			Err(ManifestError::Malformed { .. })
		));
		assert!(matches!(
			Manifest::parse(r#"{"other": []}"#, "m.json"),
			Err(ManifestError::Malformed { .. })
		));
	}

	#[test]
	fn test_transports_default_to_both() {
		let manifest = Manifest::parse(
			r#"[
				{"id": "any", "command": "a"},
				{"id": "cli", "command": "b", "supportedTransports": ["stdio"]},
				{"id": "none", "command": "c", "supportedTransports": []},
				{"id": "odd", "command": "d", "supportedTransports": ["carrier-pigeon"]}
			]"#,
			"m.json",
		)
		.unwrap();

		assert_eq!(manifest.servers.len(), 2);
		assert!(manifest.servers[0].supports(TransportMode::Http));
		assert!(manifest.servers[1].supports(TransportMode::Stdio));
		assert!(!manifest.servers[1].supports(TransportMode::Http));
		assert_eq!(manifest.rejected.len(), 2);
		assert!(manifest.rejected[0]
			.to_string()
			.contains("must support at least one transport mode"));
	}

	#[test]
	fn test_instructions_are_appended_in_order() {
		let manifest = Manifest::parse(
			r#"[
				{"id": "ctx", "command": "a", "instructions": "Use context tools first."},
				{"id": "quiet", "command": "b", "instructions": "   "},
				{"id": "sec", "command": "c", "instructions": "Use security tools for audits."}
			]"#,
			"m.json",
		)
		.unwrap();
		assert_eq!(manifest.servers[1].instructions, None);
		assert_eq!(
			compose_instructions("Base.", &manifest.servers),
			"Base. Use context tools first. Use security tools for audits."
		);
		assert_eq!(compose_instructions("Base.", std::iter::empty()), "Base.");
	}

	#[test]
	fn test_missing_file_is_empty() {
		let temp = tempfile::tempdir().unwrap();
		let manifest = Manifest::load(&temp.path().join("absent.json")).unwrap();
		assert!(manifest.is_empty());
	}

	#[test]
	fn test_load_from_file() {
		let temp = tempfile::tempdir().unwrap();
		let path = temp.path().join("servers.json");
		std::fs::write(
			&path,
			r#"{"servers": [{"id": "echo", "command": "echo-server", "env": {"A": "1"}, "workingDirectory": "/tmp"}]}"#,
		)
		.unwrap();
		let manifest = Manifest::load(&path).unwrap();
		let spec = &manifest.servers[0];
		assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
		assert_eq!(spec.working_directory, Some(PathBuf::from("/tmp")));
	}
}
