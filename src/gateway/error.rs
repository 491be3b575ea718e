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

//! Error taxonomy shared by every gateway component.

use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

use crate::mcp::types::{
	JsonRpcError, BACKEND_UNAVAILABLE, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
	METHOD_NOT_FOUND, SERVER_NOT_INITIALIZED,
};

/// Problems found while loading the proxied-server manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
	#[error("failed to read manifest {}: {source}", path.display())]
	Unreadable {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("manifest {path} is not valid: {reason}")]
	Malformed { path: String, reason: String },

	#[error("manifest entry #{index} ({id}): {reason}")]
	InvalidEntry {
		index: usize,
		id: String,
		required: bool,
		reason: String,
	},
}

impl ManifestError {
	/// A rejected entry marked `required` aborts startup.
	pub fn is_required(&self) -> bool {
		match self {
			ManifestError::InvalidEntry { required, .. } => *required,
			_ => true,
		}
	}
}

#[derive(Debug, Error)]
pub enum GatewayError {
	#[error("Unknown tool: {0}")]
	UnknownTool(String),

	/// Tool exists but is hidden from a read-only session
	#[error("Tool not found: {0}")]
	ToolNotFound(String),

	#[error("Backend '{backend}' unavailable: {reason}")]
	BackendUnavailable { backend: String, reason: String },

	/// Structured error reported by the backend itself, passed through as-is.
	#[error("Backend error {}: {}", .0.code, .0.message)]
	BackendError(JsonRpcError),

	#[error("Handshake with '{backend}' failed: {reason}")]
	HandshakeFailure { backend: String, reason: String },

	#[error(transparent)]
	Manifest(#[from] ManifestError),

	#[error("Duplicate request id {0} in session")]
	DuplicateRequestId(String),

	#[error("Session {0} is closed")]
	SessionClosed(String),

	#[error("Invalid params: {0}")]
	InvalidParams(String),

	#[error("Session not initialized")]
	NotInitialized,
}

impl GatewayError {
	pub fn unavailable(backend: &str, reason: impl Into<String>) -> Self {
		GatewayError::BackendUnavailable {
			backend: backend.to_string(),
			reason: reason.into(),
		}
	}

	/// JSON-RPC error object sent to the client.
	///
	/// `SessionClosed` never reaches a client; it maps to an internal error
	/// only so the conversion is total.
	pub fn to_rpc_error(&self) -> JsonRpcError {
		match self {
			GatewayError::UnknownTool(name) => {
				JsonRpcError::new(INVALID_PARAMS, format!("Unknown tool: {}", name))
					.with_data(json!({ "tool": name }))
			}
			GatewayError::ToolNotFound(name) => {
				JsonRpcError::new(METHOD_NOT_FOUND, format!("Tool not found: {}", name))
			}
			GatewayError::BackendUnavailable { backend, reason } => JsonRpcError::new(
				BACKEND_UNAVAILABLE,
				format!("Backend '{}' unavailable: {}", backend, reason),
			)
			.with_data(json!({ "backend": backend })),
			GatewayError::BackendError(error) => error.clone(),
			GatewayError::DuplicateRequestId(id) => JsonRpcError::new(
				INVALID_REQUEST,
				format!("Request id {} is already in flight for this session", id),
			),
			GatewayError::InvalidParams(reason) => {
				JsonRpcError::new(INVALID_PARAMS, format!("Invalid params: {}", reason))
			}
			GatewayError::NotInitialized => JsonRpcError::new(
				SERVER_NOT_INITIALIZED,
				"Session not initialized: send 'initialize' first",
			),
			GatewayError::HandshakeFailure { .. }
			| GatewayError::Manifest(_)
			| GatewayError::SessionClosed(_) => JsonRpcError::new(INTERNAL_ERROR, self.to_string()),
		}
	}
}
