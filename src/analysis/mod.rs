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

//! Embedded analysis backend

pub mod local;
pub mod rules;

pub use local::LocalBackend;
pub use rules::RuleEngine;

use async_trait::async_trait;
use serde_json::Value;

use crate::mcp::types::{JsonRpcError, McpTool};

/// An in-process analysis engine exposed to clients as MCP tools.
///
/// `call` returns an MCP `CallToolResult` object. A structured error is
/// passed to the client unchanged.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
	fn name(&self) -> &str;

	fn tools(&self) -> Vec<McpTool>;

	async fn call(&self, tool: &str, arguments: Value) -> Result<Value, JsonRpcError>;
}

/// Wrap plain text as a `CallToolResult`
pub fn text_result(text: impl Into<String>, is_error: bool) -> Value {
	serde_json::json!({
		"content": [{ "type": "text", "text": text.into() }],
		"isError": is_error,
	})
}
