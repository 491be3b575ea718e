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

//! Application-wide constants

/// Per-project data directory holding config, manifest and logs
pub const DATA_DIR: &str = ".mcp-gateway";

/// Name reported in `serverInfo`
pub const SERVER_NAME: &str = "mcp-gateway";

/// Protocol revisions the gateway speaks, newest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Revision the gateway uses when talking to proxied servers
pub const CLIENT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Maximum request body accepted over HTTP (10MB)
pub const MCP_MAX_REQUEST_SIZE: usize = 10_485_760;

/// HTTP endpoint path for the streamable transport
pub const MCP_ENDPOINT: &str = "/mcp";

/// Session header assigned on `initialize`
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Recent stderr lines retained per proxied process
pub const STDERR_TAIL_LINES: usize = 50;

/// Shard count of the in-flight request table
pub const INFLIGHT_SHARDS: usize = 16;

/// Tool name length limit
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Upper bound on `tools/list` pages fetched from one backend
pub const MAX_TOOL_PAGES: usize = 100;

/// HTTP header that asks for a read-only session on `initialize`
pub const READ_ONLY_HEADER: &str = "Mcp-Read-Only";
