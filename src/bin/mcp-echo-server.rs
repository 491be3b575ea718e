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

//! Minimal MCP stdio server used to exercise the gateway's proxying.
//!
//! Tools: `ping`, `search`, `sleep`, `echo`, `fail` and `crash` (exits
//! without answering). Requests are served concurrently.

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use mcp_gateway::mcp::types::{
	JsonRpcError, JsonRpcMessage, JsonRpcResponse, McpTool, INVALID_PARAMS, METHOD_NOT_FOUND,
};

const ALL_TOOLS: &[&str] = &["ping", "search", "sleep", "echo", "fail", "crash"];

#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-echo-server")]
#[command(about = "Tiny MCP server for gateway tests")]
struct EchoArgs {
	/// Comma separated tools to expose
	#[arg(long, value_delimiter = ',', default_value = "ping")]
	tools: Vec<String>,

	/// Server name reported in initialize
	#[arg(long, default_value = "echo")]
	name: String,

	/// Never answer `ping` requests
	#[arg(long)]
	fail_ping: bool,
}

fn tool_definition(name: &str) -> Option<McpTool> {
	let tool = match name {
		"ping" => McpTool::new("ping", "Reply with pong", json!({"type": "object"})),
		"search" => McpTool::new(
			"search",
			"Pretend to search for a query",
			json!({
				"type": "object",
				"properties": {"query": {"type": "string"}},
				"required": ["query"]
			}),
		),
		"sleep" => McpTool::new(
			"sleep",
			"Wait for the given number of milliseconds",
			json!({"type": "object", "properties": {"ms": {"type": "integer"}}}),
		),
		"echo" => McpTool::new("echo", "Return the arguments", json!({"type": "object"})),
		"fail" => McpTool::new("fail", "Always fail", json!({"type": "object"})),
		"crash" => McpTool::new("crash", "Exit without replying", json!({"type": "object"})),
		_ => return None,
	};
	Some(tool)
}

async fn call_tool(args: &EchoArgs, name: &str, arguments: Value) -> Result<Value, JsonRpcError> {
	if !args.tools.iter().any(|t| t == name) {
		return Err(JsonRpcError::new(
			INVALID_PARAMS,
			format!("Unknown tool: {}", name),
		));
	}

	match name {
		"ping" => Ok(json!({"pong": true})),
		"search" => {
			let query = arguments.get("query").and_then(Value::as_str).unwrap_or("");
			Ok(json!({
				"content": [{"type": "text", "text": format!("{}: results for '{}'", args.name, query)}],
				"isError": false
			}))
		}
		"sleep" => {
			let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(100);
			tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
			Ok(json!({
				"content": [{"type": "text", "text": format!("slept {}ms", ms)}],
				"isError": false
			}))
		}
		"echo" => Ok(json!({
			"content": [{"type": "text", "text": arguments.to_string()}],
			"isError": false
		})),
		"fail" => Err(JsonRpcError::new(-32050, "Tool failed on purpose")
			.with_data(json!({"server": args.name}))),
		"crash" => {
			eprintln!("{}: crashing on request", args.name);
			std::process::exit(3);
		}
		_ => Err(JsonRpcError::new(
			INVALID_PARAMS,
			format!("Unknown tool: {}", name),
		)),
	}
}

async fn handle_request(args: &EchoArgs, method: &str, params: Value) -> Option<Result<Value, JsonRpcError>> {
	let outcome = match method {
		"initialize" => Ok(json!({
			"protocolVersion": params
				.get("protocolVersion")
				.cloned()
				.unwrap_or_else(|| json!("2024-11-05")),
			"capabilities": {"tools": {"listChanged": false}},
			"serverInfo": {"name": args.name, "version": env!("CARGO_PKG_VERSION")}
		})),
		"ping" if args.fail_ping => return None,
		"ping" => Ok(json!({})),
		"tools/list" => {
			let tools: Vec<McpTool> = args
				.tools
				.iter()
				.filter_map(|name| tool_definition(name))
				.collect();
			Ok(json!({ "tools": tools }))
		}
		"tools/call" => {
			let name = params.get("name").and_then(Value::as_str).unwrap_or("");
			let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
			call_tool(args, name, arguments).await
		}
		other => Err(JsonRpcError::new(
			METHOD_NOT_FOUND,
			format!("Method not found: {}", other),
		)),
	};
	Some(outcome)
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = EchoArgs::parse();
	for tool in &args.tools {
		if !ALL_TOOLS.contains(&tool.as_str()) {
			return Err(anyhow::anyhow!("Unsupported tool '{}'", tool));
		}
	}
	eprintln!("{}: serving {}", args.name, args.tools.join(","));

	let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
	let writer = tokio::spawn(async move {
		let mut stdout = tokio::io::stdout();
		while let Some(line) = out_rx.recv().await {
			if stdout.write_all(line.as_bytes()).await.is_err()
				|| stdout.write_all(b"\n").await.is_err()
				|| stdout.flush().await.is_err()
			{
				break;
			}
		}
	});

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let message: JsonRpcMessage = match serde_json::from_str(&line) {
			Ok(message) => message,
			Err(e) => {
				eprintln!("{}: bad message: {}", args.name, e);
				continue;
			}
		};

		let JsonRpcMessage::Request(request) = message else {
			continue;
		};

		let args = args.clone();
		let out = out_tx.clone();
		tokio::spawn(async move {
			let params = request.params.unwrap_or_else(|| json!({}));
			let Some(outcome) = handle_request(&args, &request.method, params).await else {
				return;
			};
			let response = match outcome {
				Ok(result) => JsonRpcResponse::success(Some(request.id), result),
				Err(error) => JsonRpcResponse::failure(Some(request.id), error),
			};
			if let Ok(json) = serde_json::to_string(&response) {
				let _ = out.send(json);
			}
		});
	}

	drop(out_tx);
	let _ = writer.await;
	Ok(())
}
