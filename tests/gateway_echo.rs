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

//! End-to-end tests against the bundled `mcp-echo-server` binary.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use mcp_gateway::analysis::{AnalysisEngine, RuleEngine};
use mcp_gateway::config::{AnalysisConfig, Config};
use mcp_gateway::gateway::{wait_for_catalog, Gateway, GatewayError, LifecycleState, Manifest};
use mcp_gateway::mcp::types::{IncomingRequest, BACKEND_UNAVAILABLE};
use mcp_gateway::mcp::McpServer;

const ECHO_BIN: &str = env!("CARGO_BIN_EXE_mcp-echo-server");

fn entry(id: &str, args: &[&str]) -> Value {
	json!({
		"id": id,
		"namespace": id,
		"command": ECHO_BIN,
		"args": args,
	})
}

fn manifest(entries: Vec<Value>) -> Manifest {
	Manifest::parse(&Value::Array(entries).to_string(), "test").unwrap()
}

fn fast_config() -> Config {
	let mut config = Config::default();
	config.timeouts.readiness_ms = 10_000;
	config.timeouts.handshake_ms = 5_000;
	config.timeouts.request_ms = 5_000;
	config.timeouts.termination_ms = 500;
	config.restart.backoff_base_ms = 20;
	config.restart.backoff_max_ms = 100;
	config
}

fn analysis_engine() -> Arc<dyn AnalysisEngine> {
	Arc::new(RuleEngine::new(&AnalysisConfig::default()).unwrap())
}

fn request(id: Value, method: &str, params: Value) -> IncomingRequest {
	IncomingRequest {
		id,
		method: method.to_string(),
		params: Some(params),
	}
}

async fn open_session(gateway: &Gateway) -> String {
	let reply = gateway
		.handle_request(None, request(json!(0), "initialize", json!({})))
		.await;
	reply.session_id.expect("initialize opens a session")
}

async fn call(gateway: &Gateway, session: &str, id: i64, tool: &str, arguments: Value) -> Value {
	let reply = gateway
		.handle_request(
			Some(session),
			request(json!(id), "tools/call", json!({"name": tool, "arguments": arguments})),
		)
		.await;
	serde_json::to_value(reply.response.expect("response")).unwrap()
}

async fn wait_for_state(gateway: &Gateway, backend: &str, state: LifecycleState, limit: Duration) -> bool {
	let deadline = tokio::time::Instant::now() + limit;
	while tokio::time::Instant::now() < deadline {
		if gateway.backend(backend).map(|b| b.state()) == Some(state) {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	false
}

#[tokio::test]
async fn test_ping_routes_to_echo() {
	let manifest = manifest(vec![entry("echo", &["--tools", "ping"])]);
	let gateway = Gateway::start(&fast_config(), manifest, None).await.unwrap();

	assert!(
		wait_for_catalog(&gateway, Duration::from_secs(10), |c| c.get("ping").is_some()).await,
		"echo tools never published"
	);
	assert_eq!(gateway.catalog().get("ping").unwrap().backend_id, "echo");

	let session = open_session(&gateway).await;
	let response = call(&gateway, &session, 1, "ping", json!({})).await;
	assert_eq!(response["id"], 1);
	assert_eq!(response["result"], json!({"pong": true}));

	gateway.shutdown().await;
}

#[tokio::test]
async fn test_lazy_server_starts_on_first_call() {
	let manifest = manifest(vec![entry("echo", &["--tools", "ping"])]);
	let mut config = fast_config();
	config.proxy.eager_start = false;
	let gateway = Gateway::start(&config, manifest, None).await.unwrap();

	// Tools are known from discovery while the process itself waits
	assert_eq!(gateway.catalog().get("ping").unwrap().backend_id, "echo");
	assert_eq!(gateway.backend("echo").unwrap().state(), LifecycleState::NotStarted);

	let session = open_session(&gateway).await;
	let response = call(&gateway, &session, 1, "ping", json!({})).await;
	assert_eq!(response["result"], json!({"pong": true}));
	assert_eq!(gateway.backend("echo").unwrap().state(), LifecycleState::Ready);

	gateway.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_first_calls_share_one_start() {
	let manifest = manifest(vec![entry("echo", &["--tools", "ping"])]);
	let mut config = fast_config();
	config.proxy.eager_start = false;
	let gateway = Gateway::start(&config, manifest, None).await.unwrap();
	let session = open_session(&gateway).await;

	let calls = (1..=5).map(|id| call(&gateway, &session, id, "ping", json!({})));
	for response in futures::future::join_all(calls).await {
		assert_eq!(response["result"], json!({"pong": true}));
	}

	let status = gateway
		.backend_status()
		.into_iter()
		.find(|s| s.id == "echo")
		.unwrap();
	assert_eq!(status.state, LifecycleState::Ready);
	assert_eq!(status.restarts, 0);

	gateway.shutdown().await;
}

#[tokio::test]
async fn test_manifest_transport_filter_and_instructions() {
	let mut web = entry("web", &["--tools", "ping"]);
	web["supportedTransports"] = json!(["http"]);
	web["instructions"] = json!("Web tools need a browser.");
	let mut cli = entry("cli", &["--tools", "search"]);
	cli["supportedTransports"] = json!(["stdio"]);
	cli["instructions"] = json!("Search before asking.");

	// Default transport is stdio
	let gateway = Gateway::start(&fast_config(), manifest(vec![web, cli]), None)
		.await
		.unwrap();
	assert!(gateway.backend("web").is_none());
	assert!(gateway.catalog().get("search").is_some());
	assert!(gateway.catalog().get("ping").is_none());

	let reply = gateway
		.handle_request(None, request(json!(0), "initialize", json!({})))
		.await;
	let result = reply.response.unwrap().result.unwrap();
	let instructions = result["instructions"].as_str().unwrap();
	assert!(instructions.ends_with(". Search before asking."));
	assert!(!instructions.contains("browser"));

	gateway.shutdown().await;
}

#[tokio::test]
async fn test_colliding_tools_are_namespaced() {
	let manifest = manifest(vec![
		entry("echo", &["--tools", "search", "--name", "first"]),
		entry("aux", &["--tools", "search", "--name", "second"]),
	]);
	let mut config = fast_config();
	config.proxy.eager_start = true;
	let gateway = Gateway::start(&config, manifest, Some(analysis_engine()))
		.await
		.unwrap();

	assert!(
		wait_for_catalog(&gateway, Duration::from_secs(10), |c| {
			c.get("search").is_some() && c.get("aux/search").is_some()
		})
		.await
	);
	let catalog = gateway.catalog();
	assert_eq!(catalog.get("search").unwrap().backend_id, "echo");
	assert_eq!(catalog.get("aux/search").unwrap().origin_name, "search");
	assert!(catalog.get("analyze_code_snippet").is_some());

	let session = open_session(&gateway).await;
	let first = call(&gateway, &session, 1, "search", json!({"query": "q"})).await;
	let second = call(&gateway, &session, 2, "aux/search", json!({"query": "q"})).await;
	let text = |v: &Value| v["result"]["content"][0]["text"].as_str().unwrap().to_string();
	assert!(text(&first).starts_with("first:"));
	assert!(text(&second).starts_with("second:"));

	gateway.shutdown().await;
}

#[tokio::test]
async fn test_crash_mid_call_reports_unavailable_and_recovers() {
	let manifest = manifest(vec![entry("echo", &["--tools", "ping,crash"])]);
	let gateway = Gateway::start(&fast_config(), manifest, None).await.unwrap();
	assert!(wait_for_state(&gateway, "echo", LifecycleState::Ready, Duration::from_secs(10)).await);

	let session = open_session(&gateway).await;
	let crashed = call(&gateway, &session, 1, "crash", json!({})).await;
	assert_eq!(crashed["error"]["code"], BACKEND_UNAVAILABLE);

	// Supervisor restarts it in the background
	let restarted = async {
		loop {
			let status = gateway
				.backend_status()
				.into_iter()
				.find(|s| s.id == "echo")
				.unwrap();
			if status.restarts >= 1 && status.state == LifecycleState::Ready {
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	};
	tokio::time::timeout(Duration::from_secs(10), restarted)
		.await
		.expect("echo server was not restarted");

	let pong = call(&gateway, &session, 2, "ping", json!({})).await;
	assert_eq!(pong["result"]["pong"], true);

	gateway.shutdown().await;
}

#[tokio::test]
async fn test_unhealthy_server_is_terminated() {
	let manifest = manifest(vec![entry("echo", &["--tools", "ping", "--fail-ping"])]);
	let mut config = fast_config();
	config.timeouts.health_interval_ms = 50;
	config.timeouts.health_probe_ms = 100;
	config.restart.max_failures = 2;
	let gateway = Gateway::start(&config, manifest, None).await.unwrap();

	assert!(
		wait_for_state(&gateway, "echo", LifecycleState::Terminated, Duration::from_secs(15)).await,
		"server ignoring pings should be given up on"
	);

	let session = open_session(&gateway).await;
	let response = call(&gateway, &session, 1, "ping", json!({})).await;
	assert_eq!(response["error"]["code"], BACKEND_UNAVAILABLE);

	gateway.shutdown().await;
}

#[tokio::test]
async fn test_local_and_proxied_calls_overlap() {
	let manifest = manifest(vec![entry("echo", &["--tools", "sleep"])]);
	let gateway = Gateway::start(&fast_config(), manifest, Some(analysis_engine()))
		.await
		.unwrap();
	assert!(wait_for_catalog(&gateway, Duration::from_secs(10), |c| c.get("sleep").is_some()).await);

	let session = open_session(&gateway).await;
	let started = tokio::time::Instant::now();
	let (slow, analysis) = tokio::join!(
		call(&gateway, &session, 1, "sleep", json!({"ms": 300})),
		call(
			&gateway,
			&session,
			2,
			"analyze_code_snippet",
			json!({"codeSnippet": "let x = 1; \n", "language": "rust"})
		),
	);
	assert!(slow["result"].is_object());
	assert_eq!(analysis["result"]["isError"], false);
	assert!(started.elapsed() < Duration::from_secs(3));

	gateway.shutdown().await;
}

#[tokio::test]
async fn test_required_server_that_cannot_start_aborts() {
	let manifest = manifest(vec![json!({
		"id": "broken",
		"command": "/nonexistent/mcp-server-binary",
		"required": true
	})]);
	let mut config = fast_config();
	config.timeouts.readiness_ms = 3_000;
	match Gateway::start(&config, manifest, None).await {
		Err(GatewayError::BackendUnavailable { backend, .. }) => assert_eq!(backend, "broken"),
		Err(other) => panic!("unexpected error: {}", other),
		Ok(_) => panic!("gateway started without its required server"),
	}
}

#[tokio::test]
async fn test_stdio_transport_end_to_end() {
	let manifest = manifest(vec![entry("echo", &["--tools", "ping,echo"])]);
	let gateway = Gateway::start(&fast_config(), manifest, None).await.unwrap();
	assert!(wait_for_catalog(&gateway, Duration::from_secs(10), |c| c.get("echo").is_some()).await);

	let (client, server) = tokio::io::duplex(64 * 1024);
	let (server_read, server_write) = tokio::io::split(server);
	let serving_gateway = gateway.clone();
	let serving = tokio::spawn(async move {
		McpServer::new(serving_gateway, false)
			.serve(server_read, server_write)
			.await
	});

	let (client_read, mut client_write) = tokio::io::split(client);
	let mut lines = BufReader::new(client_read).lines();
	let messages = [
		json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2025-03-26"}}),
		json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
		json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "echo", "arguments": {"n": 1}}}),
		json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "echo", "arguments": {"n": 2}}}),
	];
	for message in &messages {
		client_write
			.write_all(format!("{}\n", message).as_bytes())
			.await
			.unwrap();
	}

	let mut ids = Vec::new();
	while ids.len() < 3 {
		let line = lines.next_line().await.unwrap().unwrap();
		let value: Value = serde_json::from_str(&line).unwrap();
		if let Some(id) = value.get("id") {
			ids.push(id.as_i64().unwrap());
		}
	}
	// Same backend, same session: replies keep request order
	assert_eq!(ids, vec![1, 2, 3]);

	client_write.shutdown().await.unwrap();
	serving.await.unwrap().unwrap();
	gateway.shutdown().await;
}
