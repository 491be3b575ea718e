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

//! Streamable HTTP transport: one JSON-RPC message per `POST /mcp`.
//!
//! Connections carry a single request each and are closed after the reply.

use anyhow::Result;
use serde_json::Value;
use std::future::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::parse_flag;
use crate::constants::{MCP_ENDPOINT, MCP_MAX_REQUEST_SIZE, READ_ONLY_HEADER, SESSION_HEADER};
use crate::gateway::{Gateway, SessionOptions};
use crate::mcp::logging::log_critical_error;
use crate::mcp::types::{
	JsonRpcError, JsonRpcMessage, JsonRpcResponse, INVALID_REQUEST, PARSE_ERROR,
};

const MAX_HEADER_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 8192;

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: POST, GET, DELETE, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type, Accept, Mcp-Session-Id, Mcp-Read-Only\r\nAccess-Control-Expose-Headers: Mcp-Session-Id\r\n";

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
	pub method: String,
	pub path: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

impl HttpRequest {
	/// Case-insensitive header lookup
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}

	/// HTTP sessions expire when idle; the read-only header narrows the
	/// catalog for this request and, on `initialize`, for the session
	pub fn session_options(&self) -> SessionOptions {
		SessionOptions {
			read_only: self
				.header(READ_ONLY_HEADER)
				.is_some_and(|value| parse_flag(value).unwrap_or(false)),
			expires_when_idle: true,
		}
	}

	/// True when the client only takes `text/event-stream`
	pub fn wants_event_stream(&self) -> bool {
		match self.header("accept") {
			Some(accept) => {
				let accept = accept.to_ascii_lowercase();
				accept.contains("text/event-stream") && !accept.contains("application/json")
			}
			None => false,
		}
	}
}

/// Why a request could not be read off the socket.
#[derive(Debug, PartialEq)]
pub enum ReadError {
	Closed,
	Malformed(&'static str),
	TooLarge,
}

struct HttpResponse {
	status: u16,
	content_type: Option<&'static str>,
	session_id: Option<String>,
	extra: Option<&'static str>,
	body: Vec<u8>,
}

impl HttpResponse {
	fn text(status: u16, message: &str) -> Self {
		Self {
			status,
			content_type: Some("text/plain"),
			session_id: None,
			extra: None,
			body: message.as_bytes().to_vec(),
		}
	}

	fn empty(status: u16) -> Self {
		Self {
			status,
			content_type: None,
			session_id: None,
			extra: None,
			body: Vec::new(),
		}
	}

	fn rpc(status: u16, response: &JsonRpcResponse, event_stream: bool) -> Result<Self> {
		let json = serde_json::to_string(response)?;
		let (content_type, body) = if event_stream {
			("text/event-stream", format!("event: message\ndata: {}\n\n", json))
		} else {
			("application/json", json)
		};
		Ok(Self {
			status,
			content_type: Some(content_type),
			session_id: None,
			extra: None,
			body: body.into_bytes(),
		})
	}

	fn with_session(mut self, session_id: Option<String>) -> Self {
		self.session_id = session_id;
		self
	}
}

pub struct McpHttpServer {
	gateway: Gateway,
	bind_addr: String,
	debug: bool,
}

impl McpHttpServer {
	pub fn new(gateway: Gateway, bind_addr: String, debug: bool) -> Self {
		Self {
			gateway,
			bind_addr,
			debug,
		}
	}

	/// Bind and serve until Ctrl-C.
	pub async fn run(&self) -> Result<()> {
		let listener = TcpListener::bind(&self.bind_addr)
			.await
			.map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.bind_addr, e))?;

		if self.debug {
			eprintln!(
				"MCP gateway listening on http://{}{}",
				self.bind_addr, MCP_ENDPOINT
			);
		}

		self.serve(listener, async {
			if let Err(e) = tokio::signal::ctrl_c().await {
				warn!(error = %e, "Failed to listen for Ctrl-C");
				std::future::pending::<()>().await;
			}
		})
		.await
	}

	/// Accept connections on `listener` until `shutdown` resolves.
	pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
	where
		F: Future<Output = ()>,
	{
		let local_addr = listener.local_addr()?;
		info!(address = %local_addr, "HTTP transport started");

		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					match accepted {
						Ok((stream, addr)) => {
							let gateway = self.gateway.clone();
							tokio::spawn(async move {
								if let Err(e) = handle_connection(stream, gateway).await {
									debug!("Connection error from {}: {}", addr, e);
								}
							});
						}
						Err(e) => {
							log_critical_error("HTTP accept error", &e);
							break;
						}
					}
				}
				_ = &mut shutdown => {
					info!("HTTP transport shutting down");
					break;
				}
			}
		}

		Ok(())
	}
}

async fn handle_connection(mut stream: TcpStream, gateway: Gateway) -> Result<()> {
	let request = match read_request(&mut stream).await {
		Ok(request) => request,
		Err(ReadError::Closed) => return Ok(()),
		Err(ReadError::TooLarge) => {
			return send_response(
				&mut stream,
				HttpResponse::text(413, "Request body exceeds the size limit"),
			)
			.await;
		}
		Err(ReadError::Malformed(reason)) => {
			return send_response(&mut stream, HttpResponse::text(400, reason)).await;
		}
	};

	debug!(method = %request.method, path = %request.path, "HTTP request");

	let path = request.path.split('?').next().unwrap_or_default();
	if request.method == "OPTIONS" {
		return send_response(&mut stream, HttpResponse::empty(204)).await;
	}
	if path != MCP_ENDPOINT {
		return send_response(
			&mut stream,
			HttpResponse::text(404, &format!("Not found. Use {}", MCP_ENDPOINT)),
		)
		.await;
	}

	match request.method.as_str() {
		"POST" => handle_post(&mut stream, &gateway, request).await,
		"DELETE" => {
			let response = match request.header(SESSION_HEADER) {
				None => HttpResponse::text(400, "Missing Mcp-Session-Id header"),
				Some(id) if gateway.close_session(id) => {
					info!(session_id = %id, "Session closed by client");
					HttpResponse::empty(200)
				}
				Some(_) => HttpResponse::text(404, "Unknown session"),
			};
			send_response(&mut stream, response).await
		}
		_ => {
			let mut response = HttpResponse::text(405, "Method not allowed");
			response.extra = Some("Allow: POST, DELETE, OPTIONS\r\n");
			send_response(&mut stream, response).await
		}
	}
}

async fn handle_post(stream: &mut TcpStream, gateway: &Gateway, request: HttpRequest) -> Result<()> {
	let event_stream = request.wants_event_stream();

	let value: Value = match serde_json::from_slice(&request.body) {
		Ok(value) => value,
		Err(e) => {
			let error = JsonRpcError::new(PARSE_ERROR, format!("Parse error: {}", e));
			let response = JsonRpcResponse::failure(None, error);
			return send_response(stream, HttpResponse::rpc(400, &response, event_stream)?).await;
		}
	};

	if value.is_array() {
		let error = JsonRpcError::new(INVALID_REQUEST, "Batch requests are not supported");
		let response = JsonRpcResponse::failure(None, error);
		return send_response(stream, HttpResponse::rpc(400, &response, event_stream)?).await;
	}

	let id = value.get("id").cloned();
	let message: JsonRpcMessage = match serde_json::from_value(value) {
		Ok(message) => message,
		Err(e) => {
			let error = JsonRpcError::new(INVALID_REQUEST, format!("Invalid request: {}", e));
			let response = JsonRpcResponse::failure(id, error);
			return send_response(stream, HttpResponse::rpc(400, &response, event_stream)?).await;
		}
	};

	let session_header = request.header(SESSION_HEADER);
	if let Some(id) = session_header {
		let reinitializing = matches!(&message, JsonRpcMessage::Request(r) if r.method == "initialize");
		if !reinitializing && !gateway.has_session(id) {
			return send_response(stream, HttpResponse::text(404, "Unknown session")).await;
		}
	}

	match message {
		JsonRpcMessage::Request(rpc) => {
			let session_id = if rpc.method == "initialize" {
				if let Some(previous) = session_header {
					gateway.close_session(previous);
				}
				None
			} else {
				match session_header {
					Some(id) => Some(id),
					None => {
						return send_response(
							stream,
							HttpResponse::text(400, "Missing Mcp-Session-Id header"),
						)
						.await;
					}
				}
			};

			let prepared = gateway.prepare_with(session_id, rpc, request.session_options());
			let reply = prepared.run().await;
			let result = match &reply.response {
				Some(response) => {
					let http = HttpResponse::rpc(200, response, event_stream)?
						.with_session(reply.session_id.clone());
					send_response(stream, http).await
				}
				None => send_response(stream, HttpResponse::text(404, "Session closed")).await,
			};
			// Next ordered reply may go once this one is on the wire
			drop(reply.turn);
			result
		}
		JsonRpcMessage::Notification(notification) => {
			gateway.handle_notification(session_header, &notification);
			send_response(stream, HttpResponse::empty(202)).await
		}
		JsonRpcMessage::Response(response) => {
			debug!(id = %response.id, "Ignoring response from client");
			send_response(stream, HttpResponse::empty(202)).await
		}
	}
}

/// Read one request: headers up to the blank line, then `Content-Length`
/// bytes of body.
pub async fn read_request<S>(stream: &mut S) -> Result<HttpRequest, ReadError>
where
	S: tokio::io::AsyncRead + Unpin,
{
	let mut buffer = Vec::with_capacity(READ_CHUNK);
	let mut chunk = vec![0; READ_CHUNK];

	let (head_end, body_start) = loop {
		if let Some(split) = find_header_end(&buffer) {
			break split;
		}
		if buffer.len() > MAX_HEADER_SIZE {
			return Err(ReadError::Malformed("Request headers too large"));
		}
		let read = stream.read(&mut chunk).await.map_err(|_| ReadError::Closed)?;
		if read == 0 {
			return if buffer.is_empty() {
				Err(ReadError::Closed)
			} else {
				Err(ReadError::Malformed("Invalid HTTP request format"))
			};
		}
		buffer.extend_from_slice(&chunk[..read]);
	};

	let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
	let (method, path, headers) = parse_head(&head)?;

	let content_length = match headers
		.iter()
		.find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
	{
		Some((_, value)) => value
			.trim()
			.parse::<usize>()
			.map_err(|_| ReadError::Malformed("Invalid Content-Length"))?,
		None => 0,
	};
	if content_length > MCP_MAX_REQUEST_SIZE {
		return Err(ReadError::TooLarge);
	}

	let mut body = buffer.split_off(body_start.min(buffer.len()));
	while body.len() < content_length {
		let read = stream.read(&mut chunk).await.map_err(|_| ReadError::Closed)?;
		if read == 0 {
			return Err(ReadError::Malformed("Request body shorter than Content-Length"));
		}
		body.extend_from_slice(&chunk[..read]);
	}
	body.truncate(content_length);

	Ok(HttpRequest {
		method,
		path,
		headers,
		body,
	})
}

/// Returns (end of headers, start of body)
fn find_header_end(buffer: &[u8]) -> Option<(usize, usize)> {
	if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
		return Some((pos, pos + 4));
	}
	buffer
		.windows(2)
		.position(|w| w == b"\n\n")
		.map(|pos| (pos, pos + 2))
}

type RequestHead = (String, String, Vec<(String, String)>);

fn parse_head(head: &str) -> Result<RequestHead, ReadError> {
	let mut lines = head.lines();
	let request_line = lines.next().unwrap_or("");
	let mut parts = request_line.split_whitespace();
	let (method, path) = match (parts.next(), parts.next(), parts.next()) {
		(Some(method), Some(path), Some(version)) if version.starts_with("HTTP/") => {
			(method.to_ascii_uppercase(), path.to_string())
		}
		_ => return Err(ReadError::Malformed("Invalid HTTP request line")),
	};

	let mut headers = Vec::new();
	for line in lines {
		if line.trim().is_empty() {
			continue;
		}
		let Some((name, value)) = line.split_once(':') else {
			return Err(ReadError::Malformed("Invalid HTTP header"));
		};
		headers.push((name.trim().to_string(), value.trim().to_string()));
	}

	Ok((method, path, headers))
}

fn status_text(status: u16) -> &'static str {
	match status {
		200 => "OK",
		202 => "Accepted",
		204 => "No Content",
		400 => "Bad Request",
		404 => "Not Found",
		405 => "Method Not Allowed",
		413 => "Payload Too Large",
		500 => "Internal Server Error",
		_ => "Error",
	}
}

async fn send_response(stream: &mut TcpStream, response: HttpResponse) -> Result<()> {
	let mut head = format!(
		"HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n{}",
		response.status,
		status_text(response.status),
		response.body.len(),
		CORS_HEADERS
	);
	if let Some(content_type) = response.content_type {
		head.push_str(&format!("Content-Type: {}\r\n", content_type));
	}
	if let Some(session_id) = &response.session_id {
		head.push_str(&format!("{}: {}\r\n", SESSION_HEADER, session_id));
	}
	if let Some(extra) = response.extra {
		head.push_str(extra);
	}
	head.push_str("\r\n");

	stream.write_all(head.as_bytes()).await?;
	stream.write_all(&response.body).await?;
	stream.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::gateway::Manifest;
	use serde_json::json;
	use tokio::sync::oneshot;

	#[test]
	fn test_parse_head() {
		let (method, path, headers) = parse_head(
			"post /mcp HTTP/1.1\r\nHost: localhost\r\nmcp-session-id: abc\r\nContent-Length: 2",
		)
		.unwrap();
		assert_eq!(method, "POST");
		assert_eq!(path, "/mcp");
		assert_eq!(headers.len(), 3);

		assert_eq!(
			parse_head("GARBAGE").unwrap_err(),
			ReadError::Malformed("Invalid HTTP request line")
		);
	}

	#[test]
	fn test_accept_negotiation() {
		let mut request = HttpRequest {
			method: "POST".into(),
			path: "/mcp".into(),
			headers: vec![("Accept".into(), "application/json, text/event-stream".into())],
			body: Vec::new(),
		};
		assert!(!request.wants_event_stream());
		request.headers[0].1 = "text/event-stream".into();
		assert!(request.wants_event_stream());
		assert_eq!(request.header("ACCEPT"), Some("text/event-stream"));
	}

	#[test]
	fn test_read_only_header() {
		let mut request = HttpRequest {
			method: "POST".into(),
			path: "/mcp".into(),
			headers: Vec::new(),
			body: Vec::new(),
		};
		let options = request.session_options();
		assert!(!options.read_only);
		assert!(options.expires_when_idle);

		request.headers.push(("mcp-read-only".into(), "true".into()));
		assert!(request.session_options().read_only);
		request.headers[0].1 = "maybe".into();
		assert!(!request.session_options().read_only);
	}

	#[tokio::test]
	async fn test_read_request_split_body() {
		let (mut client, mut server) = tokio::io::duplex(1024);
		let writer = tokio::spawn(async move {
			client
				.write_all(b"POST /mcp HTTP/1.1\r\nContent-Length: 11\r\n\r\n{\"a\":")
				.await
				.unwrap();
			client.write_all(b"true}extra").await.unwrap();
		});
		let request = read_request(&mut server).await.unwrap();
		writer.await.unwrap();
		assert_eq!(request.body, b"{\"a\":true}e");
	}

	#[tokio::test]
	async fn test_oversized_body_rejected() {
		let (mut client, mut server) = tokio::io::duplex(1024);
		let head = format!(
			"POST /mcp HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
			MCP_MAX_REQUEST_SIZE + 1
		);
		client.write_all(head.as_bytes()).await.unwrap();
		assert_eq!(read_request(&mut server).await.unwrap_err(), ReadError::TooLarge);
	}

	async fn exchange(addr: std::net::SocketAddr, raw: String) -> (u16, String, String) {
		let mut stream = TcpStream::connect(addr).await.unwrap();
		stream.write_all(raw.as_bytes()).await.unwrap();
		let mut response = Vec::new();
		stream.read_to_end(&mut response).await.unwrap();
		let response = String::from_utf8(response).unwrap();
		let (head, body) = response.split_once("\r\n\r\n").unwrap();
		let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
		(status, head.to_string(), body.to_string())
	}

	fn post(body: &Value, session: Option<&str>, accept: &str) -> String {
		let body = body.to_string();
		let session = session
			.map(|id| format!("Mcp-Session-Id: {}\r\n", id))
			.unwrap_or_default();
		format!(
			"POST /mcp HTTP/1.1\r\nHost: localhost\r\nAccept: {}\r\nContent-Type: application/json\r\n{}Content-Length: {}\r\n\r\n{}",
			accept,
			session,
			body.len(),
			body
		)
	}

	#[tokio::test]
	async fn test_http_session_lifecycle() {
		let gateway = Gateway::start(&Config::default(), Manifest::default(), None)
			.await
			.unwrap();
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (stop_tx, stop_rx) = oneshot::channel::<()>();
		let server = McpHttpServer::new(gateway.clone(), addr.to_string(), false);
		let serving = tokio::spawn(async move {
			server
				.serve(listener, async {
					let _ = stop_rx.await;
				})
				.await
		});

		let json_accept = "application/json, text/event-stream";
		let (status, head, body) = exchange(
			addr,
			post(
				&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
				None,
				json_accept,
			),
		)
		.await;
		assert_eq!(status, 200);
		let session_line = head
			.lines()
			.find(|l| l.to_ascii_lowercase().starts_with("mcp-session-id:"))
			.expect("session header");
		let session = session_line.split_once(':').unwrap().1.trim().to_string();
		let init: Value = serde_json::from_str(&body).unwrap();
		assert_eq!(init["id"], 1);

		// Requests without a session are refused
		let (status, _, _) = exchange(
			addr,
			post(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}), None, json_accept),
		)
		.await;
		assert_eq!(status, 400);

		let (status, _, _) = exchange(
			addr,
			post(
				&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
				Some(&session),
				json_accept,
			),
		)
		.await;
		assert_eq!(status, 202);

		// Event-stream only clients get the reply as one SSE event
		let (status, head, body) = exchange(
			addr,
			post(
				&json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}),
				Some(&session),
				"text/event-stream",
			),
		)
		.await;
		assert_eq!(status, 200);
		assert!(head.contains("Content-Type: text/event-stream"));
		let data = body
			.lines()
			.find_map(|l| l.strip_prefix("data: "))
			.unwrap();
		let ping: Value = serde_json::from_str(data).unwrap();
		assert_eq!(ping["id"], 3);

		let (status, _, _) = exchange(
			addr,
			format!("GET /mcp HTTP/1.1\r\nMcp-Session-Id: {}\r\n\r\n", session),
		)
		.await;
		assert_eq!(status, 405);

		let (status, _, _) = exchange(
			addr,
			format!("DELETE /mcp HTTP/1.1\r\nMcp-Session-Id: {}\r\n\r\n", session),
		)
		.await;
		assert_eq!(status, 200);
		assert_eq!(gateway.session_count(), 0);

		let (status, _, _) = exchange(
			addr,
			post(
				&json!({"jsonrpc": "2.0", "id": 4, "method": "tools/list"}),
				Some(&session),
				json_accept,
			),
		)
		.await;
		assert_eq!(status, 404);

		let (status, _, _) = exchange(addr, "POST /other HTTP/1.1\r\n\r\n".to_string()).await;
		assert_eq!(status, 404);

		stop_tx.send(()).unwrap();
		serving.await.unwrap().unwrap();
		gateway.shutdown().await;
	}
}
