use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

// JSON-RPC error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const SERVER_NOT_INITIALIZED: i32 = -32002;
pub const BACKEND_UNAVAILABLE: i32 = -32001;

/// MCP Protocol types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
	pub jsonrpc: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<Value>,
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

impl JsonRpcRequest {
	pub fn new(id: Value, method: &str, params: Value) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id: Some(id),
			method: method.to_string(),
			params: Some(params),
		}
	}

	pub fn notification(method: &str, params: Option<Value>) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id: None,
			method: method.to_string(),
			params,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
	pub jsonrpc: String,
	pub id: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
	pub fn success(id: Option<Value>, result: Value) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id,
			result: None,
			error: Some(error),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
	pub code: i32,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl JsonRpcError {
	pub fn new(code: i32, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			data: None,
		}
	}

	pub fn with_data(mut self, data: Value) -> Self {
		self.data = Some(data);
		self
	}
}

/// Anything a peer can put on the wire. Variant order matters for the
/// untagged match: requests carry both `id` and `method`, notifications only
/// `method`, responses only `id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
	Request(IncomingRequest),
	Notification(IncomingNotification),
	Response(IncomingResponse),
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingRequest {
	pub id: Value,
	pub method: String,
	#[serde(default)]
	pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingNotification {
	pub method: String,
	#[serde(default)]
	pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingResponse {
	pub id: Value,
	#[serde(default)]
	pub result: Option<Value>,
	#[serde(default)]
	pub error: Option<JsonRpcError>,
}

/// MCP Tool definitions
///
/// Fields the gateway does not interpret (title, annotations, outputSchema)
/// are carried in `extra` so proxied tools keep them when re-advertised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(rename = "inputSchema", default = "default_input_schema")]
	pub input_schema: Value,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl McpTool {
	pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
		Self {
			name: name.to_string(),
			description: Some(description.to_string()),
			input_schema,
			extra: Map::new(),
		}
	}

	/// Annotate as side-effect free
	pub fn read_only(mut self) -> Self {
		self.extra.insert(
			"annotations".to_string(),
			serde_json::json!({ "readOnlyHint": true }),
		);
		self
	}
}

fn default_input_schema() -> Value {
	serde_json::json!({ "type": "object" })
}
