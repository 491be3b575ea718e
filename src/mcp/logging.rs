use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt::Layer, prelude::*, registry::Registry, EnvFilter};

use crate::constants::DATA_DIR;

static MCP_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize logging for the gateway with daily file rotation.
///
/// Nothing is ever written to stdout: in stdio mode stdout carries the
/// protocol stream only.
pub fn init_mcp_logging(base_dir: PathBuf, debug_mode: bool) -> Result<(), anyhow::Error> {
	// Create a unique log directory based on project path
	let project_hash = {
		let mut hasher = Sha256::new();
		hasher.update(base_dir.to_string_lossy().as_bytes());
		format!("{:x}", hasher.finalize())[..12].to_string()
	};

	let project_name = base_dir
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or("unknown");

	let logs_root = base_dir.join(DATA_DIR).join("logs");
	let log_dir = logs_root.join(format!("{}_{}", project_name, project_hash));
	std::fs::create_dir_all(&log_dir)?;

	MCP_LOG_DIR
		.set(log_dir.clone())
		.map_err(|_| anyhow::anyhow!("Failed to set log directory"))?;

	// Cross-platform way to create a "latest" indicator
	let latest_file = logs_root.join("latest.txt");
	std::fs::write(&latest_file, log_dir.to_string_lossy().as_bytes()).unwrap_or_else(|e| {
		eprintln!("Warning: Could not create latest log indicator: {}", e);
	});

	let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "mcp_gateway.log");

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		if debug_mode {
			EnvFilter::new("debug")
		} else {
			EnvFilter::new("info")
		}
	});

	// File layer with JSON formatting for structured logs
	let file_layer = Layer::new()
		.with_writer(file_appender)
		.with_ansi(false)
		.with_target(true)
		.with_file(true)
		.with_line_number(true)
		.with_thread_ids(true)
		.with_thread_names(true)
		.json();

	// Console layer (only in debug mode), always stderr
	let console_layer = if debug_mode {
		Some(
			Layer::new()
				.with_writer(std::io::stderr)
				.with_ansi(true)
				.with_target(false)
				.with_thread_ids(false)
				.with_thread_names(false),
		)
	} else {
		None
	};

	let registry = Registry::default().with(file_layer).with(env_filter);

	if let Some(console) = console_layer {
		registry.with(console).try_init()?;
	} else {
		registry.try_init()?;
	}

	info!(
		project_path = %base_dir.display(),
		project_name = project_name,
		log_directory = %log_dir.display(),
		debug_mode = debug_mode,
		"MCP gateway logging initialized"
	);

	Ok(())
}

/// Log MCP request details
pub fn log_mcp_request(
	method: &str,
	params: Option<&serde_json::Value>,
	request_id: Option<&serde_json::Value>,
) {
	info!(
		method = method,
		request_id = ?request_id,
		params_size = params.map(|p| p.to_string().len()).unwrap_or(0),
		"MCP Request received"
	);

	if let Some(params) = params {
		debug!(
			method = method,
			params = %params,
			"MCP Request parameters"
		);
	}
}

/// Log MCP response
pub fn log_mcp_response(
	method: &str,
	success: bool,
	request_id: Option<&serde_json::Value>,
	duration_ms: Option<u64>,
) {
	if success {
		info!(
			method = method,
			request_id = ?request_id,
			duration_ms = duration_ms,
			"MCP Request processed successfully"
		);
	} else {
		warn!(
			method = method,
			request_id = ?request_id,
			duration_ms = duration_ms,
			"MCP Request processing failed"
		);
	}
}

/// Log critical errors with context
pub fn log_critical_error(context: &str, error: &dyn std::error::Error) {
	error!(
		context = context,
		error = %error,
		error_chain = ?error.source(),
		"Critical error in MCP gateway"
	);
}

/// Log a proxied backend lifecycle transition
pub fn log_backend_transition(backend_id: &str, from: &str, to: &str, reason: Option<&str>) {
	if to == "terminated" || to == "degraded" {
		warn!(
			backend = backend_id,
			from = from,
			to = to,
			reason = reason,
			"Backend state changed"
		);
	} else {
		info!(
			backend = backend_id,
			from = from,
			to = to,
			reason = reason,
			"Backend state changed"
		);
	}
}

/// Log one line a proxied server wrote to stderr
pub fn log_stderr_line(backend_id: &str, line: &str) {
	debug!(target: "gateway::stderr", backend = backend_id, line = line);
}

/// Get the current log directory
pub fn get_log_directory() -> Option<PathBuf> {
	MCP_LOG_DIR.get().cloned()
}

/// Get all log directories for the gateway
pub fn get_all_log_directories(base_dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
	let logs_dir = base_dir.join(DATA_DIR).join("logs");

	if !logs_dir.exists() {
		return Ok(Vec::new());
	}

	let mut directories = Vec::new();
	for entry in std::fs::read_dir(logs_dir)? {
		let entry = entry?;
		let path = entry.path();

		if path.is_dir() {
			if let Some(name) = path.file_name() {
				let name_str = name.to_string_lossy();
				// Skip hidden directories and files
				if !name_str.starts_with('.') && !name_str.ends_with(".txt") {
					directories.push(path);
				}
			}
		}
	}

	// Sort by modification time (newest first)
	directories.sort_by(|a, b| {
		let a_time = a
			.metadata()
			.and_then(|m| m.modified())
			.unwrap_or(std::time::SystemTime::UNIX_EPOCH);
		let b_time = b
			.metadata()
			.and_then(|m| m.modified())
			.unwrap_or(std::time::SystemTime::UNIX_EPOCH);
		b_time.cmp(&a_time)
	});

	Ok(directories)
}

/// Print log directory information
pub fn print_log_directories(base_dir: &Path) -> Result<(), std::io::Error> {
	println!("MCP Gateway Log Directories:");
	for (index, log_dir) in get_all_log_directories(base_dir)?.iter().enumerate() {
		println!("{}: {}", index + 1, log_dir.display());
	}
	Ok(())
}
