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

use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use tracing::{error, info};

use mcp_gateway::analysis::{AnalysisEngine, RuleEngine};
use mcp_gateway::config::{Config, TransportMode};
use mcp_gateway::gateway::{Gateway, Manifest};
use mcp_gateway::mcp::logging::{get_log_directory, init_mcp_logging};
use mcp_gateway::mcp::{McpHttpServer, McpServer};

#[derive(Args, Clone)]
pub struct McpArgs {
	/// Enable debug logging (also mirrored to stderr)
	#[arg(long)]
	pub debug: bool,

	/// Project directory holding .mcp-gateway/ (defaults to current directory)
	#[arg(long, default_value = ".")]
	pub path: String,

	/// Transport to serve on (overrides config)
	#[arg(long, value_enum)]
	pub transport: Option<TransportMode>,

	/// Bind to HTTP server on host:port instead of using stdin/stdout (e.g., "0.0.0.0:12345")
	#[arg(long, value_name = "HOST:PORT")]
	pub bind: Option<String>,

	/// Proxied server manifest (overrides config)
	#[arg(long, value_name = "FILE")]
	pub manifest: Option<String>,

	/// How long calls wait for a starting backend, in milliseconds
	#[arg(long, value_name = "MS")]
	pub readiness_timeout_ms: Option<u64>,

	/// Start proxied servers on their first call instead of at boot
	#[arg(long)]
	pub lazy: bool,

	/// Do not expose the embedded analysis tools
	#[arg(long)]
	pub no_analysis: bool,

	/// Only expose tools annotated read-only
	#[arg(long)]
	pub read_only: bool,

	/// Close HTTP sessions idle this long, in milliseconds (0 disables)
	#[arg(long, value_name = "MS")]
	pub session_idle_ms: Option<u64>,
}

impl McpArgs {
	fn apply(&self, config: &mut Config) -> Result<()> {
		if let Some(transport) = self.transport {
			config.server.transport = transport;
		}
		if let Some(bind) = &self.bind {
			let (host, port) = bind
				.rsplit_once(':')
				.ok_or_else(|| anyhow::anyhow!("Invalid bind address '{}', expected HOST:PORT", bind))?;
			config.server.host = host.to_string();
			config.server.port = port
				.parse()
				.map_err(|_| anyhow::anyhow!("Invalid port in bind address '{}'", bind))?;
			config.server.transport = TransportMode::Http;
		}
		if let Some(manifest) = &self.manifest {
			config.proxy.manifest_path = manifest.clone();
		}
		if let Some(ms) = self.readiness_timeout_ms {
			config.timeouts.readiness_ms = ms;
		}
		if self.lazy {
			config.proxy.eager_start = false;
		}
		if self.no_analysis {
			config.analysis.enabled = false;
		}
		if self.read_only {
			config.server.read_only = true;
		}
		if let Some(ms) = self.session_idle_ms {
			config.timeouts.session_idle_ms = ms;
		}
		Ok(())
	}
}

pub async fn run(args: McpArgs) -> Result<()> {
	// Convert path to absolute PathBuf
	let working_directory = std::path::Path::new(&args.path)
		.canonicalize()
		.map_err(|e| anyhow::anyhow!("Invalid path '{}': {}", args.path, e))?;

	// Verify the path exists and is a directory
	if !working_directory.is_dir() {
		return Err(anyhow::anyhow!(
			"Path '{}' is not a directory",
			working_directory.display()
		));
	}

	// Note: No console output here - stdout belongs to the protocol in stdio mode
	init_mcp_logging(working_directory.clone(), args.debug)?;
	if args.debug {
		if let Some(log_dir) = get_log_directory() {
			eprintln!("Logging to {}", log_dir.display());
		}
	}

	let mut config = Config::load_from(&working_directory)?;
	args.apply(&mut config)?;

	let manifest_path = config.get_manifest_path(&working_directory);
	let manifest = Manifest::load(&manifest_path).inspect_err(|e| {
		error!(error = %e, "Cannot load proxied server manifest");
	})?;

	let engine: Option<Arc<dyn AnalysisEngine>> = if config.analysis.enabled {
		Some(Arc::new(RuleEngine::new(&config.analysis)?))
	} else {
		None
	};

	let gateway = Gateway::start(&config, manifest, engine).await?;
	info!(
		transport = %config.server.transport,
		backends = gateway.backends().len(),
		tools = gateway.catalog().len(),
		"Gateway ready"
	);

	let served = match config.server.transport {
		TransportMode::Stdio => McpServer::new(gateway.clone(), args.debug).run().await,
		TransportMode::Http => {
			McpHttpServer::new(gateway.clone(), config.bind_address(), args.debug)
				.run()
				.await
		}
	};

	gateway.shutdown().await;
	served
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(Parser)]
	struct Cli {
		#[command(flatten)]
		args: McpArgs,
	}

	#[test]
	fn test_bind_switches_to_http() {
		let cli = Cli::parse_from(["test", "--bind", "0.0.0.0:9000", "--lazy", "--no-analysis"]);
		let mut config = Config::default();
		cli.args.apply(&mut config).unwrap();
		assert_eq!(config.server.transport, TransportMode::Http);
		assert_eq!(config.bind_address(), "0.0.0.0:9000");
		assert!(!config.proxy.eager_start);
		assert!(!config.analysis.enabled);
	}

	#[test]
	fn test_read_only_and_idle_flags() {
		let cli = Cli::parse_from(["test", "--read-only", "--session-idle-ms", "0"]);
		let mut config = Config::default();
		cli.args.apply(&mut config).unwrap();
		assert!(config.server.read_only);
		assert_eq!(config.timeouts.session_idle(), None);
		assert_eq!(config.server.transport, TransportMode::Stdio);
	}

	#[test]
	fn test_bad_bind_rejected() {
		let cli = Cli::parse_from(["test", "--bind", "localhost"]);
		assert!(cli.args.apply(&mut Config::default()).is_err());
	}
}
