use anyhow::Result;
use clap::Args;
use mcp_gateway::config::{Config, TransportMode};

#[derive(Args)]
pub struct ConfigArgs {
	/// Set the default transport (stdio or http)
	#[arg(long, value_enum)]
	pub transport: Option<TransportMode>,

	/// Set the HTTP bind host
	#[arg(long)]
	pub host: Option<String>,

	/// Set the HTTP port
	#[arg(long)]
	pub port: Option<u16>,

	/// Set the proxied server manifest path
	#[arg(long)]
	pub manifest: Option<String>,

	/// Set how many consecutive failures terminate a proxied server
	#[arg(long)]
	pub max_failures: Option<u32>,

	/// Set the per-call timeout in milliseconds
	#[arg(long)]
	pub request_timeout_ms: Option<u64>,

	/// Enable or disable the embedded analysis tools
	#[arg(long)]
	pub analysis_enabled: Option<bool>,

	/// Only expose tools annotated read-only
	#[arg(long)]
	pub read_only: Option<bool>,

	/// Set the HTTP session idle limit in milliseconds (0 disables)
	#[arg(long)]
	pub session_idle_ms: Option<u64>,

	/// Show current configuration
	#[arg(long)]
	pub show: bool,

	/// Reset configuration to defaults
	#[arg(long)]
	pub reset: bool,
}

pub fn execute(args: &ConfigArgs, mut config: Config) -> Result<()> {
	if args.reset {
		config = Config::default();
		config.save()?;
		println!("Configuration reset to defaults");
		return Ok(());
	}

	if args.show {
		println!("Current configuration:");
		println!("Transport: {}", config.server.transport);
		println!("HTTP address: {}", config.bind_address());
		println!("Manifest: {}", config.proxy.manifest_path);
		println!("Eager start: {}", config.proxy.eager_start);
		println!("Max failures: {}", config.restart.max_failures);
		println!(
			"Backoff: {}ms base, {}ms max",
			config.restart.backoff_base_ms, config.restart.backoff_max_ms
		);
		println!("Readiness timeout: {}ms", config.timeouts.readiness_ms);
		println!("Request timeout: {}ms", config.timeouts.request_ms);
		println!(
			"Health checks: every {}ms, {}ms probe timeout",
			config.timeouts.health_interval_ms, config.timeouts.health_probe_ms
		);
		println!("Analysis enabled: {}", config.analysis.enabled);
		println!("Read-only: {}", config.server.read_only);
		match config.timeouts.session_idle() {
			Some(idle) => println!("Session idle limit: {}ms", idle.as_millis()),
			None => println!("Session idle limit: none"),
		}
		return Ok(());
	}

	let mut updated = false;

	if let Some(transport) = args.transport {
		config.server.transport = transport;
		println!("Transport set to: {}", transport);
		updated = true;
	}

	if let Some(host) = &args.host {
		config.server.host = host.clone();
		println!("Host set to: {}", host);
		updated = true;
	}

	if let Some(port) = args.port {
		config.server.port = port;
		println!("Port set to: {}", port);
		updated = true;
	}

	if let Some(manifest) = &args.manifest {
		config.proxy.manifest_path = manifest.clone();
		println!("Manifest set to: {}", manifest);
		updated = true;
	}

	if let Some(max_failures) = args.max_failures {
		config.restart.max_failures = max_failures;
		println!("Max failures set to: {}", max_failures);
		updated = true;
	}

	if let Some(request_timeout_ms) = args.request_timeout_ms {
		config.timeouts.request_ms = request_timeout_ms;
		println!("Request timeout set to: {}ms", request_timeout_ms);
		updated = true;
	}

	if let Some(analysis_enabled) = args.analysis_enabled {
		config.analysis.enabled = analysis_enabled;
		println!(
			"Analysis {}",
			if analysis_enabled { "enabled" } else { "disabled" }
		);
		updated = true;
	}

	if let Some(read_only) = args.read_only {
		config.server.read_only = read_only;
		println!("Read-only mode {}", if read_only { "enabled" } else { "disabled" });
		updated = true;
	}

	if let Some(session_idle_ms) = args.session_idle_ms {
		config.timeouts.session_idle_ms = session_idle_ms;
		println!("Session idle limit set to: {}ms", session_idle_ms);
		updated = true;
	}

	if updated {
		config.save()?;
		println!("Configuration updated successfully!");
	} else {
		println!("No configuration changes made. Use --show to see current settings.");
	}

	Ok(())
}
