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

use mcp_gateway::config::Config;
use mcp_gateway::gateway::Manifest;

#[derive(Args, Debug)]
pub struct ManifestArgs {
	/// Manifest to check (defaults to the configured one)
	#[arg(value_name = "FILE")]
	pub file: Option<String>,

	/// Print accepted entries as JSON
	#[arg(long)]
	pub json: bool,
}

/// Validate the proxied server manifest without starting anything.
pub fn execute(args: &ManifestArgs, config: &Config) -> Result<()> {
	let current_dir = std::env::current_dir()?;
	let path = match &args.file {
		Some(file) => std::path::PathBuf::from(file),
		None => config.get_manifest_path(&current_dir),
	};

	if !path.exists() {
		println!("No manifest at {} (no proxied servers)", path.display());
		return Ok(());
	}

	let manifest = Manifest::load(&path)?;

	if args.json {
		println!("{}", serde_json::to_string_pretty(&manifest.servers)?);
	} else {
		println!("Manifest: {}", path.display());
		for spec in &manifest.servers {
			let transports: Vec<String> = spec
				.supported_transports
				.iter()
				.map(ToString::to_string)
				.collect();
			println!(
				"  {} (namespace {}, {}){}: {} {}",
				spec.id,
				spec.namespace,
				transports.join("/"),
				if spec.required { " [required]" } else { "" },
				spec.command,
				spec.args.join(" ")
			);
			if !spec.supports(config.server.transport) {
				println!(
					"    not loaded while serving over {}",
					config.server.transport
				);
			}
		}
		for rejection in &manifest.rejected {
			eprintln!("  rejected: {}", rejection);
		}
	}

	if let Some(failure) = manifest.required_failure() {
		return Err(anyhow::anyhow!("Gateway would refuse to start: {}", failure));
	}
	Ok(())
}
