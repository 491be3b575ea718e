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

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

use mcp_gateway::config::Config;

mod commands;

#[derive(Parser)]
#[command(name = "mcp-gateway")]
#[command(version)]
#[command(about = "One MCP endpoint for embedded code analysis and supervised MCP servers")]
struct GatewayArgs {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the gateway (stdio by default, HTTP with --bind)
	#[command(alias = "mcp")]
	Serve(commands::McpArgs),

	/// Generate or edit the configuration file
	Config(commands::ConfigArgs),

	/// Validate the proxied server manifest
	Manifest(commands::ManifestArgs),

	/// View gateway logs
	Logs(commands::LogsArgs),

	/// Generate shell completion scripts
	Completion {
		/// The shell to generate completion for
		#[arg(value_enum)]
		shell: Shell,
	},
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let args = GatewayArgs::parse();

	match &args.command {
		// Loads its own config relative to --path
		Commands::Serve(mcp_args) => commands::mcp::run(mcp_args.clone()).await,
		Commands::Config(config_args) => {
			let config = Config::load()?;
			commands::config::execute(config_args, config)
		}
		Commands::Manifest(manifest_args) => {
			let config = Config::load()?;
			commands::manifest::execute(manifest_args, &config)
		}
		Commands::Logs(logs_args) => commands::logs::execute(logs_args).await,
		Commands::Completion { shell } => {
			let mut app = GatewayArgs::command();
			let name = app.get_name().to_string();
			generate(*shell, &mut app, name, &mut std::io::stdout());
			Ok(())
		}
	}
}
