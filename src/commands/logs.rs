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

//! Reader for the gateway's JSON log files.

use anyhow::Result;
use clap::Args;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mcp_gateway::mcp::logging::{get_all_log_directories, print_log_directories};

/// Target of lines a proxied server wrote to its stderr
const STDERR_TARGET: &str = "gateway::stderr";

const FOLLOW_POLL: Duration = Duration::from_millis(500);

#[derive(Args, Debug)]
pub struct LogsArgs {
	/// List the log directories of every gateway run in this project
	#[arg(long)]
	pub all: bool,

	/// Keep printing new entries as they are written
	#[arg(long, short)]
	pub follow: bool,

	/// Number of matching entries to show from the end
	#[arg(long, short, default_value = "100")]
	pub lines: usize,

	/// Only warnings and errors
	#[arg(long)]
	pub errors_only: bool,

	/// Only entries about one proxied server
	#[arg(long, value_name = "ID")]
	pub backend: Option<String>,

	/// Only the stderr output captured from proxied servers
	#[arg(long)]
	pub stderr: bool,

	/// Print the JSON lines as stored
	#[arg(long)]
	pub raw: bool,
}

/// One line of the JSON file layer.
#[derive(Debug, Deserialize)]
struct LogEntry {
	#[serde(default)]
	timestamp: String,
	#[serde(default)]
	level: String,
	#[serde(default)]
	target: String,
	#[serde(default)]
	fields: Map<String, Value>,
}

impl LogEntry {
	fn parse(line: &str) -> Option<Self> {
		serde_json::from_str(line).ok()
	}

	fn field(&self, name: &str) -> Option<&str> {
		self.fields.get(name).and_then(Value::as_str)
	}

	fn render(&self) -> String {
		let message = self.field("message").unwrap_or_default();
		let mut out = format!("{} {:>5}", self.timestamp, self.level);
		if let Some(backend) = self.field("backend") {
			out.push_str(&format!(" [{}]", backend));
		}
		if self.target == STDERR_TARGET {
			out.push_str(&format!(" stderr: {}", self.field("line").unwrap_or_default()));
			return out;
		}
		out.push(' ');
		out.push_str(message);
		for (key, value) in &self.fields {
			if key == "message" || key == "backend" {
				continue;
			}
			match value {
				Value::String(text) => out.push_str(&format!(" {}={}", key, text)),
				other => out.push_str(&format!(" {}={}", key, other)),
			}
		}
		out
	}
}

#[derive(Debug, Default)]
struct LineFilter {
	errors_only: bool,
	backend: Option<String>,
	stderr_only: bool,
}

impl LineFilter {
	fn from_args(args: &LogsArgs) -> Self {
		Self {
			errors_only: args.errors_only,
			backend: args.backend.clone(),
			stderr_only: args.stderr,
		}
	}

	/// Lines that are not JSON only pass an empty filter
	fn matches(&self, entry: Option<&LogEntry>) -> bool {
		let Some(entry) = entry else {
			return !self.errors_only && self.backend.is_none() && !self.stderr_only;
		};
		if self.errors_only && !matches!(entry.level.as_str(), "WARN" | "ERROR") {
			return false;
		}
		if self.stderr_only && entry.target != STDERR_TARGET {
			return false;
		}
		match &self.backend {
			Some(backend) => entry.field("backend") == Some(backend.as_str()),
			None => true,
		}
	}
}

pub async fn execute(args: &LogsArgs) -> Result<()> {
	let current_dir = std::env::current_dir()?;

	if args.all {
		print_log_directories(&current_dir)?;
		return Ok(());
	}

	let log_dirs = get_all_log_directories(&current_dir)?;
	let Some(latest_dir) = log_dirs.first() else {
		println!("No gateway logs found for this project.");
		println!("Logs are created when the gateway is started.");
		return Ok(());
	};

	let Some(log_file) = newest_log_file(latest_dir)? else {
		println!("No log files found in {}", latest_dir.display());
		return Ok(());
	};
	println!("Reading from: {}", log_file.display());

	let filter = LineFilter::from_args(args);
	let content = std::fs::read_to_string(&log_file)?;
	for line in tail(&content, &filter, args.lines) {
		print_line(line, args.raw);
	}

	if args.follow {
		follow(&log_file, content.len() as u64, &filter, args.raw).await?;
	}
	Ok(())
}

fn print_line(line: &str, raw: bool) {
	match LogEntry::parse(line) {
		Some(entry) if !raw => println!("{}", entry.render()),
		_ => println!("{}", line),
	}
}

/// Last `count` lines that pass the filter, oldest first
fn tail<'a>(content: &'a str, filter: &LineFilter, count: usize) -> Vec<&'a str> {
	let mut kept: Vec<&str> = content
		.lines()
		.rev()
		.filter(|line| filter.matches(LogEntry::parse(line).as_ref()))
		.take(count)
		.collect();
	kept.reverse();
	kept
}

/// Daily rotation names files `mcp_gateway.log.<date>`; pick the newest
fn newest_log_file(log_dir: &Path) -> Result<Option<PathBuf>> {
	let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
	for entry in std::fs::read_dir(log_dir)? {
		let path = entry?.path();
		let is_log = path
			.file_name()
			.and_then(|n| n.to_str())
			.is_some_and(|n| n.starts_with("mcp_gateway.log"));
		if !is_log {
			continue;
		}
		let modified = path
			.metadata()
			.and_then(|m| m.modified())
			.unwrap_or(std::time::SystemTime::UNIX_EPOCH);
		if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
			newest = Some((modified, path));
		}
	}
	Ok(newest.map(|(_, path)| path))
}

/// Poll the file for appended lines until Ctrl+C.
async fn follow(path: &Path, mut offset: u64, filter: &LineFilter, raw: bool) -> Result<()> {
	let mut pending = String::new();
	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => return Ok(()),
			_ = tokio::time::sleep(FOLLOW_POLL) => {}
		}

		let mut file = std::fs::File::open(path)?;
		let len = file.metadata()?.len();
		if len < offset {
			// Truncated or replaced
			offset = 0;
			pending.clear();
		}
		file.seek(SeekFrom::Start(offset))?;
		let mut chunk = String::new();
		offset += file.read_to_string(&mut chunk)? as u64;
		pending.push_str(&chunk);

		while let Some(end) = pending.find('\n') {
			let line: String = pending.drain(..=end).collect();
			let line = line.trim_end();
			if filter.matches(LogEntry::parse(line).as_ref()) {
				print_line(line, raw);
			}
		}
	}
}
