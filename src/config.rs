use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{DATA_DIR, SERVER_NAME};

// Default values functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_server_name() -> String {
    SERVER_NAME.to_string()
}

fn default_manifest_path() -> String {
    format!("{}/proxied-servers.json", DATA_DIR)
}

fn default_eager_start() -> bool {
    true
}

fn default_readiness_ms() -> u64 {
    30_000
}

fn default_handshake_ms() -> u64 {
    30_000
}

fn default_health_probe_ms() -> u64 {
    5_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_request_ms() -> u64 {
    120_000
}

fn default_termination_ms() -> u64 {
    5_000
}

fn default_session_idle_ms() -> u64 {
    1_800_000
}

fn default_max_failures() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_analysis_enabled() -> bool {
    true
}

fn default_max_line_length() -> usize {
    120
}

/// Accepts true/false, 1/0 and yes/no, case-insensitively
pub fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(anyhow::anyhow!("expected a boolean, got '{}'", other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Stdio,
    Http,
}

impl std::str::FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "http" => Ok(TransportMode::Http),
            other => Err(anyhow::anyhow!("Unknown transport '{}', expected stdio or http", other)),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Stdio => write!(f, "stdio"),
            TransportMode::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transport: TransportMode,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_server_name")]
    pub name: String,

    /// Advertise and serve only tools annotated `readOnlyHint: true`
    #[serde(default)]
    pub read_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::default(),
            host: default_host(),
            port: default_port(),
            name: default_server_name(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,

    /// Start every proxied server at boot instead of on first call
    #[serde(default = "default_eager_start")]
    pub eager_start: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            eager_start: default_eager_start(),
        }
    }
}

/// All values are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_readiness_ms")]
    pub readiness_ms: u64,

    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,

    #[serde(default = "default_health_probe_ms")]
    pub health_probe_ms: u64,

    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    #[serde(default = "default_request_ms")]
    pub request_ms: u64,

    #[serde(default = "default_termination_ms")]
    pub termination_ms: u64,

    /// Sessions without traffic for this long are closed; 0 keeps them forever
    #[serde(default = "default_session_idle_ms")]
    pub session_idle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            readiness_ms: default_readiness_ms(),
            handshake_ms: default_handshake_ms(),
            health_probe_ms: default_health_probe_ms(),
            health_interval_ms: default_health_interval_ms(),
            request_ms: default_request_ms(),
            termination_ms: default_termination_ms(),
            session_idle_ms: default_session_idle_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn readiness(&self) -> Duration {
        Duration::from_millis(self.readiness_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn health_probe(&self) -> Duration {
        Duration::from_millis(self.health_probe_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn termination(&self) -> Duration {
        Duration::from_millis(self.termination_ms)
    }

    pub fn session_idle(&self) -> Option<Duration> {
        (self.session_idle_ms > 0).then(|| Duration::from_millis(self.session_idle_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Consecutive failures before a server is terminated for good
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_enabled")]
    pub enabled: bool,

    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: default_analysis_enabled(),
            max_line_length: default_max_line_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let base_dir = std::env::current_dir()?;
        Self::load_from(&base_dir)
    }

    /// Load `<base_dir>/.mcp-gateway/config.toml`, writing defaults when absent.
    pub fn load_from(base_dir: &Path) -> Result<Self> {
        let config_dir = Self::ensure_config_dir(base_dir)?;
        let config_path = config_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            // Create default config if it doesn't exist
            let config = Config::default();
            let toml_content = toml::to_string_pretty(&config)?;
            fs::write(&config_path, toml_content)?;
            config
        };

        // Environment variables take precedence over config file values
        config.apply_env_overrides(|key| std::env::var(key).ok())?;

        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(transport) = lookup("MCP_GATEWAY_TRANSPORT") {
            self.server.transport = transport.parse()?;
        }
        if let Some(host) = lookup("MCP_GATEWAY_HTTP_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("MCP_GATEWAY_HTTP_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid MCP_GATEWAY_HTTP_PORT '{}'", port))?;
        }
        if let Some(manifest) = lookup("MCP_GATEWAY_MANIFEST") {
            self.proxy.manifest_path = manifest;
        }
        if let Some(read_only) = lookup("MCP_GATEWAY_READ_ONLY") {
            self.server.read_only = parse_flag(&read_only)
                .with_context(|| format!("Invalid MCP_GATEWAY_READ_ONLY '{}'", read_only))?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = std::env::current_dir()?;
        self.save_to(&base_dir)
    }

    pub fn save_to(&self, base_dir: &Path) -> Result<()> {
        let config_dir = Self::ensure_config_dir(base_dir)?;
        let config_path = config_dir.join("config.toml");

        let toml_content = toml::to_string_pretty(self)?;
        fs::write(config_path, toml_content)?;
        Ok(())
    }

    fn ensure_config_dir(base_dir: &Path) -> Result<PathBuf> {
        let config_dir = base_dir.join(DATA_DIR);
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }
        Ok(config_dir)
    }

    /// Manifest location, resolved against `base_dir` when relative
    pub fn get_manifest_path(&self, base_dir: &Path) -> PathBuf {
        if Path::new(&self.proxy.manifest_path).is_absolute() {
            PathBuf::from(&self.proxy.manifest_path)
        } else {
            base_dir.join(&self.proxy.manifest_path)
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.transport, TransportMode::Stdio);
        assert_eq!(config.restart.max_failures, 3);
        assert_eq!(config.timeouts.request(), Duration::from_secs(120));
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_load_creates_default_file() {
        let temp = tempfile::tempdir().unwrap();
        let config = Config::load_from(temp.path()).unwrap();
        assert!(temp.path().join(DATA_DIR).join("config.toml").exists());
        assert_eq!(config.analysis.max_line_length, 120);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join(DATA_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            "[server]\ntransport = \"http\"\nport = 9191\n\n[restart]\nmax_failures = 5\n",
        )
        .unwrap();

        let config = Config::load_from(temp.path()).unwrap();
        assert_eq!(config.server.transport, TransportMode::Http);
        assert_eq!(config.server.port, 9191);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.restart.max_failures, 5);
        assert_eq!(config.restart.backoff_base_ms, 500);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MCP_GATEWAY_TRANSPORT", "HTTP"),
            ("MCP_GATEWAY_HTTP_PORT", "7001"),
            ("MCP_GATEWAY_MANIFEST", "/etc/gateway/servers.json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.transport, TransportMode::Http);
        assert_eq!(config.server.port, 7001);
        assert_eq!(
            config.get_manifest_path(Path::new("/work")),
            PathBuf::from("/etc/gateway/servers.json")
        );
    }

    #[test]
    fn test_read_only_override() {
        let mut config = Config::default();
        assert!(!config.server.read_only);
        config
            .apply_env_overrides(|key| (key == "MCP_GATEWAY_READ_ONLY").then(|| "TRUE".to_string()))
            .unwrap();
        assert!(config.server.read_only);

        let result = config.apply_env_overrides(|key| {
            (key == "MCP_GATEWAY_READ_ONLY").then(|| "sometimes".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_idle_disables_expiry() {
        let mut config = Config::default();
        assert_eq!(config.timeouts.session_idle(), Some(Duration::from_secs(1800)));
        config.timeouts.session_idle_ms = 0;
        assert_eq!(config.timeouts.session_idle(), None);
    }

    #[test]
    fn test_bad_port_override_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|key| {
            (key == "MCP_GATEWAY_HTTP_PORT").then(|| "eighty".to_string())
        });
        assert!(result.is_err());
    }
}
