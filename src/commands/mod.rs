pub mod config;
pub mod logs;
pub mod manifest;
pub mod mcp;

// Re-export all the command structs and enums
pub use config::ConfigArgs;
pub use logs::LogsArgs;
pub use manifest::ManifestArgs;
pub use mcp::McpArgs;
