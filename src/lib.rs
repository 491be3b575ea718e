// Main lib.rs file that exports our modules
pub mod analysis;
pub mod config;
pub mod constants;
pub mod gateway;
pub mod mcp;

// Re-export commonly used items for convenience
pub use config::Config;
pub use gateway::Gateway;
