pub mod cache;
pub mod client;
pub mod config;
pub mod http;
pub mod llm;
pub mod mcp;
pub mod proxy;
pub mod serdes;
pub mod signal;
pub mod telemetry;
pub mod types;

pub use config::Config;
