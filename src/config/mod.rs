pub mod env;
mod loader;

pub use env::{AppConfig, DirectoryConfig, GatewayConfig, PipelineConfig};
pub use loader::load_config;
