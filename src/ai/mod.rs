mod client;
mod gateway;
mod types;

#[cfg(test)]
pub mod testing;

pub use client::HttpAnalysisGateway;
pub use gateway::AnalysisGateway;
pub use types::AnalysisStatus;
