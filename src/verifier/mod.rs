pub mod client;
pub mod runner;
pub mod types;

pub use client::{ExecutionClient, StatusProxyClient};
pub use runner::{validate_payload, JobRunVerifier, PollOutcome};
pub use types::*;
