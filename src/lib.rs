pub mod config;
pub mod error;
pub mod logging;
pub mod ports;
pub mod readiness;
pub mod stack;
pub mod supervisor;
pub mod verifier;

pub use config::StackConfig;
pub use error::{Result, StackError};
pub use stack::StackOrchestrator;
