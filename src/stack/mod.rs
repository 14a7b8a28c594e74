pub mod orchestrator;

pub use orchestrator::{StackOrchestrator, UpReport};
