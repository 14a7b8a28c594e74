pub mod probe;
pub mod types;

pub use probe::{checks_for, ReadinessProbe};
pub use types::*;
