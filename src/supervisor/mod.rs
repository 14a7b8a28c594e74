pub mod manager;
pub mod process;
pub mod store;
pub mod types;

pub use manager::SessionSupervisor;
pub use store::SessionStore;
pub use types::*;
