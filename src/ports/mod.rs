pub mod locator;
pub mod reclaimer;

pub use locator::{ProcessLocator, SystemProcessLocator};
pub use reclaimer::{is_port_free, PortReclaimer, ReclaimOutcome};
