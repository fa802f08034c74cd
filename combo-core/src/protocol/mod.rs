//! Protocol implementations.

pub mod frame;
pub mod hci;
pub mod radio;

// Re-export common types
pub use frame::{Channel, StreamDeframer};
pub use hci::{CommandResponse, HciCommand, HciEvent};
pub use radio::RadioEvent;
