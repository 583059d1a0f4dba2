// src/communication/mod.rs - Emulator control channel and pin event plumbing
pub mod event_system;
pub mod monitor;
pub mod response;

pub use event_system::PinEventChannel;
pub use monitor::{MonitorChannel, MonitorError};
pub use response::{MONITOR_PROMPT, PromptAfterEcho, ResponseMatcher};
