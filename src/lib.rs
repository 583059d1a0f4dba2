// src/lib.rs - Microcontroller emulation core
pub mod bridge;
pub mod communication;
pub mod config;
pub mod hardware;
pub mod mcu;

pub use bridge::{Bridge, BridgeError, RegisterPort, SyncReport};
pub use communication::{MonitorChannel, MonitorError, PinEventChannel};
pub use config::{Config, ConfigError, McuConfig, McuType, load_config};
pub use hardware::{AddressSpace, MemoryError, PinDirection, PinError, PinState, PinTable};
pub use mcu::{HaltReason, Mcu, McuError, McuSnapshot, McuState, StepOutcome};
