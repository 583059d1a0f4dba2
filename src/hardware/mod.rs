// src/hardware/mod.rs - Pin table and address space owned by the MCU model
pub mod memory;
pub mod pins;

pub use memory::{AddressSpace, MemoryError};
pub use pins::{
    Pin, PinChange, PinDirection, PinError, PinObserver, PinState, PinTable, RegisterMapping,
};
