// src/mcu.rs - Microcontroller state machine
//
// RESET/HALTED --run--> RUNNING --step--> RUNNING | HALTED
// RUNNING --stop--> HALTED, any --reset--> RESET.
// RUNNING --step with pc outside memory--> ERROR; every mutating call but reset fails there.

use crate::config::{Config, McuConfig, McuType};
use crate::hardware::{AddressSpace, MemoryError, Pin, PinError, PinState, PinTable};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const REGISTER_COUNT: usize = 32;
/// Program counter advance per step. No decoding happens; instructions are assumed 2 bytes.
pub const INSTRUCTION_SIZE: u32 = 2;

#[derive(Debug, Error)]
pub enum McuError {
    #[error("Pin error: {0}")]
    Pin(#[from] PinError),
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("no firmware loaded")]
    NoFirmware,
    #[error("register index {0} out of range (0..32)")]
    RegisterOutOfRange(usize),
    #[error("operation not allowed in state {0}")]
    InvalidState(McuState),
    #[error("program counter 0x{0:08x} is at or past the end of memory, reset required")]
    ProgramEnded(u32),
    #[error("program counter 0x{0:08x} left the address space")]
    Fault(u32),
    #[error("firmware file '{}': {source}", .path.display())]
    FirmwareIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("firmware file '{}' is empty", .0.display())]
    EmptyFirmware(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum McuState {
    Reset,
    Running,
    Halted,
    Error,
}

impl fmt::Display for McuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            McuState::Reset => "RESET",
            McuState::Running => "RUNNING",
            McuState::Halted => "HALTED",
            McuState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Breakpoint(u32),
    EndOfMemory,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continued,
    Halted(HaltReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub size: u32,
    pub entry_point: u32,
}

/// Plain data view for status renderers.
#[derive(Debug, Clone, Serialize)]
pub struct McuSnapshot {
    pub name: String,
    pub mcu_type: McuType,
    pub state: McuState,
    pub program_counter: u32,
    pub registers: Vec<u32>,
    pub firmware_loaded: bool,
    pub firmware_path: Option<PathBuf>,
    pub breakpoints: Vec<u32>,
    pub pins: Vec<Pin>,
}

#[derive(Debug)]
pub struct Mcu {
    config: McuConfig,
    state: McuState,
    program_counter: u32,
    registers: [u32; REGISTER_COUNT],
    memory: AddressSpace,
    pins: PinTable,
    firmware_loaded: bool,
    firmware_path: Option<PathBuf>,
    breakpoints: BTreeSet<u32>,
}

impl Mcu {
    pub fn new(config: McuConfig) -> Result<Self, McuError> {
        let memory = AddressSpace::new(config.memory_size, config.flash_start, config.ram_start)?;
        let pins = PinTable::new(config.pin_count)?;

        tracing::info!(
            "Microcontroller {} initialized: {} Hz, {} bytes, {} pins",
            config.name,
            config.clock_frequency,
            config.memory_size,
            config.pin_count
        );

        Ok(Self {
            program_counter: config.flash_start,
            config,
            state: McuState::Reset,
            registers: [0; REGISTER_COUNT],
            memory,
            pins,
            firmware_loaded: false,
            firmware_path: None,
            breakpoints: BTreeSet::new(),
        })
    }

    /// Builds the MCU and applies the `[[pins]]` table.
    pub fn from_config(config: &Config) -> Result<Self, McuError> {
        let mut mcu = Self::new(config.mcu.resolve())?;
        for pin in &config.pins {
            mcu.pins.configure(pin.index, pin.direction, pin.name.as_deref())?;
            if let (Some(address), Some(bit)) = (pin.register, pin.bit) {
                mcu.pins.map_register(pin.index, address, bit)?;
            }
            if pin.monitored {
                mcu.pins.start_monitoring(pin.index)?;
            }
        }
        Ok(mcu)
    }

    pub fn config(&self) -> &McuConfig {
        &self.config
    }

    pub fn state(&self) -> McuState {
        self.state
    }

    pub fn program_counter(&self) -> u32 {
        self.program_counter
    }

    pub fn firmware_loaded(&self) -> bool {
        self.firmware_loaded
    }

    pub fn firmware_path(&self) -> Option<&Path> {
        self.firmware_path.as_deref()
    }

    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    pub fn pins(&self) -> &PinTable {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut PinTable {
        &mut self.pins
    }

    /// Clears registers and RAM, rewinds the program counter and drives every pin LOW.
    /// Flash and breakpoints survive.
    pub fn reset(&mut self) {
        self.state = McuState::Reset;
        self.program_counter = self.config.flash_start;
        self.registers = [0; REGISTER_COUNT];
        self.memory.clear_ram();
        self.pins.force_all(PinState::Low);
        tracing::info!("Microcontroller reset");
    }

    // --- Firmware ---

    /// Reads the whole file before touching flash, so a failed read or an oversized image
    /// leaves the previous firmware in place.
    pub fn load_firmware(&mut self, path: impl AsRef<Path>) -> Result<usize, McuError> {
        let path = path.as_ref();
        self.ensure_not_running()?;
        let image = std::fs::read(path).map_err(|source| McuError::FirmwareIo {
            path: path.to_path_buf(),
            source,
        })?;
        let loaded = self.load_firmware_bytes(&image)?;
        self.firmware_path = Some(path.to_path_buf());
        tracing::info!("Firmware loaded: {} ({} bytes)", path.display(), loaded);
        Ok(loaded)
    }

    pub fn load_firmware_bytes(&mut self, image: &[u8]) -> Result<usize, McuError> {
        self.ensure_not_running()?;
        let loaded = self.memory.load(image)?;
        self.firmware_loaded = true;
        self.firmware_path = None;
        Ok(loaded)
    }

    /// Checks that a firmware file could be loaded without loading it.
    pub fn verify_firmware(&self, path: impl AsRef<Path>) -> Result<u64, McuError> {
        let path = path.as_ref();
        let size = std::fs::metadata(path)
            .map_err(|source| McuError::FirmwareIo {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if size == 0 {
            return Err(McuError::EmptyFirmware(path.to_path_buf()));
        }
        let capacity = self.memory.memory_size() - self.memory.flash_start();
        if size > capacity as u64 {
            return Err(MemoryError::TooLarge {
                length: size as usize,
                capacity,
            }
            .into());
        }
        Ok(size)
    }

    pub fn firmware_info(&self) -> Result<FirmwareInfo, McuError> {
        if !self.firmware_loaded {
            return Err(McuError::NoFirmware);
        }
        Ok(FirmwareInfo {
            size: self.memory.firmware_extent(),
            entry_point: self.config.flash_start,
        })
    }

    fn ensure_not_running(&self) -> Result<(), McuError> {
        match self.state {
            McuState::Running | McuState::Error => Err(McuError::InvalidState(self.state)),
            _ => Ok(()),
        }
    }

    fn ensure_not_faulted(&self) -> Result<(), McuError> {
        if self.state == McuState::Error {
            Err(McuError::InvalidState(self.state))
        } else {
            Ok(())
        }
    }

    // --- Execution ---

    pub fn run(&mut self) -> Result<(), McuError> {
        if !self.firmware_loaded {
            return Err(McuError::NoFirmware);
        }
        match self.state {
            McuState::Running => Ok(()),
            McuState::Error => Err(McuError::InvalidState(self.state)),
            McuState::Reset | McuState::Halted => {
                if self.program_counter >= self.memory.memory_size() {
                    return Err(McuError::ProgramEnded(self.program_counter));
                }
                self.state = McuState::Running;
                tracing::info!("Execution started at 0x{:08x}", self.program_counter);
                Ok(())
            }
        }
    }

    pub fn stop(&mut self) -> Result<(), McuError> {
        if self.state == McuState::Error {
            return Err(McuError::InvalidState(self.state));
        }
        self.state = McuState::Halted;
        tracing::info!("Execution stopped at 0x{:08x}", self.program_counter);
        Ok(())
    }

    /// Moves execution to `address`, like a jump. The target is only checked when the next
    /// instruction is fetched, so a jump outside memory faults on the following `step`.
    pub fn set_program_counter(&mut self, address: u32) -> Result<(), McuError> {
        self.ensure_not_faulted()?;
        self.program_counter = address;
        tracing::debug!("Program counter set to 0x{:08x}", address);
        Ok(())
    }

    pub fn step(&mut self) -> Result<StepOutcome, McuError> {
        if self.state != McuState::Running {
            return Err(McuError::InvalidState(self.state));
        }
        let size = self.memory.memory_size();
        if self.program_counter >= size {
            self.state = McuState::Error;
            tracing::error!("Program counter 0x{:08x} outside memory", self.program_counter);
            return Err(McuError::Fault(self.program_counter));
        }

        tracing::trace!("Executing instruction at 0x{:08x}", self.program_counter);
        self.program_counter = self.program_counter.saturating_add(INSTRUCTION_SIZE);

        if self.program_counter >= size {
            self.state = McuState::Halted;
            tracing::info!("Execution finished: end of memory");
            return Ok(StepOutcome::Halted(HaltReason::EndOfMemory));
        }
        if self.breakpoints.contains(&self.program_counter) {
            self.state = McuState::Halted;
            tracing::info!("Breakpoint hit at 0x{:08x}", self.program_counter);
            return Ok(StepOutcome::Halted(HaltReason::Breakpoint(self.program_counter)));
        }
        Ok(StepOutcome::Continued)
    }

    /// Steps until the program counter reaches `address`, a breakpoint, or the end of
    /// memory. `cancel` is checked before every step; cancellation leaves the MCU HALTED.
    pub fn run_until(
        &mut self,
        address: u32,
        cancel: &CancellationToken,
    ) -> Result<HaltReason, McuError> {
        self.run()?;
        tracing::info!("Running until 0x{:08x}", address);

        if self.program_counter == address {
            self.state = McuState::Halted;
            return Ok(HaltReason::Breakpoint(address));
        }

        loop {
            if cancel.is_cancelled() {
                self.state = McuState::Halted;
                tracing::info!("Run cancelled at 0x{:08x}", self.program_counter);
                return Ok(HaltReason::Cancelled);
            }
            match self.step()? {
                StepOutcome::Continued if self.program_counter == address => {
                    self.state = McuState::Halted;
                    tracing::info!("Breakpoint hit at 0x{:08x}", address);
                    return Ok(HaltReason::Breakpoint(address));
                }
                StepOutcome::Continued => {}
                StepOutcome::Halted(reason) => return Ok(reason),
            }
        }
    }

    // --- Breakpoints ---

    pub fn set_breakpoint(&mut self, address: u32) -> Result<(), McuError> {
        self.ensure_not_faulted()?;
        if address >= self.memory.memory_size() {
            return Err(MemoryError::OutOfBounds {
                address,
                length: 1,
                size: self.memory.memory_size(),
            }
            .into());
        }
        self.breakpoints.insert(address);
        tracing::debug!("Breakpoint set at 0x{:08x}", address);
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, address: u32) -> bool {
        let removed = self.breakpoints.remove(&address);
        if removed {
            tracing::debug!("Breakpoint removed at 0x{:08x}", address);
        }
        removed
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = u32> + '_ {
        self.breakpoints.iter().copied()
    }

    // --- Memory and registers ---

    pub fn read_memory(&self, address: u32, length: usize) -> Result<&[u8], McuError> {
        Ok(self.memory.read(address, length)?)
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), McuError> {
        self.ensure_not_faulted()?;
        Ok(self.memory.write(address, data)?)
    }

    pub fn read_register(&self, index: usize) -> Result<u32, McuError> {
        self.registers
            .get(index)
            .copied()
            .ok_or(McuError::RegisterOutOfRange(index))
    }

    pub fn write_register(&mut self, index: usize, value: u32) -> Result<(), McuError> {
        self.ensure_not_faulted()?;
        let slot = self
            .registers
            .get_mut(index)
            .ok_or(McuError::RegisterOutOfRange(index))?;
        *slot = value;
        Ok(())
    }

    // --- Pins ---

    pub fn pin_state(&self, index: usize) -> Result<PinState, McuError> {
        Ok(self.pins.get_state(index)?)
    }

    pub fn set_pin_state(&mut self, index: usize, state: PinState) -> Result<(), McuError> {
        self.ensure_not_faulted()?;
        Ok(self.pins.set_state(index, state)?)
    }

    pub fn pin_by_name(&self, name: &str) -> Result<&Pin, McuError> {
        Ok(self.pins.lookup_by_name(name)?)
    }

    pub fn snapshot(&self) -> McuSnapshot {
        McuSnapshot {
            name: self.config.name.clone(),
            mcu_type: self.config.mcu_type,
            state: self.state,
            program_counter: self.program_counter,
            registers: self.registers[..8].to_vec(),
            firmware_loaded: self.firmware_loaded,
            firmware_path: self.firmware_path.clone(),
            breakpoints: self.breakpoints.iter().copied().collect(),
            pins: self.pins.pins().cloned().collect(),
        }
    }
}
