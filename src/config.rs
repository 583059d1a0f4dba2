//! # MCU, emulator and pin configuration
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [mcu]
//! type = "atmega328p"
//!
//! [emulator]
//! machine_type = "mps2-an385"
//! monitor_port = 4444
//!
//! [[pins]]
//! index = 13
//! name = "LED"
//! direction = "output"
//! register = 0x25
//! bit = 5
//! monitored = true
//! ```
//!
//! Every field has a default, so an empty file yields the ATmega328P preset with a
//! default emulator command line and no configured pins.

// src/config.rs - Single configuration file
use crate::hardware::PinDirection;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the MCU model, the external emulator and the pin table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub mcu: McuSection,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub pins: Vec<PinConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum McuType {
    #[default]
    #[serde(rename = "atmega328p")]
    AtMega328P,
    #[serde(rename = "cortex-m3")]
    CortexM3,
    #[serde(rename = "pic16f877a")]
    Pic16F877A,
}

impl fmt::Display for McuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            McuType::AtMega328P => "ATmega328P",
            McuType::CortexM3 => "ARM Cortex-M3",
            McuType::Pic16F877A => "PIC16F877A",
        };
        f.write_str(name)
    }
}

/// Resolved microcontroller description used to build an `Mcu`.
///
/// Addresses are offsets into the modelled byte buffer, not bus addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McuConfig {
    pub mcu_type: McuType,
    pub name: String,
    pub clock_frequency: u32,
    pub memory_size: u32,
    pub flash_start: u32,
    pub ram_start: u32,
    pub pin_count: usize,
}

impl McuConfig {
    pub fn preset(mcu_type: McuType) -> Self {
        match mcu_type {
            McuType::AtMega328P => Self {
                mcu_type,
                name: mcu_type.to_string(),
                clock_frequency: 16_000_000,
                memory_size: 32_768,
                flash_start: 0x0000,
                ram_start: 0x0100,
                pin_count: 28,
            },
            McuType::CortexM3 => Self {
                mcu_type,
                name: mcu_type.to_string(),
                clock_frequency: 72_000_000,
                memory_size: 65_536,
                flash_start: 0x0000,
                ram_start: 0x8000,
                pin_count: 48,
            },
            McuType::Pic16F877A => Self {
                mcu_type,
                name: mcu_type.to_string(),
                clock_frequency: 20_000_000,
                memory_size: 8_192,
                flash_start: 0x0000,
                ram_start: 0x0020,
                pin_count: 40,
            },
        }
    }
}

impl Default for McuConfig {
    fn default() -> Self {
        Self::preset(McuType::default())
    }
}

/// `[mcu]` section: a preset plus optional overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McuSection {
    #[serde(default, rename = "type")]
    pub mcu_type: McuType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub clock_frequency: Option<u32>,
    #[serde(default)]
    pub memory_size: Option<u32>,
    #[serde(default)]
    pub flash_start: Option<u32>,
    #[serde(default)]
    pub ram_start: Option<u32>,
    #[serde(default)]
    pub pin_count: Option<usize>,
}

impl McuSection {
    pub fn resolve(&self) -> McuConfig {
        let preset = McuConfig::preset(self.mcu_type);
        McuConfig {
            mcu_type: self.mcu_type,
            name: self.name.clone().unwrap_or(preset.name),
            clock_frequency: self.clock_frequency.unwrap_or(preset.clock_frequency),
            memory_size: self.memory_size.unwrap_or(preset.memory_size),
            flash_start: self.flash_start.unwrap_or(preset.flash_start),
            ram_start: self.ram_start.unwrap_or(preset.ram_start),
            pin_count: self.pin_count.unwrap_or(preset.pin_count),
        }
    }
}

/// External emulator process and monitor socket settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmulatorConfig {
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_cpu_type")]
    pub cpu_type: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default = "default_enable_monitor")]
    pub enable_monitor: bool,
    #[serde(default = "default_monitor_port")]
    pub monitor_port: u16,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_response_buffer_size")]
    pub response_buffer_size: usize,
    /// `{address}` is replaced with the register address in `0x%08x` form.
    #[serde(default = "default_read_word_command")]
    pub read_word_command: String,
    /// Same placeholders plus `{value}`. Without it the emulator is treated as read-only.
    #[serde(default)]
    pub write_word_command: Option<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary: None,
            machine_type: default_machine_type(),
            cpu_type: default_cpu_type(),
            memory_mb: default_memory_mb(),
            kernel: None,
            enable_monitor: default_enable_monitor(),
            monitor_port: default_monitor_port(),
            settle_delay_ms: default_settle_delay_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            response_buffer_size: default_response_buffer_size(),
            read_word_command: default_read_word_command(),
            write_word_command: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// One `[[pins]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PinConfig {
    pub index: usize,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub direction: PinDirection,
    #[serde(default)]
    pub register: Option<u32>,
    #[serde(default)]
    pub bit: Option<u8>,
    #[serde(default)]
    pub monitored: bool,
}

impl Config {
    /// Checks the layout and pin table before any component is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mcu = self.mcu.resolve();
        if mcu.memory_size == 0 {
            return Err(ConfigError::Invalid("mcu.memory_size must be > 0".into()));
        }
        if mcu.flash_start > mcu.ram_start || mcu.ram_start > mcu.memory_size {
            return Err(ConfigError::Invalid(format!(
                "mcu layout must satisfy flash_start <= ram_start <= memory_size (0x{:x}, 0x{:x}, 0x{:x})",
                mcu.flash_start, mcu.ram_start, mcu.memory_size
            )));
        }
        if mcu.pin_count == 0 {
            return Err(ConfigError::Invalid("mcu.pin_count must be > 0".into()));
        }
        for pin in &self.pins {
            if pin.index >= mcu.pin_count {
                return Err(ConfigError::Invalid(format!(
                    "pin {} exceeds pin_count {}",
                    pin.index, mcu.pin_count
                )));
            }
            match (pin.register, pin.bit) {
                (Some(_), Some(bit)) if bit > 31 => {
                    return Err(ConfigError::Invalid(format!(
                        "pin {} bit {} must be between 0 and 31",
                        pin.index, bit
                    )));
                }
                (Some(_), None) | (None, Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "pin {} needs both register and bit, or neither",
                        pin.index
                    )));
                }
                _ => {}
            }
        }
        if self.emulator.monitor_port == 0 {
            return Err(ConfigError::Invalid("emulator.monitor_port must be > 0".into()));
        }
        if self.emulator.response_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "emulator.response_buffer_size must be > 0".into(),
            ));
        }
        if self.bridge.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("bridge.poll_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

// Default value functions
fn default_machine_type() -> String { "mps2-an385".to_string() }
fn default_cpu_type() -> String { "cortex-m3".to_string() }
fn default_memory_mb() -> u32 { 16 }
fn default_enable_monitor() -> bool { true }
fn default_monitor_port() -> u16 { 4444 }
fn default_settle_delay_ms() -> u64 { 2000 }
fn default_restart_delay_ms() -> u64 { 1000 }
fn default_connect_timeout_ms() -> u64 { 2000 }
fn default_read_timeout_ms() -> u64 { 500 }
fn default_shutdown_grace_ms() -> u64 { 1000 }
fn default_response_buffer_size() -> usize { 1024 }
fn default_read_word_command() -> String { "xp /1wx {address}".to_string() }
fn default_poll_interval_ms() -> u64 { 100 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        let mcu = config.mcu.resolve();
        assert_eq!(mcu.mcu_type, McuType::AtMega328P);
        assert_eq!(mcu.memory_size, 32_768);
        assert_eq!(mcu.ram_start, 0x100);
        assert_eq!(mcu.pin_count, 28);
        assert_eq!(config.emulator.monitor_port, 4444);
        assert_eq!(config.emulator.machine_type, "mps2-an385");
        assert!(config.emulator.enable_monitor);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test_config.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "[mcu]\ntype = 'pic16f877a'\nmemory_size = 4096\n\n[[pins]]\nindex = 3\nname = 'BTN'\nregister = 6\nbit = 1"
        )
        .unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        let mcu = config.mcu.resolve();
        assert_eq!(mcu.mcu_type, McuType::Pic16F877A);
        assert_eq!(mcu.memory_size, 4096);
        // Preset values fill what the file leaves out
        assert_eq!(mcu.ram_start, 0x20);
        assert_eq!(config.pins.len(), 1);
        assert_eq!(config.pins[0].direction, PinDirection::Input);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_file.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not a valid toml").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_validate_rejects_bad_layout() {
        let toml = r#"
        [mcu]
        ram_start = 0x10
        flash_start = 0x20
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_half_mapping() {
        let toml = r#"
        [[pins]]
        index = 2
        register = 0x25
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_preset_names() {
        assert_eq!(McuConfig::preset(McuType::CortexM3).name, "ARM Cortex-M3");
        assert_eq!(McuConfig::preset(McuType::CortexM3).clock_frequency, 72_000_000);
    }
}
