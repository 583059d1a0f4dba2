//! Logical pin table and its mapping onto memory-mapped register bits.
//!
//! Every pin lives at a fixed index assigned when the table is created. A pin may carry a
//! name, a direction and an optional `(address, bit)` mapping; the two register-sync
//! functions are the only path between the numeric hardware view and the logical one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Highest bit position a mapping may use.
pub const MAX_BIT: u8 = 31;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    #[error("pin index {index} out of range (table holds {max_pins} pins)")]
    OutOfRange { index: usize, max_pins: usize },
    #[error("bit position {0} out of range (0..=31)")]
    BitOutOfRange(u8),
    #[error("register 0x{address:08x} bit {bit} is already mapped to pin {owner}")]
    MappingConflict { address: u32, bit: u8, owner: usize },
    #[error("pin name '{name}' is already used by pin {owner}")]
    DuplicateName { name: String, owner: usize },
    #[error("no pin named '{0}'")]
    NotFound(String),
    #[error("unable to allocate a table of {0} pins")]
    AllocationError(usize),
}

/// Logical level of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PinState {
    Low,
    High,
    Floating,
    PullUp,
    PullDown,
}

impl PinState {
    pub fn from_level(level: bool) -> Self {
        if level { PinState::High } else { PinState::Low }
    }

    /// Binary level of the state, `None` for the non-driven states.
    pub fn level(self) -> Option<bool> {
        match self {
            PinState::High => Some(true),
            PinState::Low => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PinState::Low => "LOW",
            PinState::High => "HIGH",
            PinState::Floating => "FLOATING",
            PinState::PullUp => "PULL_UP",
            PinState::PullDown => "PULL_DOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinDirection {
    #[default]
    Input,
    Output,
    Bidirectional,
}

impl fmt::Display for PinDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PinDirection::Input => "INPUT",
            PinDirection::Output => "OUTPUT",
            PinDirection::Bidirectional => "BIDIR",
        };
        f.write_str(name)
    }
}

/// A single bit of a memory-mapped register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterMapping {
    pub address: u32,
    pub bit: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pin {
    pub index: usize,
    pub name: Option<String>,
    pub state: PinState,
    pub direction: PinDirection,
    pub monitored: bool,
    pub mapping: Option<RegisterMapping>,
}

impl Pin {
    fn inert(index: usize) -> Self {
        Self {
            index,
            name: None,
            state: PinState::Low,
            direction: PinDirection::Input,
            monitored: false,
            mapping: None,
        }
    }
}

/// Change of a monitored pin, delivered synchronously to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinChange {
    pub index: usize,
    pub old: PinState,
    pub new: PinState,
    pub at: DateTime<Utc>,
}

pub trait PinObserver: Send {
    fn on_change(&mut self, change: &PinChange);
}

impl<F> PinObserver for F
where
    F: FnMut(&PinChange) + Send,
{
    fn on_change(&mut self, change: &PinChange) {
        self(change)
    }
}

/// Fixed-capacity table of logical pins.
pub struct PinTable {
    pins: Vec<Pin>,
    pin_count: usize,
    observers: Vec<Box<dyn PinObserver>>,
}

impl PinTable {
    pub fn new(max_pins: usize) -> Result<Self, PinError> {
        if max_pins == 0 {
            return Err(PinError::AllocationError(0));
        }
        let mut pins = Vec::new();
        pins.try_reserve_exact(max_pins)
            .map_err(|_| PinError::AllocationError(max_pins))?;
        pins.extend((0..max_pins).map(Pin::inert));
        tracing::debug!("Pin table created with {} pins", max_pins);
        Ok(Self {
            pins,
            pin_count: 0,
            observers: Vec::new(),
        })
    }

    pub fn max_pins(&self) -> usize {
        self.pins.len()
    }

    /// Highest configured (or mapped) index plus one, not the number of named pins.
    pub fn pin_count(&self) -> usize {
        self.pin_count
    }

    fn check(&self, index: usize) -> Result<(), PinError> {
        if index < self.pins.len() {
            Ok(())
        } else {
            Err(PinError::OutOfRange { index, max_pins: self.pins.len() })
        }
    }

    fn touch(&mut self, index: usize) {
        self.pin_count = self.pin_count.max(index + 1);
    }

    pub fn configure(
        &mut self,
        index: usize,
        direction: PinDirection,
        name: Option<&str>,
    ) -> Result<(), PinError> {
        self.check(index)?;
        if let Some(name) = name {
            if let Some(owner) = self
                .pins
                .iter()
                .find(|p| p.index != index && p.name.as_deref() == Some(name))
            {
                return Err(PinError::DuplicateName {
                    name: name.to_string(),
                    owner: owner.index,
                });
            }
        }

        let pin = &mut self.pins[index];
        pin.direction = direction;
        pin.name = name.map(str::to_string);
        self.touch(index);

        tracing::info!(
            "Pin {} configured: {} ({})",
            index,
            name.unwrap_or("unnamed"),
            direction
        );
        Ok(())
    }

    pub fn map_register(&mut self, index: usize, address: u32, bit: u8) -> Result<(), PinError> {
        self.check(index)?;
        if bit > MAX_BIT {
            return Err(PinError::BitOutOfRange(bit));
        }
        let mapping = RegisterMapping { address, bit };
        if let Some(owner) = self
            .pins
            .iter()
            .find(|p| p.index != index && p.mapping == Some(mapping))
        {
            return Err(PinError::MappingConflict { address, bit, owner: owner.index });
        }

        self.pins[index].mapping = Some(mapping);
        self.touch(index);
        tracing::info!("Pin {} mapped to register 0x{:08x}, bit {}", index, address, bit);
        Ok(())
    }

    pub fn unmap_register(&mut self, index: usize) -> Result<(), PinError> {
        self.check(index)?;
        self.pins[index].mapping = None;
        Ok(())
    }

    pub fn set_state(&mut self, index: usize, state: PinState) -> Result<(), PinError> {
        self.check(index)?;
        self.apply(index, state);
        Ok(())
    }

    fn apply(&mut self, index: usize, state: PinState) {
        let pin = &mut self.pins[index];
        let old = pin.state;
        pin.state = state;

        if pin.monitored && old != state {
            let change = PinChange { index, old, new: state, at: Utc::now() };
            tracing::info!("[monitor] pin {} changed from {} to {}", index, old, state);
            for observer in self.observers.iter_mut() {
                observer.on_change(&change);
            }
        }
    }

    pub fn get_state(&self, index: usize) -> Result<PinState, PinError> {
        self.check(index)?;
        Ok(self.pins[index].state)
    }

    /// Flips HIGH and LOW; every other state becomes HIGH. Returns the new state.
    pub fn toggle(&mut self, index: usize) -> Result<PinState, PinError> {
        let next = match self.get_state(index)? {
            PinState::High => PinState::Low,
            _ => PinState::High,
        };
        self.apply(index, next);
        Ok(next)
    }

    pub fn start_monitoring(&mut self, index: usize) -> Result<(), PinError> {
        self.check(index)?;
        self.pins[index].monitored = true;
        tracing::debug!("Monitoring started for pin {}", index);
        Ok(())
    }

    pub fn stop_monitoring(&mut self, index: usize) -> Result<(), PinError> {
        self.check(index)?;
        self.pins[index].monitored = false;
        tracing::debug!("Monitoring stopped for pin {}", index);
        Ok(())
    }

    /// Drives every pin in the table to `state`, notifying observers as usual.
    pub fn force_all(&mut self, state: PinState) {
        for index in 0..self.pins.len() {
            self.apply(index, state);
        }
    }

    /// Applies a register value sampled from hardware. Returns the number of pins whose
    /// state actually changed.
    pub fn update_from_register(&mut self, address: u32, value: u32) -> usize {
        let mut changed = 0;
        for index in 0..self.pin_count {
            let Some(mapping) = self.pins[index].mapping else {
                continue;
            };
            if mapping.address != address {
                continue;
            }
            let next = PinState::from_level((value >> mapping.bit) & 1 == 1);
            if self.pins[index].state != next {
                self.apply(index, next);
                changed += 1;
            }
        }

        if changed > 0 {
            tracing::debug!("Updated {} pins from register 0x{:08x}", changed, address);
        }
        changed
    }

    /// Folds pin levels into `value`. Non-driven states count as LOW. Returns the number
    /// of pins mapped to `address`.
    pub fn update_to_register(&self, address: u32, value: &mut u32) -> usize {
        let mut contributing = 0;
        for pin in &self.pins[..self.pin_count] {
            let Some(mapping) = pin.mapping else {
                continue;
            };
            if mapping.address != address {
                continue;
            }
            let mask = 1u32 << mapping.bit;
            if pin.state == PinState::High {
                *value |= mask;
            } else {
                *value &= !mask;
            }
            contributing += 1;
        }
        contributing
    }

    pub fn pin(&self, index: usize) -> Result<&Pin, PinError> {
        self.check(index)?;
        Ok(&self.pins[index])
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<&Pin, PinError> {
        self.pins[..self.pin_count]
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .ok_or_else(|| PinError::NotFound(name.to_string()))
    }

    /// Pins in `0..pin_count`.
    pub fn pins(&self) -> impl Iterator<Item = &Pin> {
        self.pins[..self.pin_count].iter()
    }

    pub fn monitored_pins(&self) -> impl Iterator<Item = &Pin> {
        self.pins().filter(|p| p.monitored)
    }

    /// Distinct register addresses referenced by configured pins, ascending.
    pub fn mapped_addresses(&self) -> Vec<u32> {
        self.pins()
            .filter_map(|p| p.mapping.map(|m| m.address))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn subscribe<O>(&mut self, observer: O)
    where
        O: PinObserver + 'static,
    {
        self.observers.push(Box::new(observer));
    }
}

impl fmt::Debug for PinTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinTable")
            .field("max_pins", &self.pins.len())
            .field("pin_count", &self.pin_count)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_levels() {
        assert_eq!(PinState::from_level(true), PinState::High);
        assert_eq!(PinState::from_level(false), PinState::Low);
        assert_eq!(PinState::PullUp.level(), None);
        assert_eq!(PinState::Low.level(), Some(false));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(PinState::PullDown.to_string(), "PULL_DOWN");
        assert_eq!(PinDirection::Bidirectional.to_string(), "BIDIR");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(PinTable::new(0).unwrap_err(), PinError::AllocationError(0));
    }
}
