//! Flat flash + RAM byte storage.
//!
//! | Range                      | Content                        |
//! |----------------------------|--------------------------------|
//! | `flash_start..ram_start`   | Program image, read-only       |
//! | `ram_start..memory_size`   | RAM, writable                  |

use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("access of {length} bytes at 0x{address:08x} exceeds memory size {size}")]
    OutOfBounds { address: u32, length: usize, size: u32 },
    #[error("write to 0x{address:08x} is below the RAM boundary 0x{ram_start:08x}")]
    ReadOnlyRegion { address: u32, ram_start: u32 },
    #[error("image of {length} bytes does not fit in {capacity} bytes")]
    TooLarge { length: usize, capacity: u32 },
    #[error("invalid memory layout: {0}")]
    InvalidLayout(String),
    #[error("unable to allocate {0} bytes of memory")]
    AllocationError(u32),
}

#[derive(Debug, Clone)]
pub struct AddressSpace {
    bytes: Vec<u8>,
    flash_start: u32,
    ram_start: u32,
    loaded: bool,
}

impl AddressSpace {
    pub fn new(memory_size: u32, flash_start: u32, ram_start: u32) -> Result<Self, MemoryError> {
        if memory_size == 0 {
            return Err(MemoryError::InvalidLayout("memory size must be non-zero".into()));
        }
        if flash_start > ram_start || ram_start > memory_size {
            return Err(MemoryError::InvalidLayout(format!(
                "expected flash_start <= ram_start <= memory_size, got 0x{:x} / 0x{:x} / 0x{:x}",
                flash_start, ram_start, memory_size
            )));
        }

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(memory_size as usize)
            .map_err(|_| MemoryError::AllocationError(memory_size))?;
        bytes.resize(memory_size as usize, 0);

        Ok(Self {
            bytes,
            flash_start,
            ram_start,
            loaded: false,
        })
    }

    pub fn memory_size(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn flash_start(&self) -> u32 {
        self.flash_start
    }

    pub fn ram_start(&self) -> u32 {
        self.ram_start
    }

    pub fn ram_range(&self) -> Range<u32> {
        self.ram_start..self.memory_size()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn span(&self, address: u32, length: usize) -> Result<Range<usize>, MemoryError> {
        let start = address as usize;
        match start.checked_add(length) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds {
                address,
                length,
                size: self.memory_size(),
            }),
        }
    }

    /// Copies a complete image to `flash_start`. The size check runs before any byte is
    /// touched, so a rejected image leaves the previous contents intact.
    pub fn load(&mut self, image: &[u8]) -> Result<usize, MemoryError> {
        let capacity = self.memory_size() - self.flash_start;
        if image.len() > self.bytes.len() || image.len() > capacity as usize {
            return Err(MemoryError::TooLarge {
                length: image.len(),
                capacity,
            });
        }

        // Stale bytes from an earlier, longer image would skew the extent heuristic.
        self.bytes[self.flash_start as usize..self.ram_start as usize].fill(0);
        let start = self.flash_start as usize;
        self.bytes[start..start + image.len()].copy_from_slice(image);
        self.loaded = true;
        Ok(image.len())
    }

    pub fn read(&self, address: u32, length: usize) -> Result<&[u8], MemoryError> {
        let span = self.span(address, length)?;
        Ok(&self.bytes[span])
    }

    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        let span = self.span(address, data.len())?;
        if address < self.ram_start {
            return Err(MemoryError::ReadOnlyRegion {
                address,
                ram_start: self.ram_start,
            });
        }
        self.bytes[span].copy_from_slice(data);
        Ok(())
    }

    pub fn clear_ram(&mut self) {
        self.bytes[self.ram_start as usize..].fill(0);
    }

    /// Offset one past the highest non-zero byte in the whole space.
    ///
    /// This approximates the firmware size; an image whose tail is zero padding reports
    /// shorter than it really is.
    pub fn firmware_extent(&self) -> u32 {
        self.bytes
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i as u32 + 1)
    }
}
