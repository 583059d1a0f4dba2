// Integration tests for the flash/RAM address space

use mcu_emu::hardware::{AddressSpace, MemoryError};

fn atmega() -> AddressSpace {
    AddressSpace::new(32_768, 0, 256).unwrap()
}

#[test]
fn test_load_and_read_back() {
    let mut space = atmega();
    assert!(!space.is_loaded());
    assert_eq!(space.load(&[0x0c, 0x94, 0x34, 0x00]).unwrap(), 4);
    assert!(space.is_loaded());
    assert_eq!(space.read(0, 4).unwrap(), &[0x0c, 0x94, 0x34, 0x00]);
    assert_eq!(space.firmware_extent(), 4);
}

#[test]
fn test_flash_is_read_only() {
    let mut space = atmega();
    assert_eq!(
        space.write(0x10, &[1]),
        Err(MemoryError::ReadOnlyRegion { address: 0x10, ram_start: 256 })
    );
    assert!(space.write(256, &[1, 2, 3]).is_ok());
    assert_eq!(space.read(256, 3).unwrap(), &[1, 2, 3]);
}

#[test]
fn test_bounds() {
    let mut space = atmega();
    assert!(space.read(32_766, 2).is_ok());
    assert_eq!(
        space.read(32_767, 2),
        Err(MemoryError::OutOfBounds { address: 32_767, length: 2, size: 32_768 })
    );
    assert!(matches!(
        space.write(32_768, &[0]),
        Err(MemoryError::OutOfBounds { .. })
    ));
    // Zero-length access at the very end is in bounds
    assert_eq!(space.read(32_768, 0).unwrap().len(), 0);
}

#[test]
fn test_out_of_bounds_reported_before_read_only() {
    let mut space = AddressSpace::new(64, 0, 64).unwrap();
    assert!(matches!(
        space.write(60, &[0; 8]),
        Err(MemoryError::OutOfBounds { .. })
    ));
}

#[test]
fn test_oversized_image_leaves_memory_intact() {
    let mut space = atmega();
    space.load(&[0xaa; 16]).unwrap();
    let big = vec![0x55; 32_769];
    assert_eq!(
        space.load(&big),
        Err(MemoryError::TooLarge { length: 32_769, capacity: 32_768 })
    );
    assert_eq!(space.read(0, 16).unwrap(), &[0xaa; 16]);
}

#[test]
fn test_image_must_fit_after_flash_start() {
    let mut space = AddressSpace::new(1024, 512, 768).unwrap();
    assert!(matches!(
        space.load(&[1; 600]),
        Err(MemoryError::TooLarge { length: 600, capacity: 512 })
    ));
    assert!(space.load(&[1; 512]).is_ok());
    assert_eq!(space.read(512, 1).unwrap(), &[1]);
}

#[test]
fn test_extent_ignores_trailing_zero_padding() {
    let mut space = atmega();
    let mut image = vec![0x11; 100];
    image.extend_from_slice(&[0; 28]);
    assert_eq!(space.load(&image).unwrap(), 128);
    assert_eq!(space.firmware_extent(), 100);
}

#[test]
fn test_reload_clears_previous_flash() {
    let mut space = atmega();
    space.load(&[0xff; 200]).unwrap();
    space.load(&[0x01; 10]).unwrap();
    assert_eq!(space.firmware_extent(), 10);
    assert_eq!(space.read(10, 1).unwrap(), &[0]);
}

#[test]
fn test_clear_ram_keeps_flash() {
    let mut space = atmega();
    space.load(&[0x42; 8]).unwrap();
    space.write(300, &[9, 9]).unwrap();
    space.clear_ram();
    assert_eq!(space.read(300, 2).unwrap(), &[0, 0]);
    assert_eq!(space.read(0, 8).unwrap(), &[0x42; 8]);
    assert_eq!(space.ram_range(), 256..32_768);
}
