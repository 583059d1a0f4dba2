// Benchmark for register <-> pin synchronisation
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use mcu_emu::hardware::{PinDirection, PinTable};
use std::hint::black_box;

/// 256 pins spread over 8 registers, 32 bits each.
fn full_table() -> PinTable {
    let mut pins = PinTable::new(256).unwrap();
    for index in 0..256 {
        pins.configure(index, PinDirection::Bidirectional, None).unwrap();
        pins.map_register(index, 0x20 + (index / 32) as u32, (index % 32) as u8)
            .unwrap();
    }
    pins
}

fn bench_update_from_register(c: &mut Criterion) {
    let mut pins = full_table();
    let addresses = pins.mapped_addresses();
    let mut flip = 0u32;
    c.bench_function("update_from_register 8x32 pins", |b| {
        b.iter(|| {
            flip = !flip;
            let mut changed = 0;
            for &address in &addresses {
                changed += pins.update_from_register(address, black_box(flip));
            }
            assert_eq!(changed, 256);
        });
    });
}

fn bench_update_to_register(c: &mut Criterion) {
    let pins = full_table();
    let addresses = pins.mapped_addresses();
    c.bench_function("update_to_register 8x32 pins", |b| {
        b.iter(|| {
            let mut total = 0;
            for &address in &addresses {
                let mut value = 0xa5a5_a5a5;
                total += pins.update_to_register(address, &mut value);
                black_box(value);
            }
            assert_eq!(total, 256);
        });
    });
}

criterion_group!(benches, bench_update_from_register, bench_update_to_register);
criterion_main!(benches);
