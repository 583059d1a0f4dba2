// Integration tests for pin/register synchronisation through the bridge

use async_trait::async_trait;
use mcu_emu::bridge::{Bridge, BridgeError, RegisterPort, SyncReport};
use mcu_emu::communication::MonitorError;
use mcu_emu::config::{BridgeConfig, McuConfig};
use mcu_emu::hardware::{PinDirection, PinState};
use mcu_emu::mcu::{Mcu, StepOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Register file held in memory.
#[derive(Default)]
struct FakePort {
    registers: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
    reads: usize,
    read_only: bool,
}

#[async_trait]
impl RegisterPort for FakePort {
    async fn read_word(&mut self, address: u32) -> Result<u32, MonitorError> {
        self.reads += 1;
        self.registers
            .get(&address)
            .copied()
            .ok_or_else(|| MonitorError::UnexpectedResponse(format!("no register 0x{:x}", address)))
    }

    async fn write_word(&mut self, address: u32, value: u32) -> Result<(), MonitorError> {
        if self.read_only {
            return Err(MonitorError::Unsupported("register writes"));
        }
        self.registers.insert(address, value);
        self.writes.push((address, value));
        Ok(())
    }
}

fn led_mcu() -> Arc<Mutex<Mcu>> {
    let mut mcu = Mcu::new(McuConfig::default()).unwrap();
    mcu.pins_mut()
        .configure(13, PinDirection::Output, Some("LED"))
        .unwrap();
    mcu.pins_mut().map_register(13, 0x25, 5).unwrap();
    Arc::new(Mutex::new(mcu))
}

fn port_with(address: u32, value: u32) -> FakePort {
    let mut port = FakePort::default();
    port.registers.insert(address, value);
    port
}

fn fast() -> BridgeConfig {
    BridgeConfig { poll_interval_ms: 5 }
}

#[tokio::test]
async fn test_pull_updates_pins() {
    let mcu = led_mcu();
    let mut bridge = Bridge::new(mcu.clone(), port_with(0x25, 0x20), &fast());
    assert_eq!(bridge.pull().await.unwrap(), 1);
    assert_eq!(mcu.lock().await.pin_state(13).unwrap(), PinState::High);
    assert_eq!(bridge.last_seen(0x25), Some(0x20));
    // Same value again changes nothing
    assert_eq!(bridge.pull().await.unwrap(), 0);
}

#[tokio::test]
async fn test_push_writes_only_changed_words() {
    let mcu = led_mcu();
    let mut bridge = Bridge::new(mcu.clone(), port_with(0x25, 0x21), &fast());

    // Nothing is known about the register before the first pull
    mcu.lock().await.set_pin_state(13, PinState::Low).unwrap();
    assert_eq!(bridge.push().await.unwrap(), 0);

    bridge.pull().await.unwrap();
    assert_eq!(bridge.push().await.unwrap(), 0);

    mcu.lock().await.set_pin_state(13, PinState::Low).unwrap();
    assert_eq!(bridge.push().await.unwrap(), 1);
    // Bit 0 belongs to nobody and survives
    assert_eq!(bridge.port().writes, vec![(0x25, 0x01)]);
    assert_eq!(bridge.push().await.unwrap(), 0);
}

#[tokio::test]
async fn test_sync_once_reports_counts() {
    let mcu = led_mcu();
    let mut bridge = Bridge::new(mcu.clone(), port_with(0x25, 0x00), &fast());
    assert_eq!(bridge.sync_once().await.unwrap(), SyncReport { pushed: 0, pulled: 0 });

    mcu.lock().await.set_pin_state(13, PinState::High).unwrap();
    assert_eq!(bridge.sync_once().await.unwrap(), SyncReport { pushed: 1, pulled: 0 });
    assert_eq!(bridge.into_port().registers[&0x25], 0x20);
}

#[tokio::test]
async fn test_read_only_port_disables_push() {
    let mcu = led_mcu();
    let mut port = port_with(0x25, 0x00);
    port.read_only = true;
    let mut bridge = Bridge::new(mcu.clone(), port, &fast());
    bridge.pull().await.unwrap();

    mcu.lock().await.set_pin_state(13, PinState::High).unwrap();
    assert_eq!(bridge.push().await.unwrap(), 0);
    assert_eq!(bridge.push().await.unwrap(), 0);
    assert!(bridge.port().writes.is_empty());
}

#[tokio::test]
async fn test_read_failure_propagates() {
    let mcu = led_mcu();
    let mut bridge = Bridge::new(mcu, FakePort::default(), &fast());
    assert!(matches!(
        bridge.pull().await,
        Err(BridgeError::Monitor(MonitorError::UnexpectedResponse(_)))
    ));
}

#[tokio::test]
async fn test_step_then_pull() {
    let mcu = led_mcu();
    {
        let mut mcu = mcu.lock().await;
        mcu.load_firmware_bytes(&[0xff; 16]).unwrap();
        mcu.run().unwrap();
    }
    let mut bridge = Bridge::new(mcu.clone(), port_with(0x25, 0x20), &fast());
    assert_eq!(bridge.step().await.unwrap(), StepOutcome::Continued);

    let mcu = mcu.lock().await;
    assert_eq!(mcu.program_counter(), 2);
    assert_eq!(mcu.pin_state(13).unwrap(), PinState::High);
}

#[tokio::test]
async fn test_step_requires_running_mcu() {
    let mut bridge = Bridge::new(led_mcu(), port_with(0x25, 0), &fast());
    assert!(matches!(bridge.step().await, Err(BridgeError::Mcu(_))));
}

#[tokio::test]
async fn test_run_loop_stops_on_cancel() {
    let mcu = led_mcu();
    let mut bridge = Bridge::new(mcu.clone(), port_with(0x25, 0x20), &fast());
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });

    let total = bridge.run(cancel).await;
    assert_eq!(total.pulled, 1);
    assert_eq!(mcu.lock().await.pin_state(13).unwrap(), PinState::High);
}

#[tokio::test]
async fn test_run_for_stops_after_tick_count() {
    let mcu = led_mcu();
    let mut bridge = Bridge::new(mcu.clone(), port_with(0x25, 0x20), &fast());
    let total = bridge.run_for(3, CancellationToken::new()).await;
    assert_eq!(total, SyncReport { pushed: 0, pulled: 1 });
    // One mapped address, sampled once per tick
    assert_eq!(bridge.port().reads, 3);
}

#[tokio::test]
async fn test_run_for_honours_cancel() {
    let mut bridge = Bridge::new(led_mcu(), port_with(0x25, 0), &fast());
    let cancel = CancellationToken::new();
    cancel.cancel();
    bridge.run_for(100, cancel).await;
    assert_eq!(bridge.port().reads, 0);
}
