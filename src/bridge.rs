// src/bridge.rs - Keeps the pin table and the emulator's registers coherent
use crate::communication::{MonitorChannel, MonitorError};
use crate::config::BridgeConfig;
use crate::mcu::{Mcu, McuError, StepOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("MCU error: {0}")]
    Mcu(#[from] McuError),
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),
}

/// Word-level access to the registers of whatever is running the firmware.
#[async_trait]
pub trait RegisterPort: Send {
    async fn read_word(&mut self, address: u32) -> Result<u32, MonitorError>;
    async fn write_word(&mut self, address: u32, value: u32) -> Result<(), MonitorError>;
}

#[async_trait]
impl RegisterPort for MonitorChannel {
    async fn read_word(&mut self, address: u32) -> Result<u32, MonitorError> {
        MonitorChannel::read_word(self, address).await
    }

    async fn write_word(&mut self, address: u32, value: u32) -> Result<(), MonitorError> {
        MonitorChannel::write_word(self, address, value).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Register words written to the port.
    pub pushed: usize,
    /// Pins whose state changed from sampled register values.
    pub pulled: usize,
}

pub struct Bridge<P> {
    mcu: Arc<Mutex<Mcu>>,
    port: P,
    last_seen: HashMap<u32, u32>,
    poll_interval: Duration,
    writes_supported: bool,
}

impl<P: RegisterPort> Bridge<P> {
    pub fn new(mcu: Arc<Mutex<Mcu>>, port: P, config: &BridgeConfig) -> Self {
        Self {
            mcu,
            port,
            last_seen: HashMap::new(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            writes_supported: true,
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Last value read from or written to `address`.
    pub fn last_seen(&self, address: u32) -> Option<u32> {
        self.last_seen.get(&address).copied()
    }

    async fn mapped_addresses(&self) -> Vec<u32> {
        self.mcu.lock().await.pins().mapped_addresses()
    }

    /// Samples every mapped register and applies it to the pin table.
    pub async fn pull(&mut self) -> Result<usize, BridgeError> {
        let mut changed = 0;
        for address in self.mapped_addresses().await {
            let value = self.port.read_word(address).await?;
            let mut mcu = self.mcu.lock().await;
            changed += mcu.pins_mut().update_from_register(address, value);
            self.last_seen.insert(address, value);
        }
        Ok(changed)
    }

    /// Folds pin states into the last sampled words and writes the ones that differ.
    /// Addresses never pulled are skipped since their other bits are unknown.
    pub async fn push(&mut self) -> Result<usize, BridgeError> {
        if !self.writes_supported {
            return Ok(0);
        }

        let mut written = 0;
        for address in self.mapped_addresses().await {
            let Some(previous) = self.last_seen.get(&address).copied() else {
                continue;
            };
            let mut value = previous;
            self.mcu.lock().await.pins().update_to_register(address, &mut value);
            if value == previous {
                continue;
            }

            match self.port.write_word(address, value).await {
                Ok(()) => {
                    self.last_seen.insert(address, value);
                    written += 1;
                }
                Err(MonitorError::Unsupported(what)) => {
                    tracing::warn!("Emulator does not support {}, pin writes disabled", what);
                    self.writes_supported = false;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    pub async fn sync_once(&mut self) -> Result<SyncReport, BridgeError> {
        let pushed = self.push().await?;
        let pulled = self.pull().await?;
        tracing::trace!("Sync pushed {} words, updated {} pins", pushed, pulled);
        Ok(SyncReport { pushed, pulled })
    }

    /// Advances the MCU by one instruction and refreshes pins from the port.
    pub async fn step(&mut self) -> Result<StepOutcome, BridgeError> {
        let outcome = self.mcu.lock().await.step()?;
        self.pull().await?;
        Ok(outcome)
    }

    /// Syncs on every poll tick until `cancel` fires. Returns the accumulated counts.
    pub async fn run(&mut self, cancel: CancellationToken) -> SyncReport {
        self.tick_loop(None, cancel).await
    }

    /// Like [`Bridge::run`], but stops after `ticks` syncs.
    pub async fn run_for(&mut self, ticks: u32, cancel: CancellationToken) -> SyncReport {
        self.tick_loop(Some(ticks), cancel).await
    }

    async fn tick_loop(&mut self, limit: Option<u32>, cancel: CancellationToken) -> SyncReport {
        let mut total = SyncReport::default();
        let mut done = 0u32;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        while limit.is_none_or(|limit| done < limit) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Bridge loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.sync_once().await {
                        Ok(report) => {
                            total.pushed += report.pushed;
                            total.pulled += report.pulled;
                        }
                        Err(e) => tracing::error!("Bridge sync error: {}", e),
                    }
                    done += 1;
                }
            }
        }
        total
    }
}
