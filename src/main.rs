// src/main.rs - Command line front end for the MCU emulator
use clap::Parser;
use mcu_emu::{Bridge, Config, HaltReason, Mcu, MonitorChannel, PinEventChannel, load_config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Parser)]
#[command(name = "mcu-emu", version, about = "Microcontroller pin and register emulator")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Raw firmware image to load into flash
    #[arg(short, long)]
    firmware: Option<PathBuf>,

    /// Run until this address (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_address)]
    run_until: Option<u32>,

    /// Start the external emulator and sync pins with it
    #[arg(long)]
    emulator: bool,

    /// Number of bridge sync ticks before shutting the emulator down
    #[arg(long, default_value_t = 10)]
    sync_ticks: u32,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            load_config(&path)?
        }
        None => Config::default(),
    };
    config.validate().map_err(|e| {
        tracing::error!("Configuration rejected: {}", e);
        e
    })?;

    let mut mcu = Mcu::from_config(&config)?;
    tracing::info!("MCU: {} ({})", mcu.config().name, mcu.config().mcu_type);

    let (events, mut event_rx) = PinEventChannel::new(64);
    mcu.pins_mut().subscribe(events);
    let event_log = tokio::spawn(async move {
        while let Some(change) = event_rx.recv().await {
            tracing::debug!("Pin event at {}: {} {} -> {}", change.at, change.index, change.old, change.new);
        }
    });

    if let Some(firmware) = &args.firmware {
        mcu.load_firmware(firmware)?;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, stopping");
                cancel.cancel();
            }
        });
    }

    let mcu = if let Some(address) = args.run_until {
        let token = cancel.clone();
        let (mcu, reason) = tokio::task::spawn_blocking(move || {
            let reason = mcu.run_until(address, &token);
            (mcu, reason)
        })
        .await?;
        match reason? {
            HaltReason::Breakpoint(at) => tracing::info!("Stopped at 0x{:08x}", at),
            HaltReason::EndOfMemory => tracing::info!("Reached the end of memory"),
            HaltReason::Cancelled => tracing::info!("Run cancelled"),
        }
        mcu
    } else {
        mcu
    };

    let mcu = Arc::new(Mutex::new(mcu));

    if args.emulator {
        let mut channel = MonitorChannel::new(config.emulator.clone());
        channel.set_cancellation_token(cancel.child_token());
        match channel.installed_version().await {
            Ok(version) => tracing::info!("Emulator: {}", version),
            Err(e) => tracing::warn!("Could not query emulator version: {}", e),
        }
        channel.start().await?;

        let mut bridge = Bridge::new(mcu.clone(), channel, &config.bridge);
        let report = bridge.run_for(args.sync_ticks, cancel.child_token()).await;
        tracing::info!(
            "Bridge finished: {} words pushed, {} pin changes pulled",
            report.pushed,
            report.pulled
        );
        bridge.into_port().stop().await;
    }

    let snapshot = mcu.lock().await.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    drop(mcu);
    event_log.abort();
    Ok(())
}
