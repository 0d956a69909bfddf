//! DSP Remote
//!
//! Connects to a DSP engine, loads its configuration into an editing session
//! and polls telemetry into the spectrum analyzer until Ctrl+C.
//!
//! Usage: `remote [host] [control_port] [telemetry_port]`

use anyhow::{Context, Result};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dsp_remote::{
    analyzer::SpectrumAnalyzer,
    config::{AppConfig, Endpoints},
    convergence::{Coordinator, SyncStatus},
    persistence,
    protocol::DeviceDirection,
    reconnect::{ReconnectController, ReconnectEvent, ReconnectPolicy},
    session::Session,
    Error,
};

/// Backend used for device enumeration
const DEVICE_BACKEND: &str = "Alsa";

/// Frames between analyzer log lines
const STATS_EVERY: u64 = 50;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting DSP Remote");

    let mut config = AppConfig::load_or_default();
    let endpoints = endpoints_from_args(&config.connection)?;

    let session = Session::new(config.session.clone());
    let controller = ReconnectController::new(
        session.clone(),
        ReconnectPolicy::from_config(&config.reconnect),
        config.reconnect.enabled,
    );
    let _watcher = controller.spawn_watcher();

    let mut reconnects = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match reconnects.recv().await {
                Ok(ReconnectEvent::Exhausted { attempts }) => {
                    tracing::error!("Engine unreachable after {} attempts, reconnect manually", attempts);
                }
                Ok(event) => tracing::debug!("Reconnect: {:?}", event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let state = controller
        .connect(&endpoints)
        .await
        .with_context(|| format!("connecting to {}", endpoints.host))?;
    tracing::info!("Connected: {:?}", state);

    config.remember_endpoints(&endpoints);
    if let Err(e) = config.save_default() {
        tracing::warn!("Could not save config: {}", e);
    }

    // Engine info
    println!("\n=== Engine ===");
    match session.version().await {
        Ok(version) => println!("  Version: {}", version),
        Err(e) => println!("  Version: unavailable ({})", e),
    }
    if let Ok(volume) = session.get_volume().await {
        println!("  Volume: {:.1} dB", volume);
    }
    for direction in [DeviceDirection::Capture, DeviceDirection::Playback] {
        match session.list_devices(direction, DEVICE_BACKEND).await {
            Ok(devices) => {
                println!("  {:?} devices ({}):", direction, DEVICE_BACKEND);
                for device in devices {
                    match device.description {
                        Some(description) => println!("    {} ({})", device.name, description),
                        None => println!("    {}", device.name),
                    }
                }
            }
            Err(e) => println!("  {:?} devices: unavailable ({})", direction, e),
        }
    }
    println!();

    // Editing session
    let store = persistence::from_config(&config.persistence)?;
    let coordinator = Coordinator::new(session.clone(), Some(store), config.edit.debounce());
    coordinator.load().await?;

    let view = coordinator.state().view;
    println!("=== Pipeline ({} steps) ===", view.steps);
    for band in &view.bands {
        println!(
            "  {} [{}{}] freq={:?} gain={:?} q={:?} channels={:?}{}",
            band.name,
            band.kind,
            band.subtype.as_deref().map(|s| format!("/{}", s)).unwrap_or_default(),
            band.freq,
            band.gain,
            band.q,
            band.channels,
            if band.enabled { "" } else { " (bypassed)" }
        );
    }
    println!();

    let mut edits = coordinator.subscribe();
    tokio::spawn(async move {
        while edits.changed().await.is_ok() {
            let status = edits.borrow_and_update().status.clone();
            match status {
                SyncStatus::Resynced(e) => tracing::warn!("Edit rejected, resynchronized: {}", e),
                SyncStatus::Failed(e) => tracing::error!("Edit failed, local changes kept: {}", e),
                other => tracing::debug!("Edit status: {:?}", other),
            }
        }
    });

    // Telemetry loop
    let mut analyzer = SpectrumAnalyzer::new(config.analyzer.clone());
    let mut poll = tokio::time::interval(config.session.telemetry_poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let start_time = Instant::now();
    let mut frames: u64 = 0;

    tracing::info!("Polling telemetry - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = poll.tick() => {}
        }

        if !session.telemetry_available() {
            if frames > 0 && analyzer.is_stale(start_time.elapsed()) {
                tracing::debug!("Spectrum display stale");
            }
            continue;
        }

        match session.poll_telemetry().await {
            Ok(frame) => {
                analyzer.update(&frame.levels, start_time.elapsed());
                frames += 1;
                if frames % STATS_EVERY == 0 {
                    let state = analyzer.state();
                    let loudest = state.peak.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let average = state.long.iter().sum::<f32>() / state.long.len() as f32;
                    tracing::info!(
                        "Stats: {} frames, {} bins, peak {:.1} dB, long-term mean {:.1} dB",
                        frames,
                        analyzer.bins(),
                        loudest,
                        average
                    );
                }
            }
            Err(Error::Protocol(e)) => tracing::warn!("Dropped telemetry frame: {}", e),
            Err(e) => tracing::debug!("Telemetry poll failed: {}", e),
        }
    }

    tracing::info!("Shutting down");
    if let Err(e) = coordinator.commit_now().await {
        tracing::warn!("Final commit failed: {}", e);
    }
    controller.disconnect().await;

    Ok(())
}

fn endpoints_from_args(saved: &Endpoints) -> Result<Endpoints> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| saved.host.clone());
    let control_port = match args.next() {
        Some(port) => port.parse().context("invalid control port")?,
        None => saved.control_port,
    };
    let telemetry_port = match args.next() {
        Some(port) => port.parse().context("invalid telemetry port")?,
        None => saved.telemetry_port,
    };
    Ok(Endpoints::new(host, control_port, telemetry_port))
}
