//! Strata Subscription Daemon
//!
//! Runs the multi-SIM subscription orchestrator on a field device.
//!
//! - Loads the orchestrator config (TOML)
//! - Boots the subscription service against the simulated modem
//! - Powers the radios and announces configured cards
//! - Logs activation, deactivation and data-subscription notices
//! - Dumps the orchestrator state as JSON on an interval

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use strata_subscription::preference::{FilePreferenceStore, MemoryPreferenceStore, PreferenceStore};
use strata_subscription::sim::SimulatedCollaborators;
use strata_subscription::{
    Event, EventSender, ManagerConfig, NoticeKind, NoticeReceiver, SubscriptionHandle,
    SubscriptionService,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Strata subscription daemon.
#[derive(Parser, Debug)]
#[command(name = "strata-subd", about = "Strata multi-SIM subscription daemon")]
struct Cli {
    /// Orchestrator config file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drive a simulated modem and card inventory.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    simulate: bool,

    /// State dump interval in seconds (0 disables).
    #[arg(long, default_value_t = 30)]
    state_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    };

    tracing::info!(
        slots = config.slot_count,
        simulate = cli.simulate,
        config = ?cli.config,
        "strata-subd starting"
    );

    if !cli.simulate {
        anyhow::bail!("no modem backend is available on this build; run with --simulate true");
    }

    let preferences: Box<dyn PreferenceStore> = match &config.preferences_path {
        Some(path) => Box::new(
            FilePreferenceStore::open(path)
                .with_context(|| format!("opening preference store {}", path.display()))?,
        ),
        None => Box::new(MemoryPreferenceStore::new()),
    };

    let slot_count = config.slot_count;
    let (events, event_rx) = EventSender::channel();
    let sim = SimulatedCollaborators::new(&config.simulation, slot_count, events.clone());
    let (handle, service) = SubscriptionService::spawn_with_events(
        config,
        sim.collaborators(preferences),
        events,
        event_rx,
    );

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Notice logging ──────────────────────────────────────────
    for slot in 0..slot_count {
        for kind in [
            NoticeKind::Activated,
            NoticeKind::Deactivated,
            NoticeKind::NewCardAvailable,
            NoticeKind::DataSubscriptionChanged,
        ] {
            let (_, rx) = handle.register(slot, kind).await?;
            tokio::spawn(log_notices(rx, shutdown_rx.clone()));
        }
    }

    // ── Bring-up ────────────────────────────────────────────────
    for slot in 0..slot_count {
        handle.post(Event::RadioOn { slot });
    }
    for slot in sim.cards.occupied_slots() {
        handle.post(Event::CardInfoAvailable { slot });
    }

    // ── State dumps ─────────────────────────────────────────────
    if cli.state_interval > 0 {
        tokio::spawn(dump_state(
            handle.clone(),
            Duration::from_secs(cli.state_interval),
            shutdown_rx.clone(),
        ));
    }

    // ── Shutdown handling ───────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("received SIGINT, shutting down");
    let _ = shutdown_tx.send(true);
    service.shutdown().await;

    tracing::info!("strata-subd stopped");
    Ok(())
}

async fn log_notices(mut rx: NoticeReceiver, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            notice = rx.recv() => match notice {
                Some(notice) => tracing::info!(slot = notice.slot(), ?notice, "subscription notice"),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn dump_state(
    handle: SubscriptionHandle,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match serde_json::to_string(&handle.snapshot()) {
                    Ok(json) => tracing::info!(state = %json, "subscription state"),
                    Err(e) => tracing::warn!(error = %e, "failed to encode state"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
