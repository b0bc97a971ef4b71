use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use feedwatch::api::HttpApi;
use feedwatch::bus::{EventBus, EventFilter};
use feedwatch::config::{AppConfig, CONFIG_PATH};
use feedwatch::feed::{RuleMultiplexer, WsFeedTransport};
use feedwatch::reporter::{self, RunSummary};
use feedwatch::trackers::{Services, TrackerManager};
use feedwatch::types::{TrackerConfig, TrackerType};

#[derive(Parser)]
#[command(name = "feedwatch", about = "Social platform monitoring daemon")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Only start trackers with these ids (repeatable)
    #[arg(long = "tracker")]
    trackers: Vec<String>,

    /// Only start trackers of this type
    #[arg(long = "type")]
    tracker_type: Option<TrackerType>,

    /// Also start trackers marked `enabled = false`
    #[arg(long)]
    all: bool,
}

impl Args {
    fn selects(&self, tracker: &TrackerConfig, enabled: bool) -> bool {
        if !enabled && !self.all {
            return false;
        }
        if !self.trackers.is_empty() && !self.trackers.contains(&tracker.id) {
            return false;
        }
        self.tracker_type.is_none_or(|t| t == tracker.tracker_type)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;
    info!("Loaded config from {}", args.config.display());
    if config.api.bearer_token.is_empty() {
        anyhow::bail!("No bearer token: set api.bearer_token or the FEEDWATCH_BEARER_TOKEN env var");
    }

    let api = HttpApi::new(&config.api, config.pacer.clone()).context("failed to build API client")?;
    let transport = WsFeedTransport::new(&config.stream, config.api.bearer_token.clone());
    let multiplexer = RuleMultiplexer::new(Arc::new(transport), &config.stream);
    let bus = EventBus::new(config.bus.capacity);
    let services = Services::in_memory(Arc::new(api), multiplexer, bus);
    let manager = TrackerManager::new(services, &config);

    // Subscribe before anything starts so no event is lost.
    let mut events = manager.subscribe(EventFilter::All);
    let mut summary = RunSummary::new();

    let mut selected = Vec::new();
    for seed in &config.trackers {
        let tracker = seed.to_tracker()?;
        let id = tracker.id.clone();
        if args.selects(&tracker, seed.enabled) {
            selected.push(id.clone());
        }
        if !manager.register(tracker).await? {
            warn!("[{id}] Duplicate tracker id in config; keeping the first");
        }
    }
    if selected.is_empty() {
        anyhow::bail!("No trackers selected; check [[trackers]] in {}", args.config.display());
    }

    let mut started = 0;
    for id in &selected {
        match manager.start(id).await {
            Ok(()) => started += 1,
            Err(e) => warn!("[{id}] Failed to start: {e}"),
        }
    }
    if started == 0 {
        manager.shutdown().await;
        anyhow::bail!("None of the {} selected tracker(s) started", selected.len());
    }
    info!(
        "{started}/{} tracker(s) running. Press Ctrl+C to stop.",
        selected.len()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    reporter::report_event(&event);
                    summary.record(&event);
                }
                None => {
                    warn!("Event bus closed");
                    break;
                }
            }
        }
    }

    manager.shutdown().await;

    for tracker in manager.list().await? {
        if let Some(err) = &tracker.last_error {
            warn!("[{}] Last error: {err}", tracker.id);
        }
    }
    summary.finish(events.missed());
    reporter::report_summary(&summary);

    Ok(())
}
