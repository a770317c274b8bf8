//! Mailflow: segment-triggered email automation worker.
//!
//! Loads seed data into the in-memory stores, replays its trigger events,
//! and runs the flow executor until shutdown.

mod seed;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use mailflow_cdp::ContactStore;
use mailflow_channels::{EngagementTracker, OutboxMailer, TemplateLibrary};
use mailflow_core::config::AppConfig;
use mailflow_core::event_bus::tracing_sink;
use mailflow_journey::{
    EnrollmentStore, ExecutorServices, FlowExecutor, FlowStore, FlowWorker, TriggerMatcher,
};
use mailflow_segmentation::SegmentationEngine;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::seed::Seed;

#[derive(Parser, Debug)]
#[command(name = "mailflow")]
#[command(about = "Segment-triggered email automation worker")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "MAILFLOW__NODE_ID")]
    node_id: Option<String>,

    /// Executor poll interval in milliseconds (overrides config)
    #[arg(long, env = "MAILFLOW__EXECUTOR__POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Enrollments examined per pass (overrides config)
    #[arg(long, env = "MAILFLOW__EXECUTOR__BATCH_SIZE")]
    batch_size: Option<usize>,

    /// JSON file with contacts, segments, templates, flows and events
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Load the built-in demo flows and contacts
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Run a single executor pass, print its report, and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailflow=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Mailflow starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.executor.poll_interval_ms = ms;
    }
    if let Some(batch) = cli.batch_size {
        config.executor.batch_size = batch;
    }

    info!(
        node_id = %config.node_id,
        poll_interval_ms = config.executor.poll_interval_ms,
        batch_size = config.executor.batch_size,
        max_attempts = config.executor.max_attempts,
        "Configuration loaded"
    );

    let flows = Arc::new(FlowStore::new());
    let enrollments = Arc::new(EnrollmentStore::new());
    let contacts = Arc::new(ContactStore::new());
    let segments = Arc::new(SegmentationEngine::with_config(config.segmentation.clone()));
    let templates = Arc::new(TemplateLibrary::new());
    let mailer = Arc::new(OutboxMailer::new(config.email.clone()));
    let engagement = Arc::new(EngagementTracker::new());
    let sink = tracing_sink();

    let seed = match (&cli.seed, cli.demo) {
        (Some(path), _) => Seed::from_file(path)?,
        (None, true) => Seed::demo(),
        (None, false) => Seed::default(),
    };
    let events = seed.apply(&contacts, &segments, &templates, &flows);

    let matcher = Arc::new(
        TriggerMatcher::new(
            Arc::clone(&flows),
            Arc::clone(&enrollments),
            contacts.clone(),
            config.node_id.clone(),
        )
        .with_event_sink(Arc::clone(&sink)),
    );
    let executor = Arc::new(
        FlowExecutor::new(
            &config,
            Arc::clone(&flows),
            Arc::clone(&enrollments),
            Arc::clone(&matcher),
            ExecutorServices {
                contacts: contacts.clone(),
                mailer: mailer.clone(),
                engagement,
                templates,
            },
        )
        .with_segments(segments)
        .with_event_sink(sink),
    );

    let now = Utc::now();
    let enrolled: usize = events
        .iter()
        .map(|event| matcher.handle_event(event, now).len())
        .sum();
    info!(events = events.len(), enrolled, "Trigger events replayed");

    if cli.once {
        let report = executor.run_pass(Utc::now());
        println!("{}", serde_json::to_string_pretty(&report)?);
        info!(emails = mailer.sent_count(), "Single pass finished");
        return Ok(());
    }

    if !config.executor.enabled {
        info!("Executor disabled by configuration, exiting");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = FlowWorker::new(executor, config.node_id.clone()).spawn(shutdown_rx);

    info!("Mailflow is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    worker.await?;
    info!(
        emails = mailer.sent_count(),
        enrollments = enrollments.len(),
        "Mailflow stopped"
    );

    Ok(())
}
