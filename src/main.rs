//! HarborWatch - live vessel feed ingester
//!
//! Maintains one long-lived connection to the upstream AIS stream and rotates
//! the geographic subscription window across the configured zones. The
//! scheduler decides *where* to listen; the stream client owns *how* the
//! connection stays alive. They only meet in the coordinator loop below.

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harborwatch_backend::{
    models::Config,
    scheduler::{RegionalScheduler, SchedulerConfig, SchedulerEvent},
    stream::{StreamClientConfig, StreamConnectionClient, StreamEvent},
    SubscriptionFilter,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    info!("🚢 HarborWatch ingest starting");

    let scheduler = RegionalScheduler::with_default_regions(SchedulerConfig {
        region_duration_ms: config.region_duration_ms,
        auto_rotate: config.auto_rotate,
        ..Default::default()
    })?;

    let client = StreamConnectionClient::new(StreamClientConfig {
        url: config.stream_url.clone(),
        api_key: config.api_key.clone(),
        backoff_base_ms: config.reconnect_base_ms,
        max_reconnect_attempts: config.max_reconnect_attempts,
        ..Default::default()
    });

    // Apply the initial window before starting rotation, then skip the
    // scheduler's initial emit so the first connect is not doubled.
    let initial = scheduler.current_region();
    info!(region = %initial.name, "initial subscription window");
    client.connect(SubscriptionFilter::from_region(&initial));
    scheduler.start(true);

    // Subscription coordinator: region changes are the only write path into
    // the stream client from outside.
    let coordinator_client = client.clone();
    let mut scheduler_events = scheduler.subscribe_events();
    tokio::spawn(async move {
        loop {
            match scheduler_events.recv().await {
                Ok(SchedulerEvent::RegionChange(region)) => {
                    info!(region = %region.name, "region change, resubscribing");
                    coordinator_client
                        .update_subscription(SubscriptionFilter::from_region(&region));
                }
                Ok(SchedulerEvent::CycleComplete) => {
                    info!("completed a full rotation cycle");
                }
                Ok(SchedulerEvent::Stopped) => break,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "coordinator lagged behind scheduler events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Event sink: downstream storage/cache/broadcast consumers would hang off
    // their own receivers; this one just surfaces the feed in the logs.
    let mut stream_events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match stream_events.recv().await {
                Ok(StreamEvent::Position(update)) => {
                    debug!(
                        mmsi = update.mmsi,
                        lat = update.latitude,
                        lon = update.longitude,
                        sog = update.speed_over_ground,
                        "position"
                    );
                }
                Ok(StreamEvent::StaticData(data)) => {
                    debug!(mmsi = data.mmsi, name = ?data.name, "static data");
                }
                Ok(StreamEvent::Connected) => info!("upstream feed connected"),
                Ok(StreamEvent::Disconnected { code, reason }) => {
                    warn!(code, reason = %reason, "upstream feed disconnected");
                }
                Ok(StreamEvent::Reconnecting { attempt, delay_ms }) => {
                    info!(attempt, delay_ms, "reconnect scheduled");
                }
                Ok(StreamEvent::Warning {
                    message_type,
                    reason,
                    ..
                }) => {
                    warn!(%message_type, %reason, "frame decode warning");
                }
                Ok(StreamEvent::Error(e)) => error!(error = %e, "stream client error"),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event sink lagged behind stream events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Periodic statistics heartbeat.
    let stats_client = client.clone();
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(60));
        tick.tick().await;
        loop {
            tick.tick().await;
            let stats = stats_client.statistics();
            info!(
                connected = stats.connected,
                received = stats.messages_received,
                processed = stats.messages_processed,
                errors = stats.error_count,
                reconnect_attempts = stats.reconnect_attempts,
                "stream statistics"
            );
        }
    });

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    scheduler.stop();
    client.disconnect();

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harborwatch_backend=debug,harborwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
