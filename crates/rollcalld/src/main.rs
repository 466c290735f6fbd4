use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rollcall_core::{AttendanceEngine, CaptureOutcome, Config, FaceMatcher, JsonFileStore, MarkOutcome};
use rollcall_hw::{open_channel, DeviceSession, SessionConfig};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

mod engine;

use engine::EngineHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("loading configuration")?;
    tracing::info!(device = %config.device.path, "rollcalld starting");

    let data_dir = config.data_dir();
    let store = JsonFileStore::open(&data_dir)
        .with_context(|| format!("opening data directory {}", data_dir.display()))?;
    let ledger = AttendanceEngine::open(store, config.schedule()?)?.with_matcher(
        FaceMatcher::new(config.matcher.similarity_scale),
        config.matcher.confidence_threshold,
    );

    let channel = open_channel(&config.device.path, config.device.baud_rate, CONNECT_TIMEOUT)
        .with_context(|| format!("opening device link {}", config.device.path))?;
    let session_config = SessionConfig::from(&config.device);
    let session = tokio::task::spawn_blocking(move || {
        let mut session = DeviceSession::new(channel, session_config);
        session.initialize().map(|()| session)
    })
    .await?
    .context("initializing capture device")?;

    let engine = engine::spawn_engine(session, ledger)?;
    let roster = engine.roster().await?;
    tracing::info!(
        users = roster.len(),
        dropped = roster.iter().filter(|u| u.is_dropped).count(),
        "rollcalld ready"
    );

    let mut poll = tokio::time::interval(Duration::from_millis(config.daemon.capture_poll_ms.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep = tokio::time::interval(Duration::from_secs(config.daemon.sweep_interval_secs.max(1)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = poll.tick() => poll_once(&engine).await?,
            _ = sweep.tick() => sweep_once(&engine).await,
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }

    tracing::info!("rollcalld shutting down");
    Ok(())
}

/// Run one capture poll. Only a lost device link is fatal.
async fn poll_once(engine: &EngineHandle) -> Result<()> {
    match engine.poll_capture(Utc::now()).await {
        Ok(None) => {}
        Ok(Some(CaptureOutcome::Unrecognized)) => tracing::info!("face not recognized"),
        Ok(Some(CaptureOutcome::Marked { user_id, outcome })) => match outcome {
            MarkOutcome::Recorded { status, dropped } => {
                tracing::info!(%user_id, %status, dropped, "attendance recorded")
            }
            MarkOutcome::AlreadyMarked(status) => {
                tracing::debug!(%user_id, %status, "already marked today")
            }
        },
        Err(e) if e.is_disconnect() => return Err(e).context("capture device disconnected"),
        Err(e) => tracing::warn!(error = %e, "capture poll failed"),
    }
    Ok(())
}

async fn sweep_once(engine: &EngineHandle) {
    match engine.sweep(Utc::now()).await {
        Ok(summary) if !summary.marked_absent.is_empty() => tracing::info!(
            absent = summary.marked_absent.len(),
            dropped = ?summary.dropped,
            "absence sweep recorded"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "absence sweep failed"),
    }
}
