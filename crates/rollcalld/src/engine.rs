use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceEngine, AttendanceError, AttendanceStore, CaptureOutcome, SweepSummary, UserEntry,
};
use rollcall_hw::{Channel, DeviceError, DeviceSession, TransportError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("attendance error: {0}")]
    Attendance(#[from] AttendanceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// The device link is gone and polling cannot recover.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            EngineError::Device(DeviceError::Transport(TransportError::Disconnected))
        )
    }
}

/// Messages sent from the async tasks to the engine thread.
enum EngineRequest {
    PollCapture {
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<Option<CaptureOutcome>, EngineError>>,
    },
    Sweep {
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<SweepSummary, EngineError>>,
    },
    Roster {
        reply: oneshot::Sender<Vec<UserEntry>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Check the device for a face notification and mark the matched user.
    /// `None` means the device had nothing to report.
    pub async fn poll_capture(&self, at: DateTime<Utc>) -> Result<Option<CaptureOutcome>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::PollCapture { at, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Give every unmarked, non-dropped user an absence once the window closed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Sweep { now, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn roster(&self) -> Result<Vec<UserEntry>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Roster { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the device session and the ledger, so every device
/// exchange and every ledger mutation is serialized through the request
/// queue. The thread exits once all handles are dropped.
pub fn spawn_engine<C, S>(
    mut session: DeviceSession<C>,
    mut ledger: AttendanceEngine<S>,
) -> Result<EngineHandle, EngineError>
where
    C: Channel + Send + 'static,
    S: AttendanceStore + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::PollCapture { at, reply } => {
                        let result = run_poll(&mut session, &mut ledger, at);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Sweep { now, reply } => {
                        let result = ledger
                            .process_scheduled_status_changes(now)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Roster { reply } => {
                        let _ = reply.send(ledger.user_entries());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_poll<C: Channel, S: AttendanceStore>(
    session: &mut DeviceSession<C>,
    ledger: &mut AttendanceEngine<S>,
    at: DateTime<Utc>,
) -> Result<Option<CaptureOutcome>, EngineError> {
    let Some(sample) = session.poll_for_capture()? else {
        return Ok(None);
    };
    tracing::debug!(
        confidence = sample.confidence,
        features = sample.features.len(),
        "capture received"
    );
    Ok(Some(ledger.handle_capture(&sample, at)?))
}
