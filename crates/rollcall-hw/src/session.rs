//! Command sequences against the capture device.
//!
//! Every exchange is one request frame followed by one response frame. The
//! session owns the framer, so exchanges never interleave.

use std::thread;
use std::time::Duration;

use rollcall_core::config::DeviceConfig;
use rollcall_core::{CaptureSample, FeatureVector};
use thiserror::Error;

use crate::channel::Channel;
use crate::protocol::{Command, ProtocolFrame, Response};
use crate::transport::{FramerConfig, TransportError, TransportFramer};

const CONFIDENCE_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{command}: unexpected response code {code:#04x}")]
    UnexpectedResponse { command: Command, code: u8 },
    #[error("device rejected {0}")]
    Rejected(Command),
    #[error("malformed feature payload: {0}")]
    MalformedFeatures(String),
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("user id is empty")]
    EmptyId,
    #[error("user id is {len} bytes, limit is {max}")]
    IdTooLong { len: usize, max: usize },
    #[error("device did not confirm training (response {0:#04x})")]
    TrainingFailed(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub framer: FramerConfig,
    /// Wait before the first Init so the board can boot.
    pub boot_delay: Duration,
    /// Wait after a Reset reply while the board restarts.
    pub reset_settle: Duration,
    pub init_attempts: u32,
    pub max_user_id_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            framer: FramerConfig::default(),
            boot_delay: Duration::from_millis(2000),
            reset_settle: Duration::from_millis(2000),
            init_attempts: 3,
            max_user_id_len: 64,
        }
    }
}

impl From<&DeviceConfig> for SessionConfig {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            framer: FramerConfig {
                header_timeout: Duration::from_millis(device.header_timeout_ms),
                payload_timeout: Duration::from_millis(device.payload_timeout_ms),
                poll_interval: Duration::from_millis(device.poll_interval_ms),
                ..FramerConfig::default()
            },
            boot_delay: Duration::from_millis(device.boot_delay_ms),
            reset_settle: Duration::from_millis(device.reset_settle_ms),
            init_attempts: device.init_attempts,
            max_user_id_len: device.max_user_id_len,
        }
    }
}

/// An open session with the capture device.
pub struct DeviceSession<C> {
    framer: TransportFramer<C>,
    config: SessionConfig,
    initialized: bool,
}

impl<C: Channel> DeviceSession<C> {
    pub fn new(channel: C, config: SessionConfig) -> Self {
        Self {
            framer: TransportFramer::new(channel, config.framer),
            config,
            initialized: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn framer_mut(&mut self) -> &mut TransportFramer<C> {
        &mut self.framer
    }

    /// Wait for the board to boot, then handshake with Init.
    ///
    /// Failed attempts resync the line before the next try.
    pub fn initialize(&mut self) -> Result<(), DeviceError> {
        thread::sleep(self.config.boot_delay);
        let attempts = self.config.init_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_init() {
                Ok(()) => {
                    self.initialized = true;
                    tracing::info!(attempt, "capture device initialized");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(attempt, error = %e, "device init failed, retrying");
                    self.framer.resync()?;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempts, error = %e, "device init failed");
                    return Err(e);
                }
            }
        }
    }

    fn try_init(&mut self) -> Result<(), DeviceError> {
        let reply = self.exchange(Command::Init, &[], false)?;
        expect(Command::Init, &reply, Response::Ok)
    }

    /// Check for an unsolicited face notification without blocking.
    ///
    /// Returns `None` when nothing is buffered, when the notification is not a
    /// face event, or when the device reports no face on the follow-up query.
    pub fn poll_for_capture(&mut self) -> Result<Option<CaptureSample>, DeviceError> {
        if !self.framer.header_available()? {
            return Ok(None);
        }
        let notice = self.framer.receive_frame(false)?;
        match notice.response() {
            Some(Response::FaceDetected) | Some(Response::FaceRecognized) => {
                tracing::debug!(code = notice.code, "face notification");
                self.request_features()
            }
            _ => {
                tracing::debug!(code = notice.code, "ignoring notification");
                Ok(None)
            }
        }
    }

    /// Ask for the features of the most recent face.
    pub fn request_features(&mut self) -> Result<Option<CaptureSample>, DeviceError> {
        let reply = self.exchange(Command::GetFeatures, &[], true)?;
        match reply.response() {
            Some(Response::FeaturesData) => parse_features(&reply.payload).map(Some),
            Some(Response::NoFace) => Ok(None),
            Some(Response::Error) => Err(DeviceError::Rejected(Command::GetFeatures)),
            _ => Err(unexpected(Command::GetFeatures, &reply)),
        }
    }

    /// Have the device train on the face in view under `user_id`.
    pub fn train_face(&mut self, user_id: &str) -> Result<(), TrainError> {
        let id = user_id.as_bytes();
        if id.is_empty() {
            return Err(TrainError::EmptyId);
        }
        if id.len() > self.config.max_user_id_len {
            return Err(TrainError::IdTooLong {
                len: id.len(),
                max: self.config.max_user_id_len,
            });
        }
        self.framer.send_command(Command::TrainFace.code(), id)?;
        let reply = self.framer.receive_frame(false)?;
        if reply.response() != Some(Response::FaceTrained) {
            tracing::warn!(user_id, code = reply.code, "training not confirmed");
            return Err(TrainError::TrainingFailed(reply.code));
        }
        tracing::info!(user_id, "face trained on device");
        Ok(())
    }

    /// Reset the board. The settle delay applies whatever the reply.
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        let reply = self.exchange(Command::Reset, &[], false)?;
        thread::sleep(self.config.reset_settle);
        expect(Command::Reset, &reply, Response::Ok)?;
        tracing::info!("capture device reset");
        Ok(())
    }

    pub fn capture_frame(&mut self) -> Result<(), DeviceError> {
        let reply = self.exchange(Command::CaptureFrame, &[], false)?;
        expect(Command::CaptureFrame, &reply, Response::Ok)
    }

    pub fn detect_face(&mut self) -> Result<bool, DeviceError> {
        let reply = self.exchange(Command::DetectFace, &[], false)?;
        match reply.response() {
            Some(Response::FaceDetected) => Ok(true),
            Some(Response::NoFace) => Ok(false),
            Some(Response::Error) => Err(DeviceError::Rejected(Command::DetectFace)),
            _ => Err(unexpected(Command::DetectFace, &reply)),
        }
    }

    /// On-device recognition. The id the board reports is returned as-is.
    pub fn recognize_face(&mut self) -> Result<Option<String>, DeviceError> {
        let reply = self.exchange(Command::RecognizeFace, &[], true)?;
        match reply.response() {
            Some(Response::FaceRecognized) => {
                Ok(Some(String::from_utf8_lossy(&reply.payload).into_owned()))
            }
            Some(Response::UnknownFace) | Some(Response::NoFace) => Ok(None),
            Some(Response::Error) => Err(DeviceError::Rejected(Command::RecognizeFace)),
            _ => Err(unexpected(Command::RecognizeFace, &reply)),
        }
    }

    fn exchange(
        &mut self,
        command: Command,
        payload: &[u8],
        want_payload: bool,
    ) -> Result<ProtocolFrame, DeviceError> {
        self.framer.send_command(command.code(), payload)?;
        let reply = self.framer.receive_frame(want_payload)?;
        tracing::debug!(%command, code = reply.code, len = reply.payload.len(), "device replied");
        Ok(reply)
    }
}

fn expect(command: Command, reply: &ProtocolFrame, want: Response) -> Result<(), DeviceError> {
    match reply.response() {
        Some(r) if r == want => Ok(()),
        Some(Response::Error) => Err(DeviceError::Rejected(command)),
        _ => Err(unexpected(command, reply)),
    }
}

fn unexpected(command: Command, reply: &ProtocolFrame) -> DeviceError {
    DeviceError::UnexpectedResponse {
        command,
        code: reply.code,
    }
}

/// Decode a FeaturesData payload: LE f32 confidence, then LE f32 features.
pub fn parse_features(payload: &[u8]) -> Result<CaptureSample, DeviceError> {
    if payload.len() < CONFIDENCE_BYTES {
        return Err(DeviceError::MalformedFeatures(format!(
            "{} bytes, need at least {CONFIDENCE_BYTES}",
            payload.len()
        )));
    }
    let (head, body) = payload.split_at(CONFIDENCE_BYTES);
    let confidence = f32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let features =
        FeatureVector::from_le_bytes(body).map_err(|e| DeviceError::MalformedFeatures(e.to_string()))?;
    if features.is_empty() {
        return Err(DeviceError::MalformedFeatures("no feature values".into()));
    }
    Ok(CaptureSample::detected(features, confidence))
}
