//! Wire format of the capture device link.
//!
//! Requests and responses share one layout: `[code:1][len:1][payload:len]`.

use std::fmt;

use crate::transport::TransportError;

/// Code byte plus length byte.
pub const HEADER_LEN: usize = 2;

/// Largest payload expressible by the length byte.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Receive buffer bound. Bytes past it are consumed and dropped.
pub const MAX_RESPONSE_BUFFER: usize = 1024;

/// Request codes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Init = 0x01,
    CaptureFrame = 0x02,
    DetectFace = 0x03,
    TrainFace = 0x04,
    RecognizeFace = 0x05,
    GetFeatures = 0x06,
    Reset = 0xFF,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::CaptureFrame => "CAPTURE_FRAME",
            Self::DetectFace => "DETECT_FACE",
            Self::TrainFace => "TRAIN_FACE",
            Self::RecognizeFace => "RECOGNIZE_FACE",
            Self::GetFeatures => "GET_FEATURES",
            Self::Reset => "RESET",
        };
        f.write_str(name)
    }
}

/// Response codes sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Response {
    Ok = 0x01,
    Error = 0x02,
    FaceDetected = 0x03,
    NoFace = 0x04,
    FaceTrained = 0x05,
    FaceRecognized = 0x06,
    UnknownFace = 0x07,
    FeaturesData = 0x08,
}

impl Response {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::Ok,
            0x02 => Self::Error,
            0x03 => Self::FaceDetected,
            0x04 => Self::NoFace,
            0x05 => Self::FaceTrained,
            0x06 => Self::FaceRecognized,
            0x07 => Self::UnknownFace,
            0x08 => Self::FeaturesData,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One length-prefixed unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFrame {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl ProtocolFrame {
    pub fn new(code: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    pub fn response(&self) -> Option<Response> {
        Response::from_code(self.code)
    }

    /// Serialize to wire bytes. Payloads over 255 bytes are rejected.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        encode(self.code, &self.payload)
    }
}

pub(crate) fn encode(code: u8, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = u8::try_from(payload.len())
        .map_err(|_| TransportError::PayloadTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(code);
    out.push(len);
    out.extend_from_slice(payload);
    Ok(out)
}
