//! Length-prefixed frame transport over a byte [`Channel`].
//!
//! Each receive waits for the two header bytes under one deadline and for
//! the payload under a second, independent deadline. No retries happen here.
//!
//! A timeout can leave the stream in the middle of a frame. The framer
//! remembers that and, before the next receive, waits for the line to go
//! quiet and discards whatever is buffered so the next header is read from
//! fresh data.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::channel::Channel;
use crate::protocol::{self, ProtocolFrame, HEADER_LEN, MAX_RESPONSE_BUFFER};

/// Upper bound on bytes discarded by a single resync.
const MAX_RESYNC_DISCARD: usize = 4 * MAX_RESPONSE_BUFFER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Header,
    Payload,
}

impl fmt::Display for FramePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => f.write_str("header"),
            Self::Payload => f.write_str("payload"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out waiting for frame {0}")]
    Timeout(FramePhase),
    #[error("device channel disconnected")]
    Disconnected,
    #[error("payload of {0} bytes exceeds the 255-byte frame limit")]
    PayloadTooLarge(usize),
    #[error("device channel I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerConfig {
    pub header_timeout: Duration,
    pub payload_timeout: Duration,
    /// Sleep between availability checks while waiting.
    pub poll_interval: Duration,
    /// Silence required before a resync considers the line drained.
    pub quiet_interval: Duration,
    /// Payload bytes kept per response; the rest is read and dropped.
    pub max_response_buffer: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_millis(5000),
            payload_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(10),
            quiet_interval: Duration::from_millis(50),
            max_response_buffer: MAX_RESPONSE_BUFFER,
        }
    }
}

/// Frame codec bound to one channel. Owns the channel exclusively.
pub struct TransportFramer<C> {
    channel: C,
    config: FramerConfig,
    desynced: bool,
}

impl<C: Channel> TransportFramer<C> {
    pub fn new(channel: C, config: FramerConfig) -> Self {
        Self {
            channel,
            config,
            desynced: false,
        }
    }

    pub fn config(&self) -> &FramerConfig {
        &self.config
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Whether a previous receive gave up mid-frame.
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Write one frame and flush.
    pub fn send_command(&mut self, code: u8, payload: &[u8]) -> Result<(), TransportError> {
        let bytes = protocol::encode(code, payload)?;
        self.channel.write_all(&bytes)?;
        self.channel.flush()?;
        tracing::trace!(code = format_args!("{code:#04x}"), len = payload.len(), "frame sent");
        Ok(())
    }

    /// Read one frame. With `want_payload == false` the payload bytes are
    /// still consumed, and the returned frame carries an empty payload.
    pub fn receive_frame(&mut self, want_payload: bool) -> Result<ProtocolFrame, TransportError> {
        if self.desynced {
            self.resync()?;
        }

        self.wait_for(HEADER_LEN, self.config.header_timeout, FramePhase::Header)?;
        let mut header = [0u8; HEADER_LEN];
        self.read_exact(&mut header)?;
        let code = header[0];
        let len = usize::from(header[1]);

        self.wait_for(len, self.config.payload_timeout, FramePhase::Payload)?;
        let payload = if want_payload {
            self.read_bounded(len)?
        } else {
            self.discard(len)?;
            Vec::new()
        };

        tracing::trace!(code = format_args!("{code:#04x}"), len, "frame received");
        Ok(ProtocolFrame { code, payload })
    }

    /// Non-blocking check for a buffered header. Resyncs first if needed.
    pub fn header_available(&mut self) -> Result<bool, TransportError> {
        if self.desynced {
            self.resync()?;
        }
        Ok(self.channel.available()? >= HEADER_LEN)
    }

    /// Discard buffered input until the line stays quiet for one interval.
    /// Returns the number of bytes dropped.
    pub fn resync(&mut self) -> Result<usize, TransportError> {
        let mut discarded = 0usize;
        loop {
            let pending = self.channel.available()?;
            if pending > 0 {
                self.discard(pending)?;
                discarded += pending;
                if discarded >= MAX_RESYNC_DISCARD {
                    tracing::warn!(discarded, "line did not go quiet during resync");
                    break;
                }
                continue;
            }
            thread::sleep(self.config.quiet_interval);
            if self.channel.available()? == 0 {
                break;
            }
        }
        self.desynced = false;
        if discarded > 0 {
            tracing::warn!(discarded, "discarded stale bytes to resynchronize");
        }
        Ok(discarded)
    }

    fn wait_for(&mut self, n: usize, timeout: Duration, phase: FramePhase) -> Result<(), TransportError> {
        if n == 0 {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.channel.available()? >= n {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.desynced = true;
                tracing::debug!(%phase, needed = n, "receive timed out");
                return Err(TransportError::Timeout(phase));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Fill `buf` from bytes already known to be available.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.channel.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(TransportError::Disconnected);
            }
            filled += n;
        }
        Ok(())
    }

    /// Read `len` bytes, keeping at most `max_response_buffer`.
    fn read_bounded(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let keep = len.min(self.config.max_response_buffer);
        let mut payload = vec![0u8; keep];
        self.read_exact(&mut payload)?;
        if len > keep {
            tracing::warn!(len, kept = keep, "response exceeds buffer; dropping excess");
            self.discard(len - keep)?;
        }
        Ok(payload)
    }

    fn discard(&mut self, mut remaining: usize) -> Result<(), TransportError> {
        let mut scratch = [0u8; 64];
        while remaining > 0 {
            let chunk = remaining.min(scratch.len());
            self.read_exact(&mut scratch[..chunk])?;
            remaining -= chunk;
        }
        Ok(())
    }
}
