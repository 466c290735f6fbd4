//! rollcall-hw: Link to the remote capture device.
//!
//! Provides the byte channels (serial, TCP, in-memory), the length-prefixed
//! frame transport with per-phase timeouts, and the device command session.

pub mod channel;
pub mod protocol;
pub mod serial;
pub mod session;
pub mod transport;

pub use channel::{open_channel, Channel, MemoryChannel, TcpChannel};
pub use protocol::{Command, ProtocolFrame, Response};
pub use serial::SerialChannel;
pub use session::{DeviceError, DeviceSession, SessionConfig, TrainError};
pub use transport::{FramePhase, FramerConfig, TransportError, TransportFramer};
