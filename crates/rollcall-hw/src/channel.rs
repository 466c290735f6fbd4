//! Byte channels the frame transport runs over.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::protocol::MAX_RESPONSE_BUFFER;
use crate::serial::SerialChannel;
use crate::transport::TransportError;

const TCP_SCHEME: &str = "tcp://";

/// A bidirectional byte stream with a non-blocking availability check.
///
/// `read` only returns bytes that are already buffered; it never waits.
/// A closed channel reports [`TransportError::Disconnected`] once its
/// buffered input is exhausted.
pub trait Channel {
    /// Number of bytes that can be read without blocking.
    fn available(&mut self) -> Result<usize, TransportError>;
    /// Read up to `buf.len()` buffered bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    fn flush(&mut self) -> Result<(), TransportError>;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn available(&mut self) -> Result<usize, TransportError> {
        (**self).available()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(bytes)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }
}

/// Open the device link named by `path`: `tcp://host:port` or a serial
/// device path.
pub fn open_channel(
    path: &str,
    baud_rate: u32,
    connect_timeout: Duration,
) -> Result<Box<dyn Channel + Send>, TransportError> {
    match path.strip_prefix(TCP_SCHEME) {
        Some(addr) => Ok(Box::new(TcpChannel::connect(addr, connect_timeout)?)),
        None => Ok(Box::new(SerialChannel::open(path, baud_rate)?)),
    }
}

/// Write all of `bytes` to a non-blocking writer, waiting out `WouldBlock`.
pub(crate) fn write_nonblocking<W: Write>(writer: &mut W, mut bytes: &[u8]) -> Result<(), TransportError> {
    while !bytes.is_empty() {
        match writer.write(bytes) {
            Ok(0) => return Err(TransportError::Disconnected),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(Duration::from_millis(1)),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(map_io(e)),
        }
    }
    Ok(())
}

/// Classify an I/O error, folding closed-link errors into `Disconnected`.
pub(crate) fn map_io(err: std::io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => TransportError::Disconnected,
        _ => TransportError::Io(err),
    }
}

/// Capture device reached over TCP (e.g. a serial-to-Wi-Fi bridge).
pub struct TcpChannel {
    stream: TcpStream,
    scratch: Vec<u8>,
}

impl TcpChannel {
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let mut last_err = None;
        for sock in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    tracing::info!(peer = %sock, "connected to capture device");
                    return Ok(Self {
                        stream,
                        scratch: vec![0u8; MAX_RESPONSE_BUFFER],
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => map_io(e),
            None => TransportError::Io(std::io::Error::new(
                ErrorKind::AddrNotAvailable,
                format!("{addr} did not resolve"),
            )),
        })
    }
}

impl Channel for TcpChannel {
    fn available(&mut self) -> Result<usize, TransportError> {
        match self.stream.peek(&mut self.scratch) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(map_io(e)),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream.read(buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(map_io(e)),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        write_nonblocking(&mut self.stream, bytes)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.stream.flush().map_err(map_io)
    }
}

#[derive(Debug, Clone, Default)]
struct Pipe {
    bytes: Arc<Mutex<VecDeque<u8>>>,
}

/// In-process channel pair. Bytes written on one end are read on the other.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    inbound: Pipe,
    outbound: Pipe,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let a_to_b = Pipe::default();
        let b_to_a = Pipe::default();
        let closed = Arc::new(AtomicBool::new(false));
        (
            MemoryChannel {
                inbound: b_to_a.clone(),
                outbound: a_to_b.clone(),
                closed: closed.clone(),
            },
            MemoryChannel {
                inbound: a_to_b,
                outbound: b_to_a,
                closed,
            },
        )
    }

    /// Close both directions. Already-buffered bytes stay readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Drain everything currently readable on this end.
    pub fn take_all(&mut self) -> Vec<u8> {
        let mut queue = self.inbound.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        queue.drain(..).collect()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Channel for MemoryChannel {
    fn available(&mut self) -> Result<usize, TransportError> {
        let queue = self.inbound.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.is_empty() && self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        Ok(queue.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut queue = self.inbound.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.is_empty() && self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        self.outbound
            .bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(bytes.iter().copied());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_memory_pair_is_crossed() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(a.available().unwrap(), 0);
        assert_eq!(b.available().unwrap(), 3);
        let mut buf = [0u8; 2];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(b.take_all(), vec![3]);
    }

    #[test]
    fn test_memory_close_keeps_buffered_bytes() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.write_all(&[7]).unwrap();
        a.close();
        assert_eq!(b.available().unwrap(), 1);
        assert_eq!(b.take_all(), vec![7]);
        assert!(matches!(b.available(), Err(TransportError::Disconnected)));
    }

    #[test]
    fn test_tcp_channel_exchanges_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut channel = TcpChannel::connect(&addr, Duration::from_secs(1)).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        channel.write_all(&[0x01, 0x00]).unwrap();
        let mut got = [0u8; 2];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, [0x01, 0x00]);

        peer.write_all(&[0x01, 0x00]).unwrap();
        let mut waited = 0;
        while channel.available().unwrap() < 2 && waited < 100 {
            std::thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        let mut buf = [0u8; 2];
        assert_eq!(channel.read(&mut buf).unwrap(), 2);

        drop(peer);
        let mut closed = false;
        for _ in 0..100 {
            if matches!(channel.available(), Err(TransportError::Disconnected)) {
                closed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(closed);
    }

    #[test]
    fn test_open_channel_rejects_unresolvable_tcp() {
        assert!(open_channel("tcp://not a host", 115_200, Duration::from_millis(10)).is_err());
    }
}
