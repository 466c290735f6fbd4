//! Raw serial link to the capture board via termios.
//!
//! The port is opened non-blocking in raw 8N1 mode. Availability comes from
//! `FIONREAD`, so reads never wait on the tty.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::mem::MaybeUninit;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use crate::channel::{map_io, write_nonblocking, Channel};
use crate::transport::TransportError;

/// Map a numeric baud rate to its termios constant.
fn speed_for(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        _ => return None,
    })
}

/// Errors that mean the adapter went away rather than a transient fault.
fn is_hangup(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EIO) | Some(libc::ENXIO) | Some(libc::ENODEV)
    )
}

fn classify(err: std::io::Error) -> TransportError {
    if is_hangup(&err) {
        TransportError::Disconnected
    } else {
        map_io(err)
    }
}

/// Serial device such as `/dev/ttyUSB0`.
pub struct SerialChannel {
    path: String,
    file: File,
}

impl SerialChannel {
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let speed = speed_for(baud).ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("unsupported baud rate {baud}"),
            ))
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;
        let fd = file.as_raw_fd();

        let mut tio = MaybeUninit::<libc::termios>::uninit();
        // SAFETY: fd is valid for the lifetime of `file`; tcgetattr fully
        // initializes `tio` when it returns 0.
        if unsafe { libc::tcgetattr(fd, tio.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: initialized by the successful tcgetattr above.
        let mut tio = unsafe { tio.assume_init() };

        // SAFETY: `tio` is a valid termios owned by this frame.
        unsafe {
            libc::cfmakeraw(&mut tio);
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);
        }
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CSIZE);
        tio.c_cflag |= libc::CS8;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 0;

        // SAFETY: fd is valid; `tio` is fully initialized.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // Drop whatever the board printed before we attached.
        // SAFETY: fd is valid.
        unsafe {
            libc::tcflush(fd, libc::TCIOFLUSH);
        }

        tracing::info!(path, baud, "serial port opened");
        Ok(Self {
            path: path.to_string(),
            file,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Channel for SerialChannel {
    fn available(&mut self) -> Result<usize, TransportError> {
        let mut pending: libc::c_int = 0;
        // SAFETY: fd is valid; FIONREAD writes a single c_int.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), libc::FIONREAD, &mut pending as *mut libc::c_int) };
        if ret < 0 {
            return Err(classify(std::io::Error::last_os_error()));
        }
        Ok(usize::try_from(pending).unwrap_or(0))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(classify(e)),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        write_nonblocking(&mut self.file, bytes).map_err(|e| match e {
            TransportError::Io(io) => classify(io),
            other => other,
        })
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.file.flush().map_err(classify)?;
        // SAFETY: fd is valid.
        if unsafe { libc::tcdrain(self.file.as_raw_fd()) } != 0 {
            return Err(classify(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}
