//! Per-conversation transport state.
//!
//! A [`Connection`] owns one side of a single peer conversation: the
//! descriptors, the inbound line scanner, the outbound data-line writer, the
//! queue of descriptors received out of band, and the syscall capability
//! snapshot it was created with. Both peer roles are built on top of it.
//!
//! Once any transport operation fails, the connection latches the error and
//! every later call fails fast with the same error without touching the
//! transport again.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{DataLineWriter, LineScanner, MAX_PAYLOAD};
use crate::sys::{SysOps, WaitMode};

const READ_CHUNK: usize = 1024;

/// The two transport shapes a connection can drive.
pub(crate) enum Channel {
    /// Two pipe descriptors, driven with plain read/write.
    Pipe {
        /// Read end (peer's output).
        input: OwnedFd,
        /// Write end (peer's input).
        output: OwnedFd,
    },
    /// One connected stream socket, driven with sendmsg/recvmsg so
    /// descriptors can ride along.
    Socket {
        /// The connected socket.
        fd: OwnedFd,
    },
}

/// One side of a single peer conversation.
///
/// All operations must be serialized by the caller; distinct connections are
/// fully independent.
pub struct Connection {
    sys: Arc<dyn SysOps>,
    channel: Channel,
    scanner: LineScanner,
    data: DataLineWriter,
    received_fds: VecDeque<OwnedFd>,
    staged_fds: Vec<OwnedFd>,
    pid: Option<u32>,
    broken: Option<Error>,
    eof: bool,
    confidential: bool,
}

impl Connection {
    pub(crate) fn new(channel: Channel, sys: Arc<dyn SysOps>) -> Self {
        Self {
            sys,
            channel,
            scanner: LineScanner::new(),
            data: DataLineWriter::new(),
            received_fds: VecDeque::new(),
            staged_fds: Vec::new(),
            pid: None,
            broken: None,
            eof: false,
            confidential: false,
        }
    }

    pub(crate) fn set_pid(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    /// Pid of a spawned peer process, if this connection started one.
    pub fn peer_pid(&self) -> Option<u32> {
        self.pid
    }

    /// Suppress payload bytes from trace output, e.g. while a passphrase
    /// is in flight.
    pub fn set_confidential(&mut self, confidential: bool) {
        self.confidential = confidential;
    }

    fn check_broken(&self) -> Result<()> {
        match &self.broken {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn mark_broken(&mut self, err: Error) -> Error {
        if self.broken.is_none() {
            self.broken = Some(err.clone());
        }
        err
    }

    fn trace_line(&self, direction: &str, line: &[u8]) {
        if self.confidential {
            tracing::trace!(target: "assuan_ipc::io", direction, len = line.len(), "line");
        } else {
            tracing::trace!(target: "assuan_ipc::io",
                direction, line = %String::from_utf8_lossy(line), "line");
        }
    }

    /// Read one complete line, blocking as needed.
    ///
    /// The returned line has `LF` (and one optional `CR`) stripped. Peer
    /// hangup surfaces as [`Error::Eof`]; any other failure as
    /// [`Error::ReadError`]. Both latch the connection broken.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        self.check_broken()?;
        loop {
            match self.scanner.next_line() {
                Ok(Some(line)) => {
                    self.trace_line("recv", &line);
                    return Ok(line);
                }
                Ok(None) => {}
                Err(err) => return Err(self.mark_broken(err)),
            }
            if self.eof {
                return Err(self.mark_broken(Error::Eof));
            }

            let mut buf = [0u8; READ_CHUNK];
            let mut incoming = Vec::new();
            let res = match &self.channel {
                Channel::Pipe { input, .. } => self.sys.read(input.as_fd(), &mut buf),
                Channel::Socket { fd } => {
                    self.sys.recvmsg(fd.as_fd(), &mut buf).map(|(n, fds)| {
                        incoming = fds;
                        n
                    })
                }
            };
            self.received_fds.extend(incoming);
            match res {
                Ok(0) => self.eof = true,
                Ok(n) => self.scanner.push(&buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::debug!(target: "assuan_ipc::io", error = %err, "read failed");
                    return Err(self.mark_broken(Error::ReadError));
                }
            }
        }
    }

    /// Write one complete line; the terminating `LF` is appended here.
    ///
    /// A pending partial data line is flushed first so framing and ordering
    /// hold. Descriptors staged with [`Connection::send_fd`] ride along with
    /// this line.
    pub fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.check_broken()?;
        if line.len() > MAX_PAYLOAD {
            return Err(Error::LineTooLong);
        }
        if line.contains(&b'\n') {
            return Err(Error::InvalidValue);
        }
        self.flush_data()?;
        self.trace_line("send", line);
        let mut wire = Vec::with_capacity(line.len() + 1);
        wire.extend_from_slice(line);
        wire.push(b'\n');
        self.send_wire(&wire)
    }

    /// Append payload bytes to the outbound data stream.
    ///
    /// Full `D` lines are sent immediately; the tail stays buffered until
    /// the next non-data line or an explicit [`Connection::flush_data`].
    pub fn write_data(&mut self, payload: &[u8]) -> Result<()> {
        self.check_broken()?;
        let mut data = std::mem::take(&mut self.data);
        let res = data.push(payload, |line| self.send_wire(line));
        self.data = data;
        res
    }

    /// Send any pending partial data line.
    pub fn flush_data(&mut self) -> Result<()> {
        self.check_broken()?;
        if let Some(line) = self.data.take_partial() {
            self.trace_line("send", &line[..line.len() - 1]);
            self.send_wire(&line)?;
        }
        Ok(())
    }

    /// Drop any buffered partial data line, e.g. when a request fails.
    pub(crate) fn discard_data(&mut self) {
        self.data.clear();
    }

    /// Write raw bytes without line framing (connection nonces).
    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_broken()?;
        self.send_wire(bytes)
    }

    fn send_wire(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            let staged: Vec<RawFd> = if offset == 0 {
                self.staged_fds.iter().map(|fd| fd.as_raw_fd()).collect()
            } else {
                Vec::new()
            };
            let res = match &self.channel {
                Channel::Pipe { output, .. } => self.sys.write(output.as_fd(), &bytes[offset..]),
                Channel::Socket { fd } => self.sys.sendmsg(fd.as_fd(), &bytes[offset..], &staged),
            };
            match res {
                Ok(0) => return Err(self.mark_broken(Error::WriteError)),
                Ok(n) => {
                    if offset == 0 {
                        // The kernel duplicated the batch into the peer.
                        self.staged_fds.clear();
                    }
                    offset += n;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    // EAGAIN included: this is a blocking API, a nonblocking
                    // descriptor is a caller bug and treated as fatal.
                    tracing::debug!(target: "assuan_ipc::io", error = %err, "write failed");
                    return Err(self.mark_broken(Error::WriteError));
                }
            }
        }
        Ok(())
    }

    /// Stage a descriptor to accompany the next outgoing line.
    ///
    /// The descriptor is duplicated; the caller keeps its own copy. Only
    /// socket transports can carry descriptors.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        self.check_broken()?;
        if !matches!(self.channel, Channel::Socket { .. }) {
            return Err(Error::Parameter);
        }
        let dup = fd.try_clone_to_owned().map_err(|_| Error::Parameter)?;
        self.staged_fds.push(dup);
        Ok(())
    }

    /// Take ownership of the next descriptor the peer passed.
    pub fn receive_fd(&mut self) -> Result<OwnedFd> {
        self.received_fds.pop_front().ok_or(Error::General)
    }

    /// Number of received descriptors not yet consumed.
    pub fn pending_fds(&self) -> usize {
        self.received_fds.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Best-effort drain; a broken connection is left alone.
        let _ = self.flush_data();
        if let Some(pid) = self.pid.take() {
            match self.sys.waitpid(pid, WaitMode::NoHang) {
                Ok(Some(_)) => {}
                // Still running (or wait failed): terminate and collect.
                _ => {
                    let _ = self.sys.waitpid(pid, WaitMode::Terminate);
                }
            }
        }
    }
}
