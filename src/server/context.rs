//! Restricted conversation handle passed to command handlers.
//!
//! Handlers never see the server or the raw connection; they get a
//! [`HandlerCtx`] that exposes exactly the operations a request is allowed
//! to perform: writing data and status lines, running one inquiry, and
//! moving descriptors. Cancellation is checked at each of these protocol
//! boundaries, never inside a syscall.

use std::os::fd::{BorrowedFd, OwnedFd};

use super::ServerState;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::{Command, Reply};

/// Mutable per-conversation server state shared between the dispatch loop
/// and the handler handle.
pub(crate) struct ServerCore {
    pub(crate) state: ServerState,
    pub(crate) pending_cancel: bool,
    pub(crate) terminating: bool,
}

impl ServerCore {
    pub(crate) fn new() -> Self {
        Self {
            state: ServerState::Idle,
            pending_cancel: false,
            terminating: false,
        }
    }
}

/// Capability handle a command handler works through.
pub struct HandlerCtx<'a> {
    pub(crate) conn: &'a mut Connection,
    pub(crate) core: &'a mut ServerCore,
}

impl HandlerCtx<'_> {
    fn check_cancel(&self) -> Result<()> {
        if self.core.pending_cancel {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    /// Whether a cancellation is pending for this request.
    pub fn is_canceled(&self) -> bool {
        self.core.pending_cancel
    }

    /// Append payload bytes to the reply's inline data stream.
    ///
    /// Long payloads are split over multiple `D` lines transparently; the
    /// final partial line is flushed together with the terminal reply.
    pub fn write_data(&mut self, payload: &[u8]) -> Result<()> {
        self.check_cancel()?;
        self.conn.write_data(payload)
    }

    /// Send a status line `S KEYWORD [ARGS]`.
    pub fn write_status(&mut self, keyword: &str, args: &str) -> Result<()> {
        self.check_cancel()?;
        if keyword.is_empty() || keyword.contains([' ', '\t']) {
            return Err(Error::Parameter);
        }
        let line = if args.is_empty() {
            format!("S {keyword}")
        } else {
            format!("S {keyword} {args}")
        };
        self.conn.write_line(line.as_bytes())
    }

    /// Ask the client for additional data mid-command.
    ///
    /// Sends `INQUIRE keyword [args]` and collects the client's `D` lines
    /// until `END`. `max_len` bounds the accumulated payload (`0` means
    /// unlimited). The client aborting yields [`Error::Canceled`]; a second
    /// inquiry before this one resolves yields [`Error::NestedCommands`]
    /// and leaves the running inquiry untouched.
    pub fn inquire(&mut self, keyword: &str, args: &str, max_len: usize) -> Result<Vec<u8>> {
        if matches!(
            self.core.state,
            ServerState::Inquiring | ServerState::AwaitingInquiryReply
        ) {
            return Err(Error::NestedCommands);
        }
        self.check_cancel()?;
        if keyword.is_empty() || keyword.contains([' ', '\t']) {
            return Err(Error::Parameter);
        }

        let line = if args.is_empty() {
            format!("INQUIRE {keyword}")
        } else {
            format!("INQUIRE {keyword} {args}")
        };
        self.core.state = ServerState::Inquiring;
        self.conn.write_line(line.as_bytes())?;

        let result = self.collect_inquiry_reply(max_len);
        self.core.state = ServerState::Dispatching;
        result
    }

    fn collect_inquiry_reply(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.core.state = ServerState::AwaitingInquiryReply;
        let mut payload = Vec::new();
        loop {
            let line = self.conn.read_line()?;
            match Reply::parse(&line) {
                Ok(Reply::Data(chunk)) => {
                    payload.extend_from_slice(&chunk);
                    if max_len != 0 && payload.len() > max_len {
                        return Err(Error::TooMuchData);
                    }
                }
                Ok(Reply::End) => return Ok(payload),
                Ok(Reply::Cancel) => return Err(Error::Canceled),
                Ok(Reply::Err { code, description }) => {
                    return Err(Error::from_code(code, description.as_deref()))
                }
                Ok(Reply::Comment(_)) => {}
                Ok(_) => return Err(Error::InvalidResponse),
                Err(parse_err) => {
                    // The client may abort with command verbs instead of
                    // reply tokens: CANCEL aborts the inquiry, BYE tears
                    // the whole conversation down after the current reply.
                    let text = String::from_utf8_lossy(&line);
                    if let Some(cmd) = Command::parse(&text) {
                        if cmd.verb.eq_ignore_ascii_case("CANCEL") {
                            return Err(Error::Canceled);
                        }
                        if cmd.verb.eq_ignore_ascii_case("BYE") {
                            self.core.terminating = true;
                            return Err(Error::Canceled);
                        }
                    }
                    return Err(parse_err);
                }
            }
        }
    }

    /// Stage a descriptor to accompany the next outgoing line.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        self.conn.send_fd(fd)
    }

    /// Take ownership of the next descriptor the client passed.
    pub fn receive_fd(&mut self) -> Result<OwnedFd> {
        self.conn.receive_fd()
    }
}
