//! Client role: request sender and reply collector.
//!
//! [`Client::transact`] returns a [`Transaction`] builder; attach the sinks
//! the command needs, then [`Transaction::run`] writes the command line and
//! routes reply lines until the terminal `OK`/`ERR`:
//!
//! - `D` lines go to the data sink (missing sink is an error),
//! - `S` lines go to the status sink (missing sink ignores them),
//! - `INQUIRE` runs the inquiry handler and answers with `D` lines + `END`
//!   (missing handler answers `CAN`).
//!
//! # Example
//!
//! ```no_run
//! use assuan_ipc::transport;
//!
//! let mut client = transport::socket_client("/run/user/1000/agent.socket".as_ref(), None)?;
//! let mut version = Vec::new();
//! client
//!     .transact("GETINFO version")
//!     .on_data(|bytes| {
//!         version.extend_from_slice(bytes);
//!         Ok(())
//!     })
//!     .run()?;
//! # Ok::<(), assuan_ipc::Error>(())
//! ```

use std::os::fd::{BorrowedFd, OwnedFd};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::Reply;

/// The client side of one conversation.
pub struct Client {
    conn: Connection,
}

impl Client {
    pub(crate) fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Start building a transaction for `command`.
    ///
    /// Nothing is written until [`Transaction::run`]; the protocol forbids
    /// pipelining, so one transaction must finish before the next starts --
    /// the borrow on `self` enforces exactly that.
    pub fn transact<'a>(&'a mut self, command: &str) -> Transaction<'a> {
        Transaction {
            client: self,
            command: command.to_owned(),
            data_sink: None,
            status_sink: None,
            inquire_handler: None,
        }
    }

    /// Send a raw protocol line, for extensions and diagnostics.
    pub fn send_raw(&mut self, line: &str) -> Result<()> {
        self.conn.write_line(line.as_bytes())
    }

    /// Read one raw reply line, for extensions and diagnostics.
    pub fn receive_line(&mut self) -> Result<Vec<u8>> {
        self.conn.read_line()
    }

    /// Stage a descriptor to accompany the next outgoing line.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        self.conn.send_fd(fd)
    }

    /// Take ownership of the next descriptor the server passed.
    pub fn receive_fd(&mut self) -> Result<OwnedFd> {
        self.conn.receive_fd()
    }

    /// Pid of a spawned server process, if this client started one.
    pub fn peer_pid(&self) -> Option<u32> {
        self.conn.peer_pid()
    }

    /// Suppress payload bytes from trace output.
    pub fn set_confidential(&mut self, confidential: bool) {
        self.conn.set_confidential(confidential);
    }
}

/// Restricted writer handed to the inquiry handler.
///
/// Data pushed here becomes the `D`-line answer to the server's `INQUIRE`;
/// the client appends the closing `END` after the handler returns.
pub struct InquiryResponder<'a> {
    conn: &'a mut Connection,
}

impl InquiryResponder<'_> {
    /// Append payload bytes to the inquiry answer.
    pub fn data(&mut self, payload: &[u8]) -> Result<()> {
        self.conn.write_data(payload)
    }
}

/// One pending request, built fluently and executed by [`Transaction::run`].
pub struct Transaction<'a> {
    client: &'a mut Client,
    command: String,
    data_sink: Option<Box<dyn FnMut(&[u8]) -> Result<()> + 'a>>,
    status_sink: Option<Box<dyn FnMut(&str, &str) -> Result<()> + 'a>>,
    inquire_handler:
        Option<Box<dyn FnMut(&str, &str, &mut InquiryResponder<'_>) -> Result<()> + 'a>>,
}

impl<'a> Transaction<'a> {
    /// Receive inline data chunks.
    pub fn on_data<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&[u8]) -> Result<()> + 'a,
    {
        self.data_sink = Some(Box::new(sink));
        self
    }

    /// Receive status lines as `(keyword, args)`.
    pub fn on_status<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&str, &str) -> Result<()> + 'a,
    {
        self.status_sink = Some(Box::new(sink));
        self
    }

    /// Answer server inquiries.
    pub fn on_inquire<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str, &str, &mut InquiryResponder<'_>) -> Result<()> + 'a,
    {
        self.inquire_handler = Some(Box::new(handler));
        self
    }

    /// Send the command and collect replies until the terminal one.
    ///
    /// Returns the `OK` info text on success. A sink failure does not
    /// desynchronize the conversation: the reply stream is still consumed
    /// up to its terminal line, then the sink's error is returned.
    pub fn run(mut self) -> Result<Option<String>> {
        self.client.conn.write_line(self.command.as_bytes())?;

        // First failure from a sink or a missing sink; reported once the
        // reply stream is back at a command boundary.
        let mut deferred: Option<Error> = None;

        loop {
            let line = self.client.conn.read_line()?;
            match Reply::parse(&line)? {
                Reply::Ok(info) => {
                    return match deferred {
                        Some(err) => Err(err),
                        None => Ok(info),
                    }
                }
                Reply::Err { code, description } => {
                    let err = Error::from_code(code, description.as_deref());
                    return Err(deferred.unwrap_or(err));
                }
                Reply::Data(chunk) => {
                    if deferred.is_some() {
                        continue;
                    }
                    match self.data_sink.as_mut() {
                        Some(sink) => {
                            if let Err(err) = sink(&chunk) {
                                deferred = Some(err);
                            }
                        }
                        None => deferred = Some(Error::NoDataCallback),
                    }
                }
                Reply::Status { keyword, args } => {
                    if deferred.is_some() {
                        continue;
                    }
                    if let Some(sink) = self.status_sink.as_mut() {
                        if let Err(err) = sink(&keyword, &args) {
                            deferred = Some(err);
                        }
                    }
                }
                Reply::Inquire { keyword, args } => {
                    match self.inquire_handler.as_mut() {
                        Some(handler) if deferred.is_none() => {
                            let mut responder = InquiryResponder {
                                conn: &mut self.client.conn,
                            };
                            match handler(&keyword, &args, &mut responder) {
                                Ok(()) => self.client.conn.write_line(b"END")?,
                                Err(err) => {
                                    self.client.conn.discard_data();
                                    self.client.conn.write_line(b"CAN")?;
                                    deferred = Some(err);
                                }
                            }
                        }
                        Some(_) => {
                            // A sink already failed; refuse further work.
                            self.client.conn.write_line(b"CAN")?;
                        }
                        None => {
                            self.client.conn.write_line(b"CAN")?;
                            deferred = Some(Error::NoInquireCallback);
                        }
                    }
                }
                Reply::Comment(_) => {}
                // END and CAN never appear in a command's reply stream.
                Reply::End | Reply::Cancel => return Err(Error::InvalidResponse),
            }
        }
    }
}
