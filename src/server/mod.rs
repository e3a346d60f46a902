//! Server role: command dispatch loop and default handlers.
//!
//! A [`Server`] reads command lines from its connection, dispatches them
//! through the verb registry, and writes exactly one terminal `OK`/`ERR`
//! reply per command. Handlers run synchronously and talk to the peer
//! through the restricted [`HandlerCtx`] handle.
//!
//! # Example
//!
//! ```no_run
//! use std::os::unix::net::UnixListener;
//! use assuan_ipc::transport;
//!
//! let listener = UnixListener::bind("/run/user/1000/agent.socket")?;
//! let (mut server, credentials) = transport::socket_server(listener.into())?;
//! tracing::info!(uid = credentials.uid, "peer connected");
//!
//! server.register_command(
//!     "ECHO",
//!     |ctx, args| ctx.write_data(args.as_bytes()),
//!     Some("ECHO <text> -- send <text> back as inline data"),
//! )?;
//! server.process()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod context;
mod registry;

pub use context::HandlerCtx;
pub use registry::Handler;

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::Command;
use context::ServerCore;
use registry::{Action, Builtin, CommandRegistry};

/// Protocol position of a server conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Between commands.
    Idle,
    /// Blocked reading the next command line.
    ReceivingCommand,
    /// A handler is running.
    Dispatching,
    /// An `INQUIRE` line is going out.
    Inquiring,
    /// Blocked reading the client's inquiry reply.
    AwaitingInquiryReply,
    /// The terminal reply is going out.
    Replying,
    /// `BYE` was processed; the conversation is over.
    Terminated,
    /// A transport error latched; the conversation is unusable.
    Broken,
}

/// Hook invoked by the built-in `RESET` handler.
pub type ResetHook = Box<dyn FnMut() + Send>;

/// Hook invoked by the built-in `OPTION` handler with the parsed key and
/// value.
pub type OptionHook = Box<dyn FnMut(&str, &str) -> Result<()> + Send>;

/// The server side of one conversation.
pub struct Server {
    conn: Connection,
    registry: CommandRegistry,
    core: ServerCore,
    reset_hook: Option<ResetHook>,
    option_hook: Option<OptionHook>,
}

impl Server {
    pub(crate) fn new(conn: Connection) -> Self {
        Self {
            conn,
            registry: CommandRegistry::with_builtins(),
            core: ServerCore::new(),
            reset_hook: None,
            option_hook: None,
        }
    }

    /// Add or replace a command verb.
    ///
    /// Lookup at dispatch time is ASCII case-insensitive. The optional help
    /// text is shown by the built-in `HELP` verb.
    pub fn register_command<F>(&mut self, verb: &str, handler: F, help: Option<&str>) -> Result<()>
    where
        F: Fn(&mut HandlerCtx<'_>, &str) -> Result<()> + Send + Sync + 'static,
    {
        self.registry.register(verb, Arc::new(handler), help)
    }

    /// Install the hook called by the built-in `RESET` handler after the
    /// per-request state has been cleared.
    pub fn set_reset_hook(&mut self, hook: ResetHook) {
        self.reset_hook = Some(hook);
    }

    /// Install the hook receiving `OPTION` key/value pairs.
    pub fn set_option_hook(&mut self, hook: OptionHook) {
        self.option_hook = Some(hook);
    }

    /// Request cancellation of the request currently being dispatched.
    ///
    /// The running handler's next data, status or inquire operation fails
    /// with [`Error::Canceled`]; in-flight syscalls are never interrupted.
    pub fn cancel(&mut self) {
        self.core.pending_cancel = true;
    }

    /// Current protocol position.
    pub fn state(&self) -> ServerState {
        self.core.state
    }

    /// Pid of a spawned peer, if any.
    pub fn peer_pid(&self) -> Option<u32> {
        self.conn.peer_pid()
    }

    /// Take ownership of the next descriptor the client passed.
    pub fn receive_fd(&mut self) -> Result<OwnedFd> {
        self.conn.receive_fd()
    }

    /// Suppress payload bytes from trace output.
    pub fn set_confidential(&mut self, confidential: bool) {
        self.conn.set_confidential(confidential);
    }

    /// Serve commands until the client says `BYE` or the transport breaks.
    ///
    /// Returns `Ok(())` after a graceful `BYE`, and immediately again on
    /// re-entry once terminated. A transport failure latches the
    /// conversation broken and is returned unchanged on every call.
    pub fn process(&mut self) -> Result<()> {
        loop {
            if self.core.terminating {
                self.core.state = ServerState::Terminated;
                return Ok(());
            }

            self.core.state = ServerState::ReceivingCommand;
            let line = match self.conn.read_line() {
                Ok(line) => line,
                Err(err) => {
                    self.core.state = ServerState::Broken;
                    return Err(err);
                }
            };
            let text = String::from_utf8_lossy(&line).into_owned();
            let Some(cmd) = Command::parse(&text) else {
                // Blank and comment lines carry nothing.
                continue;
            };

            // A fresh request starts with a clean cancellation flag; only
            // the CANCEL verb itself re-arms it (for the mid-inquiry case
            // the inquiry loop handles CANCEL directly).
            self.core.pending_cancel = false;
            self.core.state = ServerState::Dispatching;
            let outcome = self.dispatch(cmd.verb, cmd.args);

            self.core.state = ServerState::Replying;
            self.send_terminal(outcome)?;
            self.core.state = ServerState::Idle;
        }
    }

    fn dispatch(&mut self, verb: &str, args: &str) -> Result<()> {
        let action = match self.registry.lookup(verb) {
            Some(entry) => entry.action.clone(),
            None => {
                tracing::debug!(target: "assuan_ipc::server", verb, "unknown command");
                return Err(Error::UnknownCommand);
            }
        };
        match action {
            Action::User(handler) => {
                let mut ctx = HandlerCtx {
                    conn: &mut self.conn,
                    core: &mut self.core,
                };
                handler(&mut ctx, args)
            }
            Action::Builtin(builtin) => self.run_builtin(builtin, args),
        }
    }

    fn run_builtin(&mut self, builtin: Builtin, args: &str) -> Result<()> {
        match builtin {
            Builtin::Nop => Ok(()),
            Builtin::Cancel => {
                self.core.pending_cancel = true;
                Ok(())
            }
            Builtin::Bye => {
                self.core.terminating = true;
                Ok(())
            }
            Builtin::Auth => Err(Error::NotImplemented),
            Builtin::Reset => {
                self.core.pending_cancel = false;
                while self.conn.pending_fds() > 0 {
                    let _ = self.conn.receive_fd();
                }
                if let Some(hook) = self.reset_hook.as_mut() {
                    hook();
                }
                Ok(())
            }
            // END belongs to the inquiry sub-protocol; reaching the
            // dispatcher means no inquiry is in flight.
            Builtin::End => Err(Error::UnexpectedCommand),
            Builtin::Help => self.run_help(args),
            Builtin::Option => self.run_option(args),
        }
    }

    fn run_help(&mut self, args: &str) -> Result<()> {
        let topic = args.trim();
        if topic.is_empty() {
            for verb in self.registry.verbs() {
                self.conn.write_line(format!("# {verb}").as_bytes())?;
            }
            return Ok(());
        }
        let help = match self.registry.lookup(topic) {
            Some(entry) => entry.help.clone(),
            None => return Err(Error::UnknownCommand),
        };
        if let Some(help) = help {
            for line in help.lines() {
                self.conn.write_line(format!("# {line}").as_bytes())?;
            }
        }
        Ok(())
    }

    fn run_option(&mut self, args: &str) -> Result<()> {
        let args = args.trim();
        let (key, value) = match args.split_once('=') {
            Some((key, value)) => (key.trim_end(), value.trim_start()),
            None => match args.split_once(' ') {
                Some((key, value)) => (key, value.trim_start()),
                None => (args, ""),
            },
        };
        let key = key.strip_prefix("--").unwrap_or(key);
        if key.is_empty() {
            return Err(Error::InvalidValue);
        }
        match self.option_hook.as_mut() {
            Some(hook) => hook(key, value),
            None => Ok(()),
        }
    }

    /// Write the single terminal reply for a dispatched command.
    fn send_terminal(&mut self, outcome: Result<()>) -> Result<()> {
        let res = match outcome {
            Ok(()) => self.conn.write_line(b"OK"),
            Err(err) => {
                // A failed request never leaks half-built data lines.
                self.conn.discard_data();
                let line = format!("ERR {} {}", err.code(), err);
                self.conn.write_line(line.as_bytes())
            }
        };
        if let Err(err) = res {
            self.core.state = ServerState::Broken;
            return Err(err);
        }
        Ok(())
    }
}
