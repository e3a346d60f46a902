//! # assuan-ipc
//!
//! Engine for the Assuan IPC protocol: a lightweight, line-oriented
//! request/response protocol used between security-sensitive helper
//! processes over pipes or local stream sockets.
//!
//! ## Architecture
//!
//! - **Protocol core** ([`protocol`]): line framing with a hard 1,002 byte
//!   envelope, percent escaping for inline data, reply/command parsing.
//! - **Roles**: a [`Server`] dispatches commands through a verb registry and
//!   may run one inquiry per command; a [`Client`] sends commands and routes
//!   the reply stream to caller-supplied sinks.
//! - **Transports** ([`transport`]): inherited pipe pairs, spawned peers,
//!   local stream sockets with peer credentials, and an in-process socket
//!   pair. Socket transports carry file descriptors out of band.
//! - **Syscall layer** ([`sys`]): every blocking primitive goes through a
//!   pluggable capability record with a default POSIX implementation.
//!
//! Each context serves exactly one conversation with one peer and presents a
//! blocking call/return API; distinct contexts are independent and may be
//! driven from separate threads.
//!
//! ## Example
//!
//! ```
//! use assuan_ipc::transport;
//!
//! let (mut server, mut client) = transport::socketpair()?;
//! server.register_command(
//!     "ECHO",
//!     |ctx, args| ctx.write_data(args.as_bytes()),
//!     None,
//! )?;
//!
//! let server_thread = std::thread::spawn(move || server.process());
//!
//! let mut echoed = Vec::new();
//! client
//!     .transact("ECHO hello world")
//!     .on_data(|bytes| {
//!         echoed.extend_from_slice(bytes);
//!         Ok(())
//!     })
//!     .run()?;
//! assert_eq!(echoed, b"hello world");
//!
//! client.transact("BYE").run()?;
//! server_thread.join().unwrap()?;
//! # Ok::<(), assuan_ipc::Error>(())
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod sys;
pub mod transport;

mod connection;

pub use client::{Client, InquiryResponder, Transaction};
pub use error::{Error, Result};
pub use server::{HandlerCtx, Server, ServerState};
pub use sys::{GlobalConfig, PosixSys, SysOps, WaitMode};
pub use transport::PeerCredentials;
