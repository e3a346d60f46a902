//! Transport bindings - constructing peers over pipes and local sockets.
//!
//! Each constructor wires a [`crate::Server`] or [`crate::Client`] to a
//! concrete transport:
//!
//! - [`pipe_server`] / [`pipe_client`] for inherited descriptor pairs and
//!   spawned helper processes
//! - [`socket_server`] / [`socket_client`] for local stream sockets, with
//!   peer credentials on the accepting side
//! - [`socketpair`] for an in-process connected pair, mainly for tests

mod pipe;
mod socket;

pub use pipe::{pipe_client, pipe_server};
pub use socket::{socket_client, socket_server, socketpair, PeerCredentials};
