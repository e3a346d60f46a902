//! Pipe transports: inherited descriptor pairs and spawned peers.

use std::os::fd::{OwnedFd, RawFd};

use crate::client::Client;
use crate::connection::{Channel, Connection};
use crate::error::{Error, Result};
use crate::server::Server;
use crate::sys;

/// Wrap two inherited descriptors as the server side of a conversation.
///
/// `input` carries the client's commands, `output` our replies; typically
/// these are stdin and stdout of a helper process. Ownership transfers to
/// the returned server, which closes both on release.
pub fn pipe_server(input: OwnedFd, output: OwnedFd) -> Server {
    let config = sys::global();
    Server::new(Connection::new(Channel::Pipe { input, output }, config.sys))
}

/// Spawn `program` as a peer server and connect to it over two pipe pairs.
///
/// The child receives one end of each pair as stdin/stdout; descriptors
/// listed in `inherited_fds` additionally survive the exec. Returns the
/// connected client and the child pid, which is also reaped when the client
/// is released.
pub fn pipe_client(
    program: &str,
    argv: &[String],
    inherited_fds: &[RawFd],
) -> Result<(Client, u32)> {
    let config = sys::global();

    // One pair per direction: we write commands into the child's stdin and
    // read replies from its stdout.
    let (child_stdin, our_output) = config.sys.pipe().map_err(|err| {
        tracing::debug!(target: "assuan_ipc::transport", error = %err, "pipe failed");
        Error::ConnectFailed
    })?;
    let (our_input, child_stdout) = config.sys.pipe().map_err(|_| Error::ConnectFailed)?;

    let pid = config
        .sys
        .spawn(program, argv, child_stdin, child_stdout, inherited_fds, None)
        .map_err(|err| {
            tracing::debug!(target: "assuan_ipc::transport",
                program, error = %err, "spawn failed");
            Error::ConnectFailed
        })?;
    tracing::debug!(target: "assuan_ipc::transport", program, pid, "spawned pipe server");

    let mut conn = Connection::new(
        Channel::Pipe {
            input: our_input,
            output: our_output,
        },
        config.sys,
    );
    conn.set_pid(pid);
    Ok((Client::new(conn), pid))
}
