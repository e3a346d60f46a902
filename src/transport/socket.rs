//! Local stream socket transports and the in-process socket pair.

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::client::Client;
use crate::connection::{Channel, Connection};
use crate::error::{Error, Result};
use crate::server::Server;
use crate::sys;

/// Identity of the connecting peer, captured at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer process id, where the OS reports one.
    pub pid: Option<u32>,
    /// Peer effective user id.
    pub uid: u32,
    /// Peer effective group id.
    pub gid: u32,
}

/// Accept one connection on `listener` and serve it.
///
/// Blocks until a peer connects. The connecting peer's credentials are
/// captured via the platform's socket-level mechanism and returned alongside
/// the server.
pub fn socket_server(listener: OwnedFd) -> Result<(Server, PeerCredentials)> {
    let config = sys::global();
    let fd = accept(&listener).map_err(|err| {
        tracing::debug!(target: "assuan_ipc::transport", error = %err, "accept failed");
        Error::AcceptFailed
    })?;
    let credentials = peer_credentials(&fd).map_err(|err| {
        tracing::debug!(target: "assuan_ipc::transport", error = %err, "peer credentials");
        Error::AcceptFailed
    })?;
    tracing::debug!(target: "assuan_ipc::transport",
        uid = credentials.uid, gid = credentials.gid, pid = credentials.pid,
        "accepted peer");
    Ok((
        Server::new(Connection::new(Channel::Socket { fd }, config.sys)),
        credentials,
    ))
}

/// Connect to the local socket at `path`.
///
/// When the platform cannot protect the socket through filesystem
/// permissions, the rendezvous nonce read from the server's socket file is
/// passed as `nonce` and written immediately after connecting, before any
/// protocol line.
pub fn socket_client(path: &Path, nonce: Option<&[u8]>) -> Result<Client> {
    let config = sys::global();
    let fd = config.sys.socket().map_err(|_| Error::ConnectFailed)?;
    config.sys.connect(fd.as_fd(), path).map_err(|err| {
        tracing::debug!(target: "assuan_ipc::transport",
            path = %path.display(), error = %err, "connect failed");
        Error::ConnectFailed
    })?;
    let mut conn = Connection::new(Channel::Socket { fd }, config.sys);
    if let Some(nonce) = nonce {
        conn.write_bytes(nonce)?;
    }
    Ok(Client::new(conn))
}

/// Create a connected server/client pair inside this process.
///
/// Both ends are full protocol contexts over a stream socket pair; drive
/// them from separate threads. Intended for tests and in-process helpers.
pub fn socketpair() -> Result<(Server, Client)> {
    let config = sys::global();
    let (server_fd, client_fd) = config.sys.socketpair().map_err(|_| Error::ConnectFailed)?;
    let server = Server::new(Connection::new(
        Channel::Socket { fd: server_fd },
        config.sys.clone(),
    ));
    let client = Client::new(Connection::new(
        Channel::Socket { fd: client_fd },
        config.sys,
    ));
    Ok((server, client))
}

fn accept(listener: &OwnedFd) -> io::Result<OwnedFd> {
    loop {
        let raw = unsafe {
            libc::accept(listener.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
        };
        if raw >= 0 {
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            set_cloexec(fd.as_raw_fd())?;
            return Ok(fd);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn peer_credentials(fd: &OwnedFd) -> io::Result<PeerCredentials> {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCredentials {
        pid: Some(ucred.pid as u32),
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

#[cfg(not(target_os = "linux"))]
fn peer_credentials(fd: &OwnedFd) -> io::Result<PeerCredentials> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    let rc = unsafe { libc::getpeereid(fd.as_raw_fd(), &mut uid, &mut gid) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCredentials {
        pid: None,
        uid,
        gid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn bind_listener(path: &Path) -> OwnedFd {
        UnixListener::bind(path).unwrap().into()
    }

    #[test]
    fn test_socket_roundtrip_with_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.socket");

        let listener = bind_listener(&path);
        let server_thread = std::thread::spawn(move || {
            let (mut server, credentials) = socket_server(listener).unwrap();
            let res = server.process();
            (res, credentials)
        });

        let mut client = socket_client(&path, None).unwrap();
        assert_eq!(client.transact("NOP").run().unwrap(), None);
        client.transact("BYE").run().unwrap();

        let (res, credentials) = server_thread.join().unwrap();
        res.unwrap();

        // We connected to ourselves.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        assert_eq!(credentials.uid, uid);
        assert_eq!(credentials.gid, gid);
        #[cfg(target_os = "linux")]
        assert_eq!(credentials.pid, Some(std::process::id()));
    }

    #[test]
    fn test_socket_client_nonce_precedes_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonce.socket");
        let listener = UnixListener::bind(&path).unwrap();

        let client_path = path.clone();
        let client_thread = std::thread::spawn(move || {
            let mut client =
                socket_client(&client_path, Some(&b"0123456789abcdef"[..])).unwrap();
            client.send_raw("NOP").unwrap();
            let line = client.receive_line().unwrap();
            assert_eq!(line, b"OK");
        });

        use std::io::{Read, Write};
        let (mut stream, _addr) = listener.accept().unwrap();
        let mut nonce = [0u8; 16];
        stream.read_exact(&mut nonce).unwrap();
        assert_eq!(&nonce, b"0123456789abcdef");
        let mut command = [0u8; 4];
        stream.read_exact(&mut command).unwrap();
        assert_eq!(&command, b"NOP\n");
        stream.write_all(b"OK\n").unwrap();

        client_thread.join().unwrap();
    }

    #[test]
    fn test_socket_client_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.socket");
        assert_eq!(socket_client(&path, None).err(), Some(Error::ConnectFailed));
    }

    #[test]
    fn test_socketpair_pair_is_connected() {
        let (mut server, mut client) = socketpair().unwrap();
        let server_thread = std::thread::spawn(move || server.process());
        assert_eq!(client.transact("NOP").run().unwrap(), None);
        client.transact("BYE").run().unwrap();
        server_thread.join().unwrap().unwrap();
    }
}
