//! Default POSIX implementation of [`SysOps`].
//!
//! Thin wrappers over `libc`; the only policy here is close-on-exec on every
//! descriptor we create and the pre/post hooks around blocking calls.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use super::{PreExec, SysOps, SyscallHook, WaitMode};

/// Largest `SCM_RIGHTS` batch a single `recvmsg` accepts.
const FD_BATCH_MAX: usize = 16;

/// The default syscall implementation.
///
/// The optional hooks run immediately before and after every blocking call,
/// so a host environment can suspend signal delivery or cancellation around
/// the suspension points.
#[derive(Default)]
pub struct PosixSys {
    pre_syscall: Option<SyscallHook>,
    post_syscall: Option<SyscallHook>,
}

impl PosixSys {
    /// Create the default implementation without hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the default implementation with pre/post syscall hooks.
    pub fn with_hooks(pre: Option<SyscallHook>, post: Option<SyscallHook>) -> Self {
        Self {
            pre_syscall: pre,
            post_syscall: post,
        }
    }

    fn enter(&self) {
        if let Some(hook) = self.pre_syscall {
            hook();
        }
    }

    fn leave(&self) {
        if let Some(hook) = self.post_syscall {
            hook();
        }
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl SysOps for PosixSys {
    fn usleep(&self, micros: u64) {
        tracing::trace!(target: "assuan_ipc::sysio", micros, "usleep");
        self.enter();
        std::thread::sleep(Duration::from_micros(micros));
        self.leave();
    }

    fn pipe(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;
        tracing::trace!(target: "assuan_ipc::sysio",
            read = read.as_raw_fd(), write = write.as_raw_fd(), "pipe");
        Ok((read, write))
    }

    fn read(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
        self.enter();
        let n = unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        self.leave();
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn write(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
        self.enter();
        let n = unsafe {
            libc::write(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len())
        };
        self.leave();
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn sendmsg(&self, fd: BorrowedFd<'_>, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        let fd_bytes = std::mem::size_of_val(fds);
        let cmsg_space = if fds.is_empty() {
            0
        } else {
            unsafe { libc::CMSG_SPACE(fd_bytes as u32) as usize }
        };
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if !fds.is_empty() {
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_space as _;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
                let data = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
                for (i, &raw) in fds.iter().enumerate() {
                    std::ptr::write_unaligned(data.add(i), raw);
                }
            }
        }

        self.enter();
        let n = unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, 0) };
        self.leave();
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn recvmsg(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let fd_size = std::mem::size_of::<libc::c_int>();
        let cmsg_space = unsafe { libc::CMSG_SPACE((FD_BATCH_MAX * fd_size) as u32) as usize };
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        #[cfg(target_os = "linux")]
        let flags = libc::MSG_CMSG_CLOEXEC;
        #[cfg(not(target_os = "linux"))]
        let flags = 0;

        self.enter();
        let n = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, flags) };
        self.leave();
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut received = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let data = libc::CMSG_DATA(cmsg);
                    let count =
                        ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / fd_size;
                    for i in 0..count {
                        let raw: libc::c_int = std::ptr::read_unaligned(
                            data.add(i * fd_size) as *const libc::c_int,
                        );
                        #[cfg(not(target_os = "linux"))]
                        let _ = set_cloexec(raw);
                        received.push(OwnedFd::from_raw_fd(raw));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        if !received.is_empty() {
            tracing::trace!(target: "assuan_ipc::sysio",
                count = received.len(), "recvmsg received descriptors");
        }
        Ok((n as usize, received))
    }

    fn spawn(
        &self,
        program: &str,
        argv: &[String],
        stdin: OwnedFd,
        stdout: OwnedFd,
        inherited_fds: &[RawFd],
        pre_exec: Option<PreExec>,
    ) -> io::Result<u32> {
        let mut cmd = Command::new(program);
        cmd.args(argv)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout));

        let inherited = inherited_fds.to_vec();
        let mut hook = pre_exec;
        unsafe {
            cmd.pre_exec(move || {
                for &fd in &inherited {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags >= 0 {
                        libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
                    }
                }
                if let Some(hook) = hook.as_mut() {
                    hook()?;
                }
                Ok(())
            });
        }

        self.enter();
        let child = cmd.spawn();
        self.leave();
        let child = child?;
        tracing::trace!(target: "assuan_ipc::sysio", program, pid = child.id(), "spawn");
        Ok(child.id())
    }

    fn waitpid(&self, pid: u32, mode: WaitMode) -> io::Result<Option<i32>> {
        if mode == WaitMode::Terminate {
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }
        let options = if mode == WaitMode::NoHang {
            libc::WNOHANG
        } else {
            0
        };
        loop {
            let mut status: libc::c_int = 0;
            self.enter();
            let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, options) };
            self.leave();
            if rc == pid as libc::pid_t {
                return Ok(Some(status));
            }
            if rc == 0 {
                return Ok(None);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // Already reaped elsewhere; nothing left to collect.
                Some(libc::ECHILD) => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    fn socketpair(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        } < 0
        {
            return Err(io::Error::last_os_error());
        }
        let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_cloexec(a.as_raw_fd())?;
        set_cloexec(b.as_raw_fd())?;
        Ok((a, b))
    }

    fn socket(&self) -> io::Result<OwnedFd> {
        default_socket()
    }

    fn connect(&self, fd: BorrowedFd<'_>, path: &Path) -> io::Result<()> {
        self.enter();
        let res = default_connect(fd, path);
        self.leave();
        res
    }
}

/// Create an unbound local stream socket, close-on-exec.
pub(super) fn default_socket() -> io::Result<OwnedFd> {
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_cloexec(fd.as_raw_fd())?;
    Ok(fd)
}

/// Connect a local stream socket to a filesystem path.
pub(super) fn default_connect(fd: BorrowedFd<'_>, path: &Path) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (i, &b) in bytes.iter().enumerate() {
        addr.sun_path[i] = b as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;

    loop {
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
