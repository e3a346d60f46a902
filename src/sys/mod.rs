//! System call capability layer.
//!
//! Every transport operation the engine performs goes through [`SysOps`], a
//! record of blocking primitives with a default POSIX implementation. Host
//! environments can substitute their own implementation to intercept or
//! redirect syscalls (test fakes, sandboxes, alternate spawn machinery)
//! without touching the protocol core.
//!
//! The trait has two generations of entries. The original set (`usleep`,
//! `pipe`, `read`, `write`, `sendmsg`, `recvmsg`, `spawn`, `waitpid`,
//! `socketpair`) is required; the later additions (`socket`, `connect`)
//! carry default bodies that delegate to the POSIX implementation, so an
//! implementation written against the older surface keeps working unchanged.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::{Arc, OnceLock};

mod posix;

pub use posix::PosixSys;

/// Hook invoked around every blocking call of the default implementation,
/// letting embedders mask signals or arm cancellation at the boundary.
pub type SyscallHook = fn();

/// Hook run in the child between fork and exec.
pub type PreExec = Box<dyn FnMut() -> io::Result<()> + Send + Sync + 'static>;

/// How [`SysOps::waitpid`] behaves when the child has not exited yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Poll without blocking.
    NoHang,
    /// Block until the child exits.
    Block,
    /// Send `SIGTERM`, then block until the child exits.
    Terminate,
}

/// Blocking system primitives the protocol engine is built on.
///
/// All entries follow `io::Result` conventions; `EINTR` handling and short
/// read/write retries are the engine's job, implementations stay thin.
pub trait SysOps: Send + Sync {
    /// Sleep for the given number of microseconds.
    fn usleep(&self, micros: u64);

    /// Create a pipe, returning `(read_end, write_end)`, both close-on-exec.
    fn pipe(&self) -> io::Result<(OwnedFd, OwnedFd)>;

    /// Read into `buf`, returning the number of bytes read (0 on EOF).
    fn read(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes written.
    fn write(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize>;

    /// Send `bytes` on a stream socket, attaching `fds` as an `SCM_RIGHTS`
    /// ancillary batch when non-empty.
    fn sendmsg(&self, fd: BorrowedFd<'_>, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize>;

    /// Receive into `buf` from a stream socket, collecting any `SCM_RIGHTS`
    /// descriptors that rode along. Received descriptors are owned by the
    /// caller and close-on-exec.
    fn recvmsg(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)>;

    /// Start `program` with `argv`, wiring `stdin`/`stdout` to the given
    /// descriptors. Descriptors listed in `inherited_fds` survive the exec;
    /// everything else of ours is close-on-exec. `pre_exec` runs in the
    /// child after fork, before exec.
    fn spawn(
        &self,
        program: &str,
        argv: &[String],
        stdin: OwnedFd,
        stdout: OwnedFd,
        inherited_fds: &[RawFd],
        pre_exec: Option<PreExec>,
    ) -> io::Result<u32>;

    /// Wait for `pid`. Returns the raw wait status when the child was
    /// reaped, `None` when it is still running (or already reaped).
    fn waitpid(&self, pid: u32, mode: WaitMode) -> io::Result<Option<i32>>;

    /// Create a connected stream socket pair, both ends close-on-exec.
    fn socketpair(&self) -> io::Result<(OwnedFd, OwnedFd)>;

    /// Create an unbound local stream socket.
    ///
    /// Later addition; the default delegates to the POSIX implementation.
    fn socket(&self) -> io::Result<OwnedFd> {
        posix::default_socket()
    }

    /// Connect a local stream socket to `path`.
    ///
    /// Later addition; the default delegates to the POSIX implementation.
    fn connect(&self, fd: BorrowedFd<'_>, path: &Path) -> io::Result<()> {
        posix::default_connect(fd, path)
    }
}

/// Process-wide defaults, established once at startup and consulted
/// read-only afterwards. Contexts snapshot the configuration at
/// construction, so later (failed) installs can never race a live
/// conversation.
#[derive(Clone)]
pub struct GlobalConfig {
    /// The syscall implementation new contexts are created with.
    pub sys: Arc<dyn SysOps>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            sys: Arc::new(PosixSys::new()),
        }
    }
}

static GLOBAL: OnceLock<GlobalConfig> = OnceLock::new();

/// Install the process-wide configuration.
///
/// Returns `false` if a configuration is already in place (including the
/// default, which is materialized on first use).
pub fn install(config: GlobalConfig) -> bool {
    GLOBAL.set(config).is_ok()
}

/// Snapshot the process-wide configuration.
pub fn global() -> GlobalConfig {
    GLOBAL.get_or_init(GlobalConfig::default).clone()
}
