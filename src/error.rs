use std::io;

/// Result alias used at every fallible boundary in this crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Error taxonomy for the optimizer, matching the three tiers in the design:
/// setup-fatal, per-tick recoverable, and strategy failures. The control loop
/// only ever propagates `Setup` errors out of `main`; every other variant is
/// caught, logged, and absorbed by the tick that produced it.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "setup failed: {}", inner)]
    Setup { inner: String },

    #[fail(display = "failed to open a perf_events file descriptor: {}", inner)]
    FdOpen { inner: nix::Error },

    #[fail(display = "failed to enable/disable a perf_events file descriptor: {}", inner)]
    Ioctl { inner: nix::Error },

    #[fail(display = "failed to mmap a perf_events ring buffer: {}", inner)]
    Mmap { inner: nix::Error },

    #[fail(display = "a ring buffer record was truncated or corrupt")]
    CorruptRecord,

    #[fail(display = "/proc read failed for pid {}: {}", pid, inner)]
    ProcGone { pid: i32, inner: io::Error },

    #[fail(display = "move_pages(2) failed: {}", inner)]
    MoveFailed { inner: nix::Error },

    #[fail(display = "sched_setaffinity/sched_setscheduler failed: {}", inner)]
    Affinity { inner: nix::Error },

    #[fail(display = "tickets file unreadable, using defaults: {}", inner)]
    TicketsUnreadable { inner: io::Error },

    #[fail(display = "child process error: {}", inner)]
    Child { inner: io::Error },

    #[fail(display = "I/O error: {}", inner)]
    Io { inner: io::Error },

    #[fail(display = "unknown error: {}", inner)]
    Misc { inner: failure::Error },
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::Io { inner }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::FdOpen { inner }
    }
}

impl From<failure::Error> for Error {
    fn from(inner: failure::Error) -> Self {
        Error::Misc { inner }
    }
}

impl Error {
    /// True for the "per-tick recoverable" tier of the taxonomy in spec
    /// section 7: the control loop logs these and keeps ticking rather than
    /// tearing anything down.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Setup { .. })
    }
}
