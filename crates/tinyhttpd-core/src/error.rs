//! Error types for server startup

use core::fmt;
use std::io;

/// Result type for setup operations
pub type SetupResult<T> = Result<T, SetupError>;

/// Errors that can occur while bringing the server up
///
/// Runtime I/O failures on individual connections never surface here; they
/// close the affected connection and nothing else. `SetupError` is reserved
/// for the startup path, where the only sane reaction is to exit.
#[derive(Debug)]
pub enum SetupError {
    /// Creating or configuring the listening socket failed
    Listener(io::Error),

    /// Creating the epoll instance failed
    Poller(io::Error),

    /// Spawning a worker thread failed
    WorkerSpawn(io::Error),

    /// A size parameter was zero or otherwise unusable
    BadConfig(&'static str),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Listener(e) => write!(f, "listener setup failed: {}", e),
            SetupError::Poller(e) => write!(f, "epoll setup failed: {}", e),
            SetupError::WorkerSpawn(e) => write!(f, "worker spawn failed: {}", e),
            SetupError::BadConfig(what) => write!(f, "bad configuration: {}", what),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Listener(e) | SetupError::Poller(e) | SetupError::WorkerSpawn(e) => {
                Some(e)
            }
            SetupError::BadConfig(_) => None,
        }
    }
}
