//! Error types.
//!
//! Errors are explicit and typed. Task closure failures never surface
//! here: a panicking task is contained by its processor and reaches its
//! terminal state like any other, so the public error surface is limited
//! to scheduler lifecycle operations.

use core::fmt;

/// Errors returned by scheduler lifecycle operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// `start` was called on a scheduler that already ran.
    ///
    /// A scheduler instance starts at most once; create a new instance to
    /// run again.
    AlreadyStarted,
    /// Spawning a worker or dispatch thread failed.
    ThreadSpawn(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "scheduler was already started"),
            Self::ThreadSpawn(err) => write!(f, "failed to spawn scheduler thread: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlreadyStarted => None,
            Self::ThreadSpawn(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::ThreadSpawn(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_and_source() {
        assert_eq!(
            Error::AlreadyStarted.to_string(),
            "scheduler was already started"
        );

        let io = std::io::Error::new(std::io::ErrorKind::Other, "no threads");
        let err = Error::from(io);
        assert!(err.to_string().contains("no threads"));
        assert!(err.source().is_some());
    }
}
