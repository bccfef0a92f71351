//! Error type shared by every backend.

use std::collections::TryReserveError;
use std::io;

use thiserror::Error as ThisError;

/// A specialized `Result` for poller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`Poller`](crate::Poller).
///
/// Timing out and being killed are not errors, see [`WaitStatus`](crate::WaitStatus).
#[derive(Debug, ThisError)]
pub enum Error {
    /// Memory or descriptors ran out while growing internal state.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The poller was used in a way its contract forbids.
    #[error("invalid use of poller: {0}")]
    InvalidUse(&'static str),

    /// The readiness syscall failed. The poller cannot be waited on again.
    #[error("readiness backend failed: {0}")]
    Backend(#[source] io::Error),

    /// Any other operating system error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classifies an error coming from socket or descriptor creation.
    pub(crate) fn from_create(err: io::Error, what: &'static str) -> Error {
        if is_exhaustion(&err) {
            Error::ResourceExhausted(what)
        } else {
            Error::Io(err)
        }
    }

    /// Wraps a failed allocation.
    pub(crate) fn from_reserve(_: TryReserveError, what: &'static str) -> Error {
        Error::ResourceExhausted(what)
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(errno: rustix::io::Errno) -> Self {
        Error::Io(errno.into())
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::ResourceExhausted(what) => io::Error::new(io::ErrorKind::OutOfMemory, what),
            Error::InvalidUse(what) => io::Error::new(io::ErrorKind::InvalidInput, what),
            Error::Backend(err) | Error::Io(err) => err,
        }
    }
}

fn is_exhaustion(err: &io::Error) -> bool {
    use rustix::io::Errno;

    match err.raw_os_error().map(Errno::from_raw_os_error) {
        Some(errno) => {
            errno == Errno::MFILE
                || errno == Errno::NFILE
                || errno == Errno::NOMEM
                || errno == Errno::NOBUFS
        }
        None => err.kind() == io::ErrorKind::OutOfMemory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_exhaustion_is_resource_exhausted() {
        let err = io::Error::from(rustix::io::Errno::MFILE);
        assert!(matches!(
            Error::from_create(err, "wake channel"),
            Error::ResourceExhausted("wake channel")
        ));

        let err = io::Error::from(rustix::io::Errno::ACCESS);
        assert!(matches!(Error::from_create(err, "wake channel"), Error::Io(_)));
    }

    #[test]
    fn converts_into_io_error() {
        let err: io::Error = Error::InvalidUse("nope").into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err: io::Error = Error::ResourceExhausted("table").into();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }
}
