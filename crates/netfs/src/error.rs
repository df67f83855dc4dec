//! Error representation for namespace operations.
//!
//! "Try again later" is not an error here: it is expressed as
//! [`Progress::Pending`](crate::Progress) by `read`/`write`. The variants
//! below cover the cases where an operation genuinely failed, and each maps
//! onto a POSIX errno via [`Error::errno`] so the namespace can sit under a
//! file server that reports errors by code.

use std::{fmt, io};

use nix::errno::Errno;

#[derive(Debug)]
pub enum Error {
    /// No socket with that identifier, or the handle is stale.
    NotFound,
    /// Malformed text payload, or an endpoint not legal for the socket's
    /// protocol or current state.
    Invalid(&'static str),
    /// A resource limit was hit (identifier space, queue capacity).
    Exhausted(&'static str),
    /// The protocol engine reported a reset or fatal failure. Surfaced once;
    /// afterwards the socket behaves as closed.
    Protocol(&'static str),
    /// Outside the documented feature set (IPv6, unknown options).
    Unsupported(&'static str),
    /// I/O failure reported by the engine.
    Io(io::Error),
}

impl Error {
    /// The errno a file server should report for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Error::NotFound => Errno::ENOENT,
            Error::Invalid(_) => Errno::EINVAL,
            Error::Exhausted(_) => Errno::ENOSPC,
            Error::Protocol(_) => Errno::ECONNRESET,
            Error::Unsupported(_) => Errno::EOPNOTSUPP,
            Error::Io(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "no such socket"),
            Error::Invalid(msg) => write!(f, "invalid operation: {msg}"),
            Error::Exhausted(what) => write!(f, "resource exhausted: {what}"),
            Error::Protocol(msg) => write!(f, "protocol failure: {msg}"),
            Error::Unsupported(what) => write!(f, "unsupported: {what}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NotFound.errno(), Errno::ENOENT);
        assert_eq!(Error::Invalid("x").errno(), Errno::EINVAL);
        assert_eq!(Error::Exhausted("x").errno(), Errno::ENOSPC);
        assert_eq!(Error::Protocol("x").errno(), Errno::ECONNRESET);
        assert_eq!(Error::Unsupported("x").errno(), Errno::EOPNOTSUPP);
        let io = Error::from(io::Error::from_raw_os_error(libc_eio()));
        assert_eq!(io.errno(), Errno::EIO);
    }

    fn libc_eio() -> i32 {
        Errno::EIO as i32
    }
}
