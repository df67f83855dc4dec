use std::net::{SocketAddr, SocketAddrV4};

use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

/// Completion of a namespace read or write.
///
/// `Pending` means the operation could not make progress right now and no
/// error occurred; the caller registers for notification and retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress<T> {
    Ready(T),
    Pending,
}

impl<T> Progress<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Progress::Pending)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Progress::Ready(_))
    }

    /// Get the completed value, `None` if pending.
    pub fn ready(self) -> Option<T> {
        match self {
            Progress::Ready(v) => Some(v),
            Progress::Pending => None,
        }
    }
}

/// Parse the `"A.B.C.D:PORT"` address text used throughout the namespace.
///
/// Surrounding whitespace (including the trailing newline of a line-oriented
/// writer) is tolerated. IPv6 literals are recognized and rejected as
/// unsupported rather than malformed.
pub fn parse_addr(text: &str) -> Result<SocketAddrV4> {
    let text = text.trim();
    match text.parse::<SocketAddr>() {
        Ok(SocketAddr::V4(addr)) => Ok(addr),
        Ok(SocketAddr::V6(_)) => Err(error::Error::Unsupported("IPv6 address")),
        Err(_) => Err(error::Error::Invalid("malformed address, want \"A.B.C.D:PORT\"")),
    }
}

/// Parse address text arriving as a raw write payload.
pub fn parse_addr_bytes(data: &[u8]) -> Result<SocketAddrV4> {
    let text =
        std::str::from_utf8(data).map_err(|_| error::Error::Invalid("address is not text"))?;
    parse_addr(text)
}

/// Render an address as the one-line text a namespace read returns.
pub fn addr_line(addr: SocketAddrV4) -> String {
    format!("{addr}\n")
}
