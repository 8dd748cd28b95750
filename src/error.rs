use std::fmt;
use std::io;

use crate::dns::DnsStatus;
use crate::{DevId, TimerId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong talking to the dispatch engine.
///
/// Kept as a plain enum rather than boxed trait objects: callers
/// frequently need to match on `Error::Dns(status)` to decide whether a
/// resolve failure is worth retrying, and a flat enum keeps that cheap.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Dns(DnsStatus),
    UnknownDev(DevId),
    UnknownTimer(TimerId),
    UnknownPump(u64),
    UnknownWorker(u64),
    NotBound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Dns(status) => write!(f, "dns error: {:?}", status),
            Error::UnknownDev(id) => write!(f, "unknown device id {}", id.0),
            Error::UnknownTimer(id) => write!(f, "unknown timer id {}", id.0),
            Error::UnknownPump(id) => write!(f, "unknown pump id {}", id),
            Error::UnknownWorker(id) => write!(f, "unknown worker id {}", id),
            Error::NotBound => write!(f, "device has no pump bound to it"),
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
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<DnsStatus> for Error {
    fn from(status: DnsStatus) -> Error {
        Error::Dns(status)
    }
}
