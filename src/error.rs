//! Error type for the transport engine.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Error type for the transport engine.
///
/// Transient socket faults are recovered internally and never surface here;
/// these variants cover allocation-time configuration and resolution faults
/// plus the few unrecoverable readiness-poll failures.
#[derive(Clone, Debug)]
pub enum Error {
    /// A required allocation field is missing or empty.
    MissingField(&'static str),

    /// A bracketed address failed IPv6 validation.
    InvalidAddress(String),

    /// The hostname could not be resolved by any strategy.
    ResolveFailed(String),

    /// Creating a UDP channel socket gave an error.
    UdpCreate(Arc<std::io::Error>),

    /// Dialing a stream connection gave an error.
    StreamConnect(Arc<std::io::Error>),

    /// Setting up the readiness poller gave an error.
    PollRegistry(Arc<std::io::Error>),

    /// Waiting for socket readiness gave an error.
    Poll(Arc<std::io::Error>),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::MissingField(field) => {
                write!(f, "missing or invalid '{}' in allocation", field)
            }
            Error::InvalidAddress(addr) => {
                write!(f, "wrong address (IPv6 filter failed) '{}'", addr)
            }
            Error::ResolveFailed(host) => {
                write!(f, "unable to resolve hostname '{}'", host)
            }
            Error::UdpCreate(_) => write!(f, "cannot create UDP socket"),
            Error::StreamConnect(_) => {
                write!(f, "cannot connect stream socket")
            }
            Error::PollRegistry(_) => {
                write!(f, "cannot set up readiness poller")
            }
            Error::Poll(_) => write!(f, "error polling socket readiness"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::MissingField(_) => None,
            Error::InvalidAddress(_) => None,
            Error::ResolveFailed(_) => None,
            Error::UdpCreate(e) => Some(e),
            Error::StreamConnect(e) => Some(e),
            Error::PollRegistry(e) => Some(e),
            Error::Poll(e) => Some(e),
        }
    }
}
