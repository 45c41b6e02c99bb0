//! Connection and completion engine of the GNI transport.
//!
//! Applications open a [`Fabric`], then a [`Domain`] bound to a credential
//! pair, and submit operations on an [`Endpoint`]. Submission never drives
//! the hardware; completions are discovered by reading a [`Counter`] or a
//! [`CompletionQueue`], by waiting on one, or by calling
//! [`Endpoint::progress`].
use thiserror::Error;

use fabric_api::Errno;
use fabric_common::resource::Error as ResourceError;

pub mod av;
pub mod cm_nic;
pub mod cntr;
pub mod config;
pub mod cq;
pub mod credential;
pub mod domain;
pub mod driver;
pub mod ep;
pub mod fabric;
pub mod matcher;
pub mod nic;
pub mod wait;

pub(crate) mod fab_req;
pub(crate) mod vc;

pub use av::AddressVector;
pub use cm_nic::{CmNic, CmNicKey, CmNicRegistry};
pub use cntr::{CntrControl, Counter};
pub use config::GniConfig;
pub use cq::CompletionQueue;
pub use domain::Domain;
pub use driver::DriverError;
pub use ep::Endpoint;
pub use fabric::Fabric;
pub use vc::VcState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Resource busy, {0} open references")]
    Busy(usize),
    #[error("Out of memory")]
    NoMemory,
    #[error("Permission denied: {0}")]
    PermissionDenied(DriverError),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Hardware resources exhausted after {0} retries")]
    TransientResource(u32),
    #[error("Operation timed out")]
    Timeout,
    #[error("Operation canceled")]
    Canceled,
    #[error("Operation would block")]
    Again,
    #[error("Message truncated, {0} bytes dropped")]
    Truncated(usize),
    #[error("Resource not found")]
    NotFound,
    #[error("Error completions available")]
    Available,
    #[error("Driver error: {0}")]
    Driver(DriverError),
}

impl Error {
    pub fn errno(&self) -> Errno {
        match self {
            Error::InvalidArgument(_) => Errno::Inval,
            Error::Busy(_) => Errno::Busy,
            Error::NoMemory => Errno::NoMem,
            Error::PermissionDenied(_) => Errno::Access,
            Error::ConnectionFailed(_) => Errno::ConnRefused,
            Error::ConnectionClosed => Errno::NotConn,
            Error::TransientResource(_) => Errno::Again,
            Error::Timeout => Errno::TimedOut,
            Error::Canceled => Errno::Canceled,
            Error::Again => Errno::Again,
            Error::Truncated(_) => Errno::Trunc,
            Error::NotFound => Errno::NoEnt,
            Error::Available => Errno::Avail,
            Error::Driver(_) => Errno::Io,
        }
    }

    pub(crate) fn inval<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl From<ResourceError> for Error {
    fn from(other: ResourceError) -> Self {
        match other {
            ResourceError::NotFound => Error::NotFound,
            ResourceError::Exists => Error::inval("resource exists"),
            ResourceError::Busy(refs) => Error::Busy(refs),
            ResourceError::Closed => Error::inval("object has been closed"),
        }
    }
}

impl From<DriverError> for Error {
    fn from(other: DriverError) -> Self {
        Error::Driver(other)
    }
}

impl From<Error> for fabric_api::Errno {
    fn from(other: Error) -> Self {
        other.errno()
    }
}
