use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes reported through completion queues and counters. The numeric
/// values follow the fabric interface's `FI_E*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum Errno {
    #[error("No such entry")]
    NoEnt,
    #[error("I/O error")]
    Io,
    #[error("Resource temporarily unavailable")]
    Again,
    #[error("Out of memory")]
    NoMem,
    #[error("Permission denied")]
    Access,
    #[error("Device or resource busy")]
    Busy,
    #[error("Invalid argument")]
    Inval,
    #[error("Function not implemented")]
    NoSys,
    #[error("Connection aborted")]
    ConnAborted,
    #[error("Transport endpoint is not connected")]
    NotConn,
    #[error("Connection timed out")]
    TimedOut,
    #[error("Connection refused")]
    ConnRefused,
    #[error("Operation canceled")]
    Canceled,
    #[error("Message truncated")]
    Trunc,
    #[error("Error available on the error queue")]
    Avail,
}

impl Errno {
    /// The positive errno value.
    pub const fn as_raw(self) -> i32 {
        match self {
            Errno::NoEnt => 2,
            Errno::Io => 5,
            Errno::Again => 11,
            Errno::NoMem => 12,
            Errno::Access => 13,
            Errno::Busy => 16,
            Errno::Inval => 22,
            Errno::NoSys => 38,
            Errno::ConnAborted => 103,
            Errno::NotConn => 107,
            Errno::TimedOut => 110,
            Errno::ConnRefused => 111,
            Errno::Canceled => 125,
            Errno::Trunc => 265,
            Errno::Avail => 259,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        let e = match raw.abs() {
            2 => Errno::NoEnt,
            5 => Errno::Io,
            11 => Errno::Again,
            12 => Errno::NoMem,
            13 => Errno::Access,
            16 => Errno::Busy,
            22 => Errno::Inval,
            38 => Errno::NoSys,
            103 => Errno::ConnAborted,
            107 => Errno::NotConn,
            110 => Errno::TimedOut,
            111 => Errno::ConnRefused,
            125 => Errno::Canceled,
            265 => Errno::Trunc,
            259 => Errno::Avail,
            _ => return None,
        };
        Some(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_are_distinct() {
        let all = [
            Errno::NoEnt,
            Errno::Io,
            Errno::Again,
            Errno::NoMem,
            Errno::Access,
            Errno::Busy,
            Errno::Inval,
            Errno::NoSys,
            Errno::ConnAborted,
            Errno::NotConn,
            Errno::TimedOut,
            Errno::ConnRefused,
            Errno::Canceled,
            Errno::Trunc,
            Errno::Avail,
        ];
        for e in all {
            assert_eq!(Errno::from_raw(e.as_raw()), Some(e));
            assert_eq!(Errno::from_raw(-e.as_raw()), Some(e));
        }
        assert_eq!(Errno::from_raw(0), None);
    }
}
