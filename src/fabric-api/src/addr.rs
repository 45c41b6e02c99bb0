use std::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// Network address of an endpoint: the device address of the node and the
/// communication domain id the endpoint was created with.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct GniAddress {
    pub device_addr: u32,
    pub cdm_id: u32,
}

const_assert_eq!(std::mem::size_of::<GniAddress>(), 8);

impl GniAddress {
    #[inline]
    pub const fn new(device_addr: u32, cdm_id: u32) -> Self {
        GniAddress {
            device_addr,
            cdm_id,
        }
    }
}

impl fmt::Display for GniAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.device_addr, self.cdm_id)
    }
}

/// The name an endpoint hands out of band so that peers can reach it. Carries
/// the cookie used to authenticate the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EpName {
    pub gnix_addr: GniAddress,
    pub name_type: u8,
    pub cookie: u32,
}

/// A (protection tag, cookie) pair authorizing a process to use a network
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub ptag: u8,
    pub cookie: u32,
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ptag {} cookie {:#x}", self.ptag, self.cookie)
    }
}

/// Index into an address vector.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiAddr(pub u64);

impl FiAddr {
    pub const UNSPEC: FiAddr = FiAddr(u64::MAX);

    #[inline]
    pub fn is_unspec(&self) -> bool {
        *self == Self::UNSPEC
    }
}
