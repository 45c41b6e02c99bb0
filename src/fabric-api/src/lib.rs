//! Vocabulary shared between the GNI transport and its users: handles,
//! addresses, attributes, flags and completion entry formats.
#![allow(missing_docs)]

pub mod handle;
pub use handle::Handle;

pub mod addr;
pub use addr::{Credentials, EpName, FiAddr, GniAddress};

pub mod errno;
pub use errno::Errno;

pub mod attr;
pub mod cq;
pub mod flags;

/// Largest transfer a single hardware operation can carry.
pub const GNIX_MAX_MSG_SIZE: u64 = (1 << 32) - 1;
pub const GNIX_CACHELINE_SIZE: usize = 64;
pub const GNIX_INJECT_SIZE: usize = GNIX_CACHELINE_SIZE;

/// Provider name matched against domain attributes.
pub const GNIX_DOM_NAME: &str = "gni";
