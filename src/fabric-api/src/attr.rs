//! Attributes accepted by the open calls.
use serde::{Deserialize, Serialize};

use crate::addr::EpName;
use crate::GNIX_DOM_NAME;

/// Kind of wait object a counter or completion queue signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitObj {
    None,
    Unspec,
    Set,
    Fd,
    MutexCond,
}

impl Default for WaitObj {
    fn default() -> Self {
        WaitObj::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpType {
    /// Connection-oriented, exactly one virtual connection per endpoint.
    Msg,
    /// Reliable datagram, one virtual connection per addressed peer.
    Rdm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CqFormat {
    Unspec,
    Context,
    Msg,
    Data,
    Tagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CntrEvents {
    Completion,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvType {
    Table,
    Map,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainAttr {
    pub name: Option<String>,
    /// When present, credentials are derived from this peer instead of the
    /// job launch environment.
    pub dest_addr: Option<EpName>,
}

impl Default for DomainAttr {
    fn default() -> Self {
        DomainAttr {
            name: Some(GNIX_DOM_NAME.to_owned()),
            dest_addr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CntrAttr {
    pub events: CntrEvents,
    pub wait_obj: WaitObj,
    pub flags: u64,
}

impl Default for CntrAttr {
    fn default() -> Self {
        CntrAttr {
            events: CntrEvents::Completion,
            wait_obj: WaitObj::None,
            flags: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CqAttr {
    /// Zero selects the domain default.
    pub size: usize,
    pub format: CqFormat,
    pub wait_obj: WaitObj,
}

impl Default for CqAttr {
    fn default() -> Self {
        CqAttr {
            size: 0,
            format: CqFormat::Context,
            wait_obj: WaitObj::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EpAttr {
    pub ep_type: EpType,
}

impl Default for EpAttr {
    fn default() -> Self {
        EpAttr {
            ep_type: EpType::Rdm,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AvAttr {
    pub av_type: AvType,
    pub count: usize,
}

impl Default for AvAttr {
    fn default() -> Self {
        AvAttr {
            av_type: AvType::Table,
            count: 16,
        }
    }
}
