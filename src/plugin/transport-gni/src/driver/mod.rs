//! The boundary between the engine and the network device.
//!
//! Everything the engine needs from the hardware goes through [`Driver`]:
//! connection handles, NIC contexts, the datagram handshake, posting
//! transfers and reaping their completions. A driver must never block in
//! any of these calls.
use thiserror::Error;

use fabric_api::{Credentials, EpName, GniAddress, Handle, GNIX_MAX_MSG_SIZE};

pub mod loopback;
pub use loopback::LoopbackDriver;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Permission denied")]
    Permission,
    #[error("No such device: {0}")]
    NoDevice(u32),
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
    #[error("Out of resources")]
    NoResources,
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("Unknown handle {0:?}")]
    UnknownHandle(Handle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CdmHandle(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NicHandle(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpHandle(pub Handle);

/// Slot index of a datagram within its CM NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatagramId(pub u64);

/// A directed handshake datagram.
#[derive(Debug, Clone, Copy)]
pub struct DatagramRequest {
    pub id: DatagramId,
    pub local: EpName,
    pub peer: GniAddress,
}

#[derive(Debug, Clone)]
pub enum DatagramEvent {
    /// A directed handshake completed. `peer_mbox` describes the remote
    /// mailbox the connection is layered on.
    Connected { id: DatagramId, peer_mbox: u64 },
    /// A directed handshake was refused or failed in the device.
    Failed { id: DatagramId, error: DriverError },
    /// A wildcard datagram was consumed by a handshake from `peer`.
    Accepted { id: DatagramId, peer: GniAddress },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Msg,
    Tagged,
    RdmaWrite,
    RdmaRead,
}

/// One chunk of a transfer, as handed to the device.
#[derive(Debug, Clone, Copy)]
pub struct OpDescriptor {
    pub op_id: u64,
    pub kind: OpKind,
    pub ep: EpHandle,
    pub local_addr: usize,
    pub len: usize,
    /// Remote address for RDMA, already advanced to this chunk.
    pub remote_addr: u64,
    pub rkey: u64,
    pub tag: u64,
    pub imm: Option<u64>,
    /// Per-connection message sequence; chunks of one message share it.
    pub msg_seq: u64,
    pub offset: usize,
    pub total_len: usize,
}

impl OpDescriptor {
    #[inline]
    pub fn is_last_chunk(&self) -> bool {
        self.offset + self.len >= self.total_len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Posted,
    /// The device is out of transmit resources; the post may be replayed.
    Backpressure,
}

/// One chunk of a message that arrived for a local endpoint.
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub dst: GniAddress,
    pub src: GniAddress,
    pub tagged: bool,
    pub tag: u64,
    pub imm: Option<u64>,
    pub msg_seq: u64,
    pub offset: usize,
    pub total_len: usize,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum HwCompletion {
    /// A posted chunk left the device.
    Tx {
        op_id: u64,
        status: Result<(), DriverError>,
    },
    Incoming(IncomingChunk),
    /// A peer finished an RDMA write carrying immediate data into a local
    /// endpoint.
    RemoteWrite {
        dst: GniAddress,
        src: GniAddress,
        imm: u64,
        len: usize,
    },
}

pub trait Driver: Send + Sync + 'static {
    /// Creates a communication domain handle for instance `inst_id`.
    fn create_cdm(&self, inst_id: u32, creds: Credentials) -> Result<CdmHandle, DriverError>;

    /// Attaches a communication domain to a device. Returns the device
    /// address used for all endpoints built on it.
    fn attach_cdm(&self, cdm: CdmHandle, device_id: u32) -> Result<u32, DriverError>;

    fn destroy_cdm(&self, cdm: CdmHandle) -> Result<(), DriverError>;

    fn create_nic(&self, cdm: CdmHandle) -> Result<NicHandle, DriverError>;

    fn destroy_nic(&self, nic: NicHandle);

    /// Makes `name` reachable through `nic`.
    fn bind_endpoint(&self, nic: NicHandle, name: &EpName) -> Result<(), DriverError>;

    fn unbind_endpoint(&self, addr: GniAddress);

    fn post_datagram(&self, cdm: CdmHandle, req: &DatagramRequest) -> Result<(), DriverError>;

    fn post_wildcard(&self, cdm: CdmHandle, id: DatagramId) -> Result<(), DriverError>;

    fn cancel_datagram(&self, cdm: CdmHandle, id: DatagramId);

    /// Appends the handshake events that happened since the last probe.
    fn probe_datagrams(&self, cdm: CdmHandle, events: &mut Vec<DatagramEvent>);

    /// Creates the low-level connection between `local` and `peer`.
    fn create_ep(
        &self,
        nic: NicHandle,
        local: GniAddress,
        peer: GniAddress,
        peer_mbox: u64,
    ) -> Result<EpHandle, DriverError>;

    fn destroy_ep(&self, ep: EpHandle);

    fn post_operation(&self, nic: NicHandle, op: &OpDescriptor)
        -> Result<PostOutcome, DriverError>;

    /// Appends completions of `nic` and clears them from the device.
    fn reap_completions(&self, nic: NicHandle, out: &mut Vec<HwCompletion>);

    #[inline]
    fn max_transfer_size(&self) -> u64 {
        GNIX_MAX_MSG_SIZE
    }
}
