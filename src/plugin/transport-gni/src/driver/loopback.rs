//! An in-process device. Every communication domain attaches to the same
//! node, so endpoints created in one process can reach each other. Transfers
//! are carried out at post time and their completions queue up until the
//! owning NIC is reaped.
//!
//! The driver can be told to refuse posts, to leave handshakes unanswered or
//! to fail them, which is how the engine's recovery paths are exercised.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};

use fabric_api::{Credentials, EpName, GniAddress, Handle, GNIX_MAX_MSG_SIZE};

use super::{
    CdmHandle, DatagramEvent, DatagramId, DatagramRequest, Driver, DriverError, EpHandle,
    HwCompletion, IncomingChunk, NicHandle, OpDescriptor, OpKind, PostOutcome,
};
use fabric_common::log;

const STALL_FOREVER: usize = usize::MAX;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackStats {
    pub cdm_created: usize,
    pub cdm_destroyed: usize,
    pub nic_created: usize,
    pub handshakes: usize,
    pub posts: usize,
    pub backpressured: usize,
}

#[derive(Debug, Default)]
struct Stats {
    cdm_created: AtomicUsize,
    cdm_destroyed: AtomicUsize,
    nic_created: AtomicUsize,
    handshakes: AtomicUsize,
    posts: AtomicUsize,
    backpressured: AtomicUsize,
}

struct CdmState {
    creds: Credentials,
    attached: bool,
    events: Vec<DatagramEvent>,
    wildcards: VecDeque<DatagramId>,
}

struct NicState {
    cdm: CdmHandle,
    completions: VecDeque<HwCompletion>,
}

struct Binding {
    nic: NicHandle,
    cdm: CdmHandle,
    cookie: u32,
}

struct EpState {
    nic: NicHandle,
    local: GniAddress,
    peer: GniAddress,
}

#[derive(Default)]
struct State {
    cdms: HashMap<CdmHandle, CdmState>,
    nics: HashMap<NicHandle, NicState>,
    bindings: HashMap<GniAddress, Binding>,
    eps: HashMap<EpHandle, EpState>,
    unreachable: HashSet<GniAddress>,
    refused: HashSet<GniAddress>,
    deny_cdm_create: bool,
    deny_attach: bool,
}

pub struct LoopbackDriver {
    device_addr: u32,
    next_handle: AtomicU64,
    state: spin::Mutex<State>,
    stall: AtomicUsize,
    max_transfer: AtomicU64,
    stats: Stats,
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::with_device_addr(0x1a2b)
    }

    pub fn with_device_addr(device_addr: u32) -> Self {
        LoopbackDriver {
            device_addr,
            next_handle: AtomicU64::new(1),
            state: spin::Mutex::new(State::default()),
            stall: AtomicUsize::new(0),
            max_transfer: AtomicU64::new(GNIX_MAX_MSG_SIZE),
            stats: Stats::default(),
        }
    }

    /// Answers the next `n` posts with backpressure.
    pub fn stall_posts(&self, n: usize) {
        self.stall.store(n, Ordering::Release);
    }

    /// Answers every post with backpressure until [`LoopbackDriver::release`].
    pub fn stall_forever(&self) {
        self.stall.store(STALL_FOREVER, Ordering::Release);
    }

    pub fn release(&self) {
        self.stall.store(0, Ordering::Release);
    }

    /// Handshakes towards `addr` are never answered.
    pub fn make_unreachable(&self, addr: GniAddress) {
        self.state.lock().unreachable.insert(addr);
    }

    /// Handshakes towards `addr` fail.
    pub fn refuse(&self, addr: GniAddress) {
        self.state.lock().refused.insert(addr);
    }

    pub fn deny_cdm_create(&self, deny: bool) {
        self.state.lock().deny_cdm_create = deny;
    }

    pub fn deny_attach(&self, deny: bool) {
        self.state.lock().deny_attach = deny;
    }

    pub fn set_max_transfer_size(&self, size: u64) {
        self.max_transfer.store(size, Ordering::Release);
    }

    pub fn live_cdms(&self) -> usize {
        self.state.lock().cdms.len()
    }

    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            cdm_created: self.stats.cdm_created.load(Ordering::Acquire),
            cdm_destroyed: self.stats.cdm_destroyed.load(Ordering::Acquire),
            nic_created: self.stats.nic_created.load(Ordering::Acquire),
            handshakes: self.stats.handshakes.load(Ordering::Acquire),
            posts: self.stats.posts.load(Ordering::Acquire),
            backpressured: self.stats.backpressured.load(Ordering::Acquire),
        }
    }

    #[inline]
    fn alloc_handle(&self) -> Handle {
        Handle(self.next_handle.fetch_add(1, Ordering::AcqRel))
    }

    /// Consumes one unit of injected backpressure, if any is left.
    fn take_stall(&self) -> bool {
        let mut cur = self.stall.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            if cur == STALL_FOREVER {
                return true;
            }
            match self
                .stall
                .compare_exchange(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

/// # Safety
///
/// Both ranges must be valid for `len` bytes. The engine only hands out
/// addresses of buffers the submitter promised to keep alive until the
/// request completes.
unsafe fn copy_bytes(src: usize, dst: usize, len: usize) {
    if len > 0 {
        std::ptr::copy(src as *const u8, dst as *mut u8, len);
    }
}

impl Driver for LoopbackDriver {
    fn create_cdm(&self, inst_id: u32, creds: Credentials) -> Result<CdmHandle, DriverError> {
        let mut state = self.state.lock();
        if state.deny_cdm_create {
            return Err(DriverError::Permission);
        }
        let cdm = CdmHandle(self.alloc_handle());
        state.cdms.insert(
            cdm,
            CdmState {
                creds,
                attached: false,
                events: Vec::new(),
                wildcards: VecDeque::new(),
            },
        );
        self.stats.cdm_created.fetch_add(1, Ordering::AcqRel);
        log::debug!("cdm {:?} created for instance {}, {}", cdm, inst_id, creds);
        Ok(cdm)
    }

    fn attach_cdm(&self, cdm: CdmHandle, device_id: u32) -> Result<u32, DriverError> {
        let mut state = self.state.lock();
        if device_id != 0 {
            return Err(DriverError::NoDevice(device_id));
        }
        if state.deny_attach {
            return Err(DriverError::Permission);
        }
        let entry = state
            .cdms
            .get_mut(&cdm)
            .ok_or(DriverError::UnknownHandle(cdm.0))?;
        entry.attached = true;
        Ok(self.device_addr)
    }

    fn destroy_cdm(&self, cdm: CdmHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let entry = state
            .cdms
            .remove(&cdm)
            .ok_or(DriverError::UnknownHandle(cdm.0))?;
        log::debug!(
            "cdm {:?} destroyed, {}, attached: {}",
            cdm,
            entry.creds,
            entry.attached
        );
        self.stats.cdm_destroyed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn create_nic(&self, cdm: CdmHandle) -> Result<NicHandle, DriverError> {
        let mut state = self.state.lock();
        match state.cdms.get(&cdm) {
            Some(entry) if entry.attached => {}
            Some(_) => return Err(DriverError::InvalidParam("cdm not attached".into())),
            None => return Err(DriverError::UnknownHandle(cdm.0)),
        }
        let nic = NicHandle(self.alloc_handle());
        state.nics.insert(
            nic,
            NicState {
                cdm,
                completions: VecDeque::new(),
            },
        );
        self.stats.nic_created.fetch_add(1, Ordering::AcqRel);
        Ok(nic)
    }

    fn destroy_nic(&self, nic: NicHandle) {
        let mut state = self.state.lock();
        state.nics.remove(&nic);
        state.bindings.retain(|_, b| b.nic != nic);
    }

    fn bind_endpoint(&self, nic: NicHandle, name: &EpName) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let cdm = state
            .nics
            .get(&nic)
            .map(|n| n.cdm)
            .ok_or(DriverError::UnknownHandle(nic.0))?;
        if state.bindings.contains_key(&name.gnix_addr) {
            return Err(DriverError::InvalidParam(format!(
                "address {} in use",
                name.gnix_addr
            )));
        }
        state.bindings.insert(
            name.gnix_addr,
            Binding {
                nic,
                cdm,
                cookie: name.cookie,
            },
        );
        Ok(())
    }

    fn unbind_endpoint(&self, addr: GniAddress) {
        self.state.lock().bindings.remove(&addr);
    }

    fn post_datagram(&self, cdm: CdmHandle, req: &DatagramRequest) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if !state.cdms.contains_key(&cdm) {
            return Err(DriverError::UnknownHandle(cdm.0));
        }
        self.stats.handshakes.fetch_add(1, Ordering::AcqRel);

        if state.unreachable.contains(&req.peer) {
            return Ok(());
        }

        let outcome = match state.bindings.get(&req.peer) {
            _ if state.refused.contains(&req.peer) => Err(DriverError::Transaction(format!(
                "handshake refused by {}",
                req.peer
            ))),
            None => Err(DriverError::Transaction(format!(
                "no endpoint at {}",
                req.peer
            ))),
            Some(b) if b.cookie != req.local.cookie => Err(DriverError::Permission),
            Some(b) => Ok(b.cdm),
        };

        let event = match outcome {
            Ok(peer_cdm) => {
                if let Some(peer_state) = state.cdms.get_mut(&peer_cdm) {
                    if let Some(wc) = peer_state.wildcards.pop_front() {
                        peer_state.events.push(DatagramEvent::Accepted {
                            id: wc,
                            peer: req.local.gnix_addr,
                        });
                    }
                }
                let peer_mbox = ((req.peer.device_addr as u64) << 32) | req.peer.cdm_id as u64;
                DatagramEvent::Connected {
                    id: req.id,
                    peer_mbox,
                }
            }
            Err(error) => DatagramEvent::Failed { id: req.id, error },
        };

        if let Some(entry) = state.cdms.get_mut(&cdm) {
            entry.events.push(event);
        }
        Ok(())
    }

    fn post_wildcard(&self, cdm: CdmHandle, id: DatagramId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let entry = state
            .cdms
            .get_mut(&cdm)
            .ok_or(DriverError::UnknownHandle(cdm.0))?;
        entry.wildcards.push_back(id);
        Ok(())
    }

    fn cancel_datagram(&self, cdm: CdmHandle, id: DatagramId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.cdms.get_mut(&cdm) {
            entry.wildcards.retain(|w| *w != id);
            entry.events.retain(|ev| match ev {
                DatagramEvent::Connected { id: x, .. }
                | DatagramEvent::Failed { id: x, .. }
                | DatagramEvent::Accepted { id: x, .. } => *x != id,
            });
        }
    }

    fn probe_datagrams(&self, cdm: CdmHandle, events: &mut Vec<DatagramEvent>) {
        let mut state = self.state.lock();
        if let Some(entry) = state.cdms.get_mut(&cdm) {
            events.append(&mut entry.events);
        }
    }

    fn create_ep(
        &self,
        nic: NicHandle,
        local: GniAddress,
        peer: GniAddress,
        _peer_mbox: u64,
    ) -> Result<EpHandle, DriverError> {
        let mut state = self.state.lock();
        if !state.nics.contains_key(&nic) {
            return Err(DriverError::UnknownHandle(nic.0));
        }
        let ep = EpHandle(self.alloc_handle());
        state.eps.insert(ep, EpState { nic, local, peer });
        Ok(ep)
    }

    fn destroy_ep(&self, ep: EpHandle) {
        self.state.lock().eps.remove(&ep);
    }

    fn post_operation(
        &self,
        nic: NicHandle,
        op: &OpDescriptor,
    ) -> Result<PostOutcome, DriverError> {
        self.stats.posts.fetch_add(1, Ordering::AcqRel);
        if self.take_stall() {
            self.stats.backpressured.fetch_add(1, Ordering::AcqRel);
            return Ok(PostOutcome::Backpressure);
        }
        if op.len as u64 > self.max_transfer.load(Ordering::Acquire) {
            return Err(DriverError::InvalidParam(format!(
                "chunk of {} bytes exceeds the device limit",
                op.len
            )));
        }

        let mut state = self.state.lock();
        let (local, peer) = match state.eps.get(&op.ep) {
            Some(ep) if ep.nic == nic => (ep.local, ep.peer),
            _ => return Err(DriverError::UnknownHandle(op.ep.0)),
        };
        let peer_nic = state.bindings.get(&peer).map(|b| b.nic);

        let status = match (op.kind, peer_nic) {
            (_, None) => Err(DriverError::Transaction(format!("{} went away", peer))),
            (OpKind::Msg | OpKind::Tagged, Some(peer_nic)) => {
                let mut payload = vec![0u8; op.len];
                // SAFETY: the descriptor covers a live submitter buffer.
                unsafe { copy_bytes(op.local_addr, payload.as_mut_ptr() as usize, op.len) };
                let chunk = IncomingChunk {
                    dst: peer,
                    src: local,
                    tagged: op.kind == OpKind::Tagged,
                    tag: op.tag,
                    imm: op.imm,
                    msg_seq: op.msg_seq,
                    offset: op.offset,
                    total_len: op.total_len,
                    payload,
                };
                if let Some(n) = state.nics.get_mut(&peer_nic) {
                    n.completions.push_back(HwCompletion::Incoming(chunk));
                }
                Ok(())
            }
            (OpKind::RdmaWrite, Some(peer_nic)) => {
                // SAFETY: the remote range is a registered peer buffer.
                unsafe { copy_bytes(op.local_addr, op.remote_addr as usize, op.len) };
                if let (Some(imm), true) = (op.imm, op.is_last_chunk()) {
                    if let Some(n) = state.nics.get_mut(&peer_nic) {
                        n.completions.push_back(HwCompletion::RemoteWrite {
                            dst: peer,
                            src: local,
                            imm,
                            len: op.total_len,
                        });
                    }
                }
                Ok(())
            }
            (OpKind::RdmaRead, Some(_)) => {
                // SAFETY: see above.
                unsafe { copy_bytes(op.remote_addr as usize, op.local_addr, op.len) };
                Ok(())
            }
        };

        let own = state
            .nics
            .get_mut(&nic)
            .ok_or(DriverError::UnknownHandle(nic.0))?;
        own.completions.push_back(HwCompletion::Tx {
            op_id: op.op_id,
            status,
        });
        Ok(PostOutcome::Posted)
    }

    fn reap_completions(&self, nic: NicHandle, out: &mut Vec<HwCompletion>) {
        let mut state = self.state.lock();
        if let Some(n) = state.nics.get_mut(&nic) {
            out.extend(n.completions.drain(..));
        }
    }

    fn max_transfer_size(&self) -> u64 {
        self.max_transfer.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREDS: Credentials = Credentials {
        ptag: 3,
        cookie: 0xbeef,
    };

    fn bound_endpoint(drv: &LoopbackDriver, cdm_id: u32) -> (CdmHandle, NicHandle, EpName) {
        let cdm = drv.create_cdm(cdm_id, CREDS).unwrap();
        let dev = drv.attach_cdm(cdm, 0).unwrap();
        let nic = drv.create_nic(cdm).unwrap();
        let name = EpName {
            gnix_addr: GniAddress::new(dev, cdm_id),
            name_type: 0,
            cookie: CREDS.cookie,
        };
        drv.bind_endpoint(nic, &name).unwrap();
        (cdm, nic, name)
    }

    #[test]
    fn handshake_consumes_peer_wildcard() {
        let drv = LoopbackDriver::new();
        let (a_cdm, _, a) = bound_endpoint(&drv, 1);
        let (b_cdm, _, b) = bound_endpoint(&drv, 2);
        drv.post_wildcard(b_cdm, DatagramId(9)).unwrap();

        let req = DatagramRequest {
            id: DatagramId(0),
            local: a,
            peer: b.gnix_addr,
        };
        drv.post_datagram(a_cdm, &req).unwrap();

        let mut events = Vec::new();
        drv.probe_datagrams(a_cdm, &mut events);
        assert!(matches!(
            &events[..],
            [DatagramEvent::Connected {
                id: DatagramId(0),
                ..
            }]
        ));
        events.clear();
        drv.probe_datagrams(b_cdm, &mut events);
        assert!(matches!(
            &events[..],
            [DatagramEvent::Accepted { id: DatagramId(9), peer }] if *peer == a.gnix_addr
        ));
    }

    #[test]
    fn stalled_posts_count_down() {
        let drv = LoopbackDriver::new();
        drv.stall_posts(2);
        assert!(drv.take_stall());
        assert!(drv.take_stall());
        assert!(!drv.take_stall());
        drv.stall_forever();
        assert!(drv.take_stall());
        drv.release();
        assert!(!drv.take_stall());
    }

    #[test]
    fn attach_can_be_denied() {
        let drv = LoopbackDriver::new();
        drv.deny_attach(true);
        let cdm = drv.create_cdm(0, CREDS).unwrap();
        assert_eq!(drv.attach_cdm(cdm, 0), Err(DriverError::Permission));
        drv.destroy_cdm(cdm).unwrap();
        assert_eq!(drv.live_cdms(), 0);
    }
}
