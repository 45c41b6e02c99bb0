//! The connection-management endpoint: one per (ptag, cookie, process),
//! shared by every domain opened with those credentials. It owns the
//! hardware communication domain handle and the datagrams used for the
//! connection handshake.
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use fabric_api::{Credentials, EpName, GniAddress};
use fabric_common::log;
use fabric_common::state_mgr::SharedStateManager;

use crate::driver::{CdmHandle, DatagramEvent, DatagramId, DatagramRequest, Driver};
use crate::vc::Vc;
use crate::{Error, Result};

/// Process-scoped CM NIC registry.
pub type CmNicRegistry = SharedStateManager<CmNicKey, CmNic>;

/// Endpoint ids each domain reserves from its CM NIC at once.
pub(crate) const CDM_ID_BLOCK: u32 = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmNicKey {
    pub ptag: u8,
    pub cookie: u32,
    pub inst_id: i32,
}

impl CmNicKey {
    pub fn for_current_process(creds: Credentials) -> Self {
        CmNicKey {
            ptag: creds.ptag,
            cookie: creds.cookie,
            inst_id: nix::unistd::getpid().as_raw(),
        }
    }

    #[inline]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            ptag: self.ptag,
            cookie: self.cookie,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DgramKind {
    Bound,
    Wildcard,
}

#[derive(Debug)]
struct Datagram {
    kind: DgramKind,
    active: bool,
    vc: Weak<Vc>,
    posted_at: Option<Instant>,
}

/// Arena of datagram slots. The free lists and the active list hold slot
/// indices; a slot is on exactly one of them.
#[derive(Debug, Default)]
struct DatagramPool {
    slots: Vec<Datagram>,
    bnd_free: Vec<usize>,
    wc_free: Vec<usize>,
    active: Vec<usize>,
}

impl DatagramPool {
    fn new(n_bnd: usize, n_wc: usize) -> Self {
        let mut pool = DatagramPool::default();
        for i in 0..n_bnd + n_wc {
            let kind = if i < n_bnd {
                DgramKind::Bound
            } else {
                DgramKind::Wildcard
            };
            pool.slots.push(Datagram {
                kind,
                active: false,
                vc: Weak::new(),
                posted_at: None,
            });
        }
        // Popped from the back, so reverse to hand out low indices first.
        pool.bnd_free = (0..n_bnd).rev().collect();
        pool.wc_free = (n_bnd..n_bnd + n_wc).rev().collect();
        pool
    }

    fn alloc(&mut self, kind: DgramKind, vc: Weak<Vc>) -> Option<usize> {
        let idx = match kind {
            DgramKind::Bound => self.bnd_free.pop()?,
            DgramKind::Wildcard => self.wc_free.pop()?,
        };
        let slot = &mut self.slots[idx];
        slot.active = true;
        slot.vc = vc;
        slot.posted_at = Some(Instant::now());
        self.active.push(idx);
        Some(idx)
    }

    /// Returns an active slot to its free list, handing back its owner.
    fn release(&mut self, idx: usize) -> Option<Weak<Vc>> {
        let slot = self.slots.get_mut(idx)?;
        if !slot.active {
            return None;
        }
        slot.active = false;
        slot.posted_at = None;
        let owner = std::mem::take(&mut slot.vc);
        match slot.kind {
            DgramKind::Bound => self.bnd_free.push(idx),
            DgramKind::Wildcard => self.wc_free.push(idx),
        }
        if let Some(pos) = self.active.iter().position(|&i| i == idx) {
            self.active.swap_remove(pos);
        }
        Some(owner)
    }

    fn kind(&self, idx: usize) -> Option<DgramKind> {
        self.slots.get(idx).filter(|s| s.active).map(|s| s.kind)
    }

    fn expired(&self, timeout: Duration, now: Instant) -> Vec<usize> {
        self.active
            .iter()
            .copied()
            .filter(|&i| {
                let slot = &self.slots[i];
                slot.kind == DgramKind::Bound
                    && slot
                        .posted_at
                        .map_or(false, |t| now.saturating_duration_since(t) >= timeout)
            })
            .collect()
    }
}

/// Outcome of a handshake, to be applied to the connection that started it.
pub(crate) struct HandshakeEvent {
    pub(crate) vc: Weak<Vc>,
    pub(crate) result: Result<u64>,
}

pub struct CmNic {
    key: CmNicKey,
    driver: Arc<dyn Driver>,
    cdm: CdmHandle,
    device_addr: u32,
    timeout: Duration,
    pool: spin::Mutex<DatagramPool>,
    next_id_block: AtomicU32,
    accepted: AtomicUsize,
}

impl std::fmt::Debug for CmNic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmNic")
            .field("key", &self.key)
            .field("cdm", &self.cdm)
            .field("device_addr", &self.device_addr)
            .finish()
    }
}

impl CmNic {
    /// Creates the hardware handle, attaches it to the local device and
    /// posts the wildcard datagrams. Create and attach failures are not
    /// retried.
    pub(crate) fn create(
        driver: Arc<dyn Driver>,
        key: CmNicKey,
        n_bnd_dgrams: usize,
        n_wc_dgrams: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let cdm = driver
            .create_cdm(key.inst_id as u32, key.credentials())
            .map_err(Error::PermissionDenied)?;
        let device_addr = match driver.attach_cdm(cdm, 0) {
            Ok(addr) => addr,
            Err(e) => {
                if let Err(e) = driver.destroy_cdm(cdm) {
                    log::warn!("destroying cdm {:?} after failed attach: {}", cdm, e);
                }
                return Err(Error::PermissionDenied(e));
            }
        };

        let cm_nic = CmNic {
            key,
            driver,
            cdm,
            device_addr,
            timeout,
            pool: spin::Mutex::new(DatagramPool::new(n_bnd_dgrams, n_wc_dgrams)),
            // Id 0 belongs to the CM NIC itself.
            next_id_block: AtomicU32::new(1),
            accepted: AtomicUsize::new(0),
        };
        cm_nic.post_wildcards()?;
        log::info!(
            "CM NIC up: ptag {} cookie {:#x} device {:#x}",
            key.ptag,
            key.cookie,
            device_addr
        );
        Ok(cm_nic)
    }

    fn post_wildcards(&self) -> Result<()> {
        let mut pool = self.pool.lock();
        while let Some(idx) = pool.alloc(DgramKind::Wildcard, Weak::new()) {
            if let Err(e) = self.driver.post_wildcard(self.cdm, DatagramId(idx as u64)) {
                pool.release(idx);
                return Err(Error::Driver(e));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn key(&self) -> CmNicKey {
        self.key
    }

    #[inline]
    pub fn device_addr(&self) -> u32 {
        self.device_addr
    }

    #[inline]
    pub(crate) fn cdm(&self) -> CdmHandle {
        self.cdm
    }

    /// Free (bound, wildcard) datagram slots.
    pub fn free_datagrams(&self) -> (usize, usize) {
        let pool = self.pool.lock();
        (pool.bnd_free.len(), pool.wc_free.len())
    }

    /// Handshakes initiated by peers and accepted so far.
    pub fn accepted_handshakes(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }

    /// Reserves a block of endpoint ids for a domain.
    pub(crate) fn reserve_id_block(&self) -> u32 {
        let block = self.next_id_block.fetch_add(1, Ordering::AcqRel);
        block.wrapping_mul(CDM_ID_BLOCK)
    }

    /// Posts the handshake datagram of `vc`. Returns `None` when every bound
    /// datagram is in use; the caller tries again on a later progress call.
    pub(crate) fn connect(
        &self,
        vc: &Arc<Vc>,
        local: EpName,
        peer: GniAddress,
    ) -> Result<Option<DatagramId>> {
        let mut pool = self.pool.lock();
        let idx = match pool.alloc(DgramKind::Bound, Arc::downgrade(vc)) {
            Some(idx) => idx,
            None => {
                log::debug!("no free bound datagram for {}", peer);
                return Ok(None);
            }
        };
        let id = DatagramId(idx as u64);
        let req = DatagramRequest { id, local, peer };
        if let Err(e) = self.driver.post_datagram(self.cdm, &req) {
            pool.release(idx);
            return Err(Error::ConnectionFailed(e.to_string()));
        }
        Ok(Some(id))
    }

    /// Withdraws a handshake whose connection went away.
    pub(crate) fn cancel(&self, id: DatagramId) {
        self.driver.cancel_datagram(self.cdm, id);
        self.pool.lock().release(id.0 as usize);
    }

    /// Collects finished and expired handshakes. The events are applied by
    /// the caller after the pool lock is released.
    pub(crate) fn progress(&self) -> Vec<HandshakeEvent> {
        let mut events = Vec::new();
        self.driver.probe_datagrams(self.cdm, &mut events);

        let mut out = Vec::new();
        let mut pool = self.pool.lock();
        for event in events {
            match event {
                DatagramEvent::Connected { id, peer_mbox } => {
                    if let Some(vc) = pool.release(id.0 as usize) {
                        out.push(HandshakeEvent {
                            vc,
                            result: Ok(peer_mbox),
                        });
                    }
                }
                DatagramEvent::Failed { id, error } => {
                    if let Some(vc) = pool.release(id.0 as usize) {
                        out.push(HandshakeEvent {
                            vc,
                            result: Err(Error::ConnectionFailed(error.to_string())),
                        });
                    }
                }
                DatagramEvent::Accepted { id, peer } => {
                    let idx = id.0 as usize;
                    if pool.kind(idx) != Some(DgramKind::Wildcard) {
                        log::warn!("accept on unknown wildcard datagram {:?}", id);
                        continue;
                    }
                    self.accepted.fetch_add(1, Ordering::AcqRel);
                    log::debug!("accepted handshake from {}", peer);
                    if let Err(e) = self.driver.post_wildcard(self.cdm, id) {
                        log::warn!("reposting wildcard datagram {:?}: {}", id, e);
                        pool.release(idx);
                    }
                }
            }
        }

        for idx in pool.expired(self.timeout, Instant::now()) {
            self.driver.cancel_datagram(self.cdm, DatagramId(idx as u64));
            if let Some(vc) = pool.release(idx) {
                out.push(HandshakeEvent {
                    vc,
                    result: Err(Error::ConnectionFailed("handshake timed out".into())),
                });
            }
        }
        out
    }
}

impl Drop for CmNic {
    fn drop(&mut self) {
        let active: Vec<usize> = self.pool.get_mut().active.clone();
        for idx in active {
            self.driver.cancel_datagram(self.cdm, DatagramId(idx as u64));
        }
        match self.driver.destroy_cdm(self.cdm) {
            Ok(()) => log::info!(
                "CM NIC down: ptag {} cookie {:#x}",
                self.key.ptag,
                self.key.cookie
            ),
            Err(e) => log::error!("destroying cdm {:?}: {}", self.cdm, e),
        }
    }
}
