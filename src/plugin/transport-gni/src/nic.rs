//! Network contexts and the poll lists counters and completion queues keep
//! of them.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fnv::FnvHashMap as HashMap;

use fabric_api::GniAddress;
use fabric_common::log;
use fabric_common::resource::ResourceTableGeneric;

use crate::cm_nic::CmNic;
use crate::driver::{Driver, HwCompletion, NicHandle};
use crate::ep::EpShared;
use crate::vc::Vc;
use crate::{Error, Result};

const REAP_BATCH: usize = 256;

struct PendingOp {
    vc: Weak<Vc>,
    req_id: u64,
}

/// A data-plane hardware context. Progressing a NIC drives the handshakes
/// of its CM NIC, the transmit queues of every endpoint attached to it, and
/// dispatches whatever the device completed.
pub struct Nic {
    handle: NicHandle,
    cm_nic: Arc<CmNic>,
    driver: Arc<dyn Driver>,
    endpoints: ResourceTableGeneric<GniAddress, EpShared>,
    pending: spin::Mutex<HashMap<u64, PendingOp>>,
    next_op_id: AtomicU64,
    // Held for the duration of a progress pass.
    reap_buf: spin::Mutex<Vec<HwCompletion>>,
}

impl std::fmt::Debug for Nic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nic")
            .field("handle", &self.handle)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

impl Nic {
    pub(crate) fn create(
        cm_nic: Arc<CmNic>,
        driver: Arc<dyn Driver>,
        cq_depth: usize,
    ) -> Result<Self> {
        let handle = driver.create_nic(cm_nic.cdm())?;
        log::debug!("nic {:?} created on {:?}", handle, cm_nic.cdm());
        Ok(Nic {
            handle,
            cm_nic,
            driver,
            endpoints: ResourceTableGeneric::default(),
            pending: spin::Mutex::new(HashMap::default()),
            next_op_id: AtomicU64::new(1),
            reap_buf: spin::Mutex::new(Vec::with_capacity(cq_depth.min(REAP_BATCH))),
        })
    }

    #[inline]
    pub(crate) fn handle(&self) -> NicHandle {
        self.handle
    }

    #[inline]
    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    #[inline]
    pub(crate) fn cm_nic(&self) -> &Arc<CmNic> {
        &self.cm_nic
    }

    pub(crate) fn attach_endpoint(&self, addr: GniAddress, ep: Arc<EpShared>) -> Result<()> {
        self.endpoints.insert(addr, ep)?;
        Ok(())
    }

    pub(crate) fn detach_endpoint(&self, addr: &GniAddress) {
        self.endpoints.remove(addr);
    }

    /// Allocates the id a posted chunk completes under.
    pub(crate) fn register_pending(&self, vc: Weak<Vc>, req_id: u64) -> u64 {
        let op_id = self.next_op_id.fetch_add(1, Ordering::AcqRel);
        self.pending.lock().insert(op_id, PendingOp { vc, req_id });
        op_id
    }

    pub(crate) fn forget_pending(&self, op_id: u64) {
        self.pending.lock().remove(&op_id);
    }

    /// Runs one progress pass. Returns a measure of the work done, zero when
    /// another thread is already progressing this NIC.
    pub fn progress(&self) -> usize {
        let Some(mut buf) = self.reap_buf.try_lock() else {
            return 0;
        };
        let mut work = 0;

        for event in self.cm_nic.progress() {
            work += 1;
            let Some(vc) = event.vc.upgrade() else {
                continue;
            };
            let failed = vc.on_handshake(event.result);
            if let Some(ep) = vc.ep() {
                ep.complete_all(failed);
            }
        }

        for ep in self.endpoints.snapshot() {
            work += ep.progress_tx();
        }

        self.driver.reap_completions(self.handle, &mut buf);
        work += buf.len();
        for completion in buf.drain(..) {
            self.dispatch(completion);
        }
        work
    }

    fn dispatch(&self, completion: HwCompletion) {
        match completion {
            HwCompletion::Tx { op_id, status } => {
                let Some(op) = self.pending.lock().remove(&op_id) else {
                    log::warn!("nic {:?}: completion for unknown op {}", self.handle, op_id);
                    return;
                };
                let Some(vc) = op.vc.upgrade() else {
                    log::debug!("dropping completion of op {}, connection gone", op_id);
                    return;
                };
                let mut done = Vec::new();
                vc.on_tx_complete(op.req_id, status, &mut done);
                if let Some(ep) = vc.ep() {
                    ep.complete_all(done);
                }
            }
            HwCompletion::Incoming(chunk) => match self.endpoints.get(&chunk.dst) {
                Ok(ep) => ep.on_incoming(chunk),
                Err(_) => log::warn!("message from {} for unknown {}", chunk.src, chunk.dst),
            },
            HwCompletion::RemoteWrite { dst, src, imm, len } => match self.endpoints.get(&dst) {
                Ok(ep) => ep.on_remote_write(src, imm, len),
                Err(_) => log::warn!("remote write from {} for unknown {}", src, dst),
            },
        }
    }
}

impl Drop for Nic {
    fn drop(&mut self) {
        self.driver.destroy_nic(self.handle);
        log::debug!("nic {:?} destroyed", self.handle);
    }
}

/// The NICs a counter or completion queue drives when it is read. Adding a
/// NIC twice takes a second reference instead of a second entry.
#[derive(Default)]
pub(crate) struct PollList {
    nics: ResourceTableGeneric<NicHandle, Nic>,
}

impl PollList {
    pub(crate) fn add(&self, nic: &Arc<Nic>) -> usize {
        self.nics.open_or_create_resource(nic.handle(), Arc::clone(nic))
    }

    pub(crate) fn remove(&self, nic: &Nic) -> Result<()> {
        match self.nics.close_resource(&nic.handle()) {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::inval("nic is not on the poll list")),
        }
    }

    pub(crate) fn refcnt(&self, nic: &Nic) -> usize {
        self.nics.refcnt(&nic.handle()).unwrap_or(0)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.nics.len()
    }

    /// Progresses every NIC on the list, outside the list's locks.
    pub(crate) fn progress(&self) -> usize {
        self.nics.snapshot().iter().map(|nic| nic.progress()).sum()
    }
}
