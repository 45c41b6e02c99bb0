use std::sync::Arc;

use fabric_api::Credentials;
use fabric_common::log;
use fabric_common::resource::RefCount;

use crate::cm_nic::{CmNic, CDM_ID_BLOCK};
use crate::config::GniConfig;
use crate::driver::Driver;
use crate::fabric::FabricShared;
use crate::nic::Nic;
use crate::{Error, Result};

#[derive(Default)]
struct NicSet {
    nics: Vec<Arc<Nic>>,
    next: usize,
}

struct IdSeed {
    next: u32,
    end: u32,
}

pub(crate) struct DomainShared {
    id: u64,
    fabric: Arc<FabricShared>,
    credentials: Credentials,
    context: u64,
    cm_nic: spin::Mutex<Option<Arc<CmNic>>>,
    nics: spin::Mutex<NicSet>,
    cdm_id_seed: spin::Mutex<IdSeed>,
    /// Held by every counter, completion queue, address vector and endpoint
    /// opened on the domain.
    pub(crate) refs: RefCount,
}

impl DomainShared {
    pub(crate) fn new(
        id: u64,
        fabric: Arc<FabricShared>,
        credentials: Credentials,
        cm_nic: Arc<CmNic>,
        context: u64,
    ) -> Self {
        let base = cm_nic.reserve_id_block();
        DomainShared {
            id,
            fabric,
            credentials,
            context,
            cm_nic: spin::Mutex::new(Some(cm_nic)),
            nics: spin::Mutex::new(NicSet::default()),
            cdm_id_seed: spin::Mutex::new(IdSeed {
                next: base,
                end: base.wrapping_add(CDM_ID_BLOCK),
            }),
            refs: RefCount::new(),
        }
    }

    #[inline]
    pub(crate) fn config(&self) -> &GniConfig {
        &self.fabric.config
    }

    #[inline]
    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.fabric.driver
    }

    #[inline]
    pub(crate) fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub(crate) fn cm_nic(&self) -> Result<Arc<CmNic>> {
        self.cm_nic
            .lock()
            .clone()
            .ok_or_else(|| Error::inval("domain has been closed"))
    }

    /// Hands out a NIC for a new endpoint: a fresh one until the domain has
    /// `max_nics_per_domain`, then the existing ones in turn.
    pub(crate) fn attach_nic(&self) -> Result<Arc<Nic>> {
        let mut set = self.nics.lock();
        if set.nics.len() < self.config().max_nics_per_domain {
            let nic = Arc::new(Nic::create(
                self.cm_nic()?,
                Arc::clone(self.driver()),
                self.config().tx_cq_size,
            )?);
            set.nics.push(Arc::clone(&nic));
            return Ok(nic);
        }
        let idx = set.next % set.nics.len();
        set.next = (idx + 1) % set.nics.len();
        Ok(Arc::clone(&set.nics[idx]))
    }

    /// Drops a reference taken by an object opened on the domain. Finishes a
    /// close left pending by a dropped `Domain`.
    pub(crate) fn release(&self) {
        if self.refs.release() {
            self.finish_close();
        }
    }

    /// Releases the NICs and the CM NIC share, and leaves the fabric.
    fn finish_close(&self) {
        let nics = std::mem::take(&mut self.nics.lock().nics);
        drop(nics);
        // The CM NIC goes down with its last domain.
        let cm_nic = self.cm_nic.lock().take();
        drop(cm_nic);
        self.fabric.remove_domain(self.id);
        log::info!("domain {} closed", self.id);
    }

    /// Next endpoint id. Ids come in blocks from the CM NIC so that domains
    /// sharing it never hand out the same one.
    pub(crate) fn next_conn_id(&self) -> Result<u32> {
        let mut seed = self.cdm_id_seed.lock();
        if seed.next == seed.end {
            let base = self.cm_nic()?.reserve_id_block();
            seed.next = base;
            seed.end = base.wrapping_add(CDM_ID_BLOCK);
        }
        let id = seed.next;
        seed.next += 1;
        Ok(id)
    }
}

/// A protection domain: the credentials every endpoint opened on it uses,
/// its share of the CM NIC, and the NICs its endpoints run on.
pub struct Domain {
    pub(crate) shared: Arc<DomainShared>,
}

impl Domain {
    #[inline]
    pub fn credentials(&self) -> Credentials {
        self.shared.credentials
    }

    #[inline]
    pub fn context(&self) -> u64 {
        self.shared.context
    }

    /// Objects currently holding a reference to the domain.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.shared.refs.get()
    }

    pub fn cm_nic(&self) -> Result<Arc<CmNic>> {
        self.shared.cm_nic()
    }

    pub fn nic_count(&self) -> usize {
        self.shared.nics.lock().nics.len()
    }

    /// Fails with resource-busy while anything references the domain, and
    /// leaves it untouched in that case.
    pub fn close(&self) -> Result<()> {
        self.shared.refs.try_close()?;
        self.shared.finish_close();
        Ok(())
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        match self.shared.refs.close_when_released() {
            Ok(true) => self.shared.finish_close(),
            Ok(false) => log::debug!(
                "domain {} dropped, closes with its last object",
                self.shared.id
            ),
            Err(_) => {}
        }
    }
}
