use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fabric_api::attr::DomainAttr;
use fabric_common::log;
use fabric_common::logging::init_log;
use fabric_common::resource::RefCount;

use crate::cm_nic::{CmNic, CmNicKey, CmNicRegistry};
use crate::config::GniConfig;
use crate::credential::CredentialSource;
use crate::domain::{Domain, DomainShared};
use crate::driver::Driver;
use crate::{Error, Result};

pub(crate) struct FabricShared {
    pub(crate) config: GniConfig,
    pub(crate) driver: Arc<dyn Driver>,
    credentials: Arc<dyn CredentialSource>,
    registry: Arc<CmNicRegistry>,
    domains: spin::Mutex<Vec<(u64, Weak<DomainShared>)>>,
    next_domain_id: AtomicU64,
    refs: RefCount,
}

impl FabricShared {
    pub(crate) fn remove_domain(&self, id: u64) {
        self.domains.lock().retain(|(d, _)| *d != id);
        self.refs.release();
    }
}

/// The top-level object. Domains opened through it share one CM NIC per
/// credential pair, looked up in the registry the fabric holds.
pub struct Fabric {
    shared: Arc<FabricShared>,
}

impl Fabric {
    pub fn open(
        config: GniConfig,
        driver: Arc<dyn Driver>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        Self::open_with_registry(config, driver, credentials, Arc::new(CmNicRegistry::new()))
    }

    /// Opens a fabric sharing `registry` with other fabrics of the process.
    pub fn open_with_registry(
        config: GniConfig,
        driver: Arc<dyn Driver>,
        credentials: Arc<dyn CredentialSource>,
        registry: Arc<CmNicRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        init_log(&config.log);
        log::debug!("opening fabric: {:?}", config);
        Ok(Fabric {
            shared: Arc::new(FabricShared {
                config,
                driver,
                credentials,
                registry,
                domains: spin::Mutex::new(Vec::new()),
                next_domain_id: AtomicU64::new(0),
                refs: RefCount::new(),
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &GniConfig {
        &self.shared.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<CmNicRegistry> {
        &self.shared.registry
    }

    /// Domains opened and not yet closed, in opening order.
    pub fn num_domains(&self) -> usize {
        self.shared.domains.lock().len()
    }

    pub fn open_domain(&self, attr: &DomainAttr, context: u64) -> Result<Domain> {
        let shared = &self.shared;
        match attr.name.as_deref() {
            Some(name) if name == shared.config.domain_name => {}
            Some(name) => return Err(Error::inval(format!("unknown domain name {:?}", name))),
            None => return Err(Error::inval("domain name missing")),
        }
        let creds = shared.credentials.resolve(attr.dest_addr.as_ref())?;

        shared.refs.open()?;
        let key = CmNicKey::for_current_process(creds);
        let lookup = shared.registry.get_or_create_with(key, || {
            CmNic::create(
                Arc::clone(&shared.driver),
                key,
                shared.config.n_bnd_dgrams,
                shared.config.n_wc_dgrams,
                shared.config.datagram_timeout(),
            )
        });
        let (cm_nic, created) = match lookup {
            Ok(found) => found,
            Err(e) => {
                shared.refs.release();
                return Err(e);
            }
        };
        if !created {
            log::debug!("domain reuses CM NIC for {}", creds);
        }

        let id = shared.next_domain_id.fetch_add(1, Ordering::AcqRel);
        let domain = Arc::new(DomainShared::new(
            id,
            Arc::clone(shared),
            creds,
            cm_nic,
            context,
        ));
        shared.domains.lock().push((id, Arc::downgrade(&domain)));
        log::info!("domain {} opened, {}", id, creds);
        Ok(Domain { shared: domain })
    }

    /// Fails with resource-busy while any domain is open.
    pub fn close(&self) -> Result<()> {
        self.shared.refs.try_close()?;
        log::info!("fabric closed");
        Ok(())
    }
}
