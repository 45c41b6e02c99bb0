use std::sync::Arc;

use fabric_api::attr::{AvAttr, AvType};
use fabric_api::{EpName, FiAddr, GniAddress};
use fabric_common::log;
use fabric_common::resource::RefCount;

use crate::domain::{Domain, DomainShared};
use crate::{Error, Result};

/// Turns the address an operation names into the peer it goes to.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, addr: FiAddr) -> Result<GniAddress>;
}

pub(crate) struct AvShared {
    domain: Arc<DomainShared>,
    av_type: AvType,
    table: spin::RwLock<Vec<Option<EpName>>>,
    pub(crate) refs: RefCount,
}

#[inline]
fn encode(addr: GniAddress) -> FiAddr {
    FiAddr(((addr.device_addr as u64) << 32) | addr.cdm_id as u64)
}

#[inline]
fn decode(addr: FiAddr) -> GniAddress {
    GniAddress::new((addr.0 >> 32) as u32, addr.0 as u32)
}

impl AvShared {
    fn lookup(&self, addr: FiAddr) -> Result<EpName> {
        if addr.is_unspec() {
            return Err(Error::inval("unspecified address"));
        }
        let table = self.table.read();
        match self.av_type {
            AvType::Table => table
                .get(addr.0 as usize)
                .copied()
                .flatten()
                .ok_or(Error::NotFound),
            AvType::Map => {
                let target = decode(addr);
                table
                    .iter()
                    .flatten()
                    .find(|name| name.gnix_addr == target)
                    .copied()
                    .ok_or(Error::NotFound)
            }
        }
    }
}

impl AvShared {
    /// Drops an endpoint's reference, finishing a close left pending by a
    /// dropped `AddressVector`.
    pub(crate) fn release(&self) {
        if self.refs.release() {
            self.domain.release();
        }
    }
}

impl AddressResolver for AvShared {
    fn resolve(&self, addr: FiAddr) -> Result<GniAddress> {
        self.lookup(addr).map(|name| name.gnix_addr)
    }
}

/// Maps the addresses operations name onto endpoint names.
pub struct AddressVector {
    pub(crate) shared: Arc<AvShared>,
}

impl AddressVector {
    pub fn open(domain: &Domain, attr: &AvAttr) -> Result<Self> {
        domain.shared.refs.open()?;
        Ok(AddressVector {
            shared: Arc::new(AvShared {
                domain: Arc::clone(&domain.shared),
                av_type: attr.av_type,
                table: spin::RwLock::new(Vec::with_capacity(attr.count)),
                refs: RefCount::new(),
            }),
        })
    }

    pub fn insert(&self, names: &[EpName]) -> Vec<FiAddr> {
        let mut table = self.shared.table.write();
        names
            .iter()
            .map(|name| {
                table.push(Some(*name));
                match self.shared.av_type {
                    AvType::Table => FiAddr((table.len() - 1) as u64),
                    AvType::Map => encode(name.gnix_addr),
                }
            })
            .collect()
    }

    pub fn remove(&self, addr: FiAddr) -> Result<()> {
        let mut table = self.shared.table.write();
        let slot = match self.shared.av_type {
            AvType::Table => table.get_mut(addr.0 as usize),
            AvType::Map => {
                let target = decode(addr);
                table
                    .iter_mut()
                    .find(|s| s.map_or(false, |name| name.gnix_addr == target))
            }
        };
        match slot {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }

    pub fn lookup(&self, addr: FiAddr) -> Result<EpName> {
        self.shared.lookup(addr)
    }

    /// Fails with resource-busy while an endpoint is bound to it.
    pub fn close(&self) -> Result<()> {
        self.shared.refs.try_close()?;
        self.shared.domain.release();
        Ok(())
    }
}

impl Drop for AddressVector {
    fn drop(&mut self) {
        match self.shared.refs.close_when_released() {
            Ok(true) => self.shared.domain.release(),
            Ok(false) => log::debug!("address vector dropped while bound"),
            Err(_) => {}
        }
    }
}
