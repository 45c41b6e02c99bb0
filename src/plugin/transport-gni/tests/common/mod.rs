#![allow(dead_code)]
use std::sync::Arc;
use std::time::{Duration, Instant};

use fabric_api::attr::{AvAttr, CqAttr, CqFormat, DomainAttr, EpAttr, EpType};
use fabric_api::cq::{CqEntry, CqErrEntry};
use fabric_api::flags::BindFlags;
use fabric_api::{Credentials, FiAddr};
use transport_gni::credential::StaticCredentials;
use transport_gni::driver::{Driver, LoopbackDriver};
use transport_gni::{AddressVector, CompletionQueue, Counter, Domain, Endpoint, Error, Fabric, GniConfig};

pub const CREDS: Credentials = Credentials {
    ptag: 7,
    cookie: 0x5a5a,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn open_fabric(config: GniConfig, driver: &Arc<LoopbackDriver>) -> Fabric {
    let driver: Arc<dyn Driver> = Arc::clone(driver) as Arc<dyn Driver>;
    Fabric::open(config, driver, Arc::new(StaticCredentials(CREDS))).unwrap()
}

pub fn open_domain(fabric: &Fabric) -> Domain {
    fabric.open_domain(&DomainAttr::default(), 0).unwrap()
}

pub fn open_cq(domain: &Domain, format: CqFormat) -> CompletionQueue {
    let attr = CqAttr {
        format,
        ..Default::default()
    };
    CompletionQueue::open(domain, &attr, 0).unwrap()
}

/// Two reliable-datagram endpoints on one domain, each with its own
/// completion queue, sharing an address vector. Fields drop in order, so
/// the endpoints release their bindings first.
pub struct Pair {
    pub tx: Endpoint,
    pub rx: Endpoint,
    pub tx_cq: CompletionQueue,
    pub rx_cq: CompletionQueue,
    pub av: AddressVector,
    /// Address of `rx` as seen from `tx`, and the other way around.
    pub to_rx: FiAddr,
    pub to_tx: FiAddr,
}

pub fn rdm_pair(domain: &Domain, format: CqFormat) -> Pair {
    build_pair(domain, format, None)
}

/// Like [`rdm_pair`], with `send_cntr` counting the transmits of `tx`.
pub fn counted_pair(domain: &Domain, format: CqFormat, send_cntr: &Counter) -> Pair {
    build_pair(domain, format, Some(send_cntr))
}

fn build_pair(domain: &Domain, format: CqFormat, send_cntr: Option<&Counter>) -> Pair {
    let av = AddressVector::open(domain, &AvAttr::default()).unwrap();
    let tx_cq = open_cq(domain, format);
    let rx_cq = open_cq(domain, format);
    let attr = EpAttr {
        ep_type: EpType::Rdm,
    };
    let tx = Endpoint::open(domain, &attr, 1).unwrap();
    let rx = Endpoint::open(domain, &attr, 2).unwrap();
    let addrs = av.insert(&[rx.name(), tx.name()]);
    if let Some(cntr) = send_cntr {
        tx.bind_cntr(cntr, BindFlags::SEND).unwrap();
    }

    for (ep, cq) in [(&tx, &tx_cq), (&rx, &rx_cq)] {
        ep.bind_av(&av).unwrap();
        ep.bind_cq(cq, BindFlags::TRANSMIT | BindFlags::RECV).unwrap();
        ep.enable().unwrap();
    }
    Pair {
        tx,
        rx,
        tx_cq,
        rx_cq,
        av,
        to_rx: addrs[0],
        to_tx: addrs[1],
    }
}

/// Reads one entry, driving progress until it shows up.
pub fn next_entry(cq: &CompletionQueue) -> Result<CqEntry, Error> {
    cq.sread(1, WAIT).map(|mut entries| entries.remove(0))
}

/// Drives progress until an error entry shows up and returns it.
pub fn next_error(cq: &CompletionQueue) -> CqErrEntry {
    let deadline = Instant::now() + WAIT;
    loop {
        match cq.read_error() {
            Ok(entry) => return entry,
            Err(Error::Again) if Instant::now() < deadline => std::thread::yield_now(),
            Err(e) => panic!("no error entry: {}", e),
        }
    }
}

/// Calls `progress` on `ep` until `done` holds.
pub fn drive_until(ep: &Endpoint, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached");
        ep.progress();
    }
}
