mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fabric_api::attr::{CntrAttr, CqAttr, CqFormat, DomainAttr, EpAttr, EpType, WaitObj};
use fabric_api::flags::BindFlags;
use transport_gni::driver::LoopbackDriver;
use transport_gni::{CntrControl, CompletionQueue, Counter, Domain, Endpoint, Error, GniConfig};

use common::{open_cq, open_domain, open_fabric};

#[test]
fn domains_with_one_credential_pair_share_a_cm_nic() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let d1 = open_domain(&fabric);
    let d2 = open_domain(&fabric);

    assert!(Arc::ptr_eq(&d1.cm_nic().unwrap(), &d2.cm_nic().unwrap()));
    assert_eq!(driver.stats().cdm_created, 1);
    assert_eq!(fabric.num_domains(), 2);
    assert_eq!(fabric.close(), Err(Error::Busy(2)));

    d1.close().unwrap();
    assert_eq!(driver.live_cdms(), 1);
    d2.close().unwrap();
    assert_eq!(driver.live_cdms(), 0);
    assert_eq!(fabric.num_domains(), 0);
    fabric.close().unwrap();
}

#[test]
fn concurrent_domain_opens_create_one_cm_nic() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);

    let domains: Vec<Domain> = crossbeam_utils::thread::scope(|s| {
        let openers: Vec<_> = (0..8).map(|_| s.spawn(|_| open_domain(&fabric))).collect();
        openers.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    assert_eq!(driver.stats().cdm_created, 1);
    assert_eq!(fabric.num_domains(), 8);
    let first = domains[0].cm_nic().unwrap();
    for domain in &domains {
        assert!(Arc::ptr_eq(&first, &domain.cm_nic().unwrap()));
    }
    drop(first);
    drop(domains);
    assert_eq!(driver.live_cdms(), 0);
}

#[test]
fn closed_endpoint_does_not_pin_the_cm_nic() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let ep = Endpoint::open(&domain, &EpAttr::default(), 0).unwrap();

    ep.close().unwrap();
    domain.close().unwrap();
    assert_eq!(driver.live_cdms(), 0);
    assert_eq!(ep.progress(), 0);

    // A new domain gets a fresh CM NIC instead of the closed one.
    let again = open_domain(&fabric);
    assert_eq!(driver.stats().cdm_created, 2);
    assert_eq!(driver.live_cdms(), 1);
    drop(ep);
    again.close().unwrap();
}

#[test]
fn dropped_objects_release_the_domain_with_their_endpoint() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let cntr = Counter::open(&domain, &CntrAttr::default(), 0).unwrap();
    let cq = open_cq(&domain, CqFormat::Context);
    let ep = Endpoint::open(
        &domain,
        &EpAttr {
            ep_type: EpType::Msg,
        },
        0,
    )
    .unwrap();
    ep.bind_cntr(&cntr, BindFlags::SEND).unwrap();
    ep.bind_cq(&cq, BindFlags::TRANSMIT).unwrap();

    drop(cntr);
    drop(cq);
    assert_eq!(domain.close(), Err(Error::Busy(3)));

    ep.close().unwrap();
    assert_eq!(domain.ref_count(), 0);
    drop(ep);
    domain.close().unwrap();
    assert_eq!(driver.live_cdms(), 0);
}

#[test]
fn dropped_domain_closes_with_its_last_object() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let cq = open_cq(&domain, CqFormat::Context);

    drop(domain);
    assert_eq!(fabric.num_domains(), 1);
    assert_eq!(driver.live_cdms(), 1);

    cq.close().unwrap();
    assert_eq!(fabric.num_domains(), 0);
    assert_eq!(driver.live_cdms(), 0);
    fabric.close().unwrap();
}

#[test]
fn domain_close_is_refused_while_objects_are_open() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let cq = open_cq(&domain, CqFormat::Context);
    let ep = Endpoint::open(&domain, &EpAttr::default(), 0).unwrap();

    assert_eq!(domain.ref_count(), 2);
    assert_eq!(domain.close(), Err(Error::Busy(2)));
    // A refused close leaves the domain usable.
    assert_eq!(domain.nic_count(), 1);
    ep.bind_cq(&cq, BindFlags::TRANSMIT).unwrap();

    ep.close().unwrap();
    assert_eq!(domain.ref_count(), 1);
    cq.close().unwrap();
    assert_eq!(domain.ref_count(), 0);
    domain.close().unwrap();
    fabric.close().unwrap();
}

#[test]
fn domain_name_must_match_the_provider() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    for name in [Some("verbs".to_owned()), None] {
        let attr = DomainAttr {
            name,
            dest_addr: None,
        };
        assert!(matches!(
            fabric.open_domain(&attr, 0),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert_eq!(fabric.num_domains(), 0);
    assert_eq!(driver.stats().cdm_created, 0);
}

#[test]
fn denied_cdm_is_permission_denied_and_not_cached() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);

    driver.deny_cdm_create(true);
    assert!(matches!(
        fabric.open_domain(&DomainAttr::default(), 0),
        Err(Error::PermissionDenied(_))
    ));
    driver.deny_attach(true);
    driver.deny_cdm_create(false);
    assert!(matches!(
        fabric.open_domain(&DomainAttr::default(), 0),
        Err(Error::PermissionDenied(_))
    ));
    // The half-built CM NIC was torn down.
    assert_eq!(driver.live_cdms(), 0);

    driver.deny_attach(false);
    let domain = open_domain(&fabric);
    assert_eq!(domain.cm_nic().unwrap().device_addr(), 0x1a2b);
    assert_eq!(fabric.num_domains(), 1);
}

#[test]
fn counters_take_no_wait_object() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);

    for wait_obj in [WaitObj::Fd, WaitObj::MutexCond, WaitObj::Set] {
        let attr = CntrAttr {
            wait_obj,
            ..Default::default()
        };
        assert!(matches!(
            Counter::open(&domain, &attr, 0),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert_eq!(domain.ref_count(), 0);

    let attr = CntrAttr {
        wait_obj: WaitObj::Unspec,
        flags: 0x10,
        ..Default::default()
    };
    let cntr = Counter::open(&domain, &attr, 9).unwrap();
    assert_eq!(cntr.context(), 9);
    assert_eq!(domain.ref_count(), 1);
    assert!(matches!(
        cntr.control(CntrControl::GetWait),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(cntr.control(CntrControl::GetOpsFlag), Ok(0x10));
    assert_eq!(cntr.control(CntrControl::SetOpsFlag(0x20)), Ok(0x20));
    assert_eq!(cntr.control(CntrControl::GetOpsFlag), Ok(0x20));
}

#[test]
fn cq_wait_objects() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);

    for wait_obj in [WaitObj::Fd, WaitObj::Set] {
        let attr = CqAttr {
            wait_obj,
            ..Default::default()
        };
        assert!(matches!(
            CompletionQueue::open(&domain, &attr, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    let attr = CqAttr {
        wait_obj: WaitObj::MutexCond,
        format: CqFormat::Unspec,
        size: 0,
    };
    let cq = CompletionQueue::open(&domain, &attr, 0).unwrap();
    assert_eq!(cq.format(), CqFormat::Context);
    assert_eq!(cq.capacity(), GniConfig::default().cq_size);
    assert_eq!(cq.read(4), Err(Error::Again));
    assert_eq!(cq.sread(4, Duration::from_millis(5)), Err(Error::Timeout));
}

#[test]
fn counter_is_busy_while_an_endpoint_holds_it() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let cntr = Counter::open(&domain, &CntrAttr::default(), 0).unwrap();
    let ep = Endpoint::open(
        &domain,
        &EpAttr {
            ep_type: EpType::Msg,
        },
        0,
    )
    .unwrap();

    ep.bind_cntr(&cntr, BindFlags::SEND | BindFlags::RECV).unwrap();
    assert!(matches!(
        ep.bind_cntr(&cntr, BindFlags::RECV),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(cntr.ref_count(), 1);
    assert_eq!(cntr.poll_nics(), 1);
    assert_eq!(cntr.close(), Err(Error::Busy(1)));

    ep.enable().unwrap();
    assert!(matches!(
        ep.bind_cntr(&cntr, BindFlags::WRITE),
        Err(Error::InvalidArgument(_))
    ));

    ep.close().unwrap();
    assert_eq!(cntr.ref_count(), 0);
    assert_eq!(cntr.poll_nics(), 0);
    let before = domain.ref_count();
    cntr.close().unwrap();
    assert_eq!(domain.ref_count(), before - 1);
}

#[test]
fn counter_wait_sees_updates_from_another_thread() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let cntr = Counter::open(&domain, &CntrAttr::default(), 0).unwrap();

    assert_eq!(cntr.wait(1, Duration::from_millis(5)), Err(Error::Timeout));

    crossbeam_utils::thread::scope(|s| {
        let waiter = s.spawn(|_| cntr.wait(3, common::WAIT));
        for _ in 0..3 {
            cntr.increment();
        }
        assert_eq!(waiter.join().unwrap(), Ok(()));
    })
    .unwrap();
    assert_eq!(cntr.read(), 3);

    cntr.set(0);
    cntr.increment_error();
    cntr.add(2);
    assert_eq!(cntr.read(), 2);
    assert_eq!(cntr.read_error(), 1);

    let waiting = AtomicBool::new(true);
    crossbeam_utils::thread::scope(|s| {
        let waiter = s.spawn(|_| {
            let res = cntr.wait(10, common::WAIT);
            waiting.store(false, Ordering::Release);
            res
        });
        while waiting.load(Ordering::Acquire) {
            cntr.increment_error();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(waiter.join().unwrap(), Err(Error::Available));
    })
    .unwrap();
    assert!(cntr.read_error() > 1);
}
