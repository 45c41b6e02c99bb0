mod common;

use std::sync::Arc;

use fabric_api::attr::{CntrAttr, CqFormat, EpAttr, EpType};
use fabric_api::flags::BindFlags;
use fabric_api::{Errno, FiAddr};
use transport_gni::driver::LoopbackDriver;
use transport_gni::{Counter, Endpoint, Error, GniConfig, VcState};

use common::{
    counted_pair, drive_until, next_entry, next_error, open_cq, open_domain, open_fabric, rdm_pair,
};

#[test]
fn backpressure_is_replayed_until_the_retry_budget_runs_out() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let cntr = Counter::open(&domain, &CntrAttr::default(), 0).unwrap();
    let pair = counted_pair(&domain, CqFormat::Context, &cntr);

    // One answer more than the budget of five retries.
    driver.stall_posts(6);
    let payload = [1u8; 8];
    unsafe { pair.tx.send(&payload, pair.to_rx, 1) }.unwrap();
    unsafe { pair.tx.send(&payload, pair.to_rx, 2) }.unwrap();

    let err = next_error(&pair.tx_cq);
    assert_eq!((err.op_context, err.err), (1, Errno::Again));
    assert_eq!(next_entry(&pair.tx_cq).unwrap().op_context, 2);
    assert_eq!(driver.stats().backpressured, 6);
    assert_eq!((cntr.read(), cntr.read_error()), (1, 1));
}

#[test]
fn stalled_request_completes_once_released() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);

    driver.stall_forever();
    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 1) }.unwrap();
    for _ in 0..10 {
        pair.tx.progress();
    }
    assert_eq!(pair.tx_cq.read(1), Err(Error::Again));
    assert_eq!(pair.tx.active_requests(), 1);
    let stalled = driver.stats().backpressured;
    assert!((1..6).contains(&stalled));

    driver.release();
    assert_eq!(next_entry(&pair.tx_cq).unwrap().op_context, 1);
    assert_eq!(pair.tx.active_requests(), 0);
}

#[test]
fn non_replayable_requests_fail_on_first_backpressure() {
    let driver = Arc::new(LoopbackDriver::new());
    let config = GniConfig {
        replay_backpressured: false,
        ..Default::default()
    };
    let fabric = open_fabric(config, &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);

    driver.stall_posts(1);
    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 1) }.unwrap();
    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 2) }.unwrap();
    let err = next_error(&pair.tx_cq);
    assert_eq!((err.op_context, err.err), (1, Errno::Again));
    assert_eq!(next_entry(&pair.tx_cq).unwrap().op_context, 2);
    assert_eq!(driver.stats().backpressured, 1);
}

#[test]
fn refused_handshake_fails_queued_requests() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);

    driver.refuse(pair.rx.name().gnix_addr);
    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 1) }.unwrap();
    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 2) }.unwrap();

    for ctx in [1, 2] {
        let err = next_error(&pair.tx_cq);
        assert_eq!((err.op_context, err.err), (ctx, Errno::ConnRefused));
    }
    // The failed connection is dropped; the next send starts over.
    drive_until(&pair.tx, || pair.tx.vc_state(pair.to_rx).is_none());
    assert_eq!(pair.tx.active_requests(), 0);
}

#[test]
fn unanswered_handshake_times_out() {
    let driver = Arc::new(LoopbackDriver::new());
    let config = GniConfig {
        datagram_timeout_ms: 20,
        ..Default::default()
    };
    let fabric = open_fabric(config, &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);
    let cm_nic = domain.cm_nic().unwrap();
    let (bound_free, _) = cm_nic.free_datagrams();

    driver.make_unreachable(pair.rx.name().gnix_addr);
    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 1) }.unwrap();
    assert_eq!(pair.tx.vc_state(pair.to_rx), Some(VcState::Connecting));
    assert_eq!(cm_nic.free_datagrams().0, bound_free - 1);

    let err = next_error(&pair.tx_cq);
    assert_eq!((err.op_context, err.err), (1, Errno::ConnRefused));
    assert_eq!(cm_nic.free_datagrams().0, bound_free);
}

#[test]
fn peer_handshakes_are_accepted() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);
    let cm_nic = domain.cm_nic().unwrap();
    let wildcards = cm_nic.free_datagrams().1;

    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 1) }.unwrap();
    next_entry(&pair.tx_cq).unwrap();
    assert_eq!(cm_nic.accepted_handshakes(), 1);
    // The consumed wildcard was posted again.
    assert_eq!(cm_nic.free_datagrams().1, wildcards);
    assert_eq!(driver.stats().handshakes, 1);
}

#[test]
fn msg_endpoints_connect_and_disconnect() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let cq_a = open_cq(&domain, CqFormat::Msg);
    let cq_b = open_cq(&domain, CqFormat::Msg);
    let attr = EpAttr {
        ep_type: EpType::Msg,
    };
    let a = Endpoint::open(&domain, &attr, 0).unwrap();
    let b = Endpoint::open(&domain, &attr, 0).unwrap();
    for (ep, cq) in [(&a, &cq_a), (&b, &cq_b)] {
        ep.bind_cq(cq, BindFlags::TRANSMIT | BindFlags::RECV).unwrap();
        ep.enable().unwrap();
    }

    // Not connected yet.
    assert!(matches!(
        unsafe { b.send(&[0u8; 1], FiAddr::UNSPEC, 0) },
        Err(Error::InvalidArgument(_))
    ));

    a.connect(&b.name()).unwrap();
    assert!(matches!(a.connect(&b.name()), Err(Error::InvalidArgument(_))));
    drive_until(&a, || a.vc_state(FiAddr::UNSPEC) == Some(VcState::Connected));

    let mut buf = [0u8; 3];
    unsafe { b.recv(&mut buf, FiAddr::UNSPEC, 7) }.unwrap();
    unsafe { a.send(&[1, 2, 3], FiAddr::UNSPEC, 1) }.unwrap();
    assert_eq!(next_entry(&cq_a).unwrap().op_context, 1);
    let entry = next_entry(&cq_b).unwrap();
    assert_eq!((entry.op_context, entry.len), (7, 3));
    assert_eq!(buf, [1, 2, 3]);

    a.disconnect(FiAddr::UNSPEC).unwrap();
    drive_until(&a, || a.vc_state(FiAddr::UNSPEC) == Some(VcState::Terminated));
    assert_eq!(
        unsafe { a.send(&[1], FiAddr::UNSPEC, 2) },
        Err(Error::ConnectionClosed)
    );
}

#[test]
fn rdm_endpoint_needs_an_address_vector() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let ep = Endpoint::open(&domain, &EpAttr::default(), 0).unwrap();

    assert!(matches!(
        unsafe { ep.send(&[0u8; 1], FiAddr(0), 0) },
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(ep.enable(), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        ep.connect(&ep.name()),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn queue_depth_bounds_outstanding_requests() {
    let driver = Arc::new(LoopbackDriver::new());
    let config = GniConfig {
        ep_queue_depth: 2,
        ..Default::default()
    };
    let fabric = open_fabric(config, &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);

    driver.make_unreachable(pair.rx.name().gnix_addr);
    let payload = [0u8; 4];
    unsafe { pair.tx.send(&payload, pair.to_rx, 1) }.unwrap();
    unsafe { pair.tx.send(&payload, pair.to_rx, 2) }.unwrap();
    assert_eq!(
        unsafe { pair.tx.send(&payload, pair.to_rx, 3) },
        Err(Error::Again)
    );
    assert_eq!(pair.tx.active_requests(), 2);
}

#[test]
fn close_cancels_requests_of_unconnected_peers() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);

    driver.make_unreachable(pair.rx.name().gnix_addr);
    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 1) }.unwrap();
    let mut buf = [0u8; 8];
    unsafe { pair.tx.recv(&mut buf, FiAddr::UNSPEC, 2) }.unwrap();
    pair.tx.close().unwrap();

    let first = next_error(&pair.tx_cq);
    let second = next_error(&pair.tx_cq);
    assert_eq!((first.op_context, first.err), (1, Errno::Canceled));
    assert_eq!((second.op_context, second.err), (2, Errno::Canceled));
    assert_eq!(pair.tx.active_requests(), 0);
    assert_eq!(pair.tx_cq.ref_count(), 0);
    assert_eq!(
        unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 3) },
        Err(Error::ConnectionClosed)
    );
    assert!(matches!(pair.tx.close(), Err(Error::InvalidArgument(_))));
}

#[test]
fn close_drains_a_live_connection() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);

    let payload = [4u8; 8];
    unsafe { pair.tx.send(&payload, pair.to_rx, 0) }.unwrap();
    next_entry(&pair.tx_cq).unwrap();

    for ctx in 1..=3 {
        unsafe { pair.tx.send(&payload, pair.to_rx, ctx) }.unwrap();
    }
    pair.tx.close().unwrap();
    let done = pair.tx_cq.read(8).unwrap();
    assert_eq!(
        done.iter().map(|e| e.op_context).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(pair.rx.unexpected_messages(), 4);
}

#[test]
fn undrained_requests_are_canceled_at_close() {
    let driver = Arc::new(LoopbackDriver::new());
    let config = GniConfig {
        close_drain_iters: 1,
        ..Default::default()
    };
    let fabric = open_fabric(config, &driver);
    let domain = open_domain(&fabric);
    let cntr = Counter::open(&domain, &CntrAttr::default(), 0).unwrap();
    let pair = counted_pair(&domain, CqFormat::Context, &cntr);

    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 0) }.unwrap();
    next_entry(&pair.tx_cq).unwrap();

    driver.stall_forever();
    unsafe { pair.tx.send(&[2u8; 8], pair.to_rx, 1) }.unwrap();
    pair.tx.close().unwrap();

    assert_eq!(pair.tx.active_requests(), 0);
    let err = next_error(&pair.tx_cq);
    assert_eq!((err.op_context, err.err), (1, Errno::Canceled));
    assert_eq!((cntr.read(), cntr.read_error()), (1, 1));
    driver.release();
}

#[test]
fn closed_endpoints_with_connections_let_the_cm_nic_go() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    let domain = open_domain(&fabric);
    let pair = rdm_pair(&domain, CqFormat::Context);
    unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 1) }.unwrap();
    next_entry(&pair.tx_cq).unwrap();
    assert_eq!(pair.tx.vc_state(pair.to_rx), Some(VcState::Connected));

    pair.tx.close().unwrap();
    pair.rx.close().unwrap();
    pair.tx_cq.close().unwrap();
    pair.rx_cq.close().unwrap();
    pair.av.close().unwrap();
    domain.close().unwrap();
    assert_eq!(driver.live_cdms(), 0);
}

#[test]
fn closing_the_last_domain_releases_the_cm_nic() {
    let driver = Arc::new(LoopbackDriver::new());
    let fabric = open_fabric(GniConfig::default(), &driver);
    {
        let domain = open_domain(&fabric);
        let pair = rdm_pair(&domain, CqFormat::Context);
        unsafe { pair.tx.send(&[1u8; 8], pair.to_rx, 1) }.unwrap();
        next_entry(&pair.tx_cq).unwrap();
        assert_eq!(driver.live_cdms(), 1);
    }
    assert_eq!(fabric.num_domains(), 0);
    assert_eq!(driver.live_cdms(), 0);
    fabric.close().unwrap();
}
