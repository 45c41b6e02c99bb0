//! Endpoints: where operations are submitted and where their completions
//! are routed to the bound counters and completion queues.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use fnv::FnvHashMap as HashMap;

use fabric_api::attr::{EpAttr, EpType};
use fabric_api::cq::{CqEntry, CqErrEntry};
use fabric_api::flags::{BindFlags, CompletionFlags};
use fabric_api::{EpName, FiAddr, GniAddress};
use fabric_common::log;
use fabric_common::resource::ResourceTableGeneric;

use crate::av::{AddressResolver, AddressVector, AvShared};
use crate::cntr::{CntrShared, Counter};
use crate::cq::{CompletionQueue, CqShared};
use crate::domain::{Domain, DomainShared};
use crate::driver::IncomingChunk;
use crate::fab_req::{FabReq, FabReqType, ReqModes};
use crate::matcher::{ListMatcher, PostedRecv, TagMatcher, UnexpectedMsg};
use crate::nic::Nic;
use crate::vc::{TxParams, Vc, VcState};
use crate::{Error, Result};

#[derive(Default)]
struct Bindings {
    send_cq: Option<Arc<CqShared>>,
    recv_cq: Option<Arc<CqShared>>,
    send_cntr: Option<Arc<CntrShared>>,
    recv_cntr: Option<Arc<CntrShared>>,
    read_cntr: Option<Arc<CntrShared>>,
    write_cntr: Option<Arc<CntrShared>>,
    av: Option<Arc<AvShared>>,
    // One entry per bind call, each holding one reference.
    held_cqs: Vec<Arc<CqShared>>,
    held_cntrs: Vec<Arc<CntrShared>>,
}

impl Bindings {
    fn cntr_slot(&mut self, class: BindFlags) -> &mut Option<Arc<CntrShared>> {
        if class == BindFlags::SEND {
            &mut self.send_cntr
        } else if class == BindFlags::RECV {
            &mut self.recv_cntr
        } else if class == BindFlags::READ {
            &mut self.read_cntr
        } else {
            &mut self.write_cntr
        }
    }

    fn cntr_for(&self, class: BindFlags) -> Option<&Arc<CntrShared>> {
        if class == BindFlags::SEND {
            self.send_cntr.as_ref()
        } else if class == BindFlags::RECV {
            self.recv_cntr.as_ref()
        } else if class == BindFlags::READ {
            self.read_cntr.as_ref()
        } else {
            self.write_cntr.as_ref()
        }
    }
}

const CNTR_CLASSES: [BindFlags; 4] = [
    BindFlags::SEND,
    BindFlags::RECV,
    BindFlags::READ,
    BindFlags::WRITE,
];

struct PartialMsg {
    buf: Vec<u8>,
    // Bytes already written, so a repeated chunk is not counted twice.
    filled: Vec<bool>,
    received: usize,
}

/// Messages arriving in several chunks, keyed by (source, sequence).
#[derive(Default)]
struct Reassembly {
    partial: HashMap<(GniAddress, u64), PartialMsg>,
}

impl Reassembly {
    /// Stores a chunk that lies within `[0, total_len)` and returns the
    /// message once every byte of it is in. Chunks disagreeing with the
    /// length of their message, or overlapping bytes already received, are
    /// dropped.
    fn add(
        &mut self,
        src: GniAddress,
        msg_seq: u64,
        offset: usize,
        total_len: usize,
        payload: Vec<u8>,
    ) -> Option<Vec<u8>> {
        let key = (src, msg_seq);
        let entry = self.partial.entry(key).or_insert_with(|| PartialMsg {
            buf: vec![0; total_len],
            filled: vec![false; total_len],
            received: 0,
        });
        let end = offset + payload.len();
        if total_len != entry.buf.len() {
            log::warn!(
                "chunk from {} claims {} bytes for message {} of {} bytes",
                src,
                total_len,
                msg_seq,
                entry.buf.len()
            );
            return None;
        }
        if entry.filled[offset..end].iter().any(|&f| f) {
            log::warn!("duplicate chunk [{}, {}) from {} dropped", offset, end, src);
            return None;
        }
        entry.buf[offset..end].copy_from_slice(&payload);
        entry.filled[offset..end].fill(true);
        entry.received += payload.len();
        if entry.received < entry.buf.len() {
            return None;
        }
        self.partial.remove(&key).map(|whole| whole.buf)
    }

    fn clear(&mut self) {
        self.partial.clear();
    }
}

pub(crate) struct EpShared {
    self_ref: Weak<EpShared>,
    ep_type: EpType,
    name: EpName,
    domain: Arc<DomainShared>,
    // Taken on close, so a closed endpoint holds no hardware context.
    nic: spin::RwLock<Option<Arc<Nic>>>,
    tx_params: TxParams,
    inject_size: usize,
    queue_depth: usize,
    replayable: bool,
    close_drain_iters: usize,
    vcs: ResourceTableGeneric<GniAddress, Vc>,
    next_vc_id: AtomicU32,
    msg_peer: spin::Mutex<Option<GniAddress>>,
    bindings: spin::RwLock<Bindings>,
    matcher: spin::Mutex<Box<dyn TagMatcher>>,
    posted_recvs: spin::Mutex<HashMap<u64, FabReq>>,
    // Finished outside of progress, reported on the next progress call.
    deferred: spin::Mutex<VecDeque<FabReq>>,
    rx_partial: spin::Mutex<Reassembly>,
    active_fab_reqs: AtomicUsize,
    next_req_id: AtomicU64,
    enabled: AtomicBool,
    closing: AtomicBool,
    context: u64,
}

impl EpShared {
    fn nic(&self) -> Result<Arc<Nic>> {
        self.nic.read().clone().ok_or(Error::ConnectionClosed)
    }

    fn check_usable(&self) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        if !self.enabled.load(Ordering::Acquire) {
            return Err(Error::inval("endpoint is not enabled"));
        }
        Ok(())
    }

    fn reserve_slot(&self) -> Result<()> {
        let prev = self.active_fab_reqs.fetch_add(1, Ordering::AcqRel);
        if prev >= self.queue_depth {
            self.active_fab_reqs.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Again);
        }
        Ok(())
    }

    fn new_req(&self, kind: FabReqType, context: u64, buf: usize, len: usize) -> FabReq {
        let id = self.next_req_id.fetch_add(1, Ordering::AcqRel);
        FabReq::new(id, kind, context, buf, len).replayable(self.replayable)
    }

    fn new_inject_req(&self, kind: FabReqType, context: u64, data: &[u8]) -> Result<FabReq> {
        if data.len() > self.inject_size {
            return Err(Error::inval(format!(
                "{} bytes exceed the inject size of {}",
                data.len(),
                self.inject_size
            )));
        }
        let id = self.next_req_id.fetch_add(1, Ordering::AcqRel);
        Ok(FabReq::new_inject(id, kind, context, data).replayable(self.replayable))
    }

    fn resolve_peer(&self, addr: FiAddr) -> Result<GniAddress> {
        match self.ep_type {
            EpType::Msg => self
                .msg_peer
                .lock()
                .ok_or_else(|| Error::inval("endpoint is not connected")),
            EpType::Rdm => {
                let av = self
                    .bindings
                    .read()
                    .av
                    .clone()
                    .ok_or_else(|| Error::inval("no address vector bound"))?;
                av.resolve(addr)
            }
        }
    }

    fn vc_for(&self, peer: GniAddress) -> Result<Arc<Vc>> {
        let nic = self.nic()?;
        Ok(self.vcs.get_or_insert_with(peer, || {
            let id = self.next_vc_id.fetch_add(1, Ordering::AcqRel);
            Arc::new(Vc::new(
                id,
                peer,
                self.name,
                Weak::clone(&self.self_ref),
                nic,
            ))
        }))
    }

    fn start_connect(&self, vc: &Arc<Vc>) {
        let Ok(nic) = self.nic() else { return };
        let failed = vc.connect(nic.cm_nic());
        if !failed.is_empty() {
            self.deferred.lock().extend(failed);
        }
    }

    fn submit_tx(&self, req: FabReq, dest: FiAddr) -> Result<()> {
        self.check_usable()?;
        let peer = self.resolve_peer(dest)?;
        let vc = self.vc_for(peer)?;
        self.reserve_slot()?;
        match vc.enqueue(req) {
            Ok(true) => {
                self.start_connect(&vc);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                self.active_fab_reqs.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn submit_recv(&self, req: FabReq, src: FiAddr) -> Result<()> {
        self.check_usable()?;
        let src = if src.is_unspec() {
            match self.ep_type {
                EpType::Msg => *self.msg_peer.lock(),
                EpType::Rdm => None,
            }
        } else {
            Some(self.resolve_peer(src)?)
        };
        let vc = match (self.ep_type, src) {
            (EpType::Rdm, Some(peer)) => Some(self.vc_for(peer)?),
            _ => None,
        };
        self.reserve_slot()?;
        if let Some(vc) = vc {
            self.start_connect(&vc);
        }

        let mut req = req.with_src(src);
        let desc = PostedRecv {
            id: req.id,
            context: req.context,
            src,
            tagged: req.kind == FabReqType::TRecv,
            tag: req.tag,
            ignore: req.ignore,
        };
        let mut matcher = self.matcher.lock();
        match matcher.post_recv(desc) {
            Some(msg) => {
                drop(matcher);
                // SAFETY: the submitter keeps the receive buffer alive until
                // the completion is read.
                unsafe { req.deliver(&msg) };
                req.modes.insert(ReqModes::MATCHED | ReqModes::UNEXPECTED);
                req.matched = Some(msg);
                self.deferred.lock().push_back(req);
            }
            None => {
                self.posted_recvs.lock().insert(req.id, req);
            }
        }
        Ok(())
    }

    pub(crate) fn complete_all(&self, reqs: Vec<FabReq>) {
        for req in reqs {
            self.complete(req);
        }
    }

    /// Routes the completion of `req` to the counter and completion queue
    /// bound for its class, then frees it.
    pub(crate) fn complete(&self, mut req: FabReq) {
        let prev = self.active_fab_reqs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "completion without a submitted request");

        let bindings = self.bindings.read();
        let recv = req.kind.is_recv();
        let cq = if recv {
            bindings.recv_cq.as_ref()
        } else {
            bindings.send_cq.as_ref()
        };
        let cntr = bindings.cntr_for(req.kind.counter_class());

        let mut flags = req.kind.completion_flags();
        if recv && req.imm.is_some() {
            flags |= CompletionFlags::REMOTE_CQ_DATA;
        }
        let len = if recv { req.received } else { req.len };
        let buf = if req.modes.contains(ReqModes::INJECT_DATA) {
            0
        } else {
            req.buf
        };
        let data = req.imm.unwrap_or(0);

        match req.error.take() {
            None => {
                if let Some(cntr) = cntr {
                    cntr.increment();
                }
                if let Some(cq) = cq {
                    cq.push(CqEntry {
                        op_context: req.context,
                        flags,
                        len,
                        buf,
                        data,
                        tag: req.tag,
                    });
                }
            }
            Some(err) => {
                log::debug!("request {} ({:?}) failed: {}", req.id, req.kind, err);
                if let Some(cntr) = cntr {
                    cntr.increment_error();
                }
                if let Some(cq) = cq {
                    cq.push_error(CqErrEntry {
                        op_context: req.context,
                        flags,
                        len,
                        buf,
                        data,
                        tag: req.tag,
                        olen: req.olen,
                        err: err.errno(),
                        prov_errno: 0,
                    });
                }
            }
        }
    }

    /// Transmit side of a NIC progress pass.
    pub(crate) fn progress_tx(&self) -> usize {
        let Ok(nic) = self.nic() else { return 0 };
        let deferred: Vec<FabReq> = self.deferred.lock().drain(..).collect();
        let mut work = deferred.len();
        self.complete_all(deferred);

        let closing = self.closing.load(Ordering::Acquire);
        let mut done = Vec::new();
        for vc in self.vcs.snapshot() {
            done.extend(vc.connect(nic.cm_nic()));
            work += vc.progress_tx(&self.tx_params, &mut done);
            work += done.len();
            self.complete_all(std::mem::take(&mut done));

            // A failed connection is forgotten so that the next operation
            // towards the peer starts over. A message endpoint keeps its
            // only connection.
            if self.ep_type == EpType::Rdm
                && !closing
                && vc.state() == VcState::Terminated
                && vc.outstanding() == 0
            {
                self.vcs.remove(&vc.peer());
            }
        }
        work
    }

    pub(crate) fn on_incoming(&self, chunk: IncomingChunk) {
        let IncomingChunk {
            src,
            tagged,
            tag,
            imm,
            msg_seq,
            offset,
            total_len,
            payload,
            ..
        } = chunk;
        if offset + payload.len() > total_len {
            log::warn!(
                "chunk [{}, +{}) from {} overruns message of {} bytes",
                offset,
                payload.len(),
                src,
                total_len
            );
            return;
        }

        let payload = if offset == 0 && payload.len() == total_len {
            payload
        } else {
            let whole = self
                .rx_partial
                .lock()
                .add(src, msg_seq, offset, total_len, payload);
            match whole {
                Some(whole) => whole,
                None => return,
            }
        };

        self.offer(UnexpectedMsg {
            src,
            tagged,
            tag,
            imm,
            payload,
        });
    }

    fn offer(&self, msg: UnexpectedMsg) {
        let matched = {
            let mut matcher = self.matcher.lock();
            matcher
                .match_or_queue(msg)
                .map(|(posted, msg)| (self.posted_recvs.lock().remove(&posted.id), msg))
        };
        match matched {
            Some((Some(mut req), msg)) => {
                // SAFETY: see `submit_recv`.
                unsafe { req.deliver(&msg) };
                req.modes.insert(ReqModes::MATCHED);
                self.complete(req);
            }
            Some((None, msg)) => {
                log::warn!("receive matched by a message from {} is gone", msg.src);
            }
            None => {}
        }
    }

    pub(crate) fn on_remote_write(&self, src: GniAddress, imm: u64, len: usize) {
        let bindings = self.bindings.read();
        match &bindings.recv_cq {
            Some(cq) => cq.push(CqEntry {
                op_context: 0,
                flags: CompletionFlags::RMA
                    | CompletionFlags::REMOTE_WRITE
                    | CompletionFlags::REMOTE_CQ_DATA,
                len,
                buf: 0,
                data: imm,
                tag: 0,
            }),
            None => log::debug!("write with immediate data from {} dropped, no cq", src),
        }
    }

    fn cancel(&self, context: u64) -> bool {
        let canceled = {
            let mut matcher = self.matcher.lock();
            matcher
                .cancel(context)
                .and_then(|posted| self.posted_recvs.lock().remove(&posted.id))
        };
        if let Some(mut req) = canceled {
            req.fail(Error::Canceled);
            self.deferred.lock().push_back(req);
            return true;
        }
        self.vcs.snapshot().iter().any(|vc| vc.cancel(context))
    }

    /// Tears the endpoint down: connections are shut down and given a
    /// bounded number of progress passes to drain, receives still waiting
    /// for a message end canceled, and every binding is released.
    fn shutdown(&self) {
        let addr = self.name.gnix_addr;
        let Some(nic) = self.nic.read().clone() else {
            return;
        };
        for vc in self.vcs.snapshot() {
            let done = vc.shutdown(nic.cm_nic());
            self.complete_all(done);
        }

        let mut unmatched: Vec<FabReq> = {
            let mut matcher = self.matcher.lock();
            let mut posted = self.posted_recvs.lock();
            for req in posted.values() {
                matcher.cancel(req.context);
            }
            posted.drain().map(|(_, req)| req).collect()
        };
        unmatched.sort_by_key(|req| req.id);
        for req in unmatched.iter_mut() {
            req.fail(Error::Canceled);
        }
        self.complete_all(unmatched);

        let mut iters = 0;
        while self
            .vcs
            .snapshot()
            .iter()
            .any(|vc| vc.state() == VcState::Terminating)
        {
            if iters == self.close_drain_iters {
                break;
            }
            nic.progress();
            iters += 1;
        }
        for vc in self.vcs.snapshot() {
            let aborted = vc.abort();
            if !aborted.is_empty() {
                log::warn!(
                    "endpoint {}: {} requests to {} canceled undrained",
                    addr,
                    aborted.len(),
                    vc.peer()
                );
            }
            self.complete_all(aborted);
        }
        let deferred: Vec<FabReq> = self.deferred.lock().drain(..).collect();
        self.complete_all(deferred);

        nic.detach_endpoint(&addr);
        self.domain.driver().unbind_endpoint(addr);
        for vc in self.vcs.snapshot() {
            self.vcs.remove(&vc.peer());
        }
        self.rx_partial.lock().clear();

        let bindings = std::mem::take(&mut *self.bindings.write());
        for cq in bindings.held_cqs {
            if let Err(e) = cq.deregister_nic(&nic) {
                log::warn!("unbinding cq from {}: {}", addr, e);
            }
            cq.release();
        }
        for cntr in bindings.held_cntrs {
            if let Err(e) = cntr.deregister_nic(&nic) {
                log::warn!("unbinding counter from {}: {}", addr, e);
            }
            cntr.release();
        }
        if let Some(av) = bindings.av {
            av.release();
        }
        self.nic.write().take();
        drop(nic);
        self.domain.release();
        log::debug!("endpoint {} closed", addr);
    }
}

/// An endpoint. Submission calls return as soon as the request is queued;
/// each one produces exactly one completion, reported on the bound
/// counters and completion queues by a later progress call.
pub struct Endpoint {
    shared: Arc<EpShared>,
}

impl Endpoint {
    pub fn open(domain: &Domain, attr: &EpAttr, context: u64) -> Result<Self> {
        Self::open_with_matcher(domain, attr, context, Box::new(ListMatcher::new()))
    }

    pub fn open_with_matcher(
        domain: &Domain,
        attr: &EpAttr,
        context: u64,
        matcher: Box<dyn TagMatcher>,
    ) -> Result<Self> {
        let dom = &domain.shared;
        dom.refs.open()?;
        let opened = Self::build(dom, attr, context, matcher);
        if opened.is_err() {
            dom.release();
        }
        opened
    }

    fn build(
        dom: &Arc<DomainShared>,
        attr: &EpAttr,
        context: u64,
        matcher: Box<dyn TagMatcher>,
    ) -> Result<Self> {
        let nic = dom.attach_nic()?;
        let cdm_id = dom.next_conn_id()?;
        let name = EpName {
            gnix_addr: GniAddress::new(nic.cm_nic().device_addr(), cdm_id),
            name_type: 0,
            cookie: dom.credentials().cookie,
        };
        dom.driver().bind_endpoint(nic.handle(), &name)?;

        let config = dom.config();
        let max_chunk = config
            .max_transfer_size
            .min(dom.driver().max_transfer_size())
            .min(usize::MAX as u64) as usize;
        let tx_params = TxParams {
            max_chunk: max_chunk.max(1),
            budget: config.progress_budget,
            max_retries: config.max_retries,
            backoff_cap: config.retry_backoff_cap,
        };

        let shared = Arc::new_cyclic(|me| EpShared {
            self_ref: Weak::clone(me),
            ep_type: attr.ep_type,
            name,
            domain: Arc::clone(dom),
            nic: spin::RwLock::new(Some(Arc::clone(&nic))),
            tx_params,
            inject_size: config.inject_size,
            queue_depth: config.ep_queue_depth,
            replayable: config.replay_backpressured,
            close_drain_iters: config.close_drain_iters,
            vcs: ResourceTableGeneric::default(),
            next_vc_id: AtomicU32::new(0),
            msg_peer: spin::Mutex::new(None),
            bindings: spin::RwLock::new(Bindings::default()),
            matcher: spin::Mutex::new(matcher),
            posted_recvs: spin::Mutex::new(HashMap::default()),
            deferred: spin::Mutex::new(VecDeque::new()),
            rx_partial: spin::Mutex::new(Reassembly::default()),
            active_fab_reqs: AtomicUsize::new(0),
            next_req_id: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            context,
        });
        if let Err(e) = nic.attach_endpoint(name.gnix_addr, Arc::clone(&shared)) {
            dom.driver().unbind_endpoint(name.gnix_addr);
            return Err(e);
        }
        log::debug!("endpoint {} opened ({:?})", name.gnix_addr, attr.ep_type);
        Ok(Endpoint { shared })
    }

    /// The name peers use to reach this endpoint.
    #[inline]
    pub fn name(&self) -> EpName {
        self.shared.name
    }

    #[inline]
    pub fn ep_type(&self) -> EpType {
        self.shared.ep_type
    }

    #[inline]
    pub fn context(&self) -> u64 {
        self.shared.context
    }

    fn check_bindable(&self) -> Result<()> {
        if self.shared.enabled.load(Ordering::Acquire) {
            return Err(Error::inval("endpoint already enabled"));
        }
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(Error::inval("endpoint has been closed"));
        }
        Ok(())
    }

    /// Binds a completion queue for transmit (`SEND`) and/or receive
    /// (`RECV`) completions.
    pub fn bind_cq(&self, cq: &CompletionQueue, flags: BindFlags) -> Result<()> {
        self.check_bindable()?;
        let valid = BindFlags::SEND | BindFlags::RECV;
        if flags.is_empty() || !valid.contains(flags) {
            return Err(Error::inval(format!("bad cq bind flags {:?}", flags)));
        }
        let mut bindings = self.shared.bindings.write();
        if (flags.contains(BindFlags::SEND) && bindings.send_cq.is_some())
            || (flags.contains(BindFlags::RECV) && bindings.recv_cq.is_some())
        {
            return Err(Error::inval("completion queue already bound"));
        }
        let nic = self.shared.nic()?;
        cq.shared.refs.open()?;
        cq.shared.register_nic(&nic);
        if flags.contains(BindFlags::SEND) {
            bindings.send_cq = Some(Arc::clone(&cq.shared));
        }
        if flags.contains(BindFlags::RECV) {
            bindings.recv_cq = Some(Arc::clone(&cq.shared));
        }
        bindings.held_cqs.push(Arc::clone(&cq.shared));
        Ok(())
    }

    pub fn bind_cntr(&self, cntr: &Counter, flags: BindFlags) -> Result<()> {
        self.check_bindable()?;
        let valid = BindFlags::SEND | BindFlags::RECV | BindFlags::READ | BindFlags::WRITE;
        if flags.is_empty() || !valid.contains(flags) {
            return Err(Error::inval(format!("bad counter bind flags {:?}", flags)));
        }
        let mut bindings = self.shared.bindings.write();
        let classes: Vec<BindFlags> = CNTR_CLASSES
            .iter()
            .copied()
            .filter(|c| flags.contains(*c))
            .collect();
        if classes.iter().any(|c| bindings.cntr_for(*c).is_some()) {
            return Err(Error::inval("counter already bound"));
        }
        let nic = self.shared.nic()?;
        cntr.shared.refs.open()?;
        cntr.shared.register_nic(&nic);
        for class in classes {
            *bindings.cntr_slot(class) = Some(Arc::clone(&cntr.shared));
        }
        bindings.held_cntrs.push(Arc::clone(&cntr.shared));
        Ok(())
    }

    pub fn bind_av(&self, av: &AddressVector) -> Result<()> {
        self.check_bindable()?;
        let mut bindings = self.shared.bindings.write();
        if bindings.av.is_some() {
            return Err(Error::inval("address vector already bound"));
        }
        av.shared.refs.open()?;
        bindings.av = Some(Arc::clone(&av.shared));
        Ok(())
    }

    /// Makes the endpoint usable. A reliable-datagram endpoint needs an
    /// address vector first.
    pub fn enable(&self) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(Error::inval("endpoint has been closed"));
        }
        if self.shared.ep_type == EpType::Rdm && self.shared.bindings.read().av.is_none() {
            return Err(Error::inval("no address vector bound"));
        }
        self.shared.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Connects a message endpoint to its only peer. The handshake
    /// completes on a later progress call.
    pub fn connect(&self, peer: &EpName) -> Result<()> {
        let shared = &self.shared;
        if shared.ep_type != EpType::Msg {
            return Err(Error::inval("connect on a connectionless endpoint"));
        }
        shared.check_usable()?;
        {
            let mut msg_peer = shared.msg_peer.lock();
            if msg_peer.is_some() {
                return Err(Error::inval("endpoint already connected"));
            }
            *msg_peer = Some(peer.gnix_addr);
        }
        let vc = shared.vc_for(peer.gnix_addr)?;
        shared.start_connect(&vc);
        Ok(())
    }

    /// # Safety
    ///
    /// `buf` must stay valid and unmodified until the completion is read.
    pub unsafe fn send(&self, buf: &[u8], dest: FiAddr, context: u64) -> Result<()> {
        let req = self
            .shared
            .new_req(FabReqType::Send, context, buf.as_ptr() as usize, buf.len());
        self.shared.submit_tx(req, dest)
    }

    /// # Safety
    ///
    /// See [`Endpoint::send`].
    pub unsafe fn senddata(&self, buf: &[u8], data: u64, dest: FiAddr, context: u64) -> Result<()> {
        let req = self
            .shared
            .new_req(FabReqType::Send, context, buf.as_ptr() as usize, buf.len())
            .with_imm(data);
        self.shared.submit_tx(req, dest)
    }

    /// Sends a copy of `buf`, which may be reused once this returns.
    pub fn inject(&self, buf: &[u8], dest: FiAddr, context: u64) -> Result<()> {
        let req = self.shared.new_inject_req(FabReqType::Send, context, buf)?;
        self.shared.submit_tx(req, dest)
    }

    /// # Safety
    ///
    /// See [`Endpoint::send`].
    pub unsafe fn tsend(&self, buf: &[u8], dest: FiAddr, tag: u64, context: u64) -> Result<()> {
        let req = self
            .shared
            .new_req(FabReqType::TSend, context, buf.as_ptr() as usize, buf.len())
            .with_tag(tag, 0);
        self.shared.submit_tx(req, dest)
    }

    /// # Safety
    ///
    /// See [`Endpoint::send`].
    pub unsafe fn tsenddata(
        &self,
        buf: &[u8],
        data: u64,
        dest: FiAddr,
        tag: u64,
        context: u64,
    ) -> Result<()> {
        let req = self
            .shared
            .new_req(FabReqType::TSend, context, buf.as_ptr() as usize, buf.len())
            .with_tag(tag, 0)
            .with_imm(data);
        self.shared.submit_tx(req, dest)
    }

    /// Posts a receive. With `src` unspecified any peer matches.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and must not be accessed until the completion
    /// is read.
    pub unsafe fn recv(&self, buf: &mut [u8], src: FiAddr, context: u64) -> Result<()> {
        let req = self.shared.new_req(
            FabReqType::Recv,
            context,
            buf.as_mut_ptr() as usize,
            buf.len(),
        );
        self.shared.submit_recv(req, src)
    }

    /// Posts a tagged receive matching tags equal to `tag` outside the bits
    /// set in `ignore`.
    ///
    /// # Safety
    ///
    /// See [`Endpoint::recv`].
    pub unsafe fn trecv(
        &self,
        buf: &mut [u8],
        src: FiAddr,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> Result<()> {
        let req = self
            .shared
            .new_req(
                FabReqType::TRecv,
                context,
                buf.as_mut_ptr() as usize,
                buf.len(),
            )
            .with_tag(tag, ignore);
        self.shared.submit_recv(req, src)
    }

    /// Writes `buf` to `addr` in the peer's memory registered under `key`.
    ///
    /// # Safety
    ///
    /// See [`Endpoint::send`]; the remote range must be valid as well.
    pub unsafe fn write(
        &self,
        buf: &[u8],
        dest: FiAddr,
        addr: u64,
        key: u64,
        context: u64,
    ) -> Result<()> {
        let req = self
            .shared
            .new_req(FabReqType::RdmaWrite, context, buf.as_ptr() as usize, buf.len())
            .with_rma(addr, key);
        self.shared.submit_tx(req, dest)
    }

    /// Like [`Endpoint::write`], and raises a completion carrying `data` on
    /// the peer's receive queue.
    ///
    /// # Safety
    ///
    /// See [`Endpoint::write`].
    pub unsafe fn writedata(
        &self,
        buf: &[u8],
        data: u64,
        dest: FiAddr,
        addr: u64,
        key: u64,
        context: u64,
    ) -> Result<()> {
        let req = self
            .shared
            .new_req(
                FabReqType::RdmaWriteImmData,
                context,
                buf.as_ptr() as usize,
                buf.len(),
            )
            .with_rma(addr, key)
            .with_imm(data);
        self.shared.submit_tx(req, dest)
    }

    /// # Safety
    ///
    /// See [`Endpoint::recv`]; the remote range must be valid as well.
    pub unsafe fn read(
        &self,
        buf: &mut [u8],
        src: FiAddr,
        addr: u64,
        key: u64,
        context: u64,
    ) -> Result<()> {
        let req = self
            .shared
            .new_req(
                FabReqType::RdmaRead,
                context,
                buf.as_mut_ptr() as usize,
                buf.len(),
            )
            .with_rma(addr, key);
        self.shared.submit_tx(req, src)
    }

    /// Cancels the request submitted with `context` if it has not started.
    /// The canceled completion is reported by a later progress call.
    pub fn cancel(&self, context: u64) -> bool {
        self.shared.cancel(context)
    }

    pub fn progress(&self) -> usize {
        self.shared.nic().map_or(0, |nic| nic.progress())
    }

    /// Tears down the connection to `dest`. Operations still queued on it
    /// drain first; new ones fail with connection-closed.
    pub fn disconnect(&self, dest: FiAddr) -> Result<()> {
        let peer = self.shared.resolve_peer(dest)?;
        let nic = self.shared.nic()?;
        let vc = self.shared.vcs.get(&peer)?;
        let done = vc.shutdown(nic.cm_nic());
        self.shared.complete_all(done);
        Ok(())
    }

    pub fn vc_state(&self, dest: FiAddr) -> Option<VcState> {
        let peer = self.shared.resolve_peer(dest).ok()?;
        self.shared.vcs.get(&peer).ok().map(|vc| vc.state())
    }

    /// Requests submitted and not yet completed.
    pub fn active_requests(&self) -> usize {
        self.shared.active_fab_reqs.load(Ordering::Acquire)
    }

    pub fn unexpected_messages(&self) -> usize {
        self.shared.matcher.lock().unexpected_len()
    }

    pub fn close(&self) -> Result<()> {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return Err(Error::inval("endpoint has been closed"));
        }
        self.shared.shutdown();
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.shared.closing.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                log::warn!("endpoint dropped while open: {}", e);
            }
        }
    }
}
