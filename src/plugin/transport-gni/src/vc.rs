//! Virtual connections: one per (endpoint, peer), layered on one NIC.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use static_assertions::const_assert_eq;

use fabric_api::{EpName, GniAddress, GNIX_CACHELINE_SIZE};
use fabric_common::log;

use crate::cm_nic::CmNic;
use crate::driver::{DatagramId, DriverError, EpHandle, OpDescriptor, PostOutcome};
use crate::ep::EpShared;
use crate::fab_req::{FabReq, ReqModes};
use crate::nic::Nic;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcState {
    None,
    Connecting,
    Connected,
    Terminating,
    Terminated,
}

/// Knobs of the transmit path, fixed per endpoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxParams {
    pub(crate) max_chunk: usize,
    pub(crate) budget: usize,
    pub(crate) max_retries: u32,
    pub(crate) backoff_cap: u32,
}

#[derive(Debug)]
struct VcInner {
    state: VcState,
    gni_ep: Option<EpHandle>,
    peer_mbox: u64,
    dgram: Option<DatagramId>,
    /// Requests not fully posted yet, in submission order.
    send_queue: VecDeque<FabReq>,
    /// Fully posted (or failed) requests awaiting their last completion,
    /// in submission order. Everything here was submitted before anything
    /// in `send_queue`.
    active: VecDeque<FabReq>,
    tx_seq: u64,
}

#[repr(align(64))]
pub(crate) struct Vc {
    id: u32,
    peer: GniAddress,
    local: EpName,
    ep: Weak<EpShared>,
    nic: Arc<Nic>,
    outstanding: AtomicUsize,
    inner: spin::Mutex<VcInner>,
}

const_assert_eq!(std::mem::align_of::<Vc>(), GNIX_CACHELINE_SIZE);

impl std::fmt::Debug for Vc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vc")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Vc {
    pub(crate) fn new(
        id: u32,
        peer: GniAddress,
        local: EpName,
        ep: Weak<EpShared>,
        nic: Arc<Nic>,
    ) -> Self {
        Vc {
            id,
            peer,
            local,
            ep,
            nic,
            outstanding: AtomicUsize::new(0),
            inner: spin::Mutex::new(VcInner {
                state: VcState::None,
                gni_ep: None,
                peer_mbox: 0,
                dgram: None,
                send_queue: VecDeque::new(),
                active: VecDeque::new(),
                tx_seq: 0,
            }),
        }
    }

    #[inline]
    pub(crate) fn peer(&self) -> GniAddress {
        self.peer
    }

    #[inline]
    pub(crate) fn state(&self) -> VcState {
        self.inner.lock().state
    }

    #[inline]
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn ep(&self) -> Option<Arc<EpShared>> {
        self.ep.upgrade()
    }

    /// Queues a transmit request. Returns true when the connection has not
    /// been started yet.
    pub(crate) fn enqueue(&self, mut req: FabReq) -> Result<bool> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, VcState::Terminating | VcState::Terminated) {
            return Err(Error::ConnectionClosed);
        }
        inner
            .send_queue
            .try_reserve(1)
            .map_err(|_| Error::NoMemory)?;
        req.msg_seq = inner.tx_seq;
        inner.tx_seq += 1;
        inner.send_queue.push_back(req);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(inner.state == VcState::None)
    }

    /// Starts the handshake, or retries posting its datagram when none was
    /// free earlier. Returns the requests failed by a refused post.
    pub(crate) fn connect(self: &Arc<Self>, cm_nic: &CmNic) -> Vec<FabReq> {
        let mut inner = self.inner.lock();
        match inner.state {
            VcState::None => inner.state = VcState::Connecting,
            VcState::Connecting if inner.dgram.is_none() => {}
            _ => return Vec::new(),
        }
        match cm_nic.connect(self, self.local, self.peer) {
            Ok(Some(id)) => {
                log::debug!("vc {} handshake to {} posted", self.id, self.peer);
                inner.dgram = Some(id);
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(e) => self.fail_connection(&mut inner, e),
        }
    }

    fn fail_connection(&self, inner: &mut VcInner, err: Error) -> Vec<FabReq> {
        log::warn!("vc {} to {}: {}", self.id, self.peer, err);
        inner.state = VcState::Terminated;
        inner.dgram = None;
        debug_assert!(inner.active.is_empty());
        let mut failed: Vec<FabReq> = inner.send_queue.drain(..).collect();
        for req in failed.iter_mut() {
            req.fail(err.clone());
        }
        self.outstanding.fetch_sub(failed.len(), Ordering::AcqRel);
        failed
    }

    /// Applies the outcome of the handshake. Returns the requests failed by
    /// it.
    pub(crate) fn on_handshake(&self, result: Result<u64>) -> Vec<FabReq> {
        let mut inner = self.inner.lock();
        if inner.state != VcState::Connecting {
            return Vec::new();
        }
        inner.dgram = None;
        let driver = self.nic.driver();
        let connected = result.and_then(|mbox| {
            driver
                .create_ep(self.nic.handle(), self.local.gnix_addr, self.peer, mbox)
                .map(|h| (h, mbox))
                .map_err(|e| Error::ConnectionFailed(e.to_string()))
        });
        match connected {
            Ok((handle, mbox)) => {
                inner.gni_ep = Some(handle);
                inner.peer_mbox = mbox;
                inner.state = VcState::Connected;
                log::debug!(
                    "vc {} connected to {}, mbox {:#x}, {} queued",
                    self.id,
                    self.peer,
                    mbox,
                    inner.send_queue.len()
                );
                Vec::new()
            }
            Err(e) => self.fail_connection(&mut inner, e),
        }
    }

    /// Posts from the head of the send queue and collects, in submission
    /// order, the requests that are complete. Returns the chunks posted.
    pub(crate) fn progress_tx(self: &Arc<Self>, params: &TxParams, done: &mut Vec<FabReq>) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut posted = 0;
        loop {
            let Some(req) = inner.send_queue.front_mut() else {
                break;
            };
            let retire = if req.error.is_some() {
                // Canceled or failed; nothing more to post.
                true
            } else {
                let Some(gni_ep) = inner.gni_ep else { break };
                if !matches!(inner.state, VcState::Connected | VcState::Terminating)
                    || posted >= params.budget
                {
                    break;
                }
                if req.backoff > 0 {
                    req.backoff -= 1;
                    break;
                }
                let Some(kind) = req.kind.op_kind() else {
                    req.fail(Error::inval("receive queued for transmit"));
                    retire_head(inner);
                    continue;
                };

                let chunk = req.next_chunk(params.max_chunk);
                let op_id = self.nic.register_pending(Arc::downgrade(self), req.id);
                let offset = req.offset();
                let desc = OpDescriptor {
                    op_id,
                    kind,
                    ep: gni_ep,
                    local_addr: req.cur_pos,
                    len: chunk,
                    remote_addr: req.rma.map_or(0, |r| r.addr + offset as u64),
                    rkey: req.rma.map_or(0, |r| r.key),
                    tag: req.tag,
                    imm: req.imm,
                    msg_seq: req.msg_seq,
                    offset,
                    total_len: req.len,
                };
                match self.nic.driver().post_operation(self.nic.handle(), &desc) {
                    Ok(PostOutcome::Posted) => {
                        req.advance(chunk);
                        req.retries = 0;
                        posted += 1;
                        req.fully_posted()
                    }
                    Ok(PostOutcome::Backpressure) => {
                        self.nic.forget_pending(op_id);
                        if !req.modes.contains(ReqModes::REPLAYABLE)
                            || req.retries >= params.max_retries
                        {
                            log::warn!(
                                "vc {}: request {} failed after {} retries",
                                self.id,
                                req.id,
                                req.retries
                            );
                            req.fail(Error::TransientResource(req.retries));
                            true
                        } else {
                            req.note_backpressure(params.backoff_cap);
                            log::debug!(
                                "vc {}: backpressure on request {}, retry {} in {} calls",
                                self.id,
                                req.id,
                                req.retries,
                                req.backoff
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        self.nic.forget_pending(op_id);
                        req.fail(Error::Driver(e));
                        true
                    }
                }
            };

            if retire {
                retire_head(inner);
            }
        }

        self.flush(inner, done);
        posted
    }

    /// Hands out finished requests from the head of the active list.
    fn flush(&self, inner: &mut VcInner, done: &mut Vec<FabReq>) {
        while inner.active.front().map_or(false, FabReq::is_done) {
            if let Some(mut req) = inner.active.pop_front() {
                req.modes.remove(ReqModes::IN_ACTIVE_LIST);
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                done.push(req);
            }
        }
        if inner.state == VcState::Terminating && self.outstanding() == 0 {
            self.terminate(inner);
        }
    }

    fn terminate(&self, inner: &mut VcInner) {
        if let Some(handle) = inner.gni_ep.take() {
            self.nic.driver().destroy_ep(handle);
        }
        inner.state = VcState::Terminated;
        log::debug!(
            "vc {} to {} terminated, mbox {:#x} released",
            self.id,
            self.peer,
            inner.peer_mbox
        );
    }

    /// Accounts for one completed chunk of request `req_id`.
    pub(crate) fn on_tx_complete(
        &self,
        req_id: u64,
        status: std::result::Result<(), DriverError>,
        done: &mut Vec<FabReq>,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let req = inner
            .active
            .iter_mut()
            .chain(inner.send_queue.iter_mut())
            .find(|r| r.id == req_id);
        match req {
            Some(req) => {
                req.chunks_in_flight = req.chunks_in_flight.saturating_sub(1);
                if let Err(e) = status {
                    req.fail(Error::Driver(e));
                }
            }
            None => log::warn!("vc {}: completion for unknown request {}", self.id, req_id),
        }
        self.flush(inner, done);
    }

    /// Marks a queued request with no chunk posted as canceled. It completes,
    /// in order, on a later progress call.
    pub(crate) fn cancel(&self, context: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .send_queue
            .iter_mut()
            .find(|r| r.context == context && r.chunks_posted == 0 && r.error.is_none())
        {
            Some(req) => {
                req.fail(Error::Canceled);
                true
            }
            None => false,
        }
    }

    /// Tears the connection down. A connection that never came up ends at
    /// once and its queued requests are returned canceled; a live one drains
    /// its queue first.
    pub(crate) fn shutdown(&self, cm_nic: &CmNic) -> Vec<FabReq> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.state {
            VcState::None | VcState::Connecting => {
                if let Some(id) = inner.dgram.take() {
                    cm_nic.cancel(id);
                }
                inner.state = VcState::Terminated;
                let mut canceled: Vec<FabReq> = inner.send_queue.drain(..).collect();
                for req in canceled.iter_mut() {
                    req.fail(Error::Canceled);
                }
                self.outstanding.fetch_sub(canceled.len(), Ordering::AcqRel);
                canceled
            }
            VcState::Connected => {
                inner.state = VcState::Terminating;
                let mut done = Vec::new();
                self.flush(inner, &mut done);
                done
            }
            VcState::Terminating | VcState::Terminated => Vec::new(),
        }
    }

    /// Ends the connection without waiting for the device. Requests still
    /// queued or in flight complete canceled, in submission order; late
    /// device completions for them are dropped.
    pub(crate) fn abort(&self) -> Vec<FabReq> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut aborted: Vec<FabReq> = inner
            .active
            .drain(..)
            .chain(inner.send_queue.drain(..))
            .collect();
        for req in aborted.iter_mut() {
            req.modes.remove(ReqModes::IN_ACTIVE_LIST);
            req.chunks_in_flight = 0;
            req.fail(Error::Canceled);
        }
        self.outstanding.fetch_sub(aborted.len(), Ordering::AcqRel);
        if inner.state != VcState::Terminated {
            self.terminate(inner);
        }
        aborted
    }
}

/// Moves the head of the send queue to the active list.
fn retire_head(inner: &mut VcInner) {
    if let Some(mut req) = inner.send_queue.pop_front() {
        req.modes.insert(ReqModes::IN_ACTIVE_LIST);
        inner.active.push_back(req);
    }
}

impl Drop for Vc {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let abandoned = inner.send_queue.len() + inner.active.len();
        if abandoned > 0 {
            log::warn!("vc {} to {} dropped with {} requests", self.id, self.peer, abandoned);
        }
        if let Some(handle) = inner.gni_ep.take() {
            self.nic.driver().destroy_ep(handle);
        }
    }
}
