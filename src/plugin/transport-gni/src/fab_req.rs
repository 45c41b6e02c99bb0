//! Fabric requests: one per user operation, carried through the virtual
//! connection until their last chunk completes.
use bitflags::bitflags;

use fabric_api::flags::{BindFlags, CompletionFlags};
use fabric_api::GniAddress;

use crate::driver::OpKind;
use crate::matcher::UnexpectedMsg;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FabReqType {
    Send,
    TSend,
    RdmaWrite,
    RdmaWriteImmData,
    RdmaRead,
    Recv,
    TRecv,
}

impl FabReqType {
    #[inline]
    pub(crate) fn is_recv(&self) -> bool {
        matches!(self, FabReqType::Recv | FabReqType::TRecv)
    }

    pub(crate) fn op_kind(&self) -> Option<OpKind> {
        match self {
            FabReqType::Send => Some(OpKind::Msg),
            FabReqType::TSend => Some(OpKind::Tagged),
            FabReqType::RdmaWrite | FabReqType::RdmaWriteImmData => Some(OpKind::RdmaWrite),
            FabReqType::RdmaRead => Some(OpKind::RdmaRead),
            FabReqType::Recv | FabReqType::TRecv => None,
        }
    }

    pub(crate) fn completion_flags(&self) -> CompletionFlags {
        match self {
            FabReqType::Send => CompletionFlags::MSG | CompletionFlags::SEND,
            FabReqType::TSend => CompletionFlags::TAGGED | CompletionFlags::SEND,
            FabReqType::RdmaWrite | FabReqType::RdmaWriteImmData => {
                CompletionFlags::RMA | CompletionFlags::WRITE
            }
            FabReqType::RdmaRead => CompletionFlags::RMA | CompletionFlags::READ,
            FabReqType::Recv => CompletionFlags::MSG | CompletionFlags::RECV,
            FabReqType::TRecv => CompletionFlags::TAGGED | CompletionFlags::RECV,
        }
    }

    /// The counter class the completion is reported to.
    pub(crate) fn counter_class(&self) -> BindFlags {
        match self {
            FabReqType::Send | FabReqType::TSend => BindFlags::SEND,
            FabReqType::RdmaWrite | FabReqType::RdmaWriteImmData => BindFlags::WRITE,
            FabReqType::RdmaRead => BindFlags::READ,
            FabReqType::Recv | FabReqType::TRecv => BindFlags::RECV,
        }
    }
}

bitflags! {
    #[derive(Default)]
    pub(crate) struct ReqModes: u32 {
        const IN_ACTIVE_LIST = 1 << 0;
        const REPLAYABLE = 1 << 1;
        const UNEXPECTED = 1 << 2;
        const MATCHED = 1 << 3;
        const INJECT_DATA = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RmaTarget {
    pub(crate) addr: u64,
    pub(crate) key: u64,
}

#[derive(Debug)]
pub(crate) struct FabReq {
    pub(crate) id: u64,
    pub(crate) kind: FabReqType,
    pub(crate) context: u64,
    pub(crate) buf: usize,
    /// Next byte to post. Stays within `[buf, buf + len]`.
    pub(crate) cur_pos: usize,
    pub(crate) len: usize,
    pub(crate) imm: Option<u64>,
    pub(crate) tag: u64,
    pub(crate) ignore: u64,
    pub(crate) rma: Option<RmaTarget>,
    /// Directed receive source.
    pub(crate) src: Option<GniAddress>,
    pub(crate) modes: ReqModes,
    pub(crate) msg_seq: u64,
    /// Consecutive backpressure answers.
    pub(crate) retries: u32,
    /// Progress calls to sit out before the next post.
    pub(crate) backoff: u32,
    pub(crate) chunks_posted: u32,
    pub(crate) chunks_in_flight: u32,
    pub(crate) matched: Option<UnexpectedMsg>,
    /// Bytes delivered into a receive buffer.
    pub(crate) received: usize,
    /// Bytes of a message that did not fit the receive buffer.
    pub(crate) olen: usize,
    pub(crate) error: Option<Error>,
    // Heap copy backing `buf` for injected requests; never touched directly.
    _inject: Option<Box<[u8]>>,
}

impl FabReq {
    pub(crate) fn new(id: u64, kind: FabReqType, context: u64, buf: usize, len: usize) -> Self {
        FabReq {
            id,
            kind,
            context,
            buf,
            cur_pos: buf,
            len,
            imm: None,
            tag: 0,
            ignore: 0,
            rma: None,
            src: None,
            modes: ReqModes::empty(),
            msg_seq: 0,
            retries: 0,
            backoff: 0,
            chunks_posted: 0,
            chunks_in_flight: 0,
            matched: None,
            received: 0,
            olen: 0,
            error: None,
            _inject: None,
        }
    }

    /// Builds a request over a private copy of `data`, so the caller's
    /// buffer can be reused as soon as submission returns.
    pub(crate) fn new_inject(id: u64, kind: FabReqType, context: u64, data: &[u8]) -> Self {
        let copy: Box<[u8]> = data.into();
        let mut req = Self::new(id, kind, context, copy.as_ptr() as usize, copy.len());
        req._inject = Some(copy);
        req.modes |= ReqModes::INJECT_DATA;
        req
    }

    pub(crate) fn with_tag(mut self, tag: u64, ignore: u64) -> Self {
        self.tag = tag;
        self.ignore = ignore;
        self
    }

    pub(crate) fn with_imm(mut self, imm: u64) -> Self {
        self.imm = Some(imm);
        self
    }

    pub(crate) fn with_rma(mut self, addr: u64, key: u64) -> Self {
        self.rma = Some(RmaTarget { addr, key });
        self
    }

    pub(crate) fn with_src(mut self, src: Option<GniAddress>) -> Self {
        self.src = src;
        self
    }

    pub(crate) fn replayable(mut self, yes: bool) -> Self {
        self.modes.set(ReqModes::REPLAYABLE, yes);
        self
    }

    #[inline]
    fn end(&self) -> usize {
        self.buf + self.len
    }

    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.cur_pos - self.buf
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.end() - self.cur_pos
    }

    /// Size of the next chunk, capped at `max_chunk`.
    #[inline]
    pub(crate) fn next_chunk(&self, max_chunk: usize) -> usize {
        self.remaining().min(max_chunk)
    }

    /// Moves the cursor past a posted chunk.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.cur_pos = (self.cur_pos + n).min(self.end());
        self.chunks_posted += 1;
        self.chunks_in_flight += 1;
    }

    /// Every byte has been handed to the device. A zero-length transfer
    /// still needs one post.
    #[inline]
    pub(crate) fn fully_posted(&self) -> bool {
        self.cur_pos == self.end() && self.chunks_posted > 0
    }

    /// Nothing more will be posted and nothing is in flight.
    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.chunks_in_flight == 0 && (self.error.is_some() || self.fully_posted())
    }

    /// Records the first failure; later ones are dropped.
    pub(crate) fn fail(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Computes the backoff after a backpressure answer: the k-th
    /// consecutive one pauses `min(2^(k-1), cap)` progress calls.
    pub(crate) fn note_backpressure(&mut self, cap: u32) {
        self.retries += 1;
        let exp = self.retries.saturating_sub(1).min(31);
        self.backoff = (1u32 << exp).min(cap.max(1));
    }

    /// Copies a matched message into the receive buffer.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes.
    pub(crate) unsafe fn deliver(&mut self, msg: &UnexpectedMsg) {
        let n = msg.payload.len().min(self.len);
        if n > 0 {
            std::ptr::copy_nonoverlapping(msg.payload.as_ptr(), self.buf as *mut u8, n);
        }
        self.received = n;
        self.olen = msg.payload.len() - n;
        self.imm = msg.imm;
        self.tag = msg.tag;
        if self.olen > 0 {
            self.fail(Error::Truncated(self.olen));
        }
    }
}
