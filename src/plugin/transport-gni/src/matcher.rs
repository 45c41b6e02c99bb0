//! Pairing of posted receives with arriving messages.
use std::collections::VecDeque;

use fabric_api::GniAddress;

/// The matching envelope of a posted receive. The request itself stays with
/// the endpoint, keyed by `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedRecv {
    pub id: u64,
    pub context: u64,
    /// Only messages from this source match; `None` accepts any.
    pub src: Option<GniAddress>,
    pub tagged: bool,
    pub tag: u64,
    pub ignore: u64,
}

/// A fully reassembled message no receive has claimed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedMsg {
    pub src: GniAddress,
    pub tagged: bool,
    pub tag: u64,
    pub imm: Option<u64>,
    pub payload: Vec<u8>,
}

impl PostedRecv {
    pub fn matches(&self, msg: &UnexpectedMsg) -> bool {
        if self.tagged != msg.tagged {
            return false;
        }
        if self.src.map_or(false, |src| src != msg.src) {
            return false;
        }
        !self.tagged || (self.tag & !self.ignore) == (msg.tag & !self.ignore)
    }
}

pub trait TagMatcher: Send {
    /// Posts a receive. Returns the unexpected message it claims right away,
    /// if any; otherwise the receive is queued.
    fn post_recv(&mut self, recv: PostedRecv) -> Option<UnexpectedMsg>;

    /// Offers an arrived message. Returns the receive it completes, or
    /// queues it as unexpected.
    fn match_or_queue(&mut self, msg: UnexpectedMsg) -> Option<(PostedRecv, UnexpectedMsg)>;

    /// Withdraws a queued receive by its user context.
    fn cancel(&mut self, context: u64) -> Option<PostedRecv>;

    fn posted_len(&self) -> usize;

    fn unexpected_len(&self) -> usize;
}

/// First-match over two FIFO lists.
#[derive(Debug, Default)]
pub struct ListMatcher {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<UnexpectedMsg>,
}

impl ListMatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagMatcher for ListMatcher {
    fn post_recv(&mut self, recv: PostedRecv) -> Option<UnexpectedMsg> {
        match self.unexpected.iter().position(|m| recv.matches(m)) {
            Some(pos) => self.unexpected.remove(pos),
            None => {
                self.posted.push_back(recv);
                None
            }
        }
    }

    fn match_or_queue(&mut self, msg: UnexpectedMsg) -> Option<(PostedRecv, UnexpectedMsg)> {
        match self.posted.iter().position(|r| r.matches(&msg)) {
            Some(pos) => self.posted.remove(pos).map(|r| (r, msg)),
            None => {
                self.unexpected.push_back(msg);
                None
            }
        }
    }

    fn cancel(&mut self, context: u64) -> Option<PostedRecv> {
        let pos = self.posted.iter().position(|r| r.context == context)?;
        self.posted.remove(pos)
    }

    fn posted_len(&self) -> usize {
        self.posted.len()
    }

    fn unexpected_len(&self) -> usize {
        self.unexpected.len()
    }
}
