use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use fabric_api::attr::{CqAttr, CqFormat, WaitObj};
use fabric_api::cq::{CqEntry, CqErrEntry};
use fabric_common::log;
use fabric_common::resource::RefCount;

use crate::domain::{Domain, DomainShared};
use crate::nic::{Nic, PollList};
use crate::wait::WaitObject;
use crate::{Error, Result};

/// Longest single sleep of a blocking read. Progress only happens while some
/// thread reads, so a sleeper has to come back and drive it.
const SREAD_SLICE: Duration = Duration::from_millis(1);

#[derive(Default)]
struct CqQueues {
    entries: VecDeque<CqEntry>,
    errors: VecDeque<CqErrEntry>,
}

pub(crate) struct CqShared {
    domain: Arc<DomainShared>,
    format: CqFormat,
    size: usize,
    wait: Option<Arc<WaitObject>>,
    queues: spin::Mutex<CqQueues>,
    poll: PollList,
    overruns: AtomicU64,
    pub(crate) refs: RefCount,
    context: u64,
}

/// Keeps the fields the queue's format exposes.
fn format_entry(format: CqFormat, entry: CqEntry) -> CqEntry {
    let mut out = CqEntry {
        op_context: entry.op_context,
        ..Default::default()
    };
    if matches!(format, CqFormat::Msg | CqFormat::Data | CqFormat::Tagged) {
        out.flags = entry.flags;
        out.len = entry.len;
    }
    if matches!(format, CqFormat::Data | CqFormat::Tagged) {
        out.buf = entry.buf;
        out.data = entry.data;
    }
    if format == CqFormat::Tagged {
        out.tag = entry.tag;
    }
    out
}

impl CqShared {
    pub(crate) fn push(&self, entry: CqEntry) {
        let entry = format_entry(self.format, entry);
        {
            let mut queues = self.queues.lock();
            if queues.entries.len() >= self.size {
                let n = self.overruns.fetch_add(1, Ordering::AcqRel) + 1;
                log::warn!("cq {:#x} overrun ({} so far)", self.context, n);
            }
            queues.entries.push_back(entry);
        }
        self.signal();
    }

    pub(crate) fn push_error(&self, entry: CqErrEntry) {
        self.queues.lock().errors.push_back(entry);
        self.signal();
    }

    #[inline]
    fn signal(&self) {
        if let Some(wait) = &self.wait {
            wait.signal();
        }
    }

    pub(crate) fn register_nic(&self, nic: &Arc<Nic>) {
        self.poll.add(nic);
    }

    pub(crate) fn deregister_nic(&self, nic: &Nic) -> Result<()> {
        self.poll.remove(nic)
    }

    /// Drops a binding's reference, finishing a close left pending by a
    /// dropped `CompletionQueue`.
    pub(crate) fn release(&self) {
        if self.refs.release() {
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        self.domain.release();
        log::debug!("cq {:#x} closed", self.context);
    }
}

/// A completion queue. Like a counter, reading it drives progress.
pub struct CompletionQueue {
    pub(crate) shared: Arc<CqShared>,
}

impl CompletionQueue {
    pub fn open(domain: &Domain, attr: &CqAttr, context: u64) -> Result<Self> {
        let wait = match attr.wait_obj {
            WaitObj::None => None,
            WaitObj::Unspec | WaitObj::MutexCond => {
                Some(Arc::new(WaitObject::new(WaitObj::MutexCond)))
            }
            other => {
                log::warn!("wait type {:?} unsupported on completion queues", other);
                return Err(Error::inval(format!("wait type {:?} unsupported", other)));
            }
        };
        let format = match attr.format {
            CqFormat::Unspec => CqFormat::Context,
            f => f,
        };
        let size = match attr.size {
            0 => domain.shared.config().cq_size,
            n => n,
        };
        domain.shared.refs.open()?;
        Ok(CompletionQueue {
            shared: Arc::new(CqShared {
                domain: Arc::clone(&domain.shared),
                format,
                size,
                wait,
                queues: spin::Mutex::new(CqQueues::default()),
                poll: PollList::default(),
                overruns: AtomicU64::new(0),
                refs: RefCount::new(),
                context,
            }),
        })
    }

    /// Reads up to `max` entries. Fails with error-available while an
    /// error entry is pending, and with would-block when nothing is there.
    pub fn read(&self, max: usize) -> Result<Vec<CqEntry>> {
        self.shared.poll.progress();
        let mut queues = self.shared.queues.lock();
        if !queues.errors.is_empty() {
            return Err(Error::Available);
        }
        if queues.entries.is_empty() {
            return Err(Error::Again);
        }
        let n = max.min(queues.entries.len());
        Ok(queues.entries.drain(..n).collect())
    }

    pub fn read_error(&self) -> Result<CqErrEntry> {
        self.shared.poll.progress();
        self.shared.queues.lock().errors.pop_front().ok_or(Error::Again)
    }

    /// Blocking read. Sleeps on the wait object when the queue has one and
    /// spins with backoff otherwise.
    pub fn sread(&self, max: usize, timeout: Duration) -> Result<Vec<CqEntry>> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            let seen = self.shared.wait.as_ref().map(|w| w.generation());
            match self.read(max) {
                Err(Error::Again) => {}
                other => return other,
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            match (&self.shared.wait, seen) {
                (Some(wait), Some(seen)) => {
                    wait.wait_since(seen, SREAD_SLICE.min(deadline - now));
                }
                _ if backoff.is_completed() => std::thread::yield_now(),
                _ => backoff.snooze(),
            }
        }
    }

    /// Wakes threads blocked in [`CompletionQueue::sread`].
    pub fn signal(&self) {
        self.shared.signal();
    }

    #[inline]
    pub fn format(&self) -> CqFormat {
        self.shared.format
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.size
    }

    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        self.shared.refs.get()
    }

    pub fn close(&self) -> Result<()> {
        self.shared.refs.try_close()?;
        self.shared.finish_close();
        Ok(())
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        match self.shared.refs.close_when_released() {
            Ok(true) => self.shared.finish_close(),
            Ok(false) => log::debug!(
                "cq {:#x} dropped while bound, closes with its last endpoint",
                self.shared.context
            ),
            Err(_) => {}
        }
    }
}
