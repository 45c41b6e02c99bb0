use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use fabric_api::attr::{CntrAttr, CntrEvents, WaitObj};
use fabric_common::log;
use fabric_common::resource::RefCount;

use crate::domain::{Domain, DomainShared};
use crate::nic::{Nic, PollList};
use crate::wait::WaitObject;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CntrControl {
    GetOpsFlag,
    SetOpsFlag(u64),
    GetWait,
}

pub(crate) struct CntrShared {
    domain: Arc<DomainShared>,
    cnt: AtomicU64,
    cnt_err: AtomicU64,
    flags: AtomicU64,
    wait: Option<Arc<WaitObject>>,
    poll: PollList,
    pub(crate) refs: RefCount,
    context: u64,
}

impl CntrShared {
    pub(crate) fn increment(&self) {
        self.cnt.fetch_add(1, Ordering::AcqRel);
        self.signal();
    }

    pub(crate) fn increment_error(&self) {
        self.cnt_err.fetch_add(1, Ordering::AcqRel);
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

    fn progress(&self) {
        self.poll.progress();
    }

    /// Drops a binding's reference, finishing a close left pending by a
    /// dropped `Counter`.
    pub(crate) fn release(&self) {
        if self.refs.release() {
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        self.domain.release();
        log::debug!("counter {:#x} closed", self.context);
    }
}

fn verify_attr(attr: &CntrAttr) -> Result<()> {
    if attr.events != CntrEvents::Completion {
        return Err(Error::inval(format!(
            "unsupported counter events {:?}",
            attr.events
        )));
    }
    match attr.wait_obj {
        WaitObj::None | WaitObj::Unspec => Ok(()),
        other => {
            log::warn!("wait type {:?} unsupported on counters", other);
            Err(Error::inval(format!("wait type {:?} unsupported", other)))
        }
    }
}

/// A completion counter. Reading it drives progress on every NIC of the
/// endpoints bound to it.
pub struct Counter {
    pub(crate) shared: Arc<CntrShared>,
}

impl Counter {
    pub fn open(domain: &Domain, attr: &CntrAttr, context: u64) -> Result<Self> {
        verify_attr(attr)?;
        domain.shared.refs.open()?;
        Ok(Counter {
            shared: Arc::new(CntrShared {
                domain: Arc::clone(&domain.shared),
                cnt: AtomicU64::new(0),
                cnt_err: AtomicU64::new(0),
                flags: AtomicU64::new(attr.flags),
                // Unspec maps to no wait object.
                wait: None,
                poll: PollList::default(),
                refs: RefCount::new(),
                context,
            }),
        })
    }

    pub fn read(&self) -> u64 {
        self.shared.progress();
        self.shared.cnt.load(Ordering::Acquire)
    }

    pub fn read_error(&self) -> u64 {
        self.shared.progress();
        self.shared.cnt_err.load(Ordering::Acquire)
    }

    pub fn increment(&self) {
        self.shared.increment();
    }

    pub fn increment_error(&self) {
        self.shared.increment_error();
    }

    pub fn add(&self, value: u64) {
        self.shared.cnt.fetch_add(value, Ordering::AcqRel);
        self.shared.signal();
    }

    pub fn set(&self, value: u64) {
        self.shared.cnt.store(value, Ordering::Release);
        self.shared.signal();
    }

    /// Drives progress until the count reaches `threshold`. Fails with
    /// error-available if the error count moves meanwhile, and with timeout
    /// once `timeout` has passed.
    pub fn wait(&self, threshold: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let errors = self.shared.cnt_err.load(Ordering::Acquire);
        let backoff = Backoff::new();
        loop {
            self.shared.progress();
            if self.shared.cnt.load(Ordering::Acquire) >= threshold {
                return Ok(());
            }
            if self.shared.cnt_err.load(Ordering::Acquire) != errors {
                return Err(Error::Available);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn control(&self, cmd: CntrControl) -> Result<u64> {
        match cmd {
            CntrControl::GetOpsFlag => Ok(self.shared.flags.load(Ordering::Acquire)),
            CntrControl::SetOpsFlag(flags) => {
                self.shared.flags.store(flags, Ordering::Release);
                Ok(flags)
            }
            CntrControl::GetWait => match &self.shared.wait {
                Some(wait) => Ok(wait.generation()),
                None => Err(Error::inval("counter has no wait object")),
            },
        }
    }

    #[inline]
    pub fn context(&self) -> u64 {
        self.shared.context
    }

    /// Endpoints currently bound to the counter.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.shared.refs.get()
    }

    /// NICs the counter drives when read.
    pub fn poll_nics(&self) -> usize {
        self.shared.poll.len()
    }

    /// Fails with resource-busy while an endpoint is bound to the counter.
    pub fn close(&self) -> Result<()> {
        self.shared.refs.try_close()?;
        self.shared.finish_close();
        Ok(())
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        match self.shared.refs.close_when_released() {
            Ok(true) => self.shared.finish_close(),
            Ok(false) => log::debug!(
                "counter {:#x} dropped while bound, closes with its last endpoint",
                self.shared.context
            ),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completion_events_without_wait() {
        let ok = |wait_obj| CntrAttr {
            wait_obj,
            ..Default::default()
        };
        assert!(verify_attr(&ok(WaitObj::None)).is_ok());
        assert!(verify_attr(&ok(WaitObj::Unspec)).is_ok());
        for bad in [WaitObj::Fd, WaitObj::MutexCond, WaitObj::Set] {
            assert!(matches!(
                verify_attr(&ok(bad)),
                Err(Error::InvalidArgument(_))
            ));
        }
        let other = CntrAttr {
            events: CntrEvents::Other(1),
            ..Default::default()
        };
        assert!(verify_attr(&other).is_err());
    }
}
