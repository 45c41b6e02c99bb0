use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use fabric_api::attr::WaitObj;

/// A blocking wait object shared by a completion queue and the threads
/// sleeping on it. Signals are counted, so a signal that lands between a
/// check and the sleep is not lost.
#[derive(Debug)]
pub struct WaitObject {
    kind: WaitObj,
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitObject {
    pub fn new(kind: WaitObj) -> Self {
        WaitObject {
            kind,
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> WaitObj {
        self.kind
    }

    /// The current generation, to be passed to [`WaitObject::wait_since`].
    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn signal(&self) {
        let mut gen = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        *gen = gen.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Sleeps until a signal newer than `seen` arrives or `timeout` passes.
    /// Returns whether a signal arrived.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gen = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        while *gen == seen {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            gen = match self.cond.wait_timeout(gen, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn signal_before_wait_is_not_lost() {
        let w = WaitObject::new(WaitObj::MutexCond);
        let seen = w.generation();
        w.signal();
        assert!(w.wait_since(seen, Duration::from_millis(1)));
    }

    #[test]
    fn wakes_a_sleeping_thread() {
        let w = Arc::new(WaitObject::new(WaitObj::MutexCond));
        let seen = w.generation();
        let waiter = {
            let w = Arc::clone(&w);
            std::thread::spawn(move || w.wait_since(seen, Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(10));
        w.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn times_out_without_signal() {
        let w = WaitObject::new(WaitObj::MutexCond);
        assert!(!w.wait_since(w.generation(), Duration::from_millis(5)));
    }
}
