use std::collections::hash_map;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use fnv::FnvHashMap as HashMap;

/// Process-scoped registry of shared state, one instance per key.
///
/// The registry only keeps weak references: the state lives as long as some
/// user holds the `Arc` returned by [`SharedStateManager::get_or_create_with`],
/// and a later lookup after the last user went away creates a fresh instance.
pub struct SharedStateManager<K, S> {
    states: spin::Mutex<HashMap<K, Weak<S>>>,
}

impl<K: Eq + Hash, S> Default for SharedStateManager<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, S> SharedStateManager<K, S> {
    pub fn new() -> Self {
        SharedStateManager {
            states: spin::Mutex::new(HashMap::default()),
        }
    }

    /// Returns the live state for `key`, or builds one with `init`.
    ///
    /// The lookup and the insertion are performed under one lock, so two
    /// concurrent callers with the same key never both run `init`. The
    /// boolean is true when `init` ran.
    pub fn get_or_create_with<F, E>(&self, key: K, init: F) -> Result<(Arc<S>, bool), E>
    where
        F: FnOnce() -> Result<S, E>,
    {
        let mut states = self.states.lock();
        match states.entry(key) {
            hash_map::Entry::Occupied(mut entry) => {
                if let Some(state) = entry.get().upgrade() {
                    Ok((state, false))
                } else {
                    let wrapped = Arc::new(init()?);
                    entry.insert(Arc::downgrade(&wrapped));
                    Ok((wrapped, true))
                }
            }
            hash_map::Entry::Vacant(entry) => {
                let wrapped = Arc::new(init()?);
                entry.insert(Arc::downgrade(&wrapped));
                Ok((wrapped, true))
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<S>> {
        self.states.lock().get(key).and_then(Weak::upgrade)
    }

    #[inline]
    pub fn contains(&self, key: &K) -> bool {
        if let Some(state) = self.states.lock().get(key) {
            state.strong_count() > 0
        } else {
            false
        }
    }

    /// Forgets entries whose state has been dropped. Returns how many live
    /// entries remain.
    pub fn prune(&self) -> usize {
        let mut states = self.states.lock();
        states.retain(|_, s| s.strong_count() > 0);
        states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_state() {
        let mgr: SharedStateManager<(u8, u32), String> = SharedStateManager::new();
        let (a, created) = mgr
            .get_or_create_with((1, 2), || Ok::<_, ()>("first".to_owned()))
            .unwrap();
        assert!(created);
        let (b, created) = mgr
            .get_or_create_with((1, 2), || Ok::<_, ()>("second".to_owned()))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, "first");
    }

    #[test]
    fn dropped_state_is_recreated() {
        let mgr: SharedStateManager<u32, u32> = SharedStateManager::new();
        let (a, _) = mgr.get_or_create_with(7, || Ok::<_, ()>(1)).unwrap();
        assert!(mgr.contains(&7));
        drop(a);
        assert!(!mgr.contains(&7));
        assert_eq!(mgr.prune(), 0);
        let (b, created) = mgr.get_or_create_with(7, || Ok::<_, ()>(2)).unwrap();
        assert!(created);
        assert_eq!(*b, 2);
    }

    #[test]
    fn failed_init_leaves_no_entry() {
        let mgr: SharedStateManager<u32, u32> = SharedStateManager::new();
        let res = mgr.get_or_create_with(3, || Err::<u32, _>("no device"));
        assert_eq!(res.err(), Some("no device"));
        assert!(mgr.get(&3).is_none());
    }
}
