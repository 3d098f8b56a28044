use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Process-unique, non-zero identifier for sockets, pipes, endpoints, AIO
/// handles and the rest.
pub(crate) fn next_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);

    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The open-to-closed gate every resource carries.
///
/// Only the caller that flips it performs teardown; all later callers see
/// `false`.
#[derive(Debug)]
pub(crate) struct OpenFlag(AtomicBool);

impl OpenFlag {
    pub(crate) const fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Maps stable keys to weakly held state.
///
/// Lookups go through here wherever holding a strong reference would either
/// keep a resource alive past its last host handle or form a cycle (pipe
/// callbacks back to their socket, inproc peers, AIO origins).
pub(crate) struct Registry<K, T> {
    entries: Mutex<BTreeMap<K, Weak<T>>>,
}

impl<K, T> Registry<K, T>
where
    K: Ord,
{
    pub(crate) const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn insert(&self, key: K, value: &Arc<T>) {
        let mut entries = self.entries.lock().unwrap();

        entries.retain(|_, entry| entry.strong_count() > 0);
        entries.insert(key, Arc::downgrade(value));
    }

    /// Inserts unless a live entry satisfying `occupied` already holds `key`.
    pub(crate) fn insert_vacant<F>(&self, key: K, value: &Arc<T>, occupied: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        let mut entries = self.entries.lock().unwrap();

        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            if occupied(&existing) {
                return false;
            }
        }

        entries.insert(key, Arc::downgrade(value));

        true
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<T>> {
        self.entries.lock().unwrap().get(key).and_then(Weak::upgrade)
    }

    /// Removes `key` only if it still refers to `value`.
    pub(crate) fn remove(&self, key: &K, value: &Arc<T>) -> bool {
        let mut entries = self.entries.lock().unwrap();

        let current = entries
            .get(key)
            .is_some_and(|entry| core::ptr::eq(entry.as_ptr(), Arc::as_ptr(value)));

        if current {
            entries.remove(key);
        }

        current
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn open_flag_closes_once_across_threads() {
        let flag = Arc::new(OpenFlag::new());

        let handles = (0..8)
            .map(|_| {
                let flag = flag.clone();
                thread::spawn(move || flag.close())
            })
            .collect::<Vec<_>>();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert!(!flag.is_open());
    }

    #[test]
    fn lookups_fail_gracefully_after_drop() {
        let registry = Registry::<u32, String>::new();

        let value = Arc::new("socket".to_string());
        registry.insert(7, &value);
        assert_eq!(registry.get(&7).as_deref(), Some(&"socket".to_string()));

        drop(value);
        assert!(registry.get(&7).is_none());
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn vacant_insert_respects_live_entries() {
        let registry = Registry::<&str, u32>::new();

        let first = Arc::new(1);
        let second = Arc::new(2);
        assert!(registry.insert_vacant("a", &first, |_| true));
        assert!(!registry.insert_vacant("a", &second, |_| true));
        assert!(registry.insert_vacant("a", &second, |_| false));

        assert!(!registry.remove(&"a", &first));
        assert!(registry.remove(&"a", &second));
    }
}
