//! Per-(attribute, scope) locks for uniqueness checks
//!
//! A uniqueness check and the index write that follows it must not
//! interleave with another check of the same attribute in the same scope.
//! Each (attribute, scope) pair gets its own mutex, created on first use.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RawMutex};
use parking_lot::lock_api::ArcMutexGuard;

/// Scope name used for globally unique attributes
pub const GLOBAL_SCOPE: &str = "";

/// Guard held while checking and writing one unique value
pub type ScopeGuard = ArcMutexGuard<RawMutex, ()>;

/// Lock registry keyed by (lowercased attribute name, normalized scope DN)
#[derive(Debug, Default)]
pub struct ScopeLocks {
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl ScopeLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock of one (attribute, scope) pair
    pub fn lock(&self, attribute: &str, scope: &str) -> ScopeGuard {
        let key = (attribute.to_ascii_lowercase(), scope.to_string());
        let lock = Arc::clone(self.locks.entry(key).or_default().value());
        lock.lock_arc()
    }

    /// Acquire the locks of several scopes of one attribute
    ///
    /// Scopes are locked in sorted order so that concurrent callers cannot
    /// deadlock.
    pub fn lock_all<'a>(
        &self,
        attribute: &str,
        scopes: impl IntoIterator<Item = &'a str>,
    ) -> Vec<ScopeGuard> {
        let mut scopes: Vec<&str> = scopes.into_iter().collect();
        scopes.sort_unstable();
        scopes.dedup();
        scopes
            .into_iter()
            .map(|scope| self.lock(attribute, scope))
            .collect()
    }

    /// Number of distinct (attribute, scope) pairs seen
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no lock was ever taken
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_pair_shares_lock() {
        let locks = ScopeLocks::new();
        drop(locks.lock("UID", GLOBAL_SCOPE));
        drop(locks.lock("uid", GLOBAL_SCOPE));
        assert_eq!(locks.len(), 1);
        drop(locks.lock("uid", "ou=a,dc=x"));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_lock_all_dedups_scopes() {
        let locks = ScopeLocks::new();
        let guards = locks.lock_all("mail", ["ou=b", "ou=a", "ou=b"]);
        assert_eq!(guards.len(), 2);
    }

    #[test]
    fn test_lock_excludes_concurrent_holders() {
        let locks = Arc::new(ScopeLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _g = locks.lock("uid", GLOBAL_SCOPE);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
