//! Keyed FIFO ticket lock
//!
//! Lock and unlock are explicit calls on a key rather than a guard tied to a
//! stack frame, so a lock taken on behalf of a remote node can be released by
//! a later request. [`TicketLock::guard`] wraps the pair for local callers.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

/// Per-key ticket lock granting the key in request order
#[derive(Debug)]
pub struct TicketLock<K> {
    tickets: Mutex<HashMap<K, Tickets>>,
    turn: Condvar,
}

impl<K: Eq + Hash + Copy> Default for TicketLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Copy> TicketLock<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            turn: Condvar::new(),
        }
    }

    /// Block until `key` is held by the caller
    pub fn lock(&self, key: K) {
        let mut tickets = self.tickets.lock();
        let entry = tickets.entry(key).or_default();
        let ticket = entry.next;
        entry.next += 1;

        while tickets.get(&key).is_some_and(|t| t.serving != ticket) {
            self.turn.wait(&mut tickets);
        }
    }

    /// Release `key`; returns false when it was not held
    pub fn unlock(&self, key: K) -> bool {
        let mut tickets = self.tickets.lock();
        let Some(entry) = tickets.get_mut(&key) else {
            return false;
        };
        entry.serving += 1;
        if entry.serving == entry.next {
            tickets.remove(&key);
        }
        drop(tickets);
        self.turn.notify_all();
        true
    }

    /// Whether someone holds or waits for `key`
    #[must_use]
    pub fn is_locked(&self, key: K) -> bool {
        self.tickets.lock().contains_key(&key)
    }

    /// Lock `key` until the guard is dropped
    pub fn guard(&self, key: K) -> TicketGuard<'_, K> {
        self.lock(key);
        TicketGuard { lock: self, key }
    }
}

/// Releases its key on drop
#[must_use]
pub struct TicketGuard<'a, K: Eq + Hash + Copy> {
    lock: &'a TicketLock<K>,
    key: K,
}

impl<K: Eq + Hash + Copy> Drop for TicketGuard<'_, K> {
    fn drop(&mut self) {
        self.lock.unlock(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_unlock() {
        let lock = TicketLock::new();
        lock.lock(1u64);
        assert!(lock.is_locked(1));
        assert!(!lock.is_locked(2));
        assert!(lock.unlock(1));
        assert!(!lock.is_locked(1));
        assert!(!lock.unlock(1));
    }

    #[test]
    fn test_guard_releases() {
        let lock = TicketLock::new();
        {
            let _guard = lock.guard(7u32);
            assert!(lock.is_locked(7));
        }
        assert!(!lock.is_locked(7));
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(TicketLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = lock.guard(42u64);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!lock.is_locked(42));
    }

    #[test]
    fn test_unlock_from_other_thread() {
        let lock = Arc::new(TicketLock::new());
        lock.lock(5u64);

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock(5u64);
                lock.unlock(5u64);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        let releaser = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || assert!(lock.unlock(5u64)))
        };
        releaser.join().unwrap();
        waiter.join().unwrap();
        assert!(!lock.is_locked(5));
    }
}
