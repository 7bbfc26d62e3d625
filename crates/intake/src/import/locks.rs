use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Process-wide registry of per-user import locks.
///
/// The backing store's session model is not re-entrant per user, so at
/// most one import worker may run for a given owner at a time. Locks
/// for different owners are independent.
#[derive(Default)]
pub struct ImportLockRegistry {
    locks: Mutex<HashMap<String, Arc<UserLock>>>,
}

#[derive(Default)]
struct UserLock {
    busy: Mutex<bool>,
    freed: Condvar,
}

/// Held for the duration of one import run; released on drop.
pub struct ImportLockGuard {
    lock: Arc<UserLock>,
}

impl Drop for ImportLockGuard {
    fn drop(&mut self) {
        let mut busy = self.lock.busy.lock().unwrap();
        *busy = false;
        self.lock.freed.notify_one();
    }
}

impl ImportLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for the user's lock. `None` means a prior
    /// import is still holding it past the deadline.
    pub fn acquire(&self, user: &str, timeout: Duration) -> Option<ImportLockGuard> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(locks.entry(user.to_string()).or_default())
        };

        let deadline = Instant::now() + timeout;
        let mut busy = lock.busy.lock().unwrap();
        while *busy {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, wait) = lock.freed.wait_timeout(busy, remaining).unwrap();
            busy = guard;
            if wait.timed_out() && *busy {
                return None;
            }
        }
        *busy = true;
        drop(busy);

        Some(ImportLockGuard { lock })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_free_lock() {
        let registry = ImportLockRegistry::new();
        let guard = registry.acquire("alice", Duration::from_millis(10));
        assert!(guard.is_some());
    }

    #[test]
    fn test_second_acquire_times_out_while_held() {
        let registry = ImportLockRegistry::new();
        let _held = registry.acquire("alice", Duration::from_millis(10)).unwrap();
        assert!(registry.acquire("alice", Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_drop_releases_for_next_acquirer() {
        let registry = ImportLockRegistry::new();
        {
            let _held = registry.acquire("alice", Duration::from_millis(10)).unwrap();
        }
        assert!(registry.acquire("alice", Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_users_do_not_contend_with_each_other() {
        let registry = ImportLockRegistry::new();
        let _alice = registry.acquire("alice", Duration::from_millis(10)).unwrap();
        assert!(registry.acquire("bob", Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_waiter_proceeds_once_holder_drops() {
        let registry = Arc::new(ImportLockRegistry::new());
        let held = registry.acquire("alice", Duration::from_millis(10)).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.acquire("alice", Duration::from_secs(5)).is_some())
        };

        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
