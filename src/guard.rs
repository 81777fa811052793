//! Per-container "update in progress" leases.
//!
//! [`InFlightGuard::try_acquire`] is a non-blocking test-and-set keyed by
//! container identity. The returned [`Lease`] releases the marker when it is
//! dropped, which also covers early returns and panics unwinding through an
//! update task. Leases carry an expiry so a task that hangs forever cannot
//! keep a container busy past `ttl`; long steps call [`Lease::renew`].
//!
//! Leases live in memory only. They are lost when the process dies, and a
//! restarted daemon begins with every container free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{EngineError, Result};

#[derive(Debug)]
struct Holder {
    token: u64,
    expires_at: Instant,
}

type HolderMap = Arc<Mutex<HashMap<String, Holder>>>;

fn lock(held: &HolderMap) -> MutexGuard<'_, HashMap<String, Holder>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct InFlightGuard {
    held: HolderMap,
    ttl: Duration,
    next_token: AtomicU64,
}

impl InFlightGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            next_token: AtomicU64::new(1),
        }
    }

    /// Fails with [`EngineError::UpdateInProgress`] if a live lease exists.
    pub fn try_acquire(&self, key: &str) -> Result<Lease> {
        let now = Instant::now();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut held = lock(&self.held);
            if let Some(holder) = held.get(key) {
                if holder.expires_at > now {
                    return Err(EngineError::UpdateInProgress(key.to_string()));
                }
                warn!("Reclaiming expired update lease for {}", key);
            }
            held.insert(
                key.to_string(),
                Holder {
                    token,
                    expires_at: now + self.ttl,
                },
            );
        }
        debug!("Acquired update lease for {}", key);
        Ok(Lease {
            key: key.to_string(),
            token,
            ttl: self.ttl,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.held)
            .get(key)
            .is_some_and(|holder| holder.expires_at > Instant::now())
    }

    /// Keys with a live lease, sorted.
    pub fn held_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = lock(&self.held)
            .iter()
            .filter(|(_, holder)| holder.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[derive(Debug)]
pub struct Lease {
    key: String,
    token: u64,
    ttl: Duration,
    held: HolderMap,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Pushes the expiry out by another `ttl`. Returns false if the lease
    /// expired and was taken over by someone else.
    pub fn renew(&self) -> bool {
        match lock(&self.held).get_mut(&self.key) {
            Some(holder) if holder.token == self.token => {
                holder.expires_at = Instant::now() + self.ttl;
                true
            }
            _ => false,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut held = lock(&self.held);
        if held.get(&self.key).is_some_and(|holder| holder.token == self.token) {
            held.remove(&self.key);
            debug!("Released update lease for {}", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let guard = InFlightGuard::new(Duration::from_secs(60));
        let lease = guard.try_acquire("web").unwrap();
        assert!(guard.try_acquire("web").unwrap_err().is_busy());
        assert!(guard.try_acquire("db").is_ok());
        assert!(guard.is_held("web"));
        drop(lease);
        assert!(!guard.is_held("web"));
        assert!(guard.try_acquire("web").is_ok());
    }

    #[test]
    fn exactly_one_concurrent_caller_wins() {
        let guard = Arc::new(InFlightGuard::new(Duration::from_secs(60)));
        let winners = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let (tx, rx) = std::sync::mpsc::channel();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let winners = Arc::clone(&winners);
                let barrier = Arc::clone(&barrier);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    match guard.try_acquire("web") {
                        Ok(lease) => {
                            winners.fetch_add(1, Ordering::SeqCst);
                            // Hold the lease until every thread has tried.
                            tx.send(lease).unwrap();
                        }
                        Err(e) => assert!(e.is_busy()),
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(tx);
        let leases: Vec<Lease> = rx.iter().collect();
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(leases.len(), 1);
    }

    #[test]
    fn expired_lease_can_be_reclaimed_and_old_holder_cannot_release_it() {
        let guard = InFlightGuard::new(Duration::from_millis(0));
        let stale = guard.try_acquire("web").unwrap();
        let fresh = guard.try_acquire("web").unwrap();
        assert!(!stale.renew());
        drop(stale);
        // The stale drop must not clear the new holder's marker.
        let held = lock(&guard.held);
        assert_eq!(held.get("web").map(|h| h.token), Some(fresh.token));
    }

    #[test]
    fn lease_is_released_when_a_task_panics() {
        let guard = Arc::new(InFlightGuard::new(Duration::from_secs(60)));
        let inner = Arc::clone(&guard);
        let result = std::thread::spawn(move || {
            let _lease = inner.try_acquire("web").unwrap();
            panic!("update task crashed");
        })
        .join();
        assert!(result.is_err());
        assert!(!guard.is_held("web"));
        assert_eq!(guard.held_keys(), Vec::<String>::new());
    }
}
