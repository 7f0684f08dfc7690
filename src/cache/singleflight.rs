//! Per-key computation deduplication
//!
//! The first caller for a key becomes the leader: it registers a flight, and the
//! work runs on its own task so that no caller's cancellation can abort it. Every
//! caller, the leader included, then waits on the flight's `watch` channel and
//! receives a clone of the same outcome. The registry lock is only held to look
//! up, insert or remove a flight, never across an await, so distinct keys never
//! wait on each other.

use crate::cache::types::CacheKey;
use crate::error::CacheError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// What a flight publishes to its waiters
pub type Outcome<T> = std::result::Result<T, CacheError>;

/// How a caller took part in a flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the computation
    Leader,

    /// Joined a computation already in flight
    Follower,
}

type Slot<T> = watch::Receiver<Option<Outcome<T>>>;

struct Flight<T> {
    id: u64,
    slot: Slot<T>,
}

type Registry<T> = Arc<Mutex<HashMap<CacheKey, Flight<T>>>>;

/// In-flight computation registry
pub struct SingleFlight<T> {
    inflight: Registry<T>,
    next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

/// Deregisters a flight when its task finishes, panics included
struct FlightGuard<T> {
    inflight: Registry<T>,
    key: CacheKey,
    id: u64,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        let mut map = self.inflight.lock();
        // A newer flight may already own the key.
        if map.get(&self.key).map(|f| f.id) == Some(self.id) {
            map.remove(&self.key);
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a run is already in flight, and wait for the
    /// shared outcome
    ///
    /// `work` is only invoked by the leader. Dropping the returned future only
    /// abandons this caller's wait.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Outcome<T>, Role)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let joined = {
            let mut map = self.inflight.lock();
            match map.get(key) {
                Some(flight) => Err(flight.slot.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, slot) = watch::channel(None);
                    map.insert(
                        key.to_string(),
                        Flight {
                            id,
                            slot: slot.clone(),
                        },
                    );
                    Ok((id, tx, slot))
                }
            }
        };

        match joined {
            Ok((id, tx, slot)) => {
                debug!("Leading computation for {}", key);
                let guard = FlightGuard {
                    inflight: self.inflight.clone(),
                    key: key.to_string(),
                    id,
                };
                let fut = work();
                tokio::spawn(async move {
                    let outcome = fut.await;
                    // Publish before deregistering so late joiners still see it.
                    let _ = tx.send(Some(outcome));
                    drop(guard);
                });
                (Self::wait(key, slot).await, Role::Leader)
            }
            Err(slot) => {
                drop(work);
                debug!("Joining in-flight computation for {}", key);
                (Self::wait(key, slot).await, Role::Follower)
            }
        }
    }

    async fn wait(key: &str, mut slot: Slot<T>) -> Outcome<T> {
        let published = slot
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|published| (*published).clone());

        match published {
            Some(outcome) => outcome,
            None => {
                warn!("Computation for {} ended without publishing a result", key);
                Err(CacheError::Coordination(format!(
                    "computation for {} ended without a result",
                    key
                )))
            }
        }
    }

    /// Number of keys currently being computed
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Whether `key` is currently being computed
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }
}
