//! In-Process Load Coalescing
//!
//! Concurrent callers asking for the same key share one in-flight future.
//! The first caller (the leader) creates it; everyone else awaits a clone of
//! the same [`Shared`] future and receives the same output, error included.
//!
//! # Handle lifecycle
//!
//! - Created on first demand for a key
//! - Removed as soon as the flight completes, so a failed load never
//!   poisons the key for later callers
//! - Removed when the last waiter detaches, so abandoned flights do not leak
//!
//! Dropping the leader does not cancel the load while other waiters still
//! poll the shared future.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

struct Flight<T: Clone> {
    id: u64,
    future: Shared<BoxFuture<'static, T>>,
    waiters: usize,
}

/// Per-key coalescing table
pub struct SingleFlight<T: Clone> {
    flights: DashMap<String, Flight<T>>,
    next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            flights: DashMap::new(),
            next_id: AtomicU64::new(0),
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

    /// Run `make()` for `key` unless a flight for it is already in progress.
    /// Returns the output and whether this caller led the flight.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, future, leader) = match self.flights.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let flight = occupied.get_mut();
                flight.waiters += 1;
                (flight.id, flight.future.clone(), false)
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let future = make().boxed().shared();
                vacant.insert(Flight {
                    id,
                    future: future.clone(),
                    waiters: 1,
                });
                (id, future, true)
            }
        };

        let mut waiter = Waiter {
            flights: &self.flights,
            key,
            id,
            detached: false,
        };
        let output = future.await;
        waiter.complete();
        (output, leader)
    }

    /// Number of keys with a flight in progress
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    /// True if a flight for `key` is in progress
    pub fn in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }
}

struct Waiter<'a, T: Clone> {
    flights: &'a DashMap<String, Flight<T>>,
    key: &'a str,
    id: u64,
    detached: bool,
}

impl<T: Clone> Waiter<'_, T> {
    /// The flight finished: retire its handle for everyone
    fn complete(&mut self) {
        self.detached = true;
        let id = self.id;
        self.flights.remove_if(self.key, |_, flight| flight.id == id);
    }
}

impl<T: Clone> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Entry::Occupied(mut occupied) = self.flights.entry(self.key.to_string()) {
            if occupied.get().id != self.id {
                return;
            }
            let flight = occupied.get_mut();
            flight.waiters -= 1;
            if flight.waiters == 0 {
                occupied.remove();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_run() {
        let flights = Arc::new(SingleFlight::<u64>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let flights = Arc::clone(&flights);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    flights
                        .run("Order:id:1", || async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            42
                        })
                        .await
                })
            })
            .collect();

        let mut leaders = 0;
        for task in tasks {
            let (value, leader) = task.await.unwrap();
            assert_eq!(value, 42);
            leaders += usize::from(leader);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert!(flights.is_empty());
    }

    #[test]
    fn test_follower_pending_until_leader_resolves() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let flights = SingleFlight::<u64>::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<u64>();

        let mut leader = task::spawn(flights.run("k", || async move { rx.await.unwrap_or(0) }));
        assert_pending!(leader.poll());
        let mut follower = task::spawn(flights.run("k", || async { 99 }));
        assert_pending!(follower.poll());
        assert!(flights.in_flight("k"));

        tx.send(5).unwrap();
        assert!(follower.is_woken());
        assert_ready_eq!(follower.poll(), (5, false));
        assert_ready_eq!(leader.poll(), (5, true));
        assert!(flights.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reaches_every_waiter_and_does_not_poison() {
        let flights = Arc::new(SingleFlight::<Result<u64, String>>::new());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let flights = Arc::clone(&flights);
                tokio::spawn(async move {
                    flights
                        .run("k", || async {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Err("boom".to_string())
                        })
                        .await
                        .0
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Err("boom".to_string()));
        }

        // The next caller starts a fresh flight
        let (value, leader) = flights.run("k", || async { Ok(7) }).await;
        assert_eq!(value, Ok(7));
        assert!(leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_leader_does_not_cancel_followers() {
        let flights = Arc::new(SingleFlight::<u64>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let spawn = |flights: Arc<SingleFlight<u64>>, runs: Arc<AtomicUsize>| {
            tokio::spawn(async move {
                flights
                    .run("k", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        9
                    })
                    .await
            })
        };

        let leader = spawn(Arc::clone(&flights), Arc::clone(&runs));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = spawn(Arc::clone(&flights), Arc::clone(&runs));
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let (value, led) = follower.await.unwrap();
        assert_eq!(value, 9);
        assert!(!led);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_abandoned_flight_is_removed() {
        let flights = Arc::new(SingleFlight::<u64>::new());

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let flights = Arc::clone(&flights);
                tokio::spawn(async move {
                    flights
                        .run("k", || async {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            1
                        })
                        .await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(flights.in_flight("k"));

        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            assert!(task.await.unwrap_err().is_cancelled());
        }
        assert!(flights.is_empty());
    }
}
