// src/payment/single_flight.rs
//! Coalesce concurrent calls that share a key into one in-flight operation

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::watch;

type Slots<K, V> = Mutex<HashMap<K, watch::Receiver<Option<V>>>>;

pub struct SingleFlight<K, V> {
    inflight: Slots<K, V>,
}

/// Frees the key when the leading call finishes or is dropped.
struct Release<'a, K: Eq + Hash, V> {
    inflight: &'a Slots<K, V>,
    key: &'a K,
}

impl<K: Eq + Hash, V> Drop for Release<'_, K, V> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(self.key);
    }
}

enum Role<V> {
    Leader(watch::Sender<Option<V>>),
    Follower(watch::Receiver<Option<V>>),
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inflight(&self, key: &K) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Run `work` unless a call with the same key is already running, in which
    /// case wait for and share its result. The flag is `true` for the caller
    /// whose `work` actually ran.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let role = {
                let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                match inflight.get(&key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _release = Release {
                        inflight: &self.inflight,
                        key: &key,
                    };
                    let value = work().await;
                    // Followers may all be gone; that is fine.
                    let _ = tx.send(Some(value.clone()));
                    return (value, true);
                }
                Role::Follower(mut rx) => loop {
                    if let Some(value) = rx.borrow_and_update().clone() {
                        return (value, false);
                    }
                    if rx.changed().await.is_err() {
                        // The leader was dropped before finishing: take over.
                        break;
                    }
                },
            }
        }
    }
}
