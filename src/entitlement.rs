// src/entitlement.rs
//! Entitlement store: owns the session token, the persisted profile and the
//! derived entitlement snapshot. All mutations go through one setter and
//! listeners observe each resulting snapshot.

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::service_client::PaymentBackend;
use crate::core::storage::{self, KeyValueStore, TOKEN_KEY, USER_KEY};
use crate::error::{PremiumError, PremiumResult};
use crate::types::{EntitlementSnapshot, EntitlementSource, PaidProbe, User, UserId};

pub type Listener = Box<dyn Fn(&EntitlementSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Returned by [`EntitlementStore::hydrate`]: the cached view, available at once,
/// and the background profile refresh when a token was found.
pub struct Hydration {
    pub snapshot: EntitlementSnapshot,
    pub refresh: Option<JoinHandle<PremiumResult<EntitlementSnapshot>>>,
}

#[derive(Default)]
struct StoreState {
    token: Option<String>,
    user: Option<User>,
    /// The profile was read from the server during this session.
    profile_fresh: bool,
    /// Client-side flip after a verified payment, pending server confirmation.
    optimistic: bool,
    /// A paid-status poll confirmed payment for the current user.
    paid_probe: bool,
    /// Bumped on every session change; late completions from an older epoch are dropped.
    epoch: u64,
    snapshot: Option<EntitlementSnapshot>,
}

impl StoreState {
    fn derive(&self) -> EntitlementSnapshot {
        let Some(user) = self.user.as_ref().filter(|_| self.token.is_some()) else {
            return EntitlementSnapshot {
                entitled: false,
                source: EntitlementSource::Unknown,
                fetched_at: Utc::now(),
                authenticated: self.token.is_some(),
                user_id: None,
            };
        };

        let profile_paid = user.payment_status;
        let source = if profile_paid && self.profile_fresh {
            EntitlementSource::ServerProfile
        } else if self.paid_probe {
            EntitlementSource::PaidPoll
        } else if self.optimistic || !self.profile_fresh {
            EntitlementSource::Cached
        } else {
            EntitlementSource::ServerProfile
        };

        EntitlementSnapshot {
            entitled: profile_paid || self.paid_probe || self.optimistic,
            source,
            fetched_at: Utc::now(),
            authenticated: true,
            user_id: Some(user.id.clone()),
        }
    }

    fn is_current_user(&self, user_id: &UserId) -> bool {
        self.token.is_some() && self.user.as_ref().map(|u| &u.id) == Some(user_id)
    }
}

pub struct EntitlementStore<B> {
    backend: Arc<B>,
    storage: Arc<dyn KeyValueStore>,
    state: Mutex<StoreState>,
    listeners: Mutex<Vec<(ListenerId, Arc<Listener>)>>,
    next_listener: AtomicU64,
}

impl<B: PaymentBackend> EntitlementStore<B> {
    pub fn new(backend: Arc<B>, storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            storage,
            state: Mutex::new(StoreState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The single setter. Applies `mutate`, recomputes the snapshot and notifies
    /// listeners once the lock is released.
    fn update<F>(&self, mutate: F) -> EntitlementSnapshot
    where
        F: FnOnce(&mut StoreState),
    {
        let snapshot = {
            let mut state = self.lock_state();
            mutate(&mut state);
            let snapshot = state.derive();
            state.snapshot = Some(snapshot.clone());
            snapshot
        };

        debug!(
            entitled = snapshot.entitled,
            source = %snapshot.source,
            "Entitlement updated"
        );
        self.notify(&snapshot);
        snapshot
    }

    fn notify(&self, snapshot: &EntitlementSnapshot) {
        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(snapshot);
        }
    }

    // ===== Observation =====

    pub fn snapshot(&self) -> EntitlementSnapshot {
        let state = self.lock_state();
        state.snapshot.clone().unwrap_or_else(|| state.derive())
    }

    pub fn user(&self) -> Option<User> {
        self.lock_state().user.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.lock_state().token.clone()
    }

    pub fn current_user_id(&self) -> Option<UserId> {
        let state = self.lock_state();
        state
            .user
            .as_ref()
            .filter(|_| state.token.is_some())
            .map(|u| u.id.clone())
    }

    pub fn session_epoch(&self) -> u64 {
        self.lock_state().epoch
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EntitlementSnapshot) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(Box::new(listener))));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(existing, _)| *existing != id);
    }

    // ===== Session lifecycle =====

    /// Load the persisted session. Never fails: missing or corrupt data means
    /// logged out. When a token is found a profile refresh is started in the
    /// background (requires a Tokio runtime) and the cached view is returned
    /// without waiting for it.
    pub fn hydrate(self: &Arc<Self>) -> Hydration {
        let token = match self.storage.get(TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "Could not read stored token, starting logged out");
                None
            }
        };
        let user: Option<User> = storage::read_json(self.storage.as_ref(), USER_KEY);

        let has_token = token.is_some();
        let snapshot = self.update(|state| {
            state.token = token;
            state.user = user;
            state.profile_fresh = false;
            state.optimistic = false;
            state.paid_probe = false;
            state.epoch += 1;
        });

        info!(
            authenticated = snapshot.authenticated,
            entitled = snapshot.entitled,
            "Session hydrated"
        );

        let refresh = if has_token {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let store = Arc::clone(self);
                    Some(handle.spawn(async move { store.refresh_profile().await }))
                }
                Err(_) => {
                    warn!("No async runtime available, skipping start-up profile refresh");
                    None
                }
            }
        } else {
            None
        };

        Hydration { snapshot, refresh }
    }

    /// Adopt a session handed over by the login flow. The profile's payment flag
    /// is advisory until the next refresh.
    pub fn establish_session(&self, token: &str, user: User) -> Result<EntitlementSnapshot> {
        self.storage.set(TOKEN_KEY, token)?;
        storage::write_json(self.storage.as_ref(), USER_KEY, &user)?;

        info!(user_id = %user.id, "Session established");
        let token = token.to_string();
        Ok(self.update(move |state| {
            state.token = Some(token);
            state.user = Some(user);
            state.profile_fresh = false;
            state.optimistic = false;
            state.paid_probe = false;
            state.epoch += 1;
        }))
    }

    /// Clear the session and every persisted copy of it. Completions of calls
    /// started before this point are discarded.
    pub fn logout(&self) -> EntitlementSnapshot {
        for key in [USER_KEY, TOKEN_KEY] {
            if let Err(e) = self.storage.remove(key) {
                warn!(key, error = %e, "Failed to remove stored session value");
            }
        }

        info!("Logged out");
        self.update(|state| {
            let epoch = state.epoch + 1;
            *state = StoreState {
                epoch,
                ..StoreState::default()
            };
        })
    }

    // ===== Server reconciliation =====

    /// Re-read the authoritative profile. On failure the prior state stays as it
    /// was, except for `Unauthenticated`, which ends the session.
    pub async fn refresh_profile(&self) -> PremiumResult<EntitlementSnapshot> {
        let (token, epoch) = {
            let state = self.lock_state();
            match state.token.clone() {
                Some(token) => (token, state.epoch),
                None => return Err(PremiumError::Unauthenticated),
            }
        };

        match self.backend.get_profile(&token).await {
            Ok(profile) => {
                if self.session_epoch() != epoch {
                    debug!("Discarding profile fetched for an ended session");
                    return Ok(self.snapshot());
                }

                info!(
                    user_id = %profile.id,
                    payment_status = profile.payment_status,
                    "Profile refreshed"
                );

                Ok(self.update(move |state| {
                    // Re-checked under the setter: a logout may have landed since.
                    if state.epoch != epoch {
                        return;
                    }
                    if let Err(e) = storage::write_json(self.storage.as_ref(), USER_KEY, &profile) {
                        warn!(error = %e, "Failed to persist refreshed profile");
                    }
                    let same_user = state.user.as_ref().map(|u| &u.id) == Some(&profile.id);
                    if !same_user {
                        state.optimistic = false;
                        state.paid_probe = false;
                    }
                    state.user = Some(profile);
                    state.profile_fresh = true;
                }))
            }
            Err(PremiumError::Unauthenticated) => {
                if self.session_epoch() == epoch {
                    warn!("Profile fetch unauthorized, ending session");
                    self.logout();
                }
                Err(PremiumError::Unauthenticated)
            }
            Err(e) => {
                warn!(error = %e, "Profile refresh failed, keeping previous entitlement");
                Err(e)
            }
        }
    }

    /// Flip entitlement on after a verified payment. Ignored unless `user_id` is
    /// the current user. Returns whether the flip was applied.
    pub fn mark_entitled_optimistically(&self, user_id: &UserId) -> bool {
        {
            let state = self.lock_state();
            if !state.is_current_user(user_id) {
                warn!(%user_id, "Ignoring optimistic entitlement for a different user");
                return false;
            }
            if state.optimistic {
                return false;
            }
        }

        let mut applied = false;
        self.update(|state| {
            if state.is_current_user(user_id) && !state.optimistic {
                state.optimistic = true;
                applied = true;
            }
        });
        applied
    }

    /// Record a paid-status poll for `user_id`. Only a positive probe for the
    /// current user changes anything; `Unpaid` and `Unknown` never downgrade.
    pub fn record_paid_probe(&self, user_id: &UserId, probe: PaidProbe) -> EntitlementSnapshot {
        if probe != PaidProbe::Paid {
            return self.snapshot();
        }

        {
            let state = self.lock_state();
            if !state.is_current_user(user_id) {
                warn!(%user_id, "Ignoring paid probe for a different user");
                return self.snapshot_from(&state);
            }
            if state.paid_probe {
                return self.snapshot_from(&state);
            }
        }

        self.update(|state| {
            if state.is_current_user(user_id) {
                state.paid_probe = true;
            }
        })
    }

    fn snapshot_from(&self, state: &StoreState) -> EntitlementSnapshot {
        state.snapshot.clone().unwrap_or_else(|| state.derive())
    }
}
