// src/payment/coordinator.rs
//! Drives one checkout attempt from order creation to a server-confirmed
//! entitlement, including the resume after a full-page redirect.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::location::{self, AppLocation};
use super::processor::{CheckoutProcessor, HandOff};
use super::single_flight::SingleFlight;
use crate::core::service_client::PaymentBackend;
use crate::core::storage::{self, KeyValueStore, PENDING_ORDER_KEY};
use crate::entitlement::EntitlementStore;
use crate::error::{FailureKind, PremiumError, PremiumResult};
use crate::types::{
    EntitlementSnapshot, EntitlementSource, PaidProbe, PendingOrder, SignedFields, UserId,
    VerificationRequest,
};

type VerifyKey = (UserId, String);

/// Observable state of the current checkout attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum CheckoutState {
    Idle,
    Creating {
        user_id: UserId,
    },
    HandedOff {
        user_id: UserId,
        order_id: String,
    },
    Verifying {
        user_id: UserId,
        order_id: String,
    },
    Reconciling {
        user_id: UserId,
        order_id: String,
    },
    Entitled {
        user_id: UserId,
        order_id: String,
    },
    Failed {
        kind: FailureKind,
        order_id: Option<String>,
    },
}

impl CheckoutState {
    pub fn label(&self) -> &'static str {
        match self {
            CheckoutState::Idle => "idle",
            CheckoutState::Creating { .. } => "creating",
            CheckoutState::HandedOff { .. } => "handed-off",
            CheckoutState::Verifying { .. } => "verifying",
            CheckoutState::Reconciling { .. } => "reconciling",
            CheckoutState::Entitled { .. } => "entitled",
            CheckoutState::Failed { .. } => "failed",
        }
    }

    /// A new attempt may start from here.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            CheckoutState::Idle | CheckoutState::Failed { .. } | CheckoutState::Entitled { .. }
        )
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            CheckoutState::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub struct PaymentCoordinator<B, P> {
    store: Arc<EntitlementStore<B>>,
    processor: Arc<P>,
    storage: Arc<dyn KeyValueStore>,
    reconcile_delays: Vec<Duration>,
    state: watch::Sender<CheckoutState>,
    inflight: SingleFlight<VerifyKey, PremiumResult<EntitlementSnapshot>>,
    /// Terminal verify outcomes seen in this process, replayed on repeat calls.
    settled: Mutex<HashMap<VerifyKey, PremiumResult<()>>>,
    resumed: AtomicBool,
}

impl<B, P> PaymentCoordinator<B, P>
where
    B: PaymentBackend,
    P: CheckoutProcessor,
{
    pub fn new(
        store: Arc<EntitlementStore<B>>,
        processor: Arc<P>,
        storage: Arc<dyn KeyValueStore>,
        reconcile_delays: Vec<Duration>,
    ) -> Self {
        let (state, _) = watch::channel(CheckoutState::Idle);
        Self {
            store,
            processor,
            storage,
            reconcile_delays,
            state,
            inflight: SingleFlight::new(),
            settled: Mutex::new(HashMap::new()),
            resumed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CheckoutState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CheckoutState> {
        self.state.subscribe()
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    pub fn pending_order(&self) -> Option<PendingOrder> {
        storage::read_json(self.storage.as_ref(), PENDING_ORDER_KEY)
    }

    fn set_state(&self, next: CheckoutState) {
        debug!(state = next.label(), "Checkout state");
        self.state.send_replace(next);
    }

    /// Move to `next` only if the current state satisfies `allowed`.
    fn transition<F>(&self, allowed: F, next: CheckoutState, action: &'static str) -> PremiumResult<()>
    where
        F: Fn(&CheckoutState) -> bool,
    {
        let mut from = "";
        let moved = self.state.send_if_modified(|current| {
            if allowed(current) {
                *current = next.clone();
                true
            } else {
                from = current.label();
                false
            }
        });

        if moved {
            debug!(state = next.label(), "Checkout state");
            Ok(())
        } else {
            Err(PremiumError::InvalidTransition { from, action })
        }
    }

    fn fail(&self, error: &PremiumError, order_id: Option<&str>) {
        self.set_state(CheckoutState::Failed {
            kind: error.kind(),
            order_id: order_id.map(str::to_string),
        });
    }

    fn persist_pending(&self, pending: &PendingOrder) {
        if let Err(e) = storage::write_json(self.storage.as_ref(), PENDING_ORDER_KEY, pending) {
            warn!(order_id = %pending.order_id, error = %e, "Failed to persist pending order");
        }
    }

    fn clear_pending(&self, order_id: &str) {
        // Only remove the record if it still describes this order.
        match self.pending_order() {
            Some(pending) if pending.order_id != order_id => return,
            _ => {}
        }
        if let Err(e) = self.storage.remove(PENDING_ORDER_KEY) {
            warn!(order_id, error = %e, "Failed to clear pending order");
        }
    }

    // ===== Checkout =====

    /// Create an order for `user_id` and hand it to the processor. Resolves with
    /// `HandedOff` when the page is being redirected, or with the outcome of
    /// verification when the processor reported success in-page.
    pub async fn start_checkout(&self, user_id: &UserId, amount: u64) -> PremiumResult<CheckoutState> {
        if self.store.current_user_id().as_ref() != Some(user_id) {
            warn!(%user_id, "Checkout requested without a matching session");
            return Err(PremiumError::Unauthenticated);
        }

        self.transition(
            CheckoutState::can_start,
            CheckoutState::Creating {
                user_id: user_id.clone(),
            },
            "start checkout",
        )?;

        let order = match self.store.backend().create_order(user_id, amount).await {
            Ok(order) => order,
            Err(e) => {
                warn!(%user_id, error = %e, "Order creation failed");
                if matches!(self.state(), CheckoutState::Creating { .. }) {
                    self.fail(&e, None);
                }
                return Err(e);
            }
        };

        let pending = PendingOrder::from(&order);
        self.transition(
            |s| matches!(s, CheckoutState::Creating { .. }),
            CheckoutState::HandedOff {
                user_id: user_id.clone(),
                order_id: order.order_id.clone(),
            },
            "hand off",
        )
        .map_err(|_| PremiumError::UserAbandoned)?;

        // Written before control leaves us, in either mode: a tab closed during
        // checkout resumes from this record on the next start.
        self.persist_pending(&pending);

        info!(
            %user_id,
            order_id = %order.order_id,
            amount = order.amount,
            currency = %order.currency,
            mode = ?self.processor.mode(),
            "Handing checkout to processor"
        );

        let handoff = self.processor.present(&order).await;

        if !matches!(self.state(), CheckoutState::HandedOff { .. }) {
            debug!(order_id = %order.order_id, "Checkout was cancelled during hand-off");
            return Err(PremiumError::UserAbandoned);
        }

        match handoff {
            HandOff::Completed(signed) => {
                if signed.order_id != order.order_id {
                    warn!(
                        expected = %order.order_id,
                        reported = %signed.order_id,
                        "Processor callback names a different order"
                    );
                }
                self.verify(&pending, Some(signed)).await?;
                Ok(self.state())
            }
            HandOff::Redirected { checkout_url } => {
                info!(order_id = %order.order_id, %checkout_url, "Control relinquished to processor");
                Ok(self.state())
            }
            HandOff::Abandoned => {
                self.clear_pending(&order.order_id);
                let err = PremiumError::UserAbandoned;
                self.fail(&err, Some(&order.order_id));
                Err(err)
            }
            HandOff::Failed(reason) => {
                warn!(order_id = %order.order_id, %reason, "Processor failed to present checkout");
                self.clear_pending(&order.order_id);
                let err = PremiumError::Network(reason);
                self.fail(&err, Some(&order.order_id));
                Err(err)
            }
        }
    }

    /// Abandon the attempt. Allowed while creating or handed off.
    pub fn cancel(&self) -> PremiumResult<()> {
        let order_id = match self.state() {
            CheckoutState::HandedOff { order_id, .. } => Some(order_id),
            _ => None,
        };

        self.transition(
            |s| matches!(s, CheckoutState::Creating { .. } | CheckoutState::HandedOff { .. }),
            CheckoutState::Failed {
                kind: FailureKind::UserAbandoned,
                order_id: order_id.clone(),
            },
            "cancel",
        )?;

        match order_id {
            Some(order_id) => self.clear_pending(&order_id),
            None => {
                if let Err(e) = self.storage.remove(PENDING_ORDER_KEY) {
                    warn!(error = %e, "Failed to clear pending order");
                }
            }
        }
        info!("Checkout cancelled");
        Ok(())
    }

    // ===== Return from the processor =====

    /// Called once per application start, after the store is hydrated. Consumes
    /// `order_id` from the address bar and, together with any pending order
    /// persisted for the current user, resumes verification.
    pub async fn resume_if_returning(
        &self,
        location: &dyn AppLocation,
    ) -> PremiumResult<Option<EntitlementSnapshot>> {
        if self.resumed.swap(true, Ordering::SeqCst) {
            debug!("Resume already ran for this start");
            return Ok(None);
        }

        let returned_order = location::take_order_id(location);
        let pending = self.pending_order();

        let Some(user_id) = self.store.current_user_id() else {
            if returned_order.is_some() {
                warn!("Returned from checkout without a session, nothing to verify");
            }
            return Ok(None);
        };

        let own_pending = pending.filter(|p| p.user_id == user_id);
        let order = match (returned_order, own_pending) {
            (Some(order_id), Some(pending)) if pending.order_id == order_id => pending,
            (Some(order_id), stale) => {
                // The address bar names the order that was paid; it replaces
                // whatever this user had pending.
                if let Some(stale) = stale {
                    warn!(
                        %user_id,
                        stale_order_id = %stale.order_id,
                        order_id = %order_id,
                        "Returned order differs from pending order, superseding"
                    );
                }
                let order = PendingOrder {
                    user_id,
                    order_id,
                    created_at: chrono::Utc::now(),
                };
                self.persist_pending(&order);
                order
            }
            (None, Some(pending)) => pending,
            (None, None) => return Ok(None),
        };

        info!(user_id = %order.user_id, order_id = %order.order_id, "Resuming checkout");
        self.verify(&order, None).await.map(Some)
    }

    // ===== Verification =====

    /// Verify `order` with the server and reconcile entitlement. Safe to repeat:
    /// concurrent calls for the same user and order share one request, and a
    /// settled outcome is replayed without touching entitlement again.
    pub async fn verify(
        &self,
        order: &PendingOrder,
        signed: Option<SignedFields>,
    ) -> PremiumResult<EntitlementSnapshot> {
        let key: VerifyKey = (order.user_id.clone(), order.order_id.clone());

        if let Some(outcome) = self.replay(&key) {
            return outcome;
        }

        // The outcome is settled before the in-flight slot is released, so a
        // caller arriving in between replays it instead of leading again.
        let (result, _) = self
            .inflight
            .run(key.clone(), || async {
                if let Some(outcome) = self.replay(&key) {
                    return outcome;
                }
                let result = self.verify_once(order, signed).await;
                self.settle(&key, &result);
                result
            })
            .await;

        result
    }

    fn replay(&self, key: &VerifyKey) -> Option<PremiumResult<EntitlementSnapshot>> {
        let outcome = self
            .settled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()?;
        debug!(order_id = %key.1, "Replaying settled verification");
        Some(outcome.map(|()| self.store.snapshot()))
    }

    /// Remember terminal outcomes. Network and auth failures stay retryable.
    fn settle(&self, key: &VerifyKey, result: &PremiumResult<EntitlementSnapshot>) {
        let outcome = match result {
            Ok(_) => Ok(()),
            Err(e @ PremiumError::VerificationRejected)
            | Err(e @ PremiumError::VerificationInconsistent) => Err(e.clone()),
            Err(_) => return,
        };
        self.settled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), outcome);
    }

    async fn verify_once(
        &self,
        order: &PendingOrder,
        signed: Option<SignedFields>,
    ) -> PremiumResult<EntitlementSnapshot> {
        let user_id = &order.user_id;
        let order_id = order.order_id.as_str();
        let epoch = self.store.session_epoch();

        self.set_state(CheckoutState::Verifying {
            user_id: user_id.clone(),
            order_id: order_id.to_string(),
        });

        let mut request = VerificationRequest::new(user_id.clone(), order_id);
        if let Some(signed) = signed.as_ref() {
            request = request.with_signed_fields(signed);
        }

        match self.store.backend().verify_payment(&request).await {
            Ok(()) => {}
            Err(PremiumError::VerificationRejected) => {
                warn!(%user_id, order_id, "Payment verification rejected");
                self.clear_pending(order_id);
                let err = PremiumError::VerificationRejected;
                self.fail(&err, Some(order_id));
                return Err(err);
            }
            Err(PremiumError::Unauthenticated) => {
                if self.store.session_epoch() == epoch {
                    self.store.logout();
                }
                let err = PremiumError::Unauthenticated;
                self.fail(&err, Some(order_id));
                return Err(err);
            }
            Err(e) => {
                // The pending record stays so the next start retries.
                warn!(%user_id, order_id, error = %e, "Payment verification did not complete");
                self.fail(&e, Some(order_id));
                return Err(e);
            }
        }

        info!(%user_id, order_id, "Payment verified");
        self.clear_pending(order_id);

        if self.store.session_epoch() != epoch
            || self.store.current_user_id().as_ref() != Some(user_id)
        {
            // Verified for someone who is no longer the session owner. The server
            // has the payment; their next profile read picks it up.
            warn!(%user_id, order_id, "Verified order belongs to an ended session, entitlement untouched");
            let err = PremiumError::Unauthenticated;
            self.fail(&err, Some(order_id));
            return Err(err);
        }

        self.reconcile(user_id, order_id, epoch).await
    }

    /// Optimistic flip, profile re-read, then paid-status polls on the
    /// configured schedule until the server agrees or the grace budget runs
    /// out. The budget bounds the whole loop, including slow backend reads.
    async fn reconcile(
        &self,
        user_id: &UserId,
        order_id: &str,
        epoch: u64,
    ) -> PremiumResult<EntitlementSnapshot> {
        self.set_state(CheckoutState::Reconciling {
            user_id: user_id.clone(),
            order_id: order_id.to_string(),
        });

        let grace: Duration = self.reconcile_delays.iter().sum();
        let deadline = Instant::now() + grace;

        self.store.mark_entitled_optimistically(user_id);

        let mut confirmed = match timeout_at(deadline, self.store.refresh_profile()).await {
            Ok(Ok(snapshot)) => {
                snapshot.entitled && snapshot.source == EntitlementSource::ServerProfile
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Profile re-read after verify failed");
                false
            }
            Err(_) => {
                debug!(%user_id, order_id, "Profile re-read after verify timed out");
                false
            }
        };
        self.ensure_session(epoch, order_id)?;

        let mut delays = self.reconcile_delays.iter();
        let mut attempt = 0;
        loop {
            let probe = match timeout_at(deadline, self.store.backend().check_paid(user_id)).await {
                Ok(Ok(probe)) => probe,
                Ok(Err(PremiumError::Unauthenticated)) => {
                    if self.store.session_epoch() == epoch {
                        self.store.logout();
                    }
                    self.ensure_session(epoch, order_id)?;
                    PaidProbe::Unknown
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Paid-status probe failed");
                    PaidProbe::Unknown
                }
                Err(_) => {
                    debug!(%user_id, order_id, attempt, "Paid-status probe timed out");
                    PaidProbe::Unknown
                }
            };
            self.ensure_session(epoch, order_id)?;

            debug!(%user_id, order_id, attempt, ?probe, "Paid-status probe");
            self.store.record_paid_probe(user_id, probe);
            confirmed |= probe == PaidProbe::Paid;

            if confirmed {
                break;
            }

            // Waits are clipped to the deadline; past it each remaining read
            // gets a single poll.
            match delays.next() {
                Some(delay) => {
                    attempt += 1;
                    sleep_until((Instant::now() + *delay).min(deadline)).await;
                    self.ensure_session(epoch, order_id)?;
                }
                None => {
                    error!(
                        %user_id,
                        order_id,
                        attempts = attempt + 1,
                        "Payment verified but profile and paid poll still report unpaid"
                    );
                    let err = PremiumError::VerificationInconsistent;
                    self.fail(&err, Some(order_id));
                    return Err(err);
                }
            }
        }

        info!(%user_id, order_id, "Premium entitlement confirmed");
        self.set_state(CheckoutState::Entitled {
            user_id: user_id.clone(),
            order_id: order_id.to_string(),
        });
        Ok(self.store.snapshot())
    }

    /// Stop reconciling once the session that started it has ended.
    fn ensure_session(&self, epoch: u64, order_id: &str) -> PremiumResult<()> {
        if self.store.session_epoch() == epoch {
            return Ok(());
        }
        info!(order_id, "Session ended during reconciliation");
        let err = PremiumError::Unauthenticated;
        self.fail(&err, Some(order_id));
        Err(err)
    }
}
