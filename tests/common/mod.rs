// tests/common/mod.rs
#![allow(dead_code)]

use chrono::Utc;
use premium_gate::core::{KeyValueStore, MemoryStore, PaymentBackend};
use premium_gate::payment::{CheckoutMode, CheckoutProcessor, HandOff};
use premium_gate::types::{
    Order, PaidProbe, SessionToken, SignedFields, User, UserId, VerificationRequest,
};
use premium_gate::{ClientConfig, PremiumApp, PremiumError, PremiumResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const TOKEN: &str = "tok-asha";

/// In-memory job-portal server. Payment becomes visible to the profile and the
/// paid poll only after their configured lag has been consumed.
#[derive(Default)]
pub struct FakeBackend {
    sessions: Mutex<HashMap<String, User>>,
    paid: Mutex<HashSet<UserId>>,
    pub reject_verify: Mutex<bool>,
    pub profile_lag: AtomicUsize,
    pub poll_lag: AtomicUsize,
    /// Extra latency on profile reads and paid polls.
    pub profile_delay: Mutex<Option<Duration>>,
    pub poll_delay: Mutex<Option<Duration>>,
    pub verify_gate: Mutex<Option<Arc<Notify>>>,
    pub verify_requests: Mutex<Vec<VerificationRequest>>,
    pub profile_calls: AtomicUsize,
    pub check_paid_calls: AtomicUsize,
    orders: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(self, token: &str, user: User) -> Self {
        self.sessions.lock().unwrap().insert(token.to_string(), user);
        self
    }

    pub fn hold_verify(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.verify_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_requests.lock().unwrap().len()
    }

    pub fn last_verify(&self) -> Option<VerificationRequest> {
        self.verify_requests.lock().unwrap().last().cloned()
    }

    /// Paid as seen through a view that lags by `lag` reads.
    fn paid_view(&self, user_id: &UserId, lag: &AtomicUsize) -> bool {
        if !self.paid.lock().unwrap().contains(user_id) {
            return false;
        }
        lag.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}

impl PaymentBackend for FakeBackend {
    async fn get_profile(&self, token: &str) -> PremiumResult<User> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.profile_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let user = self.sessions.lock().unwrap().get(token).cloned();
        let user = user.ok_or(PremiumError::Unauthenticated)?;
        let paid = self.paid_view(&user.id, &self.profile_lag);
        Ok(user.with_payment_status(paid))
    }

    async fn create_order(&self, user_id: &UserId, amount: u64) -> PremiumResult<Order> {
        let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Order {
            order_id: format!("order_{}", n),
            user_id: user_id.clone(),
            amount,
            currency: "INR".into(),
            key_id: None,
            session: SessionToken::SessionId(format!("session_{}", n)),
            created_at: Utc::now(),
        })
    }

    async fn verify_payment(&self, request: &VerificationRequest) -> PremiumResult<()> {
        self.verify_requests.lock().unwrap().push(request.clone());
        let gate = self.verify_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if *self.reject_verify.lock().unwrap() {
            return Err(PremiumError::VerificationRejected);
        }
        self.paid.lock().unwrap().insert(request.user_id.clone());
        Ok(())
    }

    async fn check_paid(&self, user_id: &UserId) -> PremiumResult<PaidProbe> {
        self.check_paid_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.poll_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.paid_view(user_id, &self.poll_lag) {
            Ok(PaidProbe::Paid)
        } else {
            Ok(PaidProbe::Unpaid)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Complete,
    Abandon,
    Fail,
}

/// Modal processor that answers the way it was told to.
pub struct ScriptedProcessor {
    pub script: Script,
    pub presented: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            presented: AtomicUsize::new(0),
        }
    }
}

impl CheckoutProcessor for ScriptedProcessor {
    fn mode(&self) -> CheckoutMode {
        CheckoutMode::Modal
    }

    async fn present(&self, order: &Order) -> HandOff {
        self.presented.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Complete => HandOff::Completed(SignedFields {
                order_id: order.order_id.clone(),
                payment_id: format!("pay_{}", order.order_id),
                signature: "sig".into(),
            }),
            Script::Abandon => HandOff::Abandoned,
            Script::Fail => HandOff::Failed("sdk failed to load".into()),
        }
    }
}

pub fn asha() -> User {
    User::new(42u64).with_name("Asha").with_email("asha@example.com")
}

pub fn fast_config() -> ClientConfig {
    ClientConfig::default().with_reconcile_delays(vec![Duration::from_millis(5); 3])
}

pub fn app_with<P: CheckoutProcessor>(
    backend: &Arc<FakeBackend>,
    processor: P,
    storage: &Arc<MemoryStore>,
) -> PremiumApp<FakeBackend, P> {
    let storage: Arc<dyn KeyValueStore> = storage.clone();
    PremiumApp::new(backend.clone(), Arc::new(processor), storage, &fast_config())
}
