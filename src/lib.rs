// src/lib.rs
//! Premium entitlement and payment flow for the job portal client.
//!
//! [`PremiumApp`] wires the pieces together the way the application does on
//! start: hydrate the session, resume a checkout interrupted by a redirect,
//! then serve gate decisions and new checkouts.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub mod cli;
pub mod config;
pub mod core;
pub mod entitlement;
pub mod error;
pub mod gate;
pub mod payment;
pub mod types;
pub mod utils;

pub use config::ClientConfig;
pub use entitlement::{EntitlementStore, Hydration};
pub use error::{FailureKind, PremiumError, PremiumResult};
pub use gate::{decide_action, decide_route, ActionDecision, RouteDecision, RouteGuard};
pub use payment::{CheckoutState, PaymentCoordinator};

use crate::core::{FileStore, KeyValueStore, PaymentBackend, ServiceClient};
use crate::payment::{AppLocation, CheckoutProcessor, HostedCheckout};
use crate::types::EntitlementSnapshot;

pub struct PremiumApp<B, P> {
    pub store: Arc<EntitlementStore<B>>,
    pub coordinator: PaymentCoordinator<B, P>,
    pub guard: RouteGuard<B>,
    pub storage: Arc<dyn KeyValueStore>,
}

impl PremiumApp<ServiceClient, HostedCheckout> {
    /// Production wiring: HTTP backend, on-disk state, hosted redirect checkout.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let storage = FileStore::open(&config.state_dir).with_context(|| {
            format!("Failed to open state directory {}", config.state_dir.display())
        })?;
        let backend = ServiceClient::new(config)?;
        let processor = HostedCheckout::new(&config.checkout_url, &config.return_url);
        Ok(Self::new(
            Arc::new(backend),
            Arc::new(processor),
            Arc::new(storage),
            config,
        ))
    }
}

impl<B: PaymentBackend, P: CheckoutProcessor> PremiumApp<B, P> {
    pub fn new(
        backend: Arc<B>,
        processor: Arc<P>,
        storage: Arc<dyn KeyValueStore>,
        config: &ClientConfig,
    ) -> Self {
        let store = Arc::new(EntitlementStore::new(backend, Arc::clone(&storage)));
        let coordinator = PaymentCoordinator::new(
            Arc::clone(&store),
            processor,
            Arc::clone(&storage),
            config.reconcile_delays.clone(),
        );
        let guard = RouteGuard::new(Arc::clone(&store));
        Self {
            store,
            coordinator,
            guard,
            storage,
        }
    }

    /// Application start: hydrate, wait for the background profile refresh,
    /// then resume any checkout the address bar or storage points at. A failed
    /// resume is reported through the checkout state, not as an error.
    pub async fn start(&self, location: &dyn AppLocation) -> EntitlementSnapshot {
        let hydration = self.store.hydrate();
        if let Some(refresh) = hydration.refresh {
            // Errors were already logged by the store.
            let _ = refresh.await;
        }

        if let Err(e) = self.coordinator.resume_if_returning(location).await {
            info!(error = %e, state = self.coordinator.state().label(), "Checkout resume did not complete");
        }
        self.store.snapshot()
    }
}
