// src/gate.rs
//! Access decisions for premium routes and in-page actions.
//!
//! [`decide_route`] and [`decide_action`] are pure functions of their inputs.
//! [`RouteGuard`] is the async wrapper used when entering a route: it re-reads
//! the profile first so a stale cache cannot open a protected surface.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::service_client::PaymentBackend;
use crate::entitlement::EntitlementStore;
use crate::types::EntitlementSnapshot;
use crate::utils::{normalize_route_path, path_has_prefix};

pub const LOGIN_ROUTE: &str = "/login";
pub const UPSELL_ROUTE: &str = "/premium";

pub const PROTECTED_ROUTES: &[&str] = &[
    "/resume-tools",
    "/ai-resume-builder",
    "/premium-templates",
    "/ats-score",
    "/pdf-export",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteDecision {
    Render,
    RedirectLogin,
    RedirectUpsell,
}

impl RouteDecision {
    /// Where to navigate instead of rendering, if anywhere.
    pub fn redirect_target(&self) -> Option<&'static str> {
        match self {
            RouteDecision::Render => None,
            RouteDecision::RedirectLogin => Some(LOGIN_ROUTE),
            RouteDecision::RedirectUpsell => Some(UPSELL_ROUTE),
        }
    }
}

impl fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RouteDecision::Render => "render",
            RouteDecision::RedirectLogin => "redirect-login",
            RouteDecision::RedirectUpsell => "redirect-upsell",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionDecision {
    Allow,
    RequireCheckout,
    RequireLogin,
}

impl fmt::Display for ActionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionDecision::Allow => "allow",
            ActionDecision::RequireCheckout => "require-checkout",
            ActionDecision::RequireLogin => "require-login",
        };
        f.write_str(label)
    }
}

/// In-page actions that need premium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    PdfDownload,
    AiResume,
    PremiumTemplates,
    AtsScore,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::PdfDownload => "pdf-download",
            Feature::AiResume => "ai-resume",
            Feature::PremiumTemplates => "premium-templates",
            Feature::AtsScore => "ats-score",
        }
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pdf-download" => Ok(Feature::PdfDownload),
            "ai-resume" => Ok(Feature::AiResume),
            "premium-templates" => Ok(Feature::PremiumTemplates),
            "ats-score" => Ok(Feature::AtsScore),
            other => Err(format!("unknown feature: {}", other)),
        }
    }
}

pub fn is_protected(path: &str) -> bool {
    let path = normalize_route_path(path);
    PROTECTED_ROUTES
        .iter()
        .any(|prefix| path_has_prefix(&path, prefix))
}

pub fn decide_route(path: &str, snapshot: &EntitlementSnapshot) -> RouteDecision {
    if !is_protected(path) {
        return RouteDecision::Render;
    }
    if !snapshot.authenticated {
        return RouteDecision::RedirectLogin;
    }
    if snapshot.entitled {
        RouteDecision::Render
    } else {
        RouteDecision::RedirectUpsell
    }
}

/// Unknown feature ids are not premium and are allowed.
pub fn decide_action(feature_id: &str, snapshot: &EntitlementSnapshot) -> ActionDecision {
    if feature_id.parse::<Feature>().is_err() {
        return ActionDecision::Allow;
    }
    if !snapshot.authenticated {
        ActionDecision::RequireLogin
    } else if snapshot.entitled {
        ActionDecision::Allow
    } else {
        ActionDecision::RequireCheckout
    }
}

pub struct RouteGuard<B> {
    store: Arc<EntitlementStore<B>>,
}

impl<B: PaymentBackend> RouteGuard<B> {
    pub fn new(store: Arc<EntitlementStore<B>>) -> Self {
        Self { store }
    }

    /// Decide on entering `path`. Protected routes re-read the server profile
    /// first; a failed read falls back to the current snapshot.
    pub async fn enter(&self, path: &str) -> RouteDecision {
        if is_protected(path) && self.store.snapshot().authenticated {
            if let Err(e) = self.store.refresh_profile().await {
                warn!(path, error = %e, "Profile re-read on route entry failed");
            }
        }

        let decision = decide_route(path, &self.store.snapshot());
        debug!(path, %decision, "Route decision");
        decision
    }
}
