// src/payment/processor.rs
//! Hand-off to the external payment processor

use reqwest::Url;
use std::future::Future;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::types::{Order, SessionToken, SignedFields};

/// How the processor returns control after checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Checkout UI opens in-page and reports back through a success callback.
    Modal,
    /// The page navigates away; the processor sends the user back with `order_id`.
    Redirect,
}

/// What happened once the processor had the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandOff {
    Completed(SignedFields),
    Redirected { checkout_url: String },
    Abandoned,
    Failed(String),
}

pub trait CheckoutProcessor: Send + Sync {
    fn mode(&self) -> CheckoutMode;

    /// Present checkout for `order`. In redirect mode this resolves once the
    /// navigation has been issued.
    fn present(&self, order: &Order) -> impl Future<Output = HandOff> + Send;
}

/// Redirect-mode processor for a hosted checkout page. It does not drive a
/// browser; the URL to open is reported in the hand-off and kept for callers.
pub struct HostedCheckout {
    checkout_base: String,
    return_url: String,
    last_redirect: Mutex<Option<String>>,
}

impl HostedCheckout {
    pub fn new(checkout_base: &str, return_url: &str) -> Self {
        Self {
            checkout_base: checkout_base.trim_end_matches('/').to_string(),
            return_url: return_url.to_string(),
            last_redirect: Mutex::new(None),
        }
    }

    /// URL the user must open to pay for `order`.
    pub fn checkout_url(&self, order: &Order) -> Result<String, String> {
        match &order.session {
            SessionToken::PaymentLink(link) => Ok(link.clone()),
            SessionToken::SessionId(session_id) => {
                let return_url = self.return_url_for(order)?;
                let mut url = Url::parse(&self.checkout_base)
                    .map_err(|e| format!("invalid checkout base: {}", e))?;
                url.query_pairs_mut()
                    .append_pair("payment_session_id", session_id)
                    .append_pair("return_url", &return_url);
                Ok(url.to_string())
            }
        }
    }

    fn return_url_for(&self, order: &Order) -> Result<String, String> {
        let mut url =
            Url::parse(&self.return_url).map_err(|e| format!("invalid return url: {}", e))?;
        url.query_pairs_mut().append_pair("order_id", &order.order_id);
        Ok(url.to_string())
    }

    pub fn take_last_redirect(&self) -> Option<String> {
        self.last_redirect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl CheckoutProcessor for HostedCheckout {
    fn mode(&self) -> CheckoutMode {
        CheckoutMode::Redirect
    }

    async fn present(&self, order: &Order) -> HandOff {
        match self.checkout_url(order) {
            Ok(checkout_url) => {
                info!(order_id = %order.order_id, "Redirecting to hosted checkout");
                *self.last_redirect.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(checkout_url.clone());
                HandOff::Redirected { checkout_url }
            }
            Err(reason) => {
                warn!(order_id = %order.order_id, %reason, "Cannot build checkout URL");
                HandOff::Failed(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;
    use chrono::Utc;

    fn order(session: SessionToken) -> Order {
        Order {
            order_id: "o1".into(),
            user_id: UserId::from(42u64),
            amount: 99,
            currency: "INR".into(),
            key_id: None,
            session,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_payment_link_used_verbatim() {
        let checkout = HostedCheckout::new("https://pay.example/checkout", "http://localhost/return");
        let handoff = checkout
            .present(&order(SessionToken::PaymentLink("https://pay.example/l/abc".into())))
            .await;
        assert_eq!(
            handoff,
            HandOff::Redirected {
                checkout_url: "https://pay.example/l/abc".into()
            }
        );
        assert_eq!(
            checkout.take_last_redirect().as_deref(),
            Some("https://pay.example/l/abc")
        );
        assert!(checkout.take_last_redirect().is_none());
    }

    #[test]
    fn test_session_id_builds_return_url() {
        let checkout = HostedCheckout::new("https://pay.example/checkout/", "http://localhost/resume-generator");
        let url = checkout
            .checkout_url(&order(SessionToken::SessionId("sess_1".into())))
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("payment_session_id".into(), "sess_1".into())));
        assert!(pairs.contains(&(
            "return_url".into(),
            "http://localhost/resume-generator?order_id=o1".into()
        )));
    }

    #[tokio::test]
    async fn test_bad_base_fails_handoff() {
        let checkout = HostedCheckout::new("not a url", "http://localhost/return");
        let handoff = checkout
            .present(&order(SessionToken::SessionId("s".into())))
            .await;
        assert!(matches!(handoff, HandOff::Failed(_)));
    }
}
