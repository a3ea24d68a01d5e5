// src/types/response.rs
use serde::{Deserialize, Serialize};

use crate::error::{PremiumError, PremiumResult};
use crate::types::entitlement::SessionToken;

// ===== Payment Service Request Types =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest<'a> {
    pub user_id: &'a str,
    pub amount: u64,
}

// ===== Payment Service Response Types =====

/// Body of `POST /api/payment/create-order`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
    /// Processor reply embedded as a JSON string.
    #[serde(default, alias = "cashfreeResponse")]
    pub processor_response: Option<String>,
}

/// The object `processorResponse` parses to. Only the fields we act on.
#[derive(Debug, Deserialize)]
pub struct ProcessorPayload {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub payment_session_id: Option<String>,
    #[serde(default)]
    pub payment_link: Option<String>,
}

impl CreateOrderResponse {
    /// Second parsing step: decode the embedded processor payload and pull the
    /// session token out of it.
    pub fn session_token(&self) -> PremiumResult<SessionToken> {
        let raw = self
            .processor_response
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PremiumError::OrderInvalid("missing processor response".into()))?;

        let payload: ProcessorPayload = serde_json::from_str(raw).map_err(|e| {
            PremiumError::OrderInvalid(format!("unreadable processor response: {}", e))
        })?;

        if let Some(id) = payload.payment_session_id.filter(|s| !s.is_empty()) {
            return Ok(SessionToken::SessionId(id));
        }
        if let Some(link) = payload.payment_link.filter(|s| !s.is_empty()) {
            return Ok(SessionToken::PaymentLink(link));
        }

        Err(PremiumError::OrderInvalid(
            "processor session missing from order".into(),
        ))
    }

    /// Order id from the body, or from the processor payload when the body omits it.
    pub fn resolved_order_id(&self) -> PremiumResult<String> {
        if let Some(id) = self.order_id.as_deref().filter(|s| !s.is_empty()) {
            return Ok(id.to_string());
        }

        self.processor_response
            .as_deref()
            .and_then(|raw| serde_json::from_str::<ProcessorPayload>(raw).ok())
            .and_then(|payload| payload.order_id)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PremiumError::OrderInvalid("order id missing".into()))
    }
}

/// Body of `POST /api/payment/verify`.
#[derive(Debug, Deserialize)]
pub struct VerifyResponse {
    #[serde(default)]
    pub success: bool,
}

/// Body of `GET /api/payment/check-paid/{userId}`. The backend has answered both
/// `{"paid": bool}` and a bare boolean.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CheckPaidResponse {
    Object { paid: bool },
    Bare(bool),
}

impl CheckPaidResponse {
    pub fn paid(&self) -> bool {
        match self {
            CheckPaidResponse::Object { paid } => *paid,
            CheckPaidResponse::Bare(paid) => *paid,
        }
    }
}
