// src/types/entitlement.rs
//! Domain records shared by the store, the coordinator and the gate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

// ===== Identity =====

/// Stable user identifier. The backend emits it either as a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(i64),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Ok(UserId(text)),
            RawId::Number(n) => Ok(UserId(n.to_string())),
        }
    }
}

/// Profile record as returned by `GET /api/profile` and persisted under `user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default, deserialize_with = "nullable_flag")]
    pub payment_status: bool,
    /// Fields this client does not interpret, kept so the stored profile stays whole.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `null` and absent both read as `false`.
fn nullable_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

impl User {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            email: None,
            user_type: None,
            payment_status: false,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_payment_status(mut self, paid: bool) -> Self {
        self.payment_status = paid;
        self
    }
}

// ===== Entitlement =====

/// Where the current entitlement value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntitlementSource {
    ServerProfile,
    PaidPoll,
    Cached,
    Unknown,
}

impl fmt::Display for EntitlementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntitlementSource::ServerProfile => "server-profile",
            EntitlementSource::PaidPoll => "paid-poll",
            EntitlementSource::Cached => "cached",
            EntitlementSource::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of the user's entitlement. Replaced wholesale, never merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSnapshot {
    pub entitled: bool,
    pub source: EntitlementSource,
    pub fetched_at: DateTime<Utc>,
    /// Whether a session token is present.
    pub authenticated: bool,
    pub user_id: Option<UserId>,
}

impl EntitlementSnapshot {
    pub fn logged_out() -> Self {
        Self {
            entitled: false,
            source: EntitlementSource::Unknown,
            fetched_at: Utc::now(),
            authenticated: false,
            user_id: None,
        }
    }
}

/// Result of `GET /api/payment/check-paid/{userId}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaidProbe {
    Paid,
    Unpaid,
    /// The probe could not be completed. Never read as "unpaid".
    Unknown,
}

// ===== Orders =====

/// Credential handed to the processor to open checkout for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SessionToken {
    /// `payment_session_id` for an embedded checkout.
    SessionId(String),
    /// Hosted checkout URL the browser is sent to.
    PaymentLink(String),
}

impl SessionToken {
    pub fn as_str(&self) -> &str {
        match self {
            SessionToken::SessionId(id) => id,
            SessionToken::PaymentLink(link) => link,
        }
    }
}

/// A server-issued intent to pay, bound to exactly one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub user_id: UserId,
    pub amount: u64,
    pub currency: String,
    pub key_id: Option<String>,
    pub session: SessionToken,
    pub created_at: DateTime<Utc>,
}

/// Continuation persisted under `pending-order` while checkout is handed off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub user_id: UserId,
    pub order_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for PendingOrder {
    fn from(order: &Order) -> Self {
        Self {
            user_id: order.user_id.clone(),
            order_id: order.order_id.clone(),
            created_at: order.created_at,
        }
    }
}

/// Fields signed by the processor and passed to the success callback in modal mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedFields {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

/// Body of `POST /api/payment/verify`. Single use per completed checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub user_id: UserId,
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl VerificationRequest {
    pub fn new(user_id: UserId, order_id: impl Into<String>) -> Self {
        Self {
            user_id,
            order_id: order_id.into(),
            payment_id: None,
            signature: None,
        }
    }

    pub fn with_signed_fields(mut self, signed: &SignedFields) -> Self {
        self.payment_id = Some(signed.payment_id.clone());
        self.signature = Some(signed.signature.clone());
        self
    }

    /// Key under which the server deduplicates verification.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.user_id, self.order_id)
    }
}
