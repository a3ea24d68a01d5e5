// src/error.rs
//! Error taxonomy surfaced to callers. Raw HTTP details never leave the adapter.

use serde::Serialize;
use thiserror::Error;

/// Errors produced by the backend adapter, the entitlement store and the
/// payment coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PremiumError {
    /// The server answered 401, or no session exists.
    #[error("Not authenticated. Please log in again.")]
    Unauthenticated,

    /// Transport failure or timeout. Prior entitlement is preserved.
    #[error("Network error: {0}")]
    Network(String),

    /// Order creation returned a malformed body or no processor session.
    #[error("Order could not be created: {0}")]
    OrderInvalid(String),

    /// The user closed the checkout.
    #[error("Checkout abandoned by user.")]
    UserAbandoned,

    /// The server refused the payment verification.
    #[error("Payment verification failed.")]
    VerificationRejected,

    /// Verification succeeded but neither the profile nor the paid poll confirmed
    /// the entitlement within the grace budget.
    #[error("Payment verified but premium status is not confirmed yet. Please refresh later.")]
    VerificationInconsistent,

    /// Unexpected, non-retryable server status.
    #[error("Server returned status {status}")]
    Server { status: u16 },

    /// An operation was called in a state that does not allow it.
    #[error("Cannot {action} while checkout is {from}")]
    InvalidTransition { from: &'static str, action: &'static str },
}

impl PremiumError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PremiumError::Unauthenticated => FailureKind::Unauthenticated,
            PremiumError::Network(_) => FailureKind::Network,
            PremiumError::OrderInvalid(_) => FailureKind::OrderInvalid,
            PremiumError::UserAbandoned => FailureKind::UserAbandoned,
            PremiumError::VerificationRejected => FailureKind::VerificationRejected,
            PremiumError::VerificationInconsistent => FailureKind::VerificationInconsistent,
            // An unexpected status is reported to the UI like a transport failure.
            PremiumError::Server { .. } => FailureKind::Network,
            // Never stored in the checkout state: a refused call leaves it untouched.
            PremiumError::InvalidTransition { .. } => FailureKind::OrderInvalid,
        }
    }

    /// Transport-level failures that may be retried with the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            PremiumError::Network(_) => true,
            PremiumError::Server { status } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PremiumError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return PremiumError::Unauthenticated;
            }
            return PremiumError::Server {
                status: status.as_u16(),
            };
        }
        PremiumError::Network(err.to_string())
    }
}

/// Copyable discriminant of a failed checkout, exposed in the observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Unauthenticated,
    Network,
    OrderInvalid,
    UserAbandoned,
    VerificationRejected,
    VerificationInconsistent,
}

impl FailureKind {
    /// User-facing text for the failure, `None` when the UI should stay silent.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            FailureKind::Unauthenticated => Some("Please login first."),
            FailureKind::Network => Some("Network problem. Please retry."),
            FailureKind::OrderInvalid => Some("Payment link not generated."),
            FailureKind::UserAbandoned => None,
            FailureKind::VerificationRejected => Some("Payment verification failed!"),
            FailureKind::VerificationInconsistent => {
                Some("Payment received. Premium will be confirmed shortly, please refresh later.")
            }
        }
    }
}

pub type PremiumResult<T> = Result<T, PremiumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            PremiumError::Network("reset".into()).kind(),
            FailureKind::Network
        );
        assert_eq!(
            PremiumError::Server { status: 502 }.kind(),
            FailureKind::Network
        );
        assert_eq!(
            PremiumError::VerificationRejected.kind(),
            FailureKind::VerificationRejected
        );
    }

    #[test]
    fn test_retryable() {
        assert!(PremiumError::Network("timeout".into()).is_retryable());
        assert!(PremiumError::Server { status: 503 }.is_retryable());
        assert!(!PremiumError::Server { status: 404 }.is_retryable());
        assert!(!PremiumError::Unauthenticated.is_retryable());
        assert!(!PremiumError::OrderInvalid("x".into()).is_retryable());
    }

    #[test]
    fn test_abandon_is_silent() {
        assert!(FailureKind::UserAbandoned.message().is_none());
        assert!(FailureKind::VerificationRejected.message().is_some());
    }
}
