// src/types/mod.rs
pub mod entitlement;
pub mod response;

pub use entitlement::{
    EntitlementSnapshot, EntitlementSource, Order, PaidProbe, PendingOrder, SessionToken,
    SignedFields, User, UserId, VerificationRequest,
};
