// src/payment/mod.rs
//! Checkout coordination: order creation, processor hand-off, post-redirect
//! resume and server verification

pub mod coordinator;
pub mod location;
pub mod processor;
pub mod single_flight;

pub use coordinator::{CheckoutState, PaymentCoordinator};
pub use location::{AppLocation, MemoryLocation};
pub use processor::{CheckoutMode, CheckoutProcessor, HandOff, HostedCheckout};
