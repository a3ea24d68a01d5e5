// src/core/mod.rs
//! Transport and persistence shared by the entitlement and payment layers

pub mod service_client;
pub mod storage;

pub use service_client::{PaymentBackend, ServiceClient};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
