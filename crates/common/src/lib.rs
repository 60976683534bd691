//! Shared identifiers for the repository mirroring saga.

pub mod types;

pub use types::InvocationId;
