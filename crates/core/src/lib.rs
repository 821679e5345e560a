//! `agilebus-core` — shared primitives for the event bus.
//!
//! This crate contains identifiers and validation errors only (no IO).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::EventId;
