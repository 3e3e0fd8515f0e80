//! elastic-state: embedded state store for the elastic scaler.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for scale plans, pod objects, service endpoints, and published
//! parameter-server host lists.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{job}:{pod}`, `{job}/{service}`) enable prefix scans
//! over one job's objects.
//!
//! Plans carry a `resourceVersion` that every write bumps. Status writes
//! name the version they were computed against and fail with
//! [`StateError::Conflict`] when another writer got there first. Starting a
//! plan also checks, in the same transaction, that no other plan of its
//! job is executing ([`StateError::JobBusy`]).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
