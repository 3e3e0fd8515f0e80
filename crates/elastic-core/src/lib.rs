//! elastic-core: shared types for the elastic-training scaler.
//!
//! Holds the `ScalePlan` wire format, the exact resource-quantity
//! representation used after normalization, and the TOML configuration
//! consumed by the reconciler and the daemon.

pub mod config;
pub mod quantity;
pub mod types;

pub use config::{AvailabilityPolicy, ScalerConfig};
pub use quantity::{Quantity, QuantityError, QuantityValue, ResourceError};
pub use types::*;
