//! elastic-reconcile: executes scale plans for elastic training jobs.
//!
//! A scale plan asks for pods to be created, migrated, or removed. The
//! reconciler turns it into per-pod operations, orders them so no role
//! drops below its availability floor, executes them with retry against
//! the cluster object API, and records every outcome on the plan's status.
//!
//! # Pipeline
//!
//! ```text
//! ScalePlan ──normalize──▶ [Operation] ──guard──▶ [Batch] ──executor──▶ [OpOutcome]
//!                                                                          │
//!           status ◀──reporter── PlanStateMachine ◀──────record────────────┘
//! ```
//!
//! Only the first batch runs per step; the rest is re-planned against
//! fresh pod state, which is what makes a restart mid-plan safe.

pub mod cluster;
pub mod controller;
pub mod error;
pub mod executor;
pub mod guard;
pub mod machine;
pub mod normalizer;
pub mod reconciler;
pub mod reporter;
pub mod retry;

pub use cluster::{ClusterApi, ClusterError, ClusterResult, StoreCluster};
pub use controller::PlanController;
pub use error::{MalformedPlan, PlanError, ReconcileError, ReconcileResult, UnsafePlan};
pub use executor::{Executor, OpOutcome};
pub use guard::{AvailabilityGuard, Batch, Stage};
pub use machine::PlanStateMachine;
pub use normalizer::{Operation, normalize};
pub use reconciler::{PassOutcome, Reconciler};
pub use reporter::{StatusReporter, ps_hosts};
pub use retry::RetryConfig;
