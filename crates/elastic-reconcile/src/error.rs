//! Error types for plan reconciliation.

use thiserror::Error;

use elastic_core::{PlanPhase, PodId, ResourceError};

use crate::cluster::ClusterError;

/// Result type alias for reconciliation.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Static validation failures. A malformed plan never starts executing.
#[derive(Debug, Error)]
pub enum MalformedPlan {
    #[error("plan has no ownerJob")]
    MissingOwnerJob,

    #[error("plan has neither pod lists nor replicaResourceSpecs")]
    Empty,

    #[error("pod {id} has no type")]
    MissingRole { id: PodId },

    #[error("pod id {0} is targeted more than once")]
    DuplicateId(PodId),

    #[error("rankIndex {rank} is used twice in role '{role}'")]
    DuplicateRank { role: String, rank: u32 },

    #[error("no live pod with id {0}")]
    UnknownPod(PodId),

    #[error("{subject}: {source}")]
    InvalidResource {
        subject: String,
        #[source]
        source: ResourceError,
    },
}

/// No execution order keeps a role above its availability floor.
#[derive(Debug, Error)]
#[error("unsafe plan for role '{role}': {reason}")]
pub struct UnsafePlan {
    pub role: String,
    pub reason: String,
}

/// Why a plan was rejected before (or instead of) executing further.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("malformed plan: {0}")]
    Malformed(#[from] MalformedPlan),

    #[error(transparent)]
    Unsafe(#[from] UnsafePlan),
}

/// An attempted phase change that would move a plan backwards or sideways.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal phase transition {from} -> {to}")]
pub struct TransitionError {
    pub from: PlanPhase,
    pub to: PlanPhase,
}

/// Errors that abort a reconciliation pass. The plan is picked up again on
/// the next pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
