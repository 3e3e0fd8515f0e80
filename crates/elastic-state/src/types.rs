//! Persisted cluster objects.
//!
//! Scale plans themselves are defined in `elastic-core`; this module holds
//! the pod, service, and host records the store keeps alongside them.

use serde::{Deserialize, Serialize};

pub use elastic_core::types::*;

// ── Pod ───────────────────────────────────────────────────────────

/// Lifecycle phase of a pod object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A pod object owned by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub job: String,
    pub spec: PodSpec,
    pub phase: PodPhase,
    /// Readiness as reported by the node agent.
    pub ready: bool,
    /// Address reported once the pod is scheduled, e.g. `10.0.0.5:2222`.
    pub host: Option<String>,
    /// Unix timestamp when the object was created.
    pub created_at: u64,
    /// Unix timestamp of the last status change.
    pub updated_at: u64,
}

impl PodRecord {
    /// A freshly created, not-yet-ready pod.
    pub fn pending(job: &str, spec: PodSpec, now: u64) -> Self {
        Self {
            job: job.to_string(),
            spec,
            phase: PodPhase::Pending,
            ready: false,
            host: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the composite key for the pods table.
    pub fn table_key(&self) -> String {
        pod_key(&self.job, &self.spec.name)
    }

    /// Scheduled or running; terminated pods no longer count toward a role.
    pub fn is_live(&self) -> bool {
        matches!(self.phase, PodPhase::Pending | PodPhase::Running)
    }

    pub fn is_ready(&self) -> bool {
        self.phase == PodPhase::Running && self.ready
    }
}

/// Key of pod `name` in `job`.
pub fn pod_key(job: &str, name: &str) -> String {
    format!("{job}:{name}")
}

// ── Service ───────────────────────────────────────────────────────

/// Pods registered under a job-level service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    pub job: String,
    pub service: String,
    /// Registered pod addresses, kept sorted.
    pub endpoints: Vec<String>,
    /// Unix timestamp of last update.
    pub updated_at: u64,
}

impl ServiceEndpoints {
    /// Build the composite key for the services table.
    pub fn table_key(&self) -> String {
        service_key(&self.job, &self.service)
    }
}

pub fn service_key(job: &str, service: &str) -> String {
    format!("{job}/{service}")
}

// ── Job hosts ─────────────────────────────────────────────────────

/// Parameter-server hosts most recently published for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHosts {
    pub job: String,
    /// Ordered by PS rank.
    pub ps_hosts: Vec<String>,
    pub updated_at: u64,
}
