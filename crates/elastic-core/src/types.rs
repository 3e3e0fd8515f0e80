//! Domain types for scale plans.
//!
//! A `ScalePlan` is produced by the upstream job controller and consumed
//! exactly once by the reconciler. All types serialize as camelCase JSON,
//! which is both the submission format and the persisted form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::quantity::{Quantity, QuantityValue, ResourceError, parse_resources};

/// Logical pod identity, unique within a job and stable across migration.
pub type PodId = u64;

/// Well-known role names.
pub mod roles {
    pub const PS: &str = "ps";
    pub const WORKER: &str = "worker";
    pub const CHIEF: &str = "chief";
    pub const EVALUATOR: &str = "evaluator";
}

// ── Plan ──────────────────────────────────────────────────────────

/// Object metadata maintained by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// Incremented whenever the spec changes.
    #[serde(default)]
    pub generation: u64,
    /// Incremented on every write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
    /// Unix timestamp (seconds) when the object was first stored.
    #[serde(default)]
    pub created_at: u64,
}

/// A request to move a job's pod population toward a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalePlan {
    pub metadata: ObjectMeta,
    pub spec: ScalePlanSpec,
    #[serde(default)]
    pub status: ScalePlanStatus,
}

impl ScalePlan {
    pub fn new(name: &str, spec: ScalePlanSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            spec,
            status: ScalePlanStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn owner_job(&self) -> &str {
        &self.spec.owner_job
    }

    /// Build the key for the plans table.
    pub fn table_key(&self) -> String {
        self.metadata.name.clone()
    }
}

/// What the plan asks for.
///
/// Either explicit pod lists or `replica_resource_specs` drive the plan.
/// When both are present the explicit lists win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalePlanSpec {
    pub owner_job: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create_pods: Vec<PodMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migrate_pods: Vec<PodMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_pods: Vec<PodMeta>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replica_resource_specs: BTreeMap<String, ReplicaResourceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ps_hosts: Vec<String>,
}

impl ScalePlanSpec {
    pub fn for_job(owner_job: &str) -> Self {
        Self {
            owner_job: owner_job.to_string(),
            ..Default::default()
        }
    }

    /// Whether any explicit pod list is non-empty.
    pub fn has_pod_lists(&self) -> bool {
        !self.create_pods.is_empty() || !self.migrate_pods.is_empty() || !self.remove_pods.is_empty()
    }

    /// A plan with nothing to do.
    pub fn is_empty(&self) -> bool {
        !self.has_pod_lists() && self.replica_resource_specs.is_empty()
    }

    /// Fold another partial plan for the same job into this one.
    ///
    /// Pod lists are appended, replica specs are overwritten per role, and
    /// `ps_hosts` is replaced when the other side carries any.
    pub fn merge(&mut self, other: ScalePlanSpec) {
        if self.owner_job.is_empty() {
            self.owner_job = other.owner_job;
        }
        self.create_pods.extend(other.create_pods);
        self.migrate_pods.extend(other.migrate_pods);
        self.remove_pods.extend(other.remove_pods);
        self.replica_resource_specs
            .extend(other.replica_resource_specs);
        if !other.ps_hosts.is_empty() {
            self.ps_hosts = other.ps_hosts;
        }
    }
}

/// Desired replica count and per-pod resources for one role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaResourceSpec {
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource: BTreeMap<String, QuantityValue>,
}

/// Pod identity and placement as written in a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    pub id: PodId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rank_index: u32,
    #[serde(default)]
    pub service: String,
    #[serde(rename = "type")]
    pub role: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource: BTreeMap<String, QuantityValue>,
}

/// A `PodMeta` with its resources parsed. This is what the executor
/// hands to the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub id: PodId,
    pub name: String,
    pub rank_index: u32,
    pub service: String,
    #[serde(rename = "type")]
    pub role: String,
    #[serde(default)]
    pub resource: BTreeMap<String, Quantity>,
}

impl PodSpec {
    pub fn from_meta(meta: &PodMeta) -> Result<Self, ResourceError> {
        Ok(Self {
            id: meta.id,
            name: meta.name.clone(),
            rank_index: meta.rank_index,
            service: meta.service.clone(),
            role: meta.role.clone(),
            resource: parse_resources(&meta.resource)?,
        })
    }

    /// Stable DNS-style address of the pod within its service.
    pub fn address(&self) -> String {
        format!("{}.{}", self.name, self.service)
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Lifecycle phase of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanPhase {
    #[default]
    Pending,
    Executing,
    Succeeded,
    Failed,
}

impl PlanPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self → next` is a legal forward step.
    ///
    /// `Pending → Failed` covers plans rejected before any mutation.
    pub fn can_transition_to(self, next: PlanPhase) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Executing)
                | (Self::Pending, Self::Failed)
                | (Self::Executing, Self::Succeeded)
                | (Self::Executing, Self::Failed)
        )
    }
}

impl std::fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Executing => "Executing",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Kind of per-pod lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Migrate,
    Remove,
}

/// Progress of one pod operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodOperationState {
    #[default]
    Pending,
    /// Migrate: replacement created and ready, old pod not yet removed.
    Created,
    Succeeded,
    Failed,
    /// Never issued because a prerequisite failed.
    Skipped,
}

impl PodOperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Recorded outcome of one pod operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodOperationStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub role: String,
    #[serde(default)]
    pub rank_index: u32,
    #[serde(default)]
    pub service: String,
    pub kind: OperationKind,
    pub state: PodOperationState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Id of the operation that replaced this failed one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substituted_by: Option<PodId>,
    #[serde(default)]
    pub updated_at: u64,
}

/// Persisted status subresource of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalePlanStatus {
    pub phase: PlanPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<u64>,
    /// Spec generation this status was computed against.
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ps_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pods: BTreeMap<PodId, PodOperationStatus>,
}

impl PodOperationStatus {
    /// A not-yet-started entry for `pod`.
    pub fn pending(pod: &PodSpec, kind: OperationKind, now: u64) -> Self {
        Self {
            name: pod.name.clone(),
            role: pod.role.clone(),
            rank_index: pod.rank_index,
            service: pod.service.clone(),
            kind,
            state: PodOperationState::Pending,
            attempts: 0,
            message: None,
            substituted_by: None,
            updated_at: now,
        }
    }
}

impl ScalePlanStatus {
    /// State recorded for `id`, defaulting to `Pending`.
    pub fn pod_state(&self, id: PodId) -> PodOperationState {
        self.pods
            .get(&id)
            .map(|p| p.state)
            .unwrap_or_default()
    }

    /// Failed pod operations that nothing replaced.
    pub fn unsubstituted_failures(&self) -> impl Iterator<Item = (&PodId, &PodOperationStatus)> {
        self.pods
            .iter()
            .filter(|(_, p)| p.state == PodOperationState::Failed && p.substituted_by.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: PodId, rank: u32) -> PodMeta {
        PodMeta {
            id,
            name: format!("job-worker-{id}"),
            rank_index: rank,
            service: "job-worker".to_string(),
            role: roles::WORKER.to_string(),
            resource: BTreeMap::new(),
        }
    }

    #[test]
    fn plan_wire_format_is_camel_case() {
        let json = r#"{
            "metadata": {"name": "plan-1"},
            "spec": {
                "ownerJob": "mnist",
                "createPods": [{"id": 1, "name": "mnist-worker-1", "rankIndex": 0,
                                "service": "mnist-worker", "type": "worker",
                                "resource": {"cpu": "2", "memory": 1024, "gpu": 0.5}}],
                "replicaResourceSpecs": {"ps": {"replicas": 2, "resource": {"cpu": "500m"}}},
                "psHosts": ["mnist-ps-0:2222"]
            }
        }"#;
        let plan: ScalePlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.owner_job(), "mnist");
        assert_eq!(plan.status.phase, PlanPhase::Pending);
        let pod = &plan.spec.create_pods[0];
        assert_eq!(pod.role, "worker");
        assert_eq!(pod.resource["memory"], QuantityValue::Integer(1024));
        assert_eq!(pod.resource["gpu"], QuantityValue::Decimal(0.5));
        assert_eq!(plan.spec.replica_resource_specs["ps"].replicas, 2);

        let out = serde_json::to_value(&plan).unwrap();
        assert!(out["spec"]["createPods"][0]["rankIndex"].is_number());
        assert!(out["spec"].get("migratePods").is_none());
    }

    #[test]
    fn pod_spec_parses_resources() {
        let mut meta = worker(1, 0);
        meta.resource.insert("cpu".to_string(), QuantityValue::from("1.5"));
        let spec = PodSpec::from_meta(&meta).unwrap();
        assert_eq!(spec.resource["cpu"].millis(), 1500);
        assert_eq!(spec.address(), "job-worker-1.job-worker");

        meta.resource.insert("memory".to_string(), QuantityValue::from("1GB"));
        let err = PodSpec::from_meta(&meta).unwrap_err();
        assert_eq!(err.resource, "memory");
    }

    #[test]
    fn phase_transitions_only_move_forward() {
        use PlanPhase::*;
        assert!(Pending.can_transition_to(Executing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Executing.can_transition_to(Succeeded));
        assert!(Executing.can_transition_to(Failed));
        assert!(!Executing.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Executing));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(Succeeded.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn merge_combines_partial_plans() {
        let mut ps_plan = ScalePlanSpec::for_job("mnist");
        ps_plan.migrate_pods.push(PodMeta {
            role: roles::PS.to_string(),
            ..worker(7, 0)
        });

        let mut worker_plan = ScalePlanSpec::for_job("mnist");
        worker_plan.create_pods.push(worker(8, 3));
        worker_plan.ps_hosts = vec!["mnist-ps-0:2222".to_string()];

        ps_plan.merge(worker_plan);
        assert_eq!(ps_plan.migrate_pods.len(), 1);
        assert_eq!(ps_plan.create_pods.len(), 1);
        assert_eq!(ps_plan.ps_hosts, vec!["mnist-ps-0:2222".to_string()]);
        assert!(!ps_plan.is_empty());
        assert!(ScalePlanSpec::for_job("mnist").is_empty());
    }

    #[test]
    fn status_tracks_unsubstituted_failures() {
        let mut status = ScalePlanStatus::default();
        let spec = PodSpec::from_meta(&worker(1, 0)).unwrap();
        let entry = PodOperationStatus {
            state: PodOperationState::Failed,
            attempts: 3,
            ..PodOperationStatus::pending(&spec, OperationKind::Create, 0)
        };
        assert_eq!(entry.service, "job-worker");
        status.pods.insert(1, entry.clone());
        status.pods.insert(
            2,
            PodOperationStatus {
                substituted_by: Some(3),
                ..entry
            },
        );
        assert_eq!(status.unsubstituted_failures().count(), 1);
        assert_eq!(status.pod_state(1), PodOperationState::Failed);
        assert_eq!(status.pod_state(9), PodOperationState::Pending);

        let json = serde_json::to_string(&status).unwrap();
        let back: ScalePlanStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
