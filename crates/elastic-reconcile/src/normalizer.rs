//! PlanSpec normalizer: turns a scale plan into ordered pod operations.
//!
//! A plan either lists pods explicitly (`createPods`, `migratePods`,
//! `removePods`) or states a target per role (`replicaResourceSpecs`).
//! Explicit lists win when both are present. Replica targets are diffed
//! against the live pods of each role: new pods take the smallest unused
//! ranks, removals take the highest ranks first so rank 0 stays put.
//!
//! Normalization runs on every reconciliation pass. Once a replica-driven
//! plan has started, its operations are rebuilt from the per-pod entries
//! recorded in its status so a restart resumes the same work instead of
//! re-diffing a half-scaled role.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use elastic_core::quantity::parse_resources;
use elastic_core::{
    OperationKind, PodId, PodMeta, PodSpec, Quantity, ScalePlan, ScalePlanStatus,
};
use elastic_state::PodRecord;

use crate::error::MalformedPlan;

/// One per-pod lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    /// Target pod. For a migrate this is the replacement.
    pub pod: PodSpec,
    /// Migrate: the live pod being replaced, `None` once it is gone.
    pub replacement_for: Option<PodSpec>,
    /// Synthesized from replica specs, so any pod of the role would do.
    pub fungible: bool,
}

impl Operation {
    pub fn create(pod: PodSpec, fungible: bool) -> Self {
        Self {
            kind: OperationKind::Create,
            pod,
            replacement_for: None,
            fungible,
        }
    }

    pub fn remove(pod: PodSpec, fungible: bool) -> Self {
        Self {
            kind: OperationKind::Remove,
            pod,
            replacement_for: None,
            fungible,
        }
    }

    pub fn id(&self) -> PodId {
        self.pod.id
    }

    pub fn role(&self) -> &str {
        &self.pod.role
    }
}

/// Normalize `plan` against the job's current pods.
///
/// `pods` is every pod object of the job; terminated ones are ignored
/// except for id allocation.
pub fn normalize(plan: &ScalePlan, pods: &[PodRecord]) -> Result<Vec<Operation>, MalformedPlan> {
    let spec = &plan.spec;
    if spec.owner_job.is_empty() {
        return Err(MalformedPlan::MissingOwnerJob);
    }
    if spec.is_empty() {
        return Err(MalformedPlan::Empty);
    }

    let live: Vec<&PodRecord> = pods.iter().filter(|p| p.is_live()).collect();

    let ops = if spec.has_pod_lists() {
        if !spec.replica_resource_specs.is_empty() {
            debug!(
                plan = %plan.name(),
                "explicit pod lists present, ignoring replicaResourceSpecs"
            );
        }
        from_pod_lists(plan, &live)?
    } else if plan.status.pods.is_empty() {
        from_replica_specs(plan, pods, &live)?
    } else {
        from_recorded(plan)?
    };

    debug!(
        plan = %plan.name(),
        job = %spec.owner_job,
        operations = ops.len(),
        "plan normalized"
    );
    Ok(ops)
}

// ── Explicit pod lists ────────────────────────────────────────────

fn from_pod_lists(plan: &ScalePlan, live: &[&PodRecord]) -> Result<Vec<Operation>, MalformedPlan> {
    let spec = &plan.spec;
    let job = spec.owner_job.as_str();

    let mut ids = BTreeSet::new();
    for meta in spec
        .create_pods
        .iter()
        .chain(&spec.migrate_pods)
        .chain(&spec.remove_pods)
    {
        if meta.role.is_empty() {
            return Err(MalformedPlan::MissingRole { id: meta.id });
        }
        if !ids.insert(meta.id) {
            return Err(MalformedPlan::DuplicateId(meta.id));
        }
    }

    // Ranks held once the plan completes: live pods it leaves alone, plus
    // every pod it creates or migrates.
    let moving: HashSet<PodId> = spec
        .migrate_pods
        .iter()
        .chain(&spec.remove_pods)
        .map(|m| m.id)
        .collect();
    let mut ranks: HashMap<(String, u32), PodId> = live
        .iter()
        .filter(|p| !moving.contains(&p.spec.id))
        .map(|p| ((p.spec.role.clone(), p.spec.rank_index), p.spec.id))
        .collect();
    for meta in spec.create_pods.iter().chain(&spec.migrate_pods) {
        let key = (meta.role.clone(), meta.rank_index);
        if let Some(&owner) = ranks.get(&key) {
            if owner != meta.id {
                return Err(MalformedPlan::DuplicateRank {
                    role: meta.role.clone(),
                    rank: meta.rank_index,
                });
            }
        }
        ranks.insert(key, meta.id);
    }

    let mut ops = Vec::with_capacity(ids.len());

    for meta in &spec.create_pods {
        let pod = pod_spec(meta, job)?;
        let clash = live
            .iter()
            .any(|p| p.spec.id == pod.id && p.spec.name != pod.name);
        if clash {
            return Err(MalformedPlan::DuplicateId(pod.id));
        }
        ops.push(Operation::create(pod, false));
    }

    for meta in &spec.migrate_pods {
        ops.push(migrate(plan, meta, live)?);
    }

    for meta in &spec.remove_pods {
        let target = live
            .iter()
            .find(|p| p.spec.id == meta.id && (meta.name.is_empty() || p.spec.name == meta.name))
            .or_else(|| live.iter().find(|p| p.spec.id == meta.id));
        let pod = match target {
            Some(p) => p.spec.clone(),
            // Already gone; removal is a no-op.
            None => pod_spec(meta, job)?,
        };
        ops.push(Operation::remove(pod, false));
    }

    Ok(ops)
}

/// Pair a `migratePods` entry with the live pod it replaces.
///
/// The old pod is the live pod with the same id under a different name.
/// If only the replacement is live the migration already happened.
fn migrate(plan: &ScalePlan, meta: &PodMeta, live: &[&PodRecord]) -> Result<Operation, MalformedPlan> {
    let job = plan.owner_job();
    let mut pod = parse_meta(meta)?;
    if pod.name.is_empty() {
        pod.name = format!("{}-{}", default_pod_name(job, &pod.role, pod.id), plan.name());
    }

    if plan.status.pod_state(pod.id).is_terminal() {
        if pod.service.is_empty() {
            pod.service = default_service(job, &pod.role);
        }
        return Ok(Operation {
            kind: OperationKind::Migrate,
            pod,
            replacement_for: None,
            fungible: false,
        });
    }

    let old = live
        .iter()
        .find(|p| p.spec.id == pod.id && p.spec.name != pod.name);
    let current = live
        .iter()
        .find(|p| p.spec.id == pod.id && p.spec.name == pod.name);
    let template = old.or(current).ok_or(MalformedPlan::UnknownPod(pod.id))?;

    if pod.service.is_empty() {
        pod.service = template.spec.service.clone();
    }
    if pod.resource.is_empty() {
        pod.resource = template.spec.resource.clone();
    }

    Ok(Operation {
        kind: OperationKind::Migrate,
        pod,
        replacement_for: old.map(|p| p.spec.clone()),
        fungible: false,
    })
}

// ── Replica specs ─────────────────────────────────────────────────

fn from_replica_specs(
    plan: &ScalePlan,
    pods: &[PodRecord],
    live: &[&PodRecord],
) -> Result<Vec<Operation>, MalformedPlan> {
    let job = plan.owner_job();
    let mut next_id = next_pod_id(pods, &plan.status);
    let mut ops = Vec::new();

    for (role, target) in &plan.spec.replica_resource_specs {
        let resource = role_resources(role, &target.resource)?;
        let mut members: Vec<&PodRecord> = live
            .iter()
            .filter(|p| p.spec.role == *role)
            .copied()
            .collect();
        let current = members.len();
        let desired = target.replicas as usize;

        if desired > current {
            let taken: BTreeSet<u32> = members.iter().map(|p| p.spec.rank_index).collect();
            let service = members
                .first()
                .map(|p| p.spec.service.clone())
                .unwrap_or_else(|| default_service(job, role));
            for rank in unused_ranks(&taken).take(desired - current) {
                let pod = synthesize(job, role, next_id, rank, &service, &resource);
                ops.push(Operation::create(pod, true));
                next_id += 1;
            }
        } else if desired < current {
            members.sort_by(|a, b| {
                b.spec
                    .rank_index
                    .cmp(&a.spec.rank_index)
                    .then(b.spec.id.cmp(&a.spec.id))
            });
            for p in members.iter().take(current - desired) {
                ops.push(Operation::remove(p.spec.clone(), true));
            }
        }

        debug!(job = %job, %role, current, desired, "replica target diffed");
    }

    Ok(ops)
}

/// Rebuild a started replica-driven plan from its recorded operations.
fn from_recorded(plan: &ScalePlan) -> Result<Vec<Operation>, MalformedPlan> {
    let mut resources: BTreeMap<&str, BTreeMap<String, Quantity>> = BTreeMap::new();
    for (role, target) in &plan.spec.replica_resource_specs {
        resources.insert(role.as_str(), role_resources(role, &target.resource)?);
    }

    let ops = plan
        .status
        .pods
        .iter()
        .map(|(id, entry)| {
            let resource = match entry.kind {
                OperationKind::Create => resources
                    .get(entry.role.as_str())
                    .cloned()
                    .unwrap_or_default(),
                _ => BTreeMap::new(),
            };
            Operation {
                kind: entry.kind,
                pod: PodSpec {
                    id: *id,
                    name: entry.name.clone(),
                    rank_index: entry.rank_index,
                    service: entry.service.clone(),
                    role: entry.role.clone(),
                    resource,
                },
                replacement_for: None,
                fungible: true,
            }
        })
        .collect();
    Ok(ops)
}

// ── Helpers ───────────────────────────────────────────────────────

fn parse_meta(meta: &PodMeta) -> Result<PodSpec, MalformedPlan> {
    PodSpec::from_meta(meta).map_err(|source| MalformedPlan::InvalidResource {
        subject: format!("pod {}", meta.id),
        source,
    })
}

/// Parse `meta` and fill in the default name and service.
fn pod_spec(meta: &PodMeta, job: &str) -> Result<PodSpec, MalformedPlan> {
    let mut pod = parse_meta(meta)?;
    if pod.name.is_empty() {
        pod.name = default_pod_name(job, &pod.role, pod.id);
    }
    if pod.service.is_empty() {
        pod.service = default_service(job, &pod.role);
    }
    Ok(pod)
}

fn role_resources(
    role: &str,
    raw: &BTreeMap<String, elastic_core::QuantityValue>,
) -> Result<BTreeMap<String, Quantity>, MalformedPlan> {
    parse_resources(raw).map_err(|source| MalformedPlan::InvalidResource {
        subject: format!("replicaResourceSpecs.{role}"),
        source,
    })
}

pub(crate) fn default_pod_name(job: &str, role: &str, id: PodId) -> String {
    format!("{job}-{role}-{id}")
}

pub(crate) fn default_service(job: &str, role: &str) -> String {
    format!("{job}-{role}")
}

/// One past the highest id seen on any pod object or recorded operation.
pub(crate) fn next_pod_id(pods: &[PodRecord], status: &ScalePlanStatus) -> PodId {
    pods.iter()
        .map(|p| p.spec.id)
        .chain(status.pods.keys().copied())
        .max()
        .map_or(0, |max| max + 1)
}

/// Ranks not in `taken`, smallest first.
pub(crate) fn unused_ranks(taken: &BTreeSet<u32>) -> impl Iterator<Item = u32> + '_ {
    (0u32..).filter(move |rank| !taken.contains(rank))
}

pub(crate) fn synthesize(
    job: &str,
    role: &str,
    id: PodId,
    rank: u32,
    service: &str,
    resource: &BTreeMap<String, Quantity>,
) -> PodSpec {
    PodSpec {
        id,
        name: default_pod_name(job, role, id),
        rank_index: rank,
        service: service.to_string(),
        role: role.to_string(),
        resource: resource.clone(),
    }
}
