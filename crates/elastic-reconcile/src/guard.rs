//! Availability guard: orders operations into batches that never take a
//! role below its availability floor.
//!
//! Batches run strictly in sequence:
//!
//! 1. `Create`: new capacity, unconstrained.
//! 2. `MigrateCreate`: replacement pods, which must become ready first.
//! 3. `MigrateRemove`: old pods, chunked by the removal budget.
//! 4. `Remove`: plain removals, chunked so the projected ready count stays
//!    at or above the floor.
//!
//! Role state is derived fresh from the live pods on every call. Pods that
//! replace a still-live old pod are left out of a role's baseline, so a
//! half-finished migration sees the same floor it started with.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use tracing::debug;

use elastic_core::{OperationKind, PodOperationState, ScalePlanStatus, ScalerConfig};
use elastic_state::PodRecord;

use crate::error::UnsafePlan;
use crate::normalizer::{Operation, next_pod_id, synthesize, unused_ranks};

/// Which half of the work a batch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Create,
    MigrateCreate,
    MigrateRemove,
    Remove,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::MigrateCreate => "migrate-create",
            Self::MigrateRemove => "migrate-remove",
            Self::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// Operations safe to run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub stage: Stage,
    pub ops: Vec<Operation>,
}

impl Batch {
    pub fn touches_role(&self, role: &str) -> bool {
        self.ops.iter().any(|op| op.role() == role)
    }
}

/// Per-role counters derived from the live pods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleState {
    /// Live pods, excluding migration replacements.
    pub live: u32,
    /// Live pods that are ready, excluding migration replacements.
    pub ready: u32,
    /// Minimum ready pods, `None` when unconstrained.
    pub floor: Option<u32>,
}

impl RoleState {
    /// Pods one batch may take away.
    pub fn budget(&self) -> Option<u32> {
        self.floor.map(|floor| self.ready.saturating_sub(floor))
    }
}

pub struct AvailabilityGuard<'a> {
    config: &'a ScalerConfig,
}

impl<'a> AvailabilityGuard<'a> {
    pub fn new(config: &'a ScalerConfig) -> Self {
        Self { config }
    }

    /// Derive per-role counters for every role with pods or operations.
    pub fn role_states(&self, ops: &[Operation], pods: &[PodRecord]) -> BTreeMap<String, RoleState> {
        let replacements: HashSet<&str> = ops
            .iter()
            .filter(|op| op.kind == OperationKind::Migrate && op.replacement_for.is_some())
            .map(|op| op.pod.name.as_str())
            .collect();

        let mut states: BTreeMap<String, RoleState> = BTreeMap::new();
        for pod in pods.iter().filter(|p| p.is_live()) {
            let state = states.entry(pod.spec.role.clone()).or_default();
            if replacements.contains(pod.spec.name.as_str()) {
                continue;
            }
            state.live += 1;
            if pod.is_ready() {
                state.ready += 1;
            }
        }
        for op in ops {
            states.entry(op.role().to_string()).or_default();
        }
        for (role, state) in states.iter_mut() {
            state.floor = self.config.policy_for(role).floor(state.ready);
        }
        states
    }

    /// Order the non-terminal operations into batches.
    ///
    /// Fails with [`UnsafePlan`] when a floored role has removals but no
    /// budget, or when the plan would end below the floor.
    pub fn plan(
        &self,
        ops: &[Operation],
        status: &ScalePlanStatus,
        pods: &[PodRecord],
    ) -> Result<Vec<Batch>, UnsafePlan> {
        let states = self.role_states(ops, pods);
        let live_names: HashSet<&str> = pods
            .iter()
            .filter(|p| p.is_live())
            .map(|p| p.spec.name.as_str())
            .collect();

        let mut creates = Vec::new();
        let mut migrate_creates = Vec::new();
        let mut migrate_removes = Vec::new();
        let mut removes = Vec::new();
        for op in ops {
            let state = status.pod_state(op.id());
            if state.is_terminal() {
                continue;
            }
            match op.kind {
                OperationKind::Create => creates.push(op.clone()),
                OperationKind::Migrate => {
                    if state == PodOperationState::Pending {
                        migrate_creates.push(op.clone());
                    }
                    migrate_removes.push(op.clone());
                }
                OperationKind::Remove => removes.push(op.clone()),
            }
        }

        // Removals that actually take a live pod away.
        let takes_pod = |op: &Operation| match op.kind {
            OperationKind::Migrate => op.replacement_for.is_some(),
            _ => live_names.contains(op.pod.name.as_str()),
        };

        let mut added: BTreeMap<String, u32> = BTreeMap::new();
        for op in &creates {
            *added.entry(op.role().to_string()).or_default() += 1;
        }

        for (role, state) in &states {
            let Some(floor) = state.floor else {
                continue;
            };
            let migrating = migrate_removes
                .iter()
                .filter(|&op| op.role() == role.as_str() && takes_pod(op))
                .count() as u32;
            let removing = removes
                .iter()
                .filter(|&op| op.role() == role.as_str() && takes_pod(op))
                .count() as u32;
            let adding = added.get(role.as_str()).copied().unwrap_or(0);

            if migrating + removing > 0 && state.ready <= floor {
                return Err(UnsafePlan {
                    role: role.clone(),
                    reason: format!(
                        "{} removal(s) requested but {} ready pod(s) leave no room above floor {floor}",
                        migrating + removing,
                        state.ready
                    ),
                });
            }
            if state.ready + adding < floor + removing {
                return Err(UnsafePlan {
                    role: role.clone(),
                    reason: format!(
                        "{} ready + {adding} created - {removing} removed is below floor {floor}",
                        state.ready
                    ),
                });
            }
        }

        let mut batches = Vec::new();
        if !creates.is_empty() {
            batches.push(Batch {
                stage: Stage::Create,
                ops: creates,
            });
        }
        if !migrate_creates.is_empty() {
            batches.push(Batch {
                stage: Stage::MigrateCreate,
                ops: migrate_creates,
            });
        }
        for ops in chunk(migrate_removes, &states, &takes_pod, |_, _| u32::MAX) {
            batches.push(Batch {
                stage: Stage::MigrateRemove,
                ops,
            });
        }
        let remove_chunks = chunk(removes, &states, &takes_pod, |role, state| {
            state.ready + added.get(role).copied().unwrap_or(0)
        });
        for ops in remove_chunks {
            batches.push(Batch {
                stage: Stage::Remove,
                ops,
            });
        }

        debug!(
            batches = batches.len(),
            stages = ?batches.iter().map(|b| b.stage).collect::<Vec<_>>(),
            "operations ordered"
        );
        Ok(batches)
    }

    /// A replacement for a failed fungible operation, if one exists.
    ///
    /// A failed create becomes a create with a fresh id and the smallest
    /// unused rank; a failed remove moves to the highest-ranked live pod of
    /// the role that no operation targets. Substitutes are never
    /// substituted themselves.
    pub fn substitute(
        &self,
        job: &str,
        failed: &Operation,
        ops: &[Operation],
        status: &ScalePlanStatus,
        pods: &[PodRecord],
    ) -> Option<Operation> {
        if !substitutable(failed, status) {
            return None;
        }

        let role = failed.role();
        let live = pods.iter().filter(|p| p.is_live() && p.spec.role == role);

        match failed.kind {
            OperationKind::Create => {
                let mut taken: BTreeSet<u32> = live.map(|p| p.spec.rank_index).collect();
                taken.extend(
                    ops.iter()
                        .filter(|op| {
                            op.kind == OperationKind::Create
                                && op.role() == role
                                && op.id() != failed.id()
                                && status.pod_state(op.id()) != PodOperationState::Failed
                        })
                        .map(|op| op.pod.rank_index),
                );
                let rank = unused_ranks(&taken).next()?;
                let id = next_pod_id(pods, status);
                let pod = synthesize(job, role, id, rank, &failed.pod.service, &failed.pod.resource);
                Some(Operation::create(pod, true))
            }
            OperationKind::Remove => {
                let targeted: HashSet<&str> = ops.iter().map(|op| op.pod.name.as_str()).collect();
                live.filter(|p| !targeted.contains(p.spec.name.as_str()))
                    .max_by_key(|p| (p.spec.rank_index, p.spec.id))
                    .map(|p| Operation::remove(p.spec.clone(), true))
            }
            OperationKind::Migrate => None,
        }
    }
}

/// Whether `failed` may be replaced: it was synthesized from replica
/// specs and is not itself a substitute.
pub fn substitutable(failed: &Operation, status: &ScalePlanStatus) -> bool {
    failed.fungible
        && !status
            .pods
            .values()
            .any(|entry| entry.substituted_by == Some(failed.id()))
}

/// Split removal operations into batches.
///
/// Operations on unconstrained roles, and ones that take no live pod, go
/// into the first batch. A floored role removes at most its budget per
/// batch and never more than `projected - floor`, where `projected` starts
/// at `start(role, state)` and drops with each batch.
fn chunk<F, S>(
    ops: Vec<Operation>,
    states: &BTreeMap<String, RoleState>,
    takes_pod: &F,
    start: S,
) -> Vec<Vec<Operation>>
where
    F: Fn(&Operation) -> bool,
    S: Fn(&str, &RoleState) -> u32,
{
    let mut chunks: Vec<Vec<Operation>> = vec![Vec::new()];
    let mut floored: BTreeMap<String, Vec<Operation>> = BTreeMap::new();

    for op in ops {
        let floor = states.get(op.role()).and_then(|s| s.floor);
        if floor.is_some() && takes_pod(&op) {
            floored.entry(op.role().to_string()).or_default().push(op);
        } else {
            chunks[0].push(op);
        }
    }

    for (role, list) in &floored {
        let Some(state) = states.get(role) else {
            continue;
        };
        let (Some(floor), Some(budget)) = (state.floor, state.budget()) else {
            continue;
        };
        let mut projected = start(role.as_str(), state);
        let mut rest = list.as_slice();
        let mut index = 0;
        while !rest.is_empty() {
            let cap = budget.min(projected.saturating_sub(floor)).max(1) as usize;
            let take = cap.min(rest.len());
            if chunks.len() <= index {
                chunks.push(Vec::new());
            }
            chunks[index].extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            projected = projected.saturating_sub(take as u32);
            index += 1;
        }
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_core::config::AvailabilityPolicy;
    use elastic_core::{PodId, PodOperationStatus, PodSpec, roles};
    use elastic_state::PodPhase;

    fn pod(role: &str, id: PodId, rank: u32, ready: bool) -> PodRecord {
        let spec = PodSpec {
            id,
            name: format!("mnist-{role}-{id}"),
            rank_index: rank,
            service: format!("mnist-{role}"),
            role: role.to_string(),
            resource: Default::default(),
        };
        let mut record = PodRecord::pending("mnist", spec, 1);
        if ready {
            record.phase = PodPhase::Running;
            record.ready = true;
        }
        record
    }

    fn migrate(old: &PodRecord) -> Operation {
        let mut new = old.spec.clone();
        new.name = format!("{}-next", old.spec.name);
        Operation {
            kind: OperationKind::Migrate,
            pod: new,
            replacement_for: Some(old.spec.clone()),
            fungible: false,
        }
    }

    fn config_with(role: &str, policy: AvailabilityPolicy) -> ScalerConfig {
        let mut config = ScalerConfig::default();
        config.availability.insert(role.to_string(), policy);
        config
    }

    fn sizes(batches: &[Batch]) -> Vec<(Stage, usize)> {
        batches.iter().map(|b| (b.stage, b.ops.len())).collect()
    }

    #[test]
    fn unconstrained_roles_run_in_stage_order() {
        let config = ScalerConfig::default();
        let guard = AvailabilityGuard::new(&config);
        let pods = vec![pod(roles::WORKER, 1, 0, true), pod(roles::WORKER, 2, 1, true)];
        let ops = vec![
            Operation::remove(pods[0].spec.clone(), false),
            Operation::remove(pods[1].spec.clone(), false),
            Operation::create(pod(roles::WORKER, 3, 2, false).spec, false),
        ];

        let batches = guard.plan(&ops, &ScalePlanStatus::default(), &pods).unwrap();
        assert_eq!(sizes(&batches), vec![(Stage::Create, 1), (Stage::Remove, 2)]);
    }

    #[test]
    fn single_ps_migration_under_min_one_is_unsafe() {
        let config = config_with(roles::PS, AvailabilityPolicy::Min { count: 1 });
        let guard = AvailabilityGuard::new(&config);
        let pods = vec![pod(roles::PS, 2, 0, true)];
        let ops = vec![migrate(&pods[0])];

        let err = guard.plan(&ops, &ScalePlanStatus::default(), &pods).unwrap_err();
        assert_eq!(err.role, "ps");
    }

    #[test]
    fn ps_migration_removes_one_old_pod_per_batch() {
        let config = ScalerConfig::default();
        let guard = AvailabilityGuard::new(&config);
        let pods: Vec<_> = (0..3).map(|i| pod(roles::PS, i, i as u32, true)).collect();
        let ops: Vec<_> = pods.iter().map(migrate).collect();

        let batches = guard.plan(&ops, &ScalePlanStatus::default(), &pods).unwrap();
        assert_eq!(
            sizes(&batches),
            vec![
                (Stage::MigrateCreate, 3),
                (Stage::MigrateRemove, 1),
                (Stage::MigrateRemove, 1),
                (Stage::MigrateRemove, 1),
            ]
        );
    }

    #[test]
    fn replacements_do_not_raise_the_floor() {
        let config = ScalerConfig::default();
        let guard = AvailabilityGuard::new(&config);
        let mut pods: Vec<_> = (0..2).map(|i| pod(roles::PS, i, i as u32, true)).collect();
        let ops: Vec<_> = pods.iter().map(migrate).collect();
        // Both replacements are up.
        for op in &ops {
            let mut record = PodRecord::pending("mnist", op.pod.clone(), 1);
            record.phase = PodPhase::Running;
            record.ready = true;
            pods.push(record);
        }

        let states = guard.role_states(&ops, &pods);
        let ps = &states["ps"];
        assert_eq!(ps.ready, 2);
        assert_eq!(ps.live, 2);
        assert_eq!(ps.floor, Some(1));
        assert_eq!(ps.budget(), Some(1));

        let mut status = ScalePlanStatus::default();
        for op in &ops {
            let mut entry = PodOperationStatus::pending(&op.pod, op.kind, 0);
            entry.state = PodOperationState::Created;
            status.pods.insert(op.id(), entry);
        }
        let batches = guard.plan(&ops, &status, &pods).unwrap();
        assert_eq!(
            sizes(&batches),
            vec![(Stage::MigrateRemove, 1), (Stage::MigrateRemove, 1)]
        );
    }

    #[test]
    fn removals_below_floor_are_unsafe() {
        let config = ScalerConfig::default();
        let guard = AvailabilityGuard::new(&config);
        let pods: Vec<_> = (0..4).map(|i| pod(roles::PS, i, i as u32, true)).collect();

        let one = vec![Operation::remove(pods[3].spec.clone(), false)];
        assert!(guard.plan(&one, &ScalePlanStatus::default(), &pods).is_ok());

        let two = vec![
            Operation::remove(pods[3].spec.clone(), false),
            Operation::remove(pods[2].spec.clone(), false),
        ];
        let err = guard.plan(&two, &ScalePlanStatus::default(), &pods).unwrap_err();
        assert!(err.reason.contains("below floor 3"));
    }

    #[test]
    fn floored_removals_are_chunked_by_budget_and_projection() {
        let config = config_with(roles::PS, AvailabilityPolicy::Min { count: 2 });
        let guard = AvailabilityGuard::new(&config);
        let pods: Vec<_> = (0..4).map(|i| pod(roles::PS, i, i as u32, true)).collect();
        let mut ops: Vec<_> = (4..6)
            .map(|i| Operation::create(pod(roles::PS, i, i as u32, false).spec, false))
            .collect();
        ops.extend((1..4).map(|i| Operation::remove(pods[i].spec.clone(), false)));

        let batches = guard.plan(&ops, &ScalePlanStatus::default(), &pods).unwrap();
        assert_eq!(
            sizes(&batches),
            vec![(Stage::Create, 2), (Stage::Remove, 2), (Stage::Remove, 1)]
        );
    }

    #[test]
    fn removing_absent_pods_is_never_unsafe() {
        let config = config_with(roles::PS, AvailabilityPolicy::Min { count: 1 });
        let guard = AvailabilityGuard::new(&config);
        let pods = vec![pod(roles::PS, 0, 0, true)];
        let gone = pod(roles::PS, 7, 1, true);
        let ops = vec![Operation::remove(gone.spec, false)];

        let batches = guard.plan(&ops, &ScalePlanStatus::default(), &pods).unwrap();
        assert_eq!(sizes(&batches), vec![(Stage::Remove, 1)]);
    }

    #[test]
    fn terminal_operations_are_skipped() {
        let config = ScalerConfig::default();
        let guard = AvailabilityGuard::new(&config);
        let done = Operation::create(pod(roles::WORKER, 1, 0, false).spec, false);
        let mut status = ScalePlanStatus::default();
        let mut entry = PodOperationStatus::pending(&done.pod, done.kind, 0);
        entry.state = PodOperationState::Succeeded;
        status.pods.insert(1, entry);

        let batches = guard.plan(&[done], &status, &[]).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn failed_create_is_substituted_with_next_free_rank() {
        let config = ScalerConfig::default();
        let guard = AvailabilityGuard::new(&config);
        let pods = vec![pod(roles::WORKER, 0, 0, true), pod(roles::WORKER, 1, 1, true)];
        let failed = Operation::create(pod(roles::WORKER, 2, 2, false).spec, true);
        let sibling = Operation::create(pod(roles::WORKER, 3, 3, false).spec, true);
        let ops = vec![failed.clone(), sibling];
        let mut status = ScalePlanStatus::default();
        for op in &ops {
            status.pods.insert(op.id(), PodOperationStatus::pending(&op.pod, op.kind, 0));
        }
        status.pods.get_mut(&2).unwrap().state = PodOperationState::Failed;

        let sub = guard.substitute("mnist", &failed, &ops, &status, &pods).unwrap();
        assert_eq!(sub.kind, OperationKind::Create);
        assert_eq!(sub.pod.rank_index, 2);
        assert_eq!(sub.id(), 4);
        assert_eq!(sub.pod.name, "mnist-worker-4");
        assert!(sub.fungible);

        // The substitute itself is not substituted again.
        status.pods.get_mut(&2).unwrap().substituted_by = Some(4);
        assert!(guard.substitute("mnist", &sub, &ops, &status, &pods).is_none());
    }

    #[test]
    fn failed_remove_moves_to_next_highest_rank() {
        let config = ScalerConfig::default();
        let guard = AvailabilityGuard::new(&config);
        let pods: Vec<_> = (0..4).map(|i| pod(roles::WORKER, i, i as u32, true)).collect();
        let failed = Operation::remove(pods[3].spec.clone(), true);
        let ops = vec![failed.clone(), Operation::remove(pods[2].spec.clone(), true)];

        let sub = guard
            .substitute("mnist", &failed, &ops, &ScalePlanStatus::default(), &pods)
            .unwrap();
        assert_eq!(sub.kind, OperationKind::Remove);
        assert_eq!(sub.id(), 1);
    }

    #[test]
    fn explicit_operations_have_no_substitute() {
        let config = ScalerConfig::default();
        let guard = AvailabilityGuard::new(&config);
        let failed = Operation::create(pod(roles::WORKER, 2, 2, false).spec, false);
        let ops = vec![failed.clone()];
        assert!(
            guard
                .substitute("mnist", &failed, &ops, &ScalePlanStatus::default(), &[])
                .is_none()
        );
    }
}
