//! Plan state machine: owns a plan's phase and per-pod outcomes.
//!
//! Phases only move forward: `Pending → Executing → {Succeeded, Failed}`,
//! or `Pending → Failed` for plans rejected before any mutation. The
//! machine works on an in-memory copy of the status; the reporter persists
//! it.

use tracing::{debug, info, warn};

use elastic_core::{
    OperationKind, PlanPhase, PodId, PodOperationState, PodOperationStatus, ScalePlanStatus,
};

use crate::error::TransitionError;
use crate::executor::OpOutcome;
use crate::normalizer::Operation;

pub struct PlanStateMachine {
    plan: String,
    status: ScalePlanStatus,
}

impl PlanStateMachine {
    /// Resume from a persisted status.
    pub fn new(plan: &str, status: ScalePlanStatus) -> Self {
        Self {
            plan: plan.to_string(),
            status,
        }
    }

    pub fn plan(&self) -> &str {
        &self.plan
    }

    pub fn phase(&self) -> PlanPhase {
        self.status.phase
    }

    pub fn status(&self) -> &ScalePlanStatus {
        &self.status
    }

    fn transition(&mut self, to: PlanPhase) -> Result<(), TransitionError> {
        let from = self.status.phase;
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }
        self.status.phase = to;
        info!(plan = %self.plan, %from, %to, "plan phase changed");
        Ok(())
    }

    // ── Pending ───────────────────────────────────────────────────

    /// Note why an admitted plan has not started yet.
    pub fn wait(&mut self, reason: &str) {
        if self.status.phase == PlanPhase::Pending {
            self.status.message = Some(reason.to_string());
        }
    }

    /// `Pending → Executing`: record the start and every planned operation.
    pub fn start(&mut self, generation: u64, ops: &[Operation], now: u64) -> Result<(), TransitionError> {
        self.transition(PlanPhase::Executing)?;
        self.status.create_time.get_or_insert(now);
        self.status.observed_generation = generation;
        self.status.message = None;
        for op in ops {
            self.status
                .pods
                .entry(op.id())
                .or_insert_with(|| PodOperationStatus::pending(&op.pod, op.kind, now));
        }
        debug!(plan = %self.plan, operations = ops.len(), "plan started");
        Ok(())
    }

    /// `Pending → Failed`: the plan was rejected before touching the
    /// cluster.
    pub fn reject(&mut self, reason: &str, now: u64) -> Result<(), TransitionError> {
        self.transition(PlanPhase::Failed)?;
        self.status.finish_time.get_or_insert(now);
        self.status.message = Some(reason.to_string());
        warn!(plan = %self.plan, %reason, "plan rejected");
        Ok(())
    }

    // ── Executing ─────────────────────────────────────────────────

    /// Fold one operation outcome into the per-pod status.
    ///
    /// Entries that already reached a terminal state are left untouched.
    pub fn record(&mut self, outcome: &OpOutcome, now: u64) {
        let Some(entry) = self.status.pods.get_mut(&outcome.id) else {
            warn!(plan = %self.plan, id = outcome.id, "outcome for unknown operation");
            return;
        };
        if entry.state.is_terminal() {
            debug!(plan = %self.plan, id = outcome.id, "operation already terminal");
            return;
        }
        entry.state = outcome.state;
        entry.attempts += outcome.attempts;
        entry.message = outcome.message.clone();
        entry.updated_at = now;
    }

    /// Record `sub` as the replacement for the failed operation `failed`.
    pub fn substitute(&mut self, failed: PodId, sub: &Operation, now: u64) {
        if let Some(entry) = self.status.pods.get_mut(&failed) {
            entry.substituted_by = Some(sub.id());
            entry.updated_at = now;
        }
        self.status
            .pods
            .insert(sub.id(), PodOperationStatus::pending(&sub.pod, sub.kind, now));
        info!(plan = %self.plan, failed, substitute = sub.id(), "operation substituted");
    }

    pub fn set_ps_hosts(&mut self, hosts: Vec<String>) {
        self.status.ps_hosts = hosts;
    }

    /// Failed operations nothing replaced.
    pub fn unrecovered_failures(&self) -> usize {
        self.status.unsubstituted_failures().count()
    }

    /// `Executing → Succeeded`.
    pub fn succeed(&mut self, now: u64) -> Result<(), TransitionError> {
        self.transition(PlanPhase::Succeeded)?;
        self.status.finish_time.get_or_insert(now);
        self.status.message = None;
        Ok(())
    }

    /// `Executing → Failed`. Operations that never ran are marked skipped.
    pub fn fail(&mut self, reason: &str, now: u64) -> Result<(), TransitionError> {
        self.transition(PlanPhase::Failed)?;
        self.status.finish_time.get_or_insert(now);
        self.status.message = Some(reason.to_string());
        for entry in self.status.pods.values_mut() {
            if !entry.state.is_terminal() {
                entry.state = PodOperationState::Skipped;
                entry.updated_at = now;
            }
        }
        warn!(plan = %self.plan, %reason, "plan failed");
        Ok(())
    }

    /// Summary line for a failed plan.
    pub fn failure_summary(&self) -> String {
        let failed: Vec<String> = self
            .status
            .unsubstituted_failures()
            .map(|(id, entry)| match entry.kind {
                OperationKind::Create => format!("create {} ({id})", entry.name),
                OperationKind::Migrate => format!("migrate {} ({id})", entry.name),
                OperationKind::Remove => format!("remove {} ({id})", entry.name),
            })
            .collect();
        format!("{} pod operation(s) failed: {}", failed.len(), failed.join(", "))
    }
}
