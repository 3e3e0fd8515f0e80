//! Plan reconciler: drives one scale plan from admission to a terminal
//! phase.
//!
//! Every step re-reads the plan and the job's pods, normalizes, orders the
//! remaining work, and runs only the first batch. Outcomes are persisted as
//! they arrive, so a restarted reconciler resumes from the recorded status
//! and never repeats a finished operation.
//!
//! A pass ends when the plan is terminal, deleted, not yet admitted, or
//! shutdown was requested. Shutdown is only observed between batches; the
//! operations of a running batch always finish.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use elastic_core::{OperationKind, PlanPhase, PodId, PodOperationState, ScalePlan, ScalerConfig, roles};

use crate::cluster::{ClusterApi, ClusterError, epoch_secs};
use crate::error::{PlanError, ReconcileError, ReconcileResult};
use crate::executor::{Executor, OpOutcome};
use crate::guard::{AvailabilityGuard, Batch, substitutable};
use crate::machine::PlanStateMachine;
use crate::normalizer::{Operation, normalize};
use crate::reporter::{StatusReporter, ps_hosts};
use crate::retry::{RetryConfig, retry_transient};

/// How a reconciliation pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Not admitted yet, or another writer got there first.
    Requeue,
    /// The plan reached a terminal phase.
    Finished(PlanPhase),
    /// The plan was deleted.
    Abandoned,
    /// Shutdown was requested. The plan stays `Executing`.
    Stopped,
}

pub struct Reconciler<C> {
    cluster: Arc<C>,
    config: ScalerConfig,
    executor: Executor<C>,
    retry: RetryConfig,
}

impl<C: ClusterApi> Reconciler<C> {
    pub fn new(cluster: Arc<C>, config: ScalerConfig) -> Self {
        let executor = Executor::new(Arc::clone(&cluster), config.executor.clone());
        let retry = RetryConfig::from(&config.executor);
        Self {
            cluster,
            config,
            executor,
            retry,
        }
    }

    /// Run one reconciliation pass for plan `name`.
    pub async fn reconcile(
        &self,
        name: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> ReconcileResult<PassOutcome> {
        match self.drive(name, shutdown).await {
            Err(ReconcileError::Cluster(ClusterError::NotFound(what))) => {
                info!(plan = %name, %what, "plan deleted, abandoning");
                Ok(PassOutcome::Abandoned)
            }
            Err(ReconcileError::Cluster(ClusterError::Conflict(reason))) => {
                warn!(plan = %name, %reason, "plan status moved underneath us, requeueing");
                Ok(PassOutcome::Requeue)
            }
            other => other,
        }
    }

    async fn drive(
        &self,
        name: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> ReconcileResult<PassOutcome> {
        let Some(plan) = self.cluster.get_plan(name).await? else {
            return Ok(PassOutcome::Abandoned);
        };
        if plan.status.phase.is_terminal() {
            return Ok(PassOutcome::Finished(plan.status.phase));
        }

        let job = plan.owner_job().to_string();
        let mut machine = PlanStateMachine::new(name, plan.status.clone());
        let mut reporter =
            StatusReporter::new(Arc::clone(&self.cluster), &plan, self.retry.clone());

        if machine.phase() == PlanPhase::Pending {
            if let Some(outcome) = self.admit(&plan, &mut machine, &mut reporter).await? {
                return Ok(outcome);
            }
        }

        loop {
            if *shutdown.borrow() {
                info!(plan = %name, "shutdown requested, plan left executing");
                return Ok(PassOutcome::Stopped);
            }

            let Some(mut current) = self.cluster.get_plan(name).await? else {
                info!(plan = %name, "plan deleted, abandoning");
                return Ok(PassOutcome::Abandoned);
            };
            reporter.observe(&current);
            if current.metadata.generation != machine.status().observed_generation {
                machine.fail("spec changed during execution", epoch_secs())?;
                return self.finish(&mut machine, &mut reporter).await;
            }

            let pods = self.cluster.list_pods(&job).await?;
            current.status = machine.status().clone();
            let guard = AvailabilityGuard::new(&self.config);
            let planned = normalize(&current, &pods)
                .map_err(PlanError::from)
                .and_then(|ops| {
                    let batches = guard.plan(&ops, &current.status, &pods)?;
                    Ok((ops, batches))
                });
            let (ops, batches) = match planned {
                Ok(planned) => planned,
                Err(e) => {
                    machine.fail(&e.to_string(), epoch_secs())?;
                    return self.finish(&mut machine, &mut reporter).await;
                }
            };

            let Some(batch) = batches.into_iter().next() else {
                if machine.unrecovered_failures() > 0 {
                    let summary = machine.failure_summary();
                    machine.fail(&summary, epoch_secs())?;
                } else {
                    machine.succeed(epoch_secs())?;
                }
                return self.finish(&mut machine, &mut reporter).await;
            };

            let failed = self
                .run_batch(&job, &batch, &mut machine, &mut reporter)
                .await?;
            if !failed.is_empty() && self.config.reconciler.substitute_failed {
                self.substitute(&job, &failed, &ops, &mut machine).await?;
            }
            if batch.touches_role(roles::PS) {
                self.refresh_ps_hosts(&job, &mut machine).await?;
            }
            reporter.report(machine.status()).await?;

            if machine.unrecovered_failures() > 0 {
                let summary = machine.failure_summary();
                machine.fail(&summary, epoch_secs())?;
                return self.finish(&mut machine, &mut reporter).await;
            }
        }
    }

    // ── Admission ─────────────────────────────────────────────────

    /// Move a pending plan to `Executing`, or explain why it cannot start.
    ///
    /// Returns the pass outcome when the plan does not start.
    async fn admit(
        &self,
        plan: &ScalePlan,
        machine: &mut PlanStateMachine,
        reporter: &mut StatusReporter<C>,
    ) -> ReconcileResult<Option<PassOutcome>> {
        if let Some(reason) = self.admission_blocker(plan).await? {
            debug!(plan = %plan.name(), %reason, "plan not admitted");
            machine.wait(&reason);
            reporter.report(machine.status()).await?;
            return Ok(Some(PassOutcome::Requeue));
        }

        let pods = self.cluster.list_pods(plan.owner_job()).await?;
        let guard = AvailabilityGuard::new(&self.config);
        let checked = normalize(plan, &pods)
            .map_err(PlanError::from)
            .and_then(|ops| {
                guard.plan(&ops, &plan.status, &pods)?;
                Ok(ops)
            });

        let now = epoch_secs();
        match checked {
            Ok(ops) => {
                let mut started = PlanStateMachine::new(plan.name(), machine.status().clone());
                started.start(plan.metadata.generation, &ops, now)?;
                match reporter.start(started.status()).await {
                    Ok(()) => *machine = started,
                    Err(ClusterError::Busy(reason)) => {
                        debug!(plan = %plan.name(), %reason, "job taken by another reconciler");
                        machine.wait(&reason);
                        reporter.report(machine.status()).await?;
                        return Ok(Some(PassOutcome::Requeue));
                    }
                    Err(e) => return Err(e.into()),
                }
                info!(
                    plan = %plan.name(),
                    job = %plan.owner_job(),
                    operations = ops.len(),
                    "plan admitted"
                );
                Ok(None)
            }
            Err(e) => {
                machine.reject(&e.to_string(), now)?;
                self.finish(machine, reporter).await.map(Some)
            }
        }
    }

    /// Another plan that must run before `plan`: one already executing on
    /// the same job, or an older pending one.
    async fn admission_blocker(&self, plan: &ScalePlan) -> ReconcileResult<Option<String>> {
        let job = plan.owner_job();
        if job.is_empty() {
            return Ok(None);
        }
        let order = (plan.metadata.created_at, plan.name());

        let plans = self.cluster.list_plans().await?;
        for other in plans
            .iter()
            .filter(|p| p.owner_job() == job && p.name() != plan.name())
        {
            match other.status.phase {
                PlanPhase::Executing => {
                    return Ok(Some(format!(
                        "waiting for plan {} executing on job {job}",
                        other.name()
                    )));
                }
                PlanPhase::Pending if (other.metadata.created_at, other.name()) < order => {
                    return Ok(Some(format!("queued behind plan {}", other.name())));
                }
                _ => {}
            }
        }
        Ok(None)
    }

    // ── Execution ─────────────────────────────────────────────────

    /// Run `batch`, persisting each outcome as it arrives. Returns the
    /// operations that failed.
    ///
    /// Every launched operation is awaited even if a status write fails;
    /// the first write error is returned afterwards.
    async fn run_batch(
        &self,
        job: &str,
        batch: &Batch,
        machine: &mut PlanStateMachine,
        reporter: &mut StatusReporter<C>,
    ) -> ReconcileResult<Vec<Operation>> {
        let mut set = self.executor.launch(job, batch);
        let mut outstanding: HashSet<PodId> = batch.ops.iter().map(Operation::id).collect();
        let mut failed: HashSet<PodId> = HashSet::new();
        let mut write_error = None;

        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(%job, error = %e, "pod operation task aborted");
                    continue;
                }
            };
            outstanding.remove(&outcome.id);
            if outcome.state == PodOperationState::Failed {
                failed.insert(outcome.id);
            }
            machine.record(&outcome, epoch_secs());
            if write_error.is_none() {
                if let Err(e) = reporter.report(machine.status()).await {
                    write_error = Some(e);
                }
            }
        }

        for id in outstanding {
            failed.insert(id);
            let aborted = OpOutcome {
                id,
                state: PodOperationState::Failed,
                attempts: 0,
                message: Some("task aborted".to_string()),
            };
            machine.record(&aborted, epoch_secs());
        }

        if let Some(e) = write_error {
            return Err(e.into());
        }
        Ok(batch
            .ops
            .iter()
            .filter(|op| failed.contains(&op.id()))
            .cloned()
            .collect())
    }

    /// Schedule replacements for failed fungible operations.
    ///
    /// A failed create is deleted first so its rank is free again.
    async fn substitute(
        &self,
        job: &str,
        failed: &[Operation],
        ops: &[Operation],
        machine: &mut PlanStateMachine,
    ) -> ReconcileResult<()> {
        let guard = AvailabilityGuard::new(&self.config);
        let mut known = ops.to_vec();

        for op in failed {
            if !substitutable(op, machine.status()) {
                continue;
            }
            if op.kind == OperationKind::Create {
                self.executor.discard(job, &op.pod).await;
            }
            let pods = self.cluster.list_pods(job).await?;
            match guard.substitute(job, op, &known, machine.status(), &pods) {
                Some(sub) => {
                    machine.substitute(op.id(), &sub, epoch_secs());
                    known.push(sub);
                }
                None => debug!(%job, id = op.id(), "no substitute available"),
            }
        }
        Ok(())
    }

    /// Recompute the job's parameter-server hosts and hand them to the job.
    async fn refresh_ps_hosts(&self, job: &str, machine: &mut PlanStateMachine) -> ReconcileResult<()> {
        let pods = self.cluster.list_pods(job).await?;
        let hosts = ps_hosts(&pods, self.config.reconciler.ps_port);

        let cluster = &*self.cluster;
        let published = hosts.as_slice();
        let mut attempts = 0;
        let result = retry_transient(&self.retry, "publish_ps_hosts", &mut attempts, move || {
            cluster.publish_ps_hosts(job, published)
        })
        .await;
        match result {
            Ok(()) => info!(%job, hosts = ?hosts, "ps hosts published"),
            Err(e) => warn!(%job, error = %e, "ps hosts not published"),
        }

        machine.set_ps_hosts(hosts);
        Ok(())
    }

    async fn finish(
        &self,
        machine: &mut PlanStateMachine,
        reporter: &mut StatusReporter<C>,
    ) -> ReconcileResult<PassOutcome> {
        reporter.report(machine.status()).await?;
        let phase = machine.phase();
        info!(
            plan = %machine.plan(),
            %phase,
            message = machine.status().message.as_deref().unwrap_or(""),
            "plan finished"
        );
        Ok(PassOutcome::Finished(phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StoreCluster;
    use elastic_core::{PodMeta, ScalePlanSpec};
    use elastic_state::StateStore;

    fn cluster() -> Arc<StoreCluster> {
        Arc::new(
            StoreCluster::new(StateStore::open_in_memory().unwrap()).with_ready_on_create(true),
        )
    }

    fn create_plan(name: &str, job: &str, id: PodId) -> ScalePlan {
        let mut spec = ScalePlanSpec::for_job(job);
        spec.create_pods.push(PodMeta {
            id,
            role: roles::WORKER.to_string(),
            rank_index: id as u32,
            ..Default::default()
        });
        ScalePlan::new(name, spec)
    }

    #[tokio::test]
    async fn missing_plan_is_abandoned() {
        let reconciler = Reconciler::new(cluster(), ScalerConfig::default());
        let (_tx, rx) = watch::channel(false);
        let outcome = reconciler.reconcile("nope", &rx).await.unwrap();
        assert_eq!(outcome, PassOutcome::Abandoned);
    }

    #[tokio::test]
    async fn older_pending_plan_is_admitted_first() {
        let cluster = cluster();
        cluster.store().create_plan(&create_plan("a", "mnist", 1)).unwrap();
        cluster.store().create_plan(&create_plan("b", "mnist", 2)).unwrap();
        let reconciler = Reconciler::new(Arc::clone(&cluster), ScalerConfig::default());
        let (_tx, rx) = watch::channel(false);

        let outcome = reconciler.reconcile("b", &rx).await.unwrap();
        assert_eq!(outcome, PassOutcome::Requeue);
        let waiting = cluster.store().get_plan("b").unwrap().unwrap();
        assert_eq!(waiting.status.phase, PlanPhase::Pending);
        assert_eq!(waiting.status.message.as_deref(), Some("queued behind plan a"));

        let outcome = reconciler.reconcile("a", &rx).await.unwrap();
        assert_eq!(outcome, PassOutcome::Finished(PlanPhase::Succeeded));
        let outcome = reconciler.reconcile("b", &rx).await.unwrap();
        assert_eq!(outcome, PassOutcome::Finished(PlanPhase::Succeeded));
    }

    #[tokio::test]
    async fn malformed_plan_is_rejected_without_mutation() {
        let cluster = cluster();
        cluster
            .store()
            .create_plan(&ScalePlan::new("p1", ScalePlanSpec::for_job("mnist")))
            .unwrap();
        let reconciler = Reconciler::new(Arc::clone(&cluster), ScalerConfig::default());
        let (_tx, rx) = watch::channel(false);

        let outcome = reconciler.reconcile("p1", &rx).await.unwrap();
        assert_eq!(outcome, PassOutcome::Finished(PlanPhase::Failed));
        let plan = cluster.store().get_plan("p1").unwrap().unwrap();
        assert!(plan.status.create_time.is_none());
        assert!(plan.status.finish_time.is_some());
        assert!(plan.status.message.unwrap().starts_with("malformed plan"));
        assert!(cluster.store().list_pods_for_job("mnist").unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_leaves_plan_executing() {
        let cluster = cluster();
        cluster.store().create_plan(&create_plan("p1", "mnist", 1)).unwrap();
        let reconciler = Reconciler::new(Arc::clone(&cluster), ScalerConfig::default());
        let (_tx, rx) = watch::channel(true);

        let outcome = reconciler.reconcile("p1", &rx).await.unwrap();
        assert_eq!(outcome, PassOutcome::Stopped);
        let plan = cluster.store().get_plan("p1").unwrap().unwrap();
        assert_eq!(plan.status.phase, PlanPhase::Executing);
        assert!(cluster.store().list_pods_for_job("mnist").unwrap().is_empty());
    }
}
