//! Plan controller: periodically reconciles every open plan.
//!
//! Each tick lists the plans that are not terminal and spawns one
//! reconciliation task per plan that is not already being worked on. A
//! plan's task lives until its pass returns; a long-running plan therefore
//! holds its slot across ticks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use elastic_core::ScalerConfig;

use crate::cluster::{ClusterApi, ClusterResult};
use crate::reconciler::{PassOutcome, Reconciler};

pub struct PlanController<C> {
    cluster: Arc<C>,
    reconciler: Arc<Reconciler<C>>,
    /// Plan name → task running its current pass.
    in_flight: HashMap<String, JoinHandle<()>>,
}

impl<C: ClusterApi> PlanController<C> {
    pub fn new(cluster: Arc<C>, config: ScalerConfig) -> Self {
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&cluster), config));
        Self {
            cluster,
            reconciler,
            in_flight: HashMap::new(),
        }
    }

    /// Number of plans with a pass in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Tick every `interval` until `shutdown` flips, then wait for the
    /// passes already running.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "plan controller started");

        loop {
            if let Err(e) = self.tick(&shutdown).await {
                error!(error = %e, "plan controller tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("plan controller shutting down");
                    break;
                }
            }
        }

        self.drain().await;
        info!("plan controller stopped");
    }

    /// Reap finished passes and start one for every open plan without a
    /// pass in progress. Returns the number of passes started.
    pub async fn tick(&mut self, shutdown: &watch::Receiver<bool>) -> ClusterResult<usize> {
        self.in_flight.retain(|_, handle| !handle.is_finished());

        let plans = self.cluster.list_plans().await?;
        let mut started = 0;
        for plan in plans.iter().filter(|p| !p.status.phase.is_terminal()) {
            let name = plan.name().to_string();
            if self.in_flight.contains_key(&name) {
                continue;
            }

            let reconciler = Arc::clone(&self.reconciler);
            let shutdown = shutdown.clone();
            let task_plan = name.clone();
            let handle = tokio::spawn(async move {
                match reconciler.reconcile(&task_plan, &shutdown).await {
                    Ok(PassOutcome::Finished(phase)) => {
                        debug!(plan = %task_plan, %phase, "reconcile pass reached terminal phase");
                    }
                    Ok(outcome) => debug!(plan = %task_plan, ?outcome, "reconcile pass ended"),
                    Err(e) => warn!(plan = %task_plan, error = %e, "reconcile pass failed"),
                }
            });
            self.in_flight.insert(name, handle);
            started += 1;
        }

        if started > 0 {
            debug!(started, in_flight = self.in_flight.len(), "reconcile passes started");
        }
        Ok(started)
    }

    /// Wait for every pass in progress to return.
    pub async fn drain(&mut self) {
        for (plan, handle) in self.in_flight.drain() {
            if let Err(e) = handle.await {
                error!(%plan, error = %e, "reconcile task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StoreCluster;
    use elastic_core::{PlanPhase, PodMeta, ScalePlan, ScalePlanSpec, roles};
    use elastic_state::StateStore;

    fn worker_plan(name: &str, job: &str) -> ScalePlan {
        let mut spec = ScalePlanSpec::for_job(job);
        spec.create_pods.push(PodMeta {
            id: 0,
            role: roles::WORKER.to_string(),
            ..Default::default()
        });
        ScalePlan::new(name, spec)
    }

    #[tokio::test]
    async fn tick_reconciles_open_plans_once() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(StoreCluster::new(store).with_ready_on_create(true));
        cluster.store().create_plan(&worker_plan("a", "job-a")).unwrap();
        cluster.store().create_plan(&worker_plan("b", "job-b")).unwrap();

        let mut controller = PlanController::new(Arc::clone(&cluster), ScalerConfig::default());
        let (tx, rx) = watch::channel(false);

        assert_eq!(controller.tick(&rx).await.unwrap(), 2);
        controller.drain().await;
        assert_eq!(controller.in_flight(), 0);

        for name in ["a", "b"] {
            let plan = cluster.store().get_plan(name).unwrap().unwrap();
            assert_eq!(plan.status.phase, PlanPhase::Succeeded);
        }

        // Terminal plans are not picked up again.
        assert_eq!(controller.tick(&rx).await.unwrap(), 0);
        drop(tx);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(StoreCluster::new(store).with_ready_on_create(true));
        cluster.store().create_plan(&worker_plan("a", "job-a")).unwrap();

        let mut controller = PlanController::new(Arc::clone(&cluster), ScalerConfig::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            controller.run(Duration::from_millis(10), rx).await;
        });

        let mut finished = false;
        for _ in 0..200 {
            let plan = cluster.store().get_plan("a").unwrap().unwrap();
            if plan.status.phase == PlanPhase::Succeeded {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
