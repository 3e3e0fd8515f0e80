//! Status reporter: persists a plan's status subresource.
//!
//! Writes are skipped when nothing changed, so each transition is written
//! once. `createTime` and `finishTime` are never rewritten after they are
//! first persisted. Status writes carry the resource version they were
//! computed against; on a conflict the reporter re-reads the plan and
//! retries only if the stored status is still the one it last wrote.

use std::sync::Arc;

use tracing::{debug, warn};

use elastic_core::{ScalePlan, ScalePlanStatus, roles};
use elastic_state::PodRecord;

use crate::cluster::{ClusterApi, ClusterError, ClusterResult};
use crate::retry::RetryConfig;

pub struct StatusReporter<C> {
    cluster: Arc<C>,
    plan: String,
    resource_version: u64,
    last: ScalePlanStatus,
    retry: RetryConfig,
}

impl<C: ClusterApi> StatusReporter<C> {
    pub fn new(cluster: Arc<C>, plan: &ScalePlan, retry: RetryConfig) -> Self {
        Self {
            cluster,
            plan: plan.name().to_string(),
            resource_version: plan.metadata.resource_version,
            last: plan.status.clone(),
            retry,
        }
    }

    /// Adopt a freshly read copy of the plan if its status is ours.
    pub fn observe(&mut self, plan: &ScalePlan) {
        if plan.status == self.last {
            self.resource_version = plan.metadata.resource_version;
        }
    }

    /// Persist `status`. Returns false when it was already stored.
    pub async fn report(&mut self, status: &ScalePlanStatus) -> ClusterResult<bool> {
        self.write(status, false).await
    }

    /// Persist the status that moves the plan to `Executing`. Fails with
    /// `Busy` while another plan of the job is executing.
    pub async fn start(&mut self, status: &ScalePlanStatus) -> ClusterResult<()> {
        self.write(status, true).await.map(|_| ())
    }

    async fn write(&mut self, status: &ScalePlanStatus, start: bool) -> ClusterResult<bool> {
        let mut status = status.clone();
        if let Some(t) = self.last.create_time {
            status.create_time = Some(t);
        }
        if let Some(t) = self.last.finish_time {
            status.finish_time = Some(t);
        }
        if status == self.last {
            return Ok(false);
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = if start {
                self.cluster
                    .start_plan(&self.plan, self.resource_version, &status)
                    .await
            } else {
                self.cluster
                    .update_plan_status(&self.plan, self.resource_version, &status)
                    .await
            };
            match result {
                Ok(stored) => {
                    self.resource_version = stored.metadata.resource_version;
                    self.last = stored.status;
                    debug!(
                        plan = %self.plan,
                        phase = %self.last.phase,
                        version = self.resource_version,
                        "status reported"
                    );
                    return Ok(true);
                }
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(ClusterError::Conflict(reason)) => {
                    let current = self
                        .cluster
                        .get_plan(&self.plan)
                        .await?
                        .ok_or_else(|| ClusterError::NotFound(self.plan.clone()))?;
                    if current.status != self.last {
                        warn!(plan = %self.plan, %reason, "status changed by another writer");
                        return Err(ClusterError::Conflict(reason));
                    }
                    debug!(plan = %self.plan, "plan metadata moved, retrying status write");
                    self.resource_version = current.metadata.resource_version;
                }
                Err(e) if e.is_transient() => {
                    warn!(plan = %self.plan, attempt, error = %e, "status write failed, retrying");
                    tokio::time::sleep(self.retry.initial_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parameter-server hosts of a job, ordered by rank.
///
/// Only live, ready PS pods count. When two pods hold the same rank (mid
/// migration) the newer one is published. A pod's reported host wins over
/// its service address.
pub fn ps_hosts(pods: &[PodRecord], ps_port: u16) -> Vec<String> {
    let mut ready: Vec<&PodRecord> = pods
        .iter()
        .filter(|p| p.spec.role == roles::PS && p.is_live() && p.is_ready())
        .collect();
    ready.sort_by(|a, b| {
        a.spec
            .rank_index
            .cmp(&b.spec.rank_index)
            .then(b.created_at.cmp(&a.created_at))
            .then(b.spec.name.cmp(&a.spec.name))
    });
    ready.dedup_by_key(|p| p.spec.rank_index);
    ready
        .into_iter()
        .map(|p| {
            p.host
                .clone()
                .unwrap_or_else(|| format!("{}:{ps_port}", p.spec.address()))
        })
        .collect()
}
