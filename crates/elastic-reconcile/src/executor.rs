//! Pod operation executor: runs one batch of pod operations against the
//! cluster.
//!
//! Every operation is idempotent. A create that finds its pod already
//! present succeeds if the stored spec matches; a remove that finds its pod
//! gone succeeds. Transient API errors are retried with bounded backoff;
//! validation errors, readiness timeouts and exhausted retries are terminal
//! for that pod only. Siblings in the same batch always run to completion.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use elastic_core::config::ExecutorConfig;
use elastic_core::{PodId, PodOperationState, PodSpec};
use elastic_state::PodPhase;

use crate::cluster::{ClusterApi, ClusterError};
use crate::guard::{Batch, Stage};
use crate::normalizer::Operation;
use crate::retry::{RetryConfig, retry_transient};

/// Terminal result of one operation within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpOutcome {
    pub id: PodId,
    pub state: PodOperationState,
    /// Cluster mutation attempts, including retries.
    pub attempts: u32,
    pub message: Option<String>,
}

/// Why a single pod operation failed.
#[derive(Debug, Error)]
enum OpFailure {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("pod {0} already exists with a different spec")]
    SpecMismatch(String),

    #[error("pod {0} disappeared while waiting for readiness")]
    Vanished(String),

    #[error("pod {name} entered phase {phase:?} before becoming ready")]
    Terminated { name: String, phase: PodPhase },

    #[error("pod {name} not ready after {secs}s")]
    ReadinessTimeout { name: String, secs: u64 },
}

/// Executes pod operations with retry and a bounded worker pool.
pub struct Executor<C> {
    cluster: Arc<C>,
    config: ExecutorConfig,
    retry: RetryConfig,
}

impl<C> Clone for Executor<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            config: self.config.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<C: ClusterApi> Executor<C> {
    pub fn new(cluster: Arc<C>, config: ExecutorConfig) -> Self {
        let retry = RetryConfig::from(&config);
        Self {
            cluster,
            config,
            retry,
        }
    }

    /// Spawn every operation of `batch`; outcomes arrive as they finish.
    ///
    /// At most `concurrency_for(batch.len())` operations are in flight.
    pub fn launch(&self, job: &str, batch: &Batch) -> JoinSet<OpOutcome> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency_for(batch.ops.len())));
        let mut set = JoinSet::new();

        for op in &batch.ops {
            let exec = self.clone();
            let permits = Arc::clone(&permits);
            let job = job.to_string();
            let op = op.clone();
            let stage = batch.stage;
            set.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                exec.execute(&job, stage, &op).await
            });
        }

        debug!(
            %job,
            stage = %batch.stage,
            operations = batch.ops.len(),
            "batch launched"
        );
        set
    }

    /// Run one stage of one operation.
    pub async fn execute(&self, job: &str, stage: Stage, op: &Operation) -> OpOutcome {
        let mut attempts = 0;
        let result = match stage {
            Stage::Create => self.create_ready(job, &op.pod, &mut attempts).await,
            Stage::MigrateCreate => self.create_ready(job, &op.pod, &mut attempts).await,
            Stage::MigrateRemove => match &op.replacement_for {
                Some(old) => {
                    match self.wait_ready(job, &op.pod.name).await {
                        Ok(()) => self.remove(job, old, &mut attempts).await,
                        Err(e) => Err(e),
                    }
                }
                None => Ok(()),
            },
            Stage::Remove => self.remove(job, &op.pod, &mut attempts).await,
        };

        match result {
            Ok(()) => {
                let state = if stage == Stage::MigrateCreate && op.replacement_for.is_some() {
                    PodOperationState::Created
                } else {
                    PodOperationState::Succeeded
                };
                info!(
                    %job,
                    pod = %op.pod.name,
                    id = op.id(),
                    %stage,
                    attempts,
                    "pod operation succeeded"
                );
                OpOutcome {
                    id: op.id(),
                    state,
                    attempts,
                    message: None,
                }
            }
            Err(e) => {
                warn!(
                    %job,
                    pod = %op.pod.name,
                    id = op.id(),
                    %stage,
                    attempts,
                    error = %e,
                    "pod operation failed"
                );
                OpOutcome {
                    id: op.id(),
                    state: PodOperationState::Failed,
                    attempts,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    /// Delete a pod, ignoring every error. Used to clear a failed create
    /// before a substitute takes its rank.
    pub async fn discard(&self, job: &str, pod: &PodSpec) {
        let mut attempts = 0;
        if let Err(e) = self.remove(job, pod, &mut attempts).await {
            debug!(%job, pod = %pod.name, error = %e, "failed pod not discarded");
        }
    }

    // ── Steps ─────────────────────────────────────────────────────

    /// Create (or adopt) the pod, register it, and wait until it is ready.
    async fn create_ready(&self, job: &str, pod: &PodSpec, attempts: &mut u32) -> Result<(), OpFailure> {
        let cluster = &*self.cluster;

        let created = retry_transient(&self.retry, "create_pod", attempts, move || {
            cluster.create_pod(job, pod)
        })
        .await;
        match created {
            Ok(()) => debug!(%job, pod = %pod.name, "pod created"),
            Err(ClusterError::AlreadyExists(_)) => {
                let mut reads = 0;
                let existing = retry_transient(&self.retry, "get_pod", &mut reads, move || {
                    cluster.get_pod(job, &pod.name)
                })
                .await?;
                match existing {
                    Some(record) if record.spec == *pod => {
                        debug!(%job, pod = %pod.name, "pod already exists with matching spec");
                    }
                    Some(_) => return Err(OpFailure::SpecMismatch(pod.name.clone())),
                    None => return Err(OpFailure::Vanished(pod.name.clone())),
                }
            }
            Err(e) => return Err(e.into()),
        }

        let address = pod.address();
        let (service, address) = (pod.service.as_str(), address.as_str());
        retry_transient(&self.retry, "register_endpoint", attempts, move || {
            cluster.register_endpoint(job, service, address)
        })
        .await?;

        self.wait_ready(job, &pod.name).await
    }

    /// Deregister and delete the pod. An absent pod counts as removed.
    async fn remove(&self, job: &str, pod: &PodSpec, attempts: &mut u32) -> Result<(), OpFailure> {
        let cluster = &*self.cluster;
        let address = pod.address();

        if !pod.service.is_empty() {
            let (service, address) = (pod.service.as_str(), address.as_str());
            retry_transient(&self.retry, "deregister_endpoint", attempts, move || {
                cluster.deregister_endpoint(job, service, address)
            })
            .await?;
        }

        let deleted = retry_transient(&self.retry, "delete_pod", attempts, move || {
            cluster.delete_pod(job, &pod.name)
        })
        .await;
        match deleted {
            Ok(()) => {
                debug!(%job, pod = %pod.name, "pod deleted");
                Ok(())
            }
            Err(ClusterError::NotFound(_)) => {
                debug!(%job, pod = %pod.name, "pod already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the pod reports ready, bounded by the readiness timeout.
    async fn wait_ready(&self, job: &str, name: &str) -> Result<(), OpFailure> {
        let timeout = self.config.readiness_timeout();
        match tokio::time::timeout(timeout, self.poll_ready(job, name)).await {
            Ok(result) => {
                if result.is_ok() {
                    debug!(%job, pod = %name, "pod ready");
                }
                result
            }
            Err(_) => Err(OpFailure::ReadinessTimeout {
                name: name.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    async fn poll_ready(&self, job: &str, name: &str) -> Result<(), OpFailure> {
        let cluster = &*self.cluster;
        let poll = self.config.readiness_poll();
        loop {
            let mut reads = 0;
            let pod = retry_transient(&self.retry, "get_pod", &mut reads, move || {
                cluster.get_pod(job, name)
            })
            .await?;
            match pod {
                Some(p) if p.is_ready() => return Ok(()),
                Some(p) if !p.is_live() => {
                    return Err(OpFailure::Terminated {
                        name: name.to_string(),
                        phase: p.phase,
                    });
                }
                Some(_) => tokio::time::sleep(poll).await,
                None => return Err(OpFailure::Vanished(name.to_string())),
            }
        }
    }
}
