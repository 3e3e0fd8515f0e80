//! Cluster object API consumed by the reconciler.
//!
//! The reconciler never touches storage directly. Everything it reads or
//! mutates (pod objects, service endpoints, the plan's status subresource,
//! the job's published PS hosts) goes through [`ClusterApi`], so the same
//! engine runs against the embedded store or any other backend.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use elastic_core::{PodSpec, ScalePlan, ScalePlanStatus};
use elastic_state::{JobHosts, PodPhase, PodRecord, StateError, StateStore};

/// Result type alias for cluster calls.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors returned by the cluster object API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected by validation: {0}")]
    Validation(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Another plan of the same job is executing.
    #[error("busy: {0}")]
    Busy(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Conflict(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

impl From<StateError> for ClusterError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::AlreadyExists(key) => Self::AlreadyExists(key),
            StateError::NotFound(key) => Self::NotFound(key),
            conflict @ StateError::Conflict { .. } => Self::Conflict(conflict.to_string()),
            StateError::JobBusy { job, holder } => {
                Self::Busy(format!("waiting for plan {holder} executing on job {job}"))
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Pod and plan operations against the cluster.
///
/// Pod objects are addressed by `(job, name)`. A migrated pod keeps its
/// logical id, so the old and new objects share an id while both exist.
pub trait ClusterApi: Send + Sync + 'static {
    /// Create a pod object. Fails with `AlreadyExists` if the name is taken.
    fn create_pod(&self, job: &str, pod: &PodSpec) -> impl Future<Output = ClusterResult<()>> + Send;

    fn get_pod(
        &self,
        job: &str,
        name: &str,
    ) -> impl Future<Output = ClusterResult<Option<PodRecord>>> + Send;

    /// All pod objects of a job, in any phase.
    fn list_pods(&self, job: &str) -> impl Future<Output = ClusterResult<Vec<PodRecord>>> + Send;

    /// Delete a pod object. Fails with `NotFound` if it does not exist.
    fn delete_pod(&self, job: &str, name: &str) -> impl Future<Output = ClusterResult<()>> + Send;

    fn register_endpoint(
        &self,
        job: &str,
        service: &str,
        address: &str,
    ) -> impl Future<Output = ClusterResult<()>> + Send;

    fn deregister_endpoint(
        &self,
        job: &str,
        service: &str,
        address: &str,
    ) -> impl Future<Output = ClusterResult<()>> + Send;

    fn get_plan(&self, name: &str) -> impl Future<Output = ClusterResult<Option<ScalePlan>>> + Send;

    fn list_plans(&self) -> impl Future<Output = ClusterResult<Vec<ScalePlan>>> + Send;

    /// Write a plan's status subresource. Fails with `Conflict` when the
    /// stored resource version differs from `resource_version`.
    fn update_plan_status(
        &self,
        name: &str,
        resource_version: u64,
        status: &ScalePlanStatus,
    ) -> impl Future<Output = ClusterResult<ScalePlan>> + Send;

    /// Write the `Executing` status of a pending plan, atomically checking
    /// that no other plan of its job is executing. Fails with `Busy` when
    /// one is, and with `Conflict` on a stale `resource_version`.
    fn start_plan(
        &self,
        name: &str,
        resource_version: u64,
        status: &ScalePlanStatus,
    ) -> impl Future<Output = ClusterResult<ScalePlan>> + Send;

    /// Hand the job its current parameter-server hosts.
    fn publish_ps_hosts(
        &self,
        job: &str,
        hosts: &[String],
    ) -> impl Future<Output = ClusterResult<()>> + Send;
}

// ── Store-backed cluster ──────────────────────────────────────────

/// [`ClusterApi`] over the embedded [`StateStore`].
///
/// Pods start `Pending` and not ready. Something outside the reconciler
/// (a node agent, or a test) marks them ready via [`set_pod_ready`].
/// In standalone mode (`ready_on_create`) they are ready immediately.
///
/// [`set_pod_ready`]: StoreCluster::set_pod_ready
#[derive(Clone)]
pub struct StoreCluster {
    store: StateStore,
    ready_on_create: bool,
}

impl StoreCluster {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            ready_on_create: false,
        }
    }

    /// Report every created pod as running and ready.
    pub fn with_ready_on_create(mut self, ready: bool) -> Self {
        self.ready_on_create = ready;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Mark a pod running and ready, optionally recording its host.
    pub fn set_pod_ready(&self, job: &str, name: &str, host: Option<String>) -> ClusterResult<()> {
        let mut pod = self
            .store
            .get_pod(job, name)?
            .ok_or_else(|| ClusterError::NotFound(format!("{job}/{name}")))?;
        pod.phase = PodPhase::Running;
        pod.ready = true;
        if host.is_some() {
            pod.host = host;
        }
        pod.updated_at = epoch_secs();
        self.store.put_pod(&pod)?;
        debug!(%job, pod = %name, "pod marked ready");
        Ok(())
    }

    /// Move a pod to `phase`, clearing readiness unless it is running.
    pub fn set_pod_phase(&self, job: &str, name: &str, phase: PodPhase) -> ClusterResult<()> {
        let mut pod = self
            .store
            .get_pod(job, name)?
            .ok_or_else(|| ClusterError::NotFound(format!("{job}/{name}")))?;
        pod.phase = phase;
        pod.ready = pod.ready && phase == PodPhase::Running;
        pod.updated_at = epoch_secs();
        self.store.put_pod(&pod)?;
        Ok(())
    }

    fn validate(pod: &PodSpec) -> ClusterResult<()> {
        let missing = if pod.name.is_empty() {
            "name"
        } else if pod.service.is_empty() {
            "service"
        } else if pod.role.is_empty() {
            "type"
        } else {
            return Ok(());
        };
        Err(ClusterError::Validation(format!(
            "pod {} has an empty {missing}",
            pod.id
        )))
    }
}

impl ClusterApi for StoreCluster {
    async fn create_pod(&self, job: &str, pod: &PodSpec) -> ClusterResult<()> {
        Self::validate(pod)?;
        let mut record = PodRecord::pending(job, pod.clone(), epoch_secs());
        if self.ready_on_create {
            record.phase = PodPhase::Running;
            record.ready = true;
        }
        self.store.create_pod(&record)?;
        Ok(())
    }

    async fn get_pod(&self, job: &str, name: &str) -> ClusterResult<Option<PodRecord>> {
        Ok(self.store.get_pod(job, name)?)
    }

    async fn list_pods(&self, job: &str) -> ClusterResult<Vec<PodRecord>> {
        Ok(self.store.list_pods_for_job(job)?)
    }

    async fn delete_pod(&self, job: &str, name: &str) -> ClusterResult<()> {
        if self.store.delete_pod(job, name)? {
            Ok(())
        } else {
            Err(ClusterError::NotFound(format!("{job}/{name}")))
        }
    }

    async fn register_endpoint(&self, job: &str, service: &str, address: &str) -> ClusterResult<()> {
        self.store.add_endpoint(job, service, address)?;
        Ok(())
    }

    async fn deregister_endpoint(
        &self,
        job: &str,
        service: &str,
        address: &str,
    ) -> ClusterResult<()> {
        self.store.remove_endpoint(job, service, address)?;
        Ok(())
    }

    async fn get_plan(&self, name: &str) -> ClusterResult<Option<ScalePlan>> {
        Ok(self.store.get_plan(name)?)
    }

    async fn list_plans(&self) -> ClusterResult<Vec<ScalePlan>> {
        Ok(self.store.list_plans()?)
    }

    async fn update_plan_status(
        &self,
        name: &str,
        resource_version: u64,
        status: &ScalePlanStatus,
    ) -> ClusterResult<ScalePlan> {
        Ok(self.store.update_plan_status(name, resource_version, status)?)
    }

    async fn start_plan(
        &self,
        name: &str,
        resource_version: u64,
        status: &ScalePlanStatus,
    ) -> ClusterResult<ScalePlan> {
        Ok(self.store.start_plan(name, resource_version, status)?)
    }

    async fn publish_ps_hosts(&self, job: &str, hosts: &[String]) -> ClusterResult<()> {
        self.store.put_job_hosts(&JobHosts {
            job: job.to_string(),
            ps_hosts: hosts.to_vec(),
            updated_at: epoch_secs(),
        })?;
        Ok(())
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_core::roles;

    fn cluster() -> StoreCluster {
        StoreCluster::new(StateStore::open_in_memory().unwrap())
    }

    fn worker(id: u64) -> PodSpec {
        PodSpec {
            id,
            name: format!("mnist-worker-{id}"),
            rank_index: id as u32,
            service: "mnist-worker".to_string(),
            role: roles::WORKER.to_string(),
            resource: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_then_duplicate_is_already_exists() {
        let c = cluster();
        c.create_pod("mnist", &worker(1)).await.unwrap();

        let err = c.create_pod("mnist", &worker(1)).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));

        let pod = c.get_pod("mnist", "mnist-worker-1").await.unwrap().unwrap();
        assert_eq!(pod.phase, PodPhase::Pending);
        assert!(!pod.is_ready());
    }

    #[tokio::test]
    async fn create_rejects_incomplete_pods() {
        let c = cluster();
        let mut pod = worker(1);
        pod.service.clear();

        let err = c.create_pod("mnist", &pod).await.unwrap_err();
        assert!(matches!(err, ClusterError::Validation(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn ready_on_create_and_set_ready() {
        let c = cluster().with_ready_on_create(true);
        c.create_pod("mnist", &worker(1)).await.unwrap();
        assert!(c.get_pod("mnist", "mnist-worker-1").await.unwrap().unwrap().is_ready());

        let c = cluster();
        c.create_pod("mnist", &worker(2)).await.unwrap();
        c.set_pod_ready("mnist", "mnist-worker-2", Some("10.0.0.2:2222".into()))
            .unwrap();
        let pod = c.get_pod("mnist", "mnist-worker-2").await.unwrap().unwrap();
        assert!(pod.is_ready());
        assert_eq!(pod.host.as_deref(), Some("10.0.0.2:2222"));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let c = cluster();
        c.create_pod("mnist", &worker(1)).await.unwrap();
        c.delete_pod("mnist", "mnist-worker-1").await.unwrap();

        let err = c.delete_pod("mnist", "mnist-worker-1").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn status_conflict_maps_to_transient_conflict() {
        let c = cluster();
        let plan = ScalePlan::new("p1", elastic_core::ScalePlanSpec::for_job("mnist"));
        c.store().create_plan(&plan).unwrap();

        let status = ScalePlanStatus::default();
        c.update_plan_status("p1", 1, &status).await.unwrap();
        let err = c.update_plan_status("p1", 1, &status).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn state_errors_map_by_kind() {
        let err: ClusterError = StateError::Write("disk full".into()).into();
        assert!(matches!(err, ClusterError::Unavailable(_)));
        let err: ClusterError = StateError::NotFound("x".into()).into();
        assert_eq!(err, ClusterError::NotFound("x".into()));
    }
}
