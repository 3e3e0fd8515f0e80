//! StateStore: redb-backed persistence for the elastic scaler.
//!
//! Provides typed CRUD over scale plans, pods, services, and published
//! hosts. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing and standalone simulation).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SCALE_PLANS).map_err(map_err!(Table))?;
        txn.open_table(PODS).map_err(map_err!(Table))?;
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(JOB_HOSTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ───────────────────────────────────────

    fn read<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix = whole table).
    fn scan<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn write<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write of one key inside a single write transaction.
    ///
    /// `update` sees the current value (if any) and returns the value to
    /// store, or an error that aborts the transaction.
    fn modify<T, F>(&self, def: JsonTable, key: &str, update: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StateResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            stored = update(current)?;
            let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    // ── Scale plans ───────────────────────────────────────────────

    /// Store a new plan. Fails if a plan with the same name exists.
    pub fn create_plan(&self, plan: &ScalePlan) -> StateResult<ScalePlan> {
        let key = plan.table_key();
        let now = epoch_secs();
        let stored = self.modify(SCALE_PLANS, &key, |current: Option<ScalePlan>| {
            if current.is_some() {
                return Err(StateError::AlreadyExists(key.clone()));
            }
            let mut fresh = plan.clone();
            fresh.metadata.generation = 1;
            fresh.metadata.resource_version = 1;
            if fresh.metadata.created_at == 0 {
                fresh.metadata.created_at = now;
            }
            Ok(fresh)
        })?;
        debug!(%key, job = %stored.spec.owner_job, "plan created");
        Ok(stored)
    }

    /// Insert or update a plan's spec. The stored status is preserved on
    /// update; use [`update_plan_status`](Self::update_plan_status) for it.
    pub fn put_plan(&self, plan: &ScalePlan) -> StateResult<ScalePlan> {
        let key = plan.table_key();
        let now = epoch_secs();
        self.modify(SCALE_PLANS, &key, |current: Option<ScalePlan>| {
            let Some(mut existing) = current else {
                let mut fresh = plan.clone();
                fresh.metadata.generation = 1;
                fresh.metadata.resource_version = 1;
                if fresh.metadata.created_at == 0 {
                    fresh.metadata.created_at = now;
                }
                return Ok(fresh);
            };
            if existing.spec != plan.spec {
                existing.spec = plan.spec.clone();
                existing.metadata.generation += 1;
            }
            existing.metadata.resource_version += 1;
            Ok(existing)
        })
    }

    /// Get a plan by name.
    pub fn get_plan(&self, name: &str) -> StateResult<Option<ScalePlan>> {
        self.read(SCALE_PLANS, name)
    }

    /// List all plans, oldest first.
    pub fn list_plans(&self) -> StateResult<Vec<ScalePlan>> {
        let mut plans: Vec<ScalePlan> = self.scan(SCALE_PLANS, "")?;
        plans.sort_by(|a, b| {
            (a.metadata.created_at, &a.metadata.name).cmp(&(b.metadata.created_at, &b.metadata.name))
        });
        Ok(plans)
    }

    /// List plans that target `job`, oldest first.
    pub fn list_plans_for_job(&self, job: &str) -> StateResult<Vec<ScalePlan>> {
        let mut plans = self.list_plans()?;
        plans.retain(|p| p.spec.owner_job == job);
        Ok(plans)
    }

    /// Replace a plan's status if its resource version still matches.
    pub fn update_plan_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &ScalePlanStatus,
    ) -> StateResult<ScalePlan> {
        let stored = self.modify(SCALE_PLANS, name, |current: Option<ScalePlan>| {
            let mut plan = current.ok_or_else(|| StateError::NotFound(name.to_string()))?;
            if plan.metadata.resource_version != expected_version {
                return Err(StateError::Conflict {
                    key: name.to_string(),
                    expected: expected_version,
                    actual: plan.metadata.resource_version,
                });
            }
            plan.status = status.clone();
            plan.metadata.resource_version += 1;
            Ok(plan)
        })?;
        debug!(
            plan = %name,
            phase = %stored.status.phase,
            version = stored.metadata.resource_version,
            "plan status stored"
        );
        Ok(stored)
    }

    /// Store an `Executing` status for a pending plan, unless another plan
    /// of the same job is already executing.
    ///
    /// The scan and the write share one write transaction, so concurrent
    /// callers admitting different plans of one job serialize here and at
    /// most one of them succeeds. Fails with [`StateError::JobBusy`] when
    /// the job is taken and [`StateError::Conflict`] on a stale version.
    pub fn start_plan(
        &self,
        name: &str,
        expected_version: u64,
        status: &ScalePlanStatus,
    ) -> StateResult<ScalePlan> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut table = txn.open_table(SCALE_PLANS).map_err(map_err!(Table))?;
            let mut plan: ScalePlan = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(name.to_string())),
            };
            if plan.metadata.resource_version != expected_version {
                return Err(StateError::Conflict {
                    key: name.to_string(),
                    expected: expected_version,
                    actual: plan.metadata.resource_version,
                });
            }

            let job = plan.spec.owner_job.clone();
            if !job.is_empty() {
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (key, value) = entry.map_err(map_err!(Read))?;
                    if key.value() == name {
                        continue;
                    }
                    let other: ScalePlan =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if other.spec.owner_job == job && other.status.phase == PlanPhase::Executing {
                        return Err(StateError::JobBusy {
                            job,
                            holder: other.metadata.name,
                        });
                    }
                }
            }

            plan.status = status.clone();
            plan.metadata.resource_version += 1;
            let bytes = serde_json::to_vec(&plan).map_err(map_err!(Serialize))?;
            table
                .insert(name, bytes.as_slice())
                .map_err(map_err!(Write))?;
            stored = plan;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            plan = %name,
            job = %stored.spec.owner_job,
            version = stored.metadata.resource_version,
            "plan started"
        );
        Ok(stored)
    }

    /// Delete a plan by name. Returns true if it existed.
    pub fn delete_plan(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove(SCALE_PLANS, name)?;
        debug!(plan = %name, existed, "plan deleted");
        Ok(existed)
    }

    // ── Pods ──────────────────────────────────────────────────────

    /// Store a new pod object. Fails if the key is taken.
    pub fn create_pod(&self, pod: &PodRecord) -> StateResult<()> {
        let key = pod.table_key();
        self.modify(PODS, &key, |current: Option<PodRecord>| {
            if current.is_some() {
                return Err(StateError::AlreadyExists(key.clone()));
            }
            Ok(pod.clone())
        })?;
        debug!(%key, "pod created");
        Ok(())
    }

    /// Insert or update a pod object.
    pub fn put_pod(&self, pod: &PodRecord) -> StateResult<()> {
        self.write(PODS, &pod.table_key(), pod)
    }

    /// Get pod `name` of `job`.
    pub fn get_pod(&self, job: &str, name: &str) -> StateResult<Option<PodRecord>> {
        self.read(PODS, &pod_key(job, name))
    }

    /// List all pods of a job.
    pub fn list_pods_for_job(&self, job: &str) -> StateResult<Vec<PodRecord>> {
        self.scan(PODS, &format!("{job}:"))
    }

    /// Delete pod `name` of `job`. Returns true if it existed.
    pub fn delete_pod(&self, job: &str, name: &str) -> StateResult<bool> {
        let key = pod_key(job, name);
        let existed = self.remove(PODS, &key)?;
        debug!(%key, existed, "pod deleted");
        Ok(existed)
    }

    // ── Services ──────────────────────────────────────────────────

    /// Register `address` under `{job}/{service}`. Idempotent.
    pub fn add_endpoint(
        &self,
        job: &str,
        service: &str,
        address: &str,
    ) -> StateResult<ServiceEndpoints> {
        let now = epoch_secs();
        self.modify(SERVICES, &service_key(job, service), |current| {
            let mut svc = current.unwrap_or_else(|| ServiceEndpoints {
                job: job.to_string(),
                service: service.to_string(),
                endpoints: Vec::new(),
                updated_at: now,
            });
            if let Err(pos) = svc.endpoints.binary_search_by(|e| e.as_str().cmp(address)) {
                svc.endpoints.insert(pos, address.to_string());
                svc.updated_at = now;
            }
            Ok(svc)
        })
    }

    /// Deregister `address` from `{job}/{service}`. Idempotent.
    pub fn remove_endpoint(
        &self,
        job: &str,
        service: &str,
        address: &str,
    ) -> StateResult<Option<ServiceEndpoints>> {
        let key = service_key(job, service);
        if self.read::<ServiceEndpoints>(SERVICES, &key)?.is_none() {
            return Ok(None);
        }
        let now = epoch_secs();
        let svc = self.modify(SERVICES, &key, |current: Option<ServiceEndpoints>| {
            let mut svc = current.ok_or_else(|| StateError::NotFound(key.clone()))?;
            if let Ok(pos) = svc.endpoints.binary_search_by(|e| e.as_str().cmp(address)) {
                svc.endpoints.remove(pos);
                svc.updated_at = now;
            }
            Ok(svc)
        })?;
        Ok(Some(svc))
    }

    /// Get a service by job and name.
    pub fn get_service(&self, job: &str, service: &str) -> StateResult<Option<ServiceEndpoints>> {
        self.read(SERVICES, &service_key(job, service))
    }

    // ── Job hosts ─────────────────────────────────────────────────

    /// Publish the PS host list for a job.
    pub fn put_job_hosts(&self, hosts: &JobHosts) -> StateResult<()> {
        self.write(JOB_HOSTS, &hosts.job, hosts)?;
        debug!(job = %hosts.job, count = hosts.ps_hosts.len(), "ps hosts published");
        Ok(())
    }

    pub fn get_job_hosts(&self, job: &str) -> StateResult<Option<JobHosts>> {
        self.read(JOB_HOSTS, job)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
