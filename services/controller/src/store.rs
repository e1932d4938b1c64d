//! Cluster store interface and in-memory implementation.
//!
//! `ClusterApi` is the boundary to the orchestration platform: reads of jobs,
//! units and discovery records, their creation and deletion, optimistic
//! status writes and a stream of change notifications.
//!
//! `InMemoryCluster` implements it for tests and the development binary. It
//! keeps a journal of create/delete calls, supports fault injection and
//! exposes helpers that move units through their phases the way a node would.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{
    labels, ContainerStatus, DiscoveryRecord, Job, JobKey, Unit, UnitPhase, DEFAULT_CONTAINER_NAME,
};

/// Capacity of the notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Change notification emitted by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    JobAdded(Job),
    JobUpdated(Job),
    JobDeleted(Job),
    UnitAdded(Unit),
    UnitUpdated { old: Unit, new: Unit },
    UnitDeleted(Unit),
    RecordAdded(DiscoveryRecord),
    RecordDeleted(DiscoveryRecord),
}

/// Access to the orchestration platform.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_job(&self, key: &JobKey) -> Result<Job, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Units labelled with `job-name`, regardless of owner.
    async fn list_units(&self, namespace: &str, job_name: &str) -> Result<Vec<Unit>, StoreError>;

    /// Discovery records labelled with `job-name`, regardless of owner.
    async fn list_records(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Vec<DiscoveryRecord>, StoreError>;

    /// Replace the job status if `job.metadata.resource_version` is current.
    ///
    /// Returns the stored job with its new resource version.
    async fn update_job_status(&self, job: &Job) -> Result<Job, StoreError>;

    async fn create_unit(&self, unit: Unit) -> Result<Unit, StoreError>;

    async fn delete_unit(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn create_record(&self, record: DiscoveryRecord) -> Result<DiscoveryRecord, StoreError>;

    async fn delete_record(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Stream of change notifications from now on.
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}

/// Kind of mutating call recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateUnit,
    DeleteUnit,
    CreateRecord,
    DeleteRecord,
    UpdateJobStatus,
}

/// One mutating call against the in-memory cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub operation: Operation,
    pub name: String,
    pub succeeded: bool,
}

/// Injected failure: calls of `operation` (optionally only for `name`) return `error`.
#[derive(Debug, Clone)]
pub struct Fault {
    pub operation: Operation,
    pub name: Option<String>,
    pub error: StoreError,
}

impl Fault {
    /// Fail every call of `operation` with an unavailable error.
    pub fn unavailable(operation: Operation) -> Self {
        Self {
            operation,
            name: None,
            error: StoreError::Unavailable("injected fault".to_string()),
        }
    }

    #[must_use]
    pub fn for_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

type ObjectKey = (String, String);

fn object_key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

/// In-memory cluster.
pub struct InMemoryCluster {
    jobs: DashMap<JobKey, Job>,
    units: DashMap<ObjectKey, Unit>,
    records: DashMap<ObjectKey, DiscoveryRecord>,
    journal: Mutex<Vec<JournalEntry>>,
    faults: Mutex<Vec<Fault>>,
    latency: Mutex<Option<Duration>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: DashMap::new(),
            units: DashMap::new(),
            records: DashMap::new(),
            journal: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            events,
        }
    }

    fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn journal_call(&self, operation: Operation, name: &str, succeeded: bool) {
        lock(&self.journal).push(JournalEntry {
            operation,
            name: name.to_string(),
            succeeded,
        });
    }

    fn check_fault(&self, operation: Operation, name: &str) -> Result<(), StoreError> {
        let faults = lock(&self.faults);
        match faults
            .iter()
            .find(|f| f.operation == operation && f.name.as_deref().is_none_or(|n| n == name))
        {
            Some(fault) => Err(fault.error.clone()),
            None => Ok(()),
        }
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    // -------------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------------

    /// Store a new job and notify subscribers.
    pub fn submit_job(&self, mut job: Job) -> Result<Job, StoreError> {
        let key = job.key();
        if self.jobs.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "job",
                name: key.to_string(),
            });
        }
        job.metadata.resource_version = 1;
        self.jobs.insert(key.clone(), job.clone());
        info!(job = %key, "Job submitted");
        self.emit(ClusterEvent::JobAdded(job.clone()));
        Ok(job)
    }

    /// Apply a change to a stored job's spec or metadata.
    pub fn modify_job<F>(&self, key: &JobKey, f: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let updated = {
            let mut entry = self.jobs.get_mut(key).ok_or_else(|| StoreError::NotFound {
                kind: "job",
                name: key.to_string(),
            })?;
            f(entry.value_mut());
            entry.metadata.resource_version += 1;
            entry.clone()
        };
        self.emit(ClusterEvent::JobUpdated(updated.clone()));
        Ok(updated)
    }

    /// Remove a job and garbage-collect everything it controls.
    pub fn remove_job(&self, key: &JobKey) -> Result<Job, StoreError> {
        let (_, job) = self.jobs.remove(key).ok_or_else(|| StoreError::NotFound {
            kind: "job",
            name: key.to_string(),
        })?;
        let uid = job.metadata.uid;

        let owned_units: Vec<ObjectKey> = self
            .units
            .iter()
            .filter(|u| u.owner.as_ref().is_some_and(|o| o.uid == uid))
            .map(|u| u.key().clone())
            .collect();
        for key in owned_units {
            if let Some((_, unit)) = self.units.remove(&key) {
                self.emit(ClusterEvent::UnitDeleted(unit));
            }
        }

        let owned_records: Vec<ObjectKey> = self
            .records
            .iter()
            .filter(|r| r.owner.as_ref().is_some_and(|o| o.uid == uid))
            .map(|r| r.key().clone())
            .collect();
        for key in owned_records {
            if let Some((_, record)) = self.records.remove(&key) {
                self.emit(ClusterEvent::RecordDeleted(record));
            }
        }

        info!(job = %key, "Job removed");
        self.emit(ClusterEvent::JobDeleted(job.clone()));
        Ok(job)
    }

    /// Snapshot of a stored job.
    pub fn job(&self, key: &JobKey) -> Option<Job> {
        self.jobs.get(key).map(|j| j.clone())
    }

    // -------------------------------------------------------------------------
    // Units
    // -------------------------------------------------------------------------

    /// Insert a unit directly, bypassing the journal.
    pub fn insert_unit(&self, unit: Unit) {
        self.units
            .insert(object_key(&unit.namespace, &unit.name), unit.clone());
        self.emit(ClusterEvent::UnitAdded(unit));
    }

    /// Apply a change to a stored unit and notify subscribers.
    pub fn modify_unit<F>(&self, namespace: &str, name: &str, f: F) -> Result<Unit, StoreError>
    where
        F: FnOnce(&mut Unit),
    {
        let (old, new) = {
            let mut entry = self
                .units
                .get_mut(&object_key(namespace, name))
                .ok_or_else(|| StoreError::NotFound {
                    kind: "unit",
                    name: name.to_string(),
                })?;
            let old = entry.clone();
            f(entry.value_mut());
            (old, entry.clone())
        };
        self.emit(ClusterEvent::UnitUpdated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    pub fn set_unit_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: UnitPhase,
    ) -> Result<Unit, StoreError> {
        self.modify_unit(namespace, name, |unit| unit.status.phase = phase)
    }

    /// Terminate the default container with `exit_code`.
    ///
    /// Zero moves the unit to Succeeded, anything else to Failed.
    pub fn terminate_unit(
        &self,
        namespace: &str,
        name: &str,
        exit_code: i32,
    ) -> Result<Unit, StoreError> {
        self.modify_unit(namespace, name, |unit| {
            default_container_status(unit).exit_code = Some(exit_code);
            unit.status.phase = if exit_code == 0 {
                UnitPhase::Succeeded
            } else {
                UnitPhase::Failed
            };
        })
    }

    /// Set the restart count of the default container.
    pub fn set_restart_count(
        &self,
        namespace: &str,
        name: &str,
        restarts: i32,
    ) -> Result<Unit, StoreError> {
        self.modify_unit(namespace, name, |unit| {
            default_container_status(unit).restart_count = restarts;
        })
    }

    /// Start graceful deletion: the unit stays visible with a deletion timestamp.
    pub fn mark_unit_terminating(&self, namespace: &str, name: &str) -> Result<Unit, StoreError> {
        self.modify_unit(namespace, name, |unit| {
            unit.deletion_timestamp.get_or_insert_with(Utc::now);
        })
    }

    pub fn unit(&self, namespace: &str, name: &str) -> Option<Unit> {
        self.units
            .get(&object_key(namespace, name))
            .map(|u| u.clone())
    }

    /// Names of all units in `namespace`, sorted.
    pub fn unit_names(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .units
            .iter()
            .filter(|u| u.key().0 == namespace)
            .map(|u| u.key().1.clone())
            .collect();
        names.sort();
        names
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    pub fn record(&self, namespace: &str, name: &str) -> Option<DiscoveryRecord> {
        self.records
            .get(&object_key(namespace, name))
            .map(|r| r.clone())
    }

    /// Names of all discovery records in `namespace`, sorted.
    pub fn record_names(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.key().0 == namespace)
            .map(|r| r.key().1.clone())
            .collect();
        names.sort();
        names
    }

    // -------------------------------------------------------------------------
    // Journal and faults
    // -------------------------------------------------------------------------

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.journal).clone()
    }

    /// Names passed to `operation`, in call order.
    pub fn calls(&self, operation: Operation) -> Vec<String> {
        lock(&self.journal)
            .iter()
            .filter(|e| e.operation == operation)
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn clear_journal(&self) {
        lock(&self.journal).clear();
    }

    pub fn inject_fault(&self, fault: Fault) {
        lock(&self.faults).push(fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Delay every create/delete call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }
}

fn default_container_status(unit: &mut Unit) -> &mut ContainerStatus {
    let statuses = &mut unit.status.container_statuses;
    let pos = match statuses.iter().position(|c| c.name == DEFAULT_CONTAINER_NAME) {
        Some(pos) => pos,
        None => {
            statuses.push(ContainerStatus {
                name: DEFAULT_CONTAINER_NAME.to_string(),
                exit_code: None,
                restart_count: 0,
            });
            statuses.len() - 1
        }
    };
    &mut statuses[pos]
}

fn has_job_label(obj_labels: &std::collections::BTreeMap<String, String>, job_name: &str) -> bool {
    obj_labels.get(labels::JOB_NAME).map(String::as_str) == Some(job_name)
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_job(&self, key: &JobKey) -> Result<Job, StoreError> {
        self.job(key).ok_or_else(|| StoreError::NotFound {
            kind: "job",
            name: key.to_string(),
        })
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.jobs.iter().map(|j| j.value().clone()).collect())
    }

    async fn list_units(&self, namespace: &str, job_name: &str) -> Result<Vec<Unit>, StoreError> {
        Ok(self
            .units
            .iter()
            .filter(|u| u.namespace == namespace && has_job_label(&u.labels, job_name))
            .map(|u| u.value().clone())
            .collect())
    }

    async fn list_records(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Vec<DiscoveryRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.namespace == namespace && has_job_label(&r.labels, job_name))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn update_job_status(&self, job: &Job) -> Result<Job, StoreError> {
        let key = job.key();
        let result = self.check_fault(Operation::UpdateJobStatus, &key.name).and_then(|()| {
            let mut entry = self.jobs.get_mut(&key).ok_or_else(|| StoreError::NotFound {
                kind: "job",
                name: key.to_string(),
            })?;
            if entry.metadata.resource_version != job.metadata.resource_version {
                return Err(StoreError::Conflict {
                    name: key.to_string(),
                    expected: job.metadata.resource_version,
                    actual: entry.metadata.resource_version,
                });
            }
            entry.status = job.status.clone();
            entry.metadata.resource_version += 1;
            Ok(entry.clone())
        });

        self.journal_call(Operation::UpdateJobStatus, &key.name, result.is_ok());
        let updated = result?;
        debug!(job = %key, version = updated.metadata.resource_version, "Job status updated");
        self.emit(ClusterEvent::JobUpdated(updated.clone()));
        Ok(updated)
    }

    async fn create_unit(&self, unit: Unit) -> Result<Unit, StoreError> {
        self.simulate_latency().await;

        let result = self.check_fault(Operation::CreateUnit, &unit.name).and_then(|()| {
            let key = object_key(&unit.namespace, &unit.name);
            if self.units.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: "unit",
                    name: unit.name.clone(),
                });
            }
            self.units.insert(key, unit.clone());
            Ok(unit.clone())
        });

        self.journal_call(Operation::CreateUnit, &unit.name, result.is_ok());
        let created = result?;
        self.emit(ClusterEvent::UnitAdded(created.clone()));
        Ok(created)
    }

    async fn delete_unit(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;

        let result = self.check_fault(Operation::DeleteUnit, name).and_then(|()| {
            self.units
                .remove(&object_key(namespace, name))
                .map(|(_, unit)| unit)
                .ok_or_else(|| StoreError::NotFound {
                    kind: "unit",
                    name: name.to_string(),
                })
        });

        self.journal_call(Operation::DeleteUnit, name, result.is_ok());
        let deleted = result?;
        self.emit(ClusterEvent::UnitDeleted(deleted));
        Ok(())
    }

    async fn create_record(&self, record: DiscoveryRecord) -> Result<DiscoveryRecord, StoreError> {
        self.simulate_latency().await;

        let result = self
            .check_fault(Operation::CreateRecord, &record.name)
            .and_then(|()| {
                let key = object_key(&record.namespace, &record.name);
                if self.records.contains_key(&key) {
                    return Err(StoreError::AlreadyExists {
                        kind: "record",
                        name: record.name.clone(),
                    });
                }
                self.records.insert(key, record.clone());
                Ok(record.clone())
            });

        self.journal_call(Operation::CreateRecord, &record.name, result.is_ok());
        let created = result?;
        self.emit(ClusterEvent::RecordAdded(created.clone()));
        Ok(created)
    }

    async fn delete_record(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;

        let result = self.check_fault(Operation::DeleteRecord, name).and_then(|()| {
            self.records
                .remove(&object_key(namespace, name))
                .map(|(_, record)| record)
                .ok_or_else(|| StoreError::NotFound {
                    kind: "record",
                    name: name.to_string(),
                })
        });

        self.journal_call(Operation::DeleteRecord, name, result.is_ok());
        let deleted = result?;
        self.emit(ClusterEvent::RecordDeleted(deleted));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}
