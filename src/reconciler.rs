//! Keeps the running monitor tasks in line with the replicated jobs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;

use crate::fingerprint::fingerprint;
use crate::probe::Prober;
use crate::store::Observer;
use crate::task::{MonitorTask, TaskOptions};
use crate::types::{MeshEntry, Status};

type TaskGroup = HashMap<u64, Arc<MonitorTask>>;

/// Owns every monitor task of this node, grouped by job name and keyed by
/// target fingerprint.
///
/// Clones share the same task table.
#[derive(Clone)]
pub struct Reconciler {
    prober: Arc<dyn Prober>,
    options: TaskOptions,
    external_labels: Arc<HashMap<String, String>>,

    tasks: Arc<Mutex<HashMap<String, TaskGroup>>>,
}

impl Reconciler {
    pub fn new(
        prober: Arc<dyn Prober>,
        options: TaskOptions,
        external_labels: HashMap<String, String>,
    ) -> Self {
        Self {
            prober,
            options,
            external_labels: Arc::new(external_labels),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts and stops tasks so the running set of `entry.name` matches
    /// the targets `entry` declares.  Targets already running are left
    /// alone.
    ///
    /// New targets are resolved without holding the task table, so calls
    /// for one job must not overlap.  The store serializes them.
    pub async fn reconcile(&self, entry: &MeshEntry) {
        if entry.status == Status::Inactive {
            let removed = self.tasks.lock().remove(&entry.name);
            if let Some(group) = removed {
                for task in group.values() {
                    task.stop();
                }
                info!("Job {} removed, stopped {} targets", entry.name, group.len());
            }
            return;
        }

        let labels = entry
            .target_group
            .as_ref()
            .map(|group| group.labels.clone())
            .unwrap_or_default();
        let desired = desired_targets(&entry.name, entry.targets(), |address| {
            fingerprint(address, &labels)
        });

        let missing = {
            let mut tasks = self.tasks.lock();
            let group = tasks.entry(entry.name.clone()).or_default();

            group.retain(|id, task| {
                if desired.contains_key(id) {
                    return true;
                }

                task.stop();
                info!(
                    "Delete target {} ({:#x}) from job {}",
                    task.address(),
                    task.fingerprint(),
                    entry.name
                );
                false
            });

            let missing = desired
                .iter()
                .filter(|(id, _)| !group.contains_key(id))
                .map(|(id, address)| (*id, address.clone()))
                .collect::<Vec<_>>();

            if group.is_empty() {
                tasks.remove(&entry.name);
            }
            missing
        };

        let task_labels = self.task_labels(&entry.name, &labels);
        let mut created = Vec::with_capacity(missing.len());
        for (id, address) in missing {
            if let Some(task) = self.build(&entry.name, &address, id, &task_labels).await {
                created.push((id, task));
            }
        }

        if created.is_empty() {
            return;
        }

        let mut tasks = self.tasks.lock();
        let group = tasks.entry(entry.name.clone()).or_default();
        for (id, task) in created {
            info!("Add target {} to job {}", task.address(), entry.name);
            group.insert(id, Arc::new(task));
        }
    }

    /// Resolves and starts the task of one target.  Failures are logged,
    /// the target is tried again on the job's next update.
    async fn build(
        &self,
        job: &str,
        address: &str,
        id: u64,
        labels: &HashMap<String, String>,
    ) -> Option<MonitorTask> {
        let ip = match self.prober.resolve(address).await {
            Ok(ip) => ip,
            Err(err) => {
                warn!("Resolve target {} of job {} failed: {}", address, job, err);
                return None;
            }
        };

        let task = match MonitorTask::new(
            address,
            ip,
            id,
            labels,
            Arc::clone(&self.prober),
            self.options,
        ) {
            Ok(task) => task,
            Err(err) => {
                warn!("Create task for {} of job {} failed: {}", address, job, err);
                return None;
            }
        };

        if let Err(err) = task.start() {
            warn!("Start task for {} of job {} failed: {}", address, job, err);
            return None;
        }

        Some(task)
    }

    /// Metric labels of a task: external labels, overridden by the job's,
    /// plus `job=<name>` so jobs sharing a target keep separate series.
    fn task_labels(&self, job: &str, labels: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = self.external_labels.as_ref().clone();
        merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.insert("job".to_string(), job.to_string());
        merged
    }

    /// Running tasks of `job`, in no particular order.
    pub fn tasks(&self, job: &str) -> Vec<Arc<MonitorTask>> {
        self.tasks
            .lock()
            .get(job)
            .map(|group| group.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops every task of every job.
    pub fn shutdown(&self) -> Vec<Arc<MonitorTask>> {
        let mut tasks = self.tasks.lock();
        let stopped = tasks
            .drain()
            .flat_map(|(_, group)| group.into_values())
            .collect::<Vec<_>>();

        for task in &stopped {
            task.stop();
        }
        stopped
    }
}

/// Fingerprint to address of every target of a job.
///
/// When two different addresses share a fingerprint the lexicographically
/// smaller one is kept, whatever order they were declared in.
fn desired_targets(
    job: &str,
    targets: &[String],
    id_of: impl Fn(&str) -> u64,
) -> BTreeMap<u64, String> {
    let mut desired = BTreeMap::<u64, String>::new();

    for address in targets {
        let id = id_of(address);
        match desired.get_mut(&id) {
            None => {
                desired.insert(id, address.clone());
            }
            Some(existing) if *existing == *address => {}
            Some(existing) => {
                warn!(
                    "Targets {} and {} of job {} share fingerprint {:#x}",
                    existing, address, job, id
                );
                if address.as_str() < existing.as_str() {
                    *existing = address.clone();
                }
            }
        }
    }

    desired
}

#[async_trait]
impl Observer for Reconciler {
    async fn on_update(&self, entry: Arc<MeshEntry>) {
        self.reconcile(&entry).await;
    }
}

impl Collector for Reconciler {
    fn desc(&self) -> Vec<&Desc> {
        // task metrics come and go with the jobs
        Vec::new()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let tasks = self.tasks.lock();

        tasks
            .values()
            .flat_map(|group| group.values())
            .flat_map(|task| task.collect())
            .collect()
    }
}
