//! Workload manager y catálogo de datasets simulados.
//!
//! Deterministas y scripteables: los tests marcan el resultado de cada job
//! (`complete_job`/`finish_all`) o activan `auto_complete` para que cada
//! poll avance la task un paso. No hay IO externo; sólo estructuras en
//! memoria.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde_json::Value;

use idds_common::error::Result;
use idds_common::IddsError;
use idds_core::externals::{DatasetMeta, JobInfo, MetadataResolver, TaskDetails, TaskDriver, TaskHandle};

#[derive(Debug, Clone)]
struct SimJob {
    job_id: i64,
    input_name: String,
    job_status: String,
}

#[derive(Debug, Clone)]
struct SimTask {
    task_name: String,
    task_type: String,
    status: String,
    jobs: Vec<SimJob>,
    submitted_at: DateTime<Utc>,
}

/// Workload manager simulado.
pub struct SimWorkloadManager {
    tasks: DashMap<i64, SimTask>,
    next_task_id: AtomicI64,
    next_job_id: AtomicI64,
    /// Cada `get_task_details` avanza la task un paso del ciclo
    /// registered → running → done (jobs en finished).
    auto_complete: bool,
}

impl SimWorkloadManager {
    pub fn new() -> Self {
        Self { tasks: DashMap::new(),
               next_task_id: AtomicI64::new(1000),
               next_job_id: AtomicI64::new(50_000),
               auto_complete: false }
    }

    pub fn auto_completing() -> Self {
        let mut mgr = Self::new();
        mgr.auto_complete = true;
        mgr
    }

    /// Fija el estado externo de la task (scripting de tests).
    pub fn set_task_status(&self, workload_id: i64, status: &str) {
        if let Some(mut task) = self.tasks.get_mut(&workload_id) {
            task.status = status.to_string();
        }
    }

    /// Marca el resultado de un job por nombre de input.
    pub fn complete_job(&self, workload_id: i64, input_name: &str, ok: bool) {
        if let Some(mut task) = self.tasks.get_mut(&workload_id) {
            for job in task.jobs.iter_mut() {
                if job.input_name == input_name {
                    job.job_status = if ok { "finished".into() } else { "failed".into() };
                }
            }
        }
    }

    /// Termina la task: todos los jobs en finished salvo los listados en
    /// `failed`, y el estado externo pasa a `done`.
    pub fn finish_all(&self, workload_id: i64, failed: &[&str]) {
        if let Some(mut task) = self.tasks.get_mut(&workload_id) {
            for job in task.jobs.iter_mut() {
                job.job_status = if failed.contains(&job.input_name.as_str()) {
                    "failed".into()
                } else {
                    "finished".into()
                };
            }
            task.status = "done".to_string();
        }
    }

    pub fn task_name(&self, workload_id: i64) -> Option<String> {
        self.tasks.get(&workload_id).map(|t| t.task_name.clone())
    }

    fn advance(task: &mut SimTask) {
        match task.status.as_str() {
            "registered" | "ready" => task.status = "running".to_string(),
            "running" | "toretry" => {
                for job in task.jobs.iter_mut() {
                    if job.job_status != "failed" {
                        job.job_status = "finished".to_string();
                    }
                }
                task.status = "done".to_string();
            }
            _ => {}
        }
    }
}

impl Default for SimWorkloadManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskDriver for SimWorkloadManager {
    async fn submit_task(&self, task_param: &Value) -> Result<i64> {
        let task_name = task_param.get("taskName")
                                  .and_then(|v| v.as_str())
                                  .ok_or_else(|| IddsError::Validation("task_param without taskName".into()))?
                                  .to_string();
        // los nombres de task son únicos: precondición del redescubrimiento
        if self.tasks.iter().any(|t| t.task_name == task_name) {
            return Err(IddsError::DriverFailure(format!("duplicated task name: {task_name}")));
        }
        let task_type = task_param.get("taskType")
                                  .and_then(|v| v.as_str())
                                  .unwrap_or("sim")
                                  .to_string();
        let inputs: Vec<String> = task_param.get("pfnList")
                                            .and_then(|v| v.as_array())
                                            .map(|a| {
                                                a.iter()
                                                 .filter_map(|v| v.as_str().map(str::to_string))
                                                 .collect()
                                            })
                                            .unwrap_or_default();
        let workload_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let jobs = inputs.into_iter()
                         .map(|input_name| SimJob { job_id: self.next_job_id.fetch_add(1, Ordering::SeqCst),
                                                    input_name,
                                                    job_status: "starting".to_string() })
                         .collect::<Vec<_>>();
        info!("sim submit: task {task_name} -> workload {workload_id} ({} jobs)", jobs.len());
        self.tasks.insert(workload_id,
                          SimTask { task_name,
                                    task_type,
                                    status: "registered".to_string(),
                                    jobs,
                                    submitted_at: Utc::now() });
        Ok(workload_id)
    }

    async fn get_task_status(&self, workload_id: i64) -> Result<String> {
        self.tasks
            .get(&workload_id)
            .map(|t| t.status.clone())
            .ok_or_else(|| IddsError::NotFound(format!("task {workload_id}")))
    }

    async fn get_task_details(&self, workload_id: i64) -> Result<TaskDetails> {
        let mut task = self.tasks
                           .get_mut(&workload_id)
                           .ok_or_else(|| IddsError::NotFound(format!("task {workload_id}")))?;
        if self.auto_complete {
            Self::advance(&mut task);
        }
        Ok(TaskDetails { status: task.status.clone(),
                         job_ids: task.jobs.iter().map(|j| j.job_id).collect() })
    }

    async fn get_job_status(&self, job_ids: &[i64]) -> Result<Vec<JobInfo>> {
        let mut out = Vec::with_capacity(job_ids.len());
        for task in self.tasks.iter() {
            for job in &task.jobs {
                if job_ids.contains(&job.job_id) {
                    out.push(JobInfo { job_id: job.job_id,
                                       job_status: job.job_status.clone(),
                                       files: vec![job.input_name.clone()] });
                }
            }
        }
        Ok(out)
    }

    async fn kill_task(&self, workload_id: i64) -> Result<()> {
        let mut task = self.tasks
                           .get_mut(&workload_id)
                           .ok_or_else(|| IddsError::NotFound(format!("task {workload_id}")))?;
        debug!("sim kill: workload {workload_id}");
        task.status = "aborted".to_string();
        for job in task.jobs.iter_mut() {
            if job.job_status != "finished" {
                job.job_status = "failed".to_string();
            }
        }
        Ok(())
    }

    async fn finish_task(&self, workload_id: i64, soft: bool) -> Result<()> {
        let mut task = self.tasks
                           .get_mut(&workload_id)
                           .ok_or_else(|| IddsError::NotFound(format!("task {workload_id}")))?;
        debug!("sim finish: workload {workload_id} soft={soft}");
        task.status = if soft { "finished".to_string() } else { "done".to_string() };
        Ok(())
    }

    async fn retry_task(&self, workload_id: i64) -> Result<()> {
        let mut task = self.tasks
                           .get_mut(&workload_id)
                           .ok_or_else(|| IddsError::NotFound(format!("task {workload_id}")))?;
        debug!("sim retry: workload {workload_id}");
        task.status = "toretry".to_string();
        for job in task.jobs.iter_mut() {
            if job.job_status == "failed" {
                job.job_status = "starting".to_string();
            }
        }
        Ok(())
    }

    async fn get_job_ids_in_time_range(&self, start: DateTime<Utc>, task_type: &str)
                                       -> Result<HashMap<i64, TaskHandle>> {
        let mut out = HashMap::new();
        for task in self.tasks.iter() {
            if task.submitted_at >= start && task.task_type == task_type {
                out.insert(*task.key(),
                           TaskHandle { task_name: task.task_name.clone(),
                                        workload_id: *task.key() });
            }
        }
        Ok(out)
    }
}

/// Catálogo de datasets simulado.
#[derive(Default)]
pub struct SimDatasetCatalog {
    datasets: DashMap<(String, String), DatasetMeta>,
}

impl SimDatasetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, scope: &str, name: &str, meta: DatasetMeta) {
        self.datasets.insert((scope.to_string(), name.to_string()), meta);
    }

    /// Alta rápida de un dataset cerrado con listado de archivos.
    pub fn put_closed(&self, scope: &str, name: &str, files: &[&str]) {
        self.put(scope,
                 name,
                 DatasetMeta { bytes: files.len() as i64 * 1024,
                               length: files.len() as i64,
                               is_open: false,
                               did_type: "DATASET".to_string(),
                               availability: Some("available".to_string()),
                               events: None,
                               run_number: None,
                               files: files.iter().map(|f| f.to_string()).collect() });
    }
}

#[async_trait]
impl MetadataResolver for SimDatasetCatalog {
    async fn get_metadata(&self, scope: &str, name: &str) -> Result<DatasetMeta> {
        self.datasets
            .get(&(scope.to_string(), name.to_string()))
            .map(|m| m.clone())
            .ok_or_else(|| IddsError::NotFound(format!("dataset {scope}:{name}")))
    }
}
