//! Contratos hacia los colaboradores externos.
//!
//! El core depende sólo de estas interfaces angostas; los adaptadores
//! concretos (PanDA, HTCondor, catálogos de datasets) viven fuera. Toda
//! llamada bloqueante lleva deadline de pared del lado del llamador.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use idds_common::error::Result;

/// Detalle de una task externa.
#[derive(Debug, Clone, Default)]
pub struct TaskDetails {
    pub status: String,
    pub job_ids: Vec<i64>,
}

/// Estado de un job externo. El primer elemento de `files` es el nombre
/// lógico del input que lo originó.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: i64,
    pub job_status: String,
    pub files: Vec<String>,
}

/// Handle devuelto por el barrido de tasks por rango temporal.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_name: String,
    pub workload_id: i64,
}

/// Driver del workload manager externo.
#[async_trait]
pub trait TaskDriver: Send + Sync {
    /// Somete una task; devuelve el workload id externo.
    async fn submit_task(&self, task_param: &Value) -> Result<i64>;

    async fn get_task_status(&self, workload_id: i64) -> Result<String>;

    async fn get_task_details(&self, workload_id: i64) -> Result<TaskDetails>;

    async fn get_job_status(&self, job_ids: &[i64]) -> Result<Vec<JobInfo>>;

    async fn kill_task(&self, workload_id: i64) -> Result<()>;

    async fn finish_task(&self, workload_id: i64, soft: bool) -> Result<()>;

    /// Reactiva una task terminada para otra vuelta de reintentos.
    async fn retry_task(&self, workload_id: i64) -> Result<()>;

    /// Tasks sometidas desde `start`, por tipo, indexadas por request
    /// externo. Usado cuando la fila local perdió su workload_id.
    async fn get_job_ids_in_time_range(&self, start: DateTime<Utc>, task_type: &str)
                                       -> Result<HashMap<i64, TaskHandle>>;
}

/// Metadata de un dataset externo.
#[derive(Debug, Clone, Default)]
pub struct DatasetMeta {
    pub bytes: i64,
    /// Cantidad de archivos.
    pub length: i64,
    pub is_open: bool,
    pub did_type: String,
    pub availability: Option<String>,
    pub events: Option<i64>,
    pub run_number: Option<i64>,
    /// Listado de archivos si el catálogo lo provee; si viene vacío el
    /// Transformer sintetiza nombres indexados a partir de `length`.
    pub files: Vec<String>,
}

/// Resolver de metadata de datasets (Rucio u otro catálogo).
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn get_metadata(&self, scope: &str, name: &str) -> Result<DatasetMeta>;
}
