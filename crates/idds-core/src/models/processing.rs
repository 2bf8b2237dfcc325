//! Fila de Processing y su objeto embebido.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use idds_common::{IddsError, Locking, ProcessingStatus};

/// Mitad estática del objeto Processing: el payload de sumisión.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSpec {
    pub task_name: String,
    pub task_type: String,
    pub task_param: Value,
    /// Presupuesto de reintentos del Work sobre SubFinished.
    #[serde(default)]
    pub num_retries: u32,
}

/// Mitad dinámica: bookkeeping frente al workload manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingData {
    pub workload_id: Option<i64>,
    /// Ciclos extra de poll tras un estado terminal, para no perder
    /// actualizaciones tardías (regla de flush).
    pub polling_retries: u32,
    pub old_workload_ids: Vec<i64>,
    pub retry_number: u32,
}

/// Un intento de ejecutar un Transform contra el workload manager externo.
/// Un Transform tiene a lo sumo un Processing activo.
#[derive(Debug, Clone)]
pub struct ProcessingRecord {
    pub processing_id: i64,
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub status: ProcessingStatus,
    pub substatus: Option<ProcessingStatus>,
    pub oldstatus: Option<ProcessingStatus>,
    pub locking: Locking,
    pub submitter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub new_retries: i32,
    pub update_retries: i32,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: Duration,
    pub update_poll_period: Duration,
    pub errors: Option<String>,
    /// `{"processing": ProcessingSpec}`.
    pub processing_metadata: Value,
    /// `{"processing_data": ProcessingData}`.
    pub running_metadata: Value,
    pub output_metadata: Value,
}

impl ProcessingRecord {
    pub fn spec(&self) -> Result<ProcessingSpec, IddsError> {
        let raw = self.processing_metadata
                      .get("processing")
                      .cloned()
                      .ok_or_else(|| {
                          IddsError::Validation(format!("processing {} has no spec", self.processing_id))
                      })?;
        Ok(serde_json::from_value(raw)?)
    }

    pub fn data(&self) -> ProcessingData {
        self.running_metadata
            .get("processing_data")
            .and_then(|d| serde_json::from_value(d.clone()).ok())
            .unwrap_or_default()
    }

    pub fn split_spec(spec: &ProcessingSpec) -> Result<(Value, Value), IddsError> {
        Ok((json!({ "processing": serde_json::to_value(spec)? }),
            json!({ "processing_data": serde_json::to_value(ProcessingData::default())? })))
    }

    pub fn running_snapshot(running_metadata: &Value, data: &ProcessingData) -> Result<Value, IddsError> {
        let mut merged = running_metadata.clone();
        if !merged.is_object() {
            merged = json!({});
        }
        merged["processing_data"] = serde_json::to_value(data)?;
        Ok(merged)
    }

    /// ¿Venció el plazo de pared del processing?
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.map(|t| t <= now).unwrap_or(false)
    }
}
