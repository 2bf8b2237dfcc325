//! Fila de Transform y codec del Work embebido.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

use idds_common::{IddsError, Locking, TransformStatus, TransformType};

use crate::workflow::{Work, WorkData};

/// Instancia persistente de un Work; pertenece a exactamente un Request.
#[derive(Debug, Clone)]
pub struct TransformRecord {
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub transform_type: TransformType,
    pub transform_tag: String,
    pub priority: i32,
    pub name: String,
    pub status: TransformStatus,
    pub substatus: Option<TransformStatus>,
    pub oldstatus: Option<TransformStatus>,
    pub locking: Locking,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub new_retries: i32,
    pub update_retries: i32,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: Duration,
    pub update_poll_period: Duration,
    pub errors: Option<String>,
    /// Mitad estática: `{"internal_id", "instance_id", "work": <blueprint>}`.
    pub transform_metadata: Value,
    /// Mitad dinámica: `{"work_data": <estado>}`.
    pub running_metadata: Value,
}

impl TransformRecord {
    /// Reconstruye el Work combinando blueprint y estado.
    pub fn work(&self) -> Result<Work, IddsError> {
        let raw = self.transform_metadata
                      .get("work")
                      .cloned()
                      .ok_or_else(|| IddsError::Validation(format!("transform {} has no work", self.transform_id)))?;
        let mut work: Work = serde_json::from_value(raw)?;
        if let Some(data) = self.running_metadata.get("work_data") {
            work.data = serde_json::from_value::<WorkData>(data.clone())?;
        }
        work.data.work_id = Some(self.transform_id);
        Ok(work)
    }

    /// Id de instancia dentro del workflow del Request.
    pub fn instance_id(&self) -> Option<&str> {
        self.transform_metadata.get("instance_id").and_then(|v| v.as_str())
    }

    /// Parte un Work en sus dos columnas de metadata.
    pub fn split_work(instance_id: &str, work: &Work) -> Result<(Value, Value), IddsError> {
        let statics = serde_json::to_value(work)?;
        let data = serde_json::to_value(&work.data)?;
        Ok((json!({
               "internal_id": work.internal_id,
               "instance_id": instance_id,
               "work_name": work.work_name,
               "sequence_id": work.data.sequence_id,
               "work": statics,
           }),
            json!({ "work_data": data })))
    }

    /// Mitad dinámica actualizada, preservando el resto de claves.
    pub fn running_snapshot(running_metadata: &Value, work: &Work) -> Result<Value, IddsError> {
        let mut merged = running_metadata.clone();
        if !merged.is_object() {
            merged = json!({});
        }
        merged["work_data"] = serde_json::to_value(&work.data)?;
        Ok(merged)
    }
}
