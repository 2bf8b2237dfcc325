//! Fila de Request y codec del workflow embebido.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

use idds_common::{IddsError, Locking, RequestStatus, TransformType};

use crate::workflow::{Workflow, WorkflowData};

/// Un Request: intención top-level del usuario; posee exactamente un
/// Workflow.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: i64,
    pub scope: String,
    pub name: String,
    pub requester: Option<String>,
    pub request_type: TransformType,
    pub workload_id: Option<i64>,
    pub priority: i32,
    pub status: RequestStatus,
    pub substatus: Option<RequestStatus>,
    pub oldstatus: Option<RequestStatus>,
    pub locking: Locking,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub new_retries: i32,
    pub update_retries: i32,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: Duration,
    pub update_poll_period: Duration,
    pub errors: Option<String>,
    /// Mitad estática: `{"workflow": <estructura>}`.
    pub request_metadata: Value,
    /// Mitad dinámica: `{"workflow_data": <estado>, "operations": [...]}`.
    pub processing_metadata: Value,
}

impl RequestRecord {
    /// Reconstruye el Workflow combinando estructura y estado.
    pub fn workflow(&self) -> Result<Workflow, IddsError> {
        let raw = self.request_metadata
                      .get("workflow")
                      .cloned()
                      .ok_or_else(|| IddsError::Validation(format!("request {} has no workflow", self.request_id)))?;
        let mut wf: Workflow = serde_json::from_value(raw)?;
        if let Some(data) = self.processing_metadata.get("workflow_data") {
            let data: WorkflowData = serde_json::from_value(data.clone())?;
            wf.load_running_data(data);
        }
        Ok(wf)
    }

    /// Parte un Workflow en sus dos columnas.
    pub fn split_workflow(wf: &Workflow) -> Result<(Value, Value), IddsError> {
        let statics = serde_json::to_value(wf)?;
        let data = serde_json::to_value(wf.get_running_data())?;
        Ok((json!({ "workflow": statics }), json!({ "workflow_data": data })))
    }

    /// Escribe ambas mitades en la fila (alta de request).
    pub fn set_workflow(&mut self, wf: &Workflow) -> Result<(), IddsError> {
        let (statics, data) = Self::split_workflow(wf)?;
        self.request_metadata = statics;
        merge_object(&mut self.processing_metadata, data);
        Ok(())
    }

    /// Reemplaza sólo la mitad dinámica en un `processing_metadata` ya
    /// poblado, preservando las demás claves (operations, etc.).
    pub fn running_snapshot(processing_metadata: &Value, wf: &Workflow) -> Result<Value, IddsError> {
        let mut merged = processing_metadata.clone();
        if !merged.is_object() {
            merged = json!({});
        }
        merged["workflow_data"] = serde_json::to_value(wf.get_running_data())?;
        Ok(merged)
    }

    /// Anota el transform_id recién asignado dentro de la mitad dinámica.
    /// La hace el catálogo en la misma transacción que crea el transform.
    pub fn patch_work_id(processing_metadata: &mut Value, instance_id: &str, transform_id: i64) {
        if let Some(data) = processing_metadata.get_mut("workflow_data")
                                               .and_then(|d| d.get_mut("works"))
                                               .and_then(|w| w.get_mut(instance_id))
                                               .and_then(|i| i.get_mut("data"))
        {
            data["work_id"] = Value::from(transform_id);
        }
    }
}

fn merge_object(target: &mut Value, addition: Value) {
    if !target.is_object() {
        *target = json!({});
    }
    if let (Some(t), Some(a)) = (target.as_object_mut(), addition.as_object()) {
        for (k, v) in a {
            t.insert(k.clone(), v.clone());
        }
    }
}
