//! Fila de Content: nivel archivo (o rango de archivo).

use chrono::{DateTime, Utc};
use serde_json::Value;

use idds_common::{ContentRelationType, ContentStatus, ContentType, Locking};

/// Un archivo (o rango min_id/max_id) dentro de una Collection.
///
/// Unicidad: `(transform_id, coll_id, map_id, name, min_id, max_id)`.
/// `content_dep_id` apunta al Content aguas arriba cuya disponibilidad
/// desbloquea a éste.
#[derive(Debug, Clone)]
pub struct ContentRecord {
    pub content_id: i64,
    pub transform_id: i64,
    pub coll_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    /// Agrupa inputs y outputs de una misma unidad de ejecución.
    pub map_id: i64,
    pub content_dep_id: Option<i64>,
    pub scope: String,
    pub name: String,
    pub min_id: i32,
    pub max_id: i32,
    pub content_type: ContentType,
    pub content_relation_type: ContentRelationType,
    pub status: ContentStatus,
    pub substatus: ContentStatus,
    pub locking: Locking,
    pub bytes: i64,
    pub md5: Option<String>,
    pub adler32: Option<String>,
    pub path: Option<String>,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    /// `{"panda_id": .., "old_panda_id": [..]}` y similares.
    pub content_metadata: Value,
}

impl ContentRecord {
    pub fn external_job_id(&self) -> Option<i64> {
        self.content_metadata.get("panda_id").and_then(|v| v.as_i64())
    }

    /// Registra un cambio de id externo preservando la historia.
    pub fn record_external_job_id(metadata: &mut Value, new_id: i64) {
        if !metadata.is_object() {
            *metadata = serde_json::json!({});
        }
        let old = metadata.get("panda_id").and_then(|v| v.as_i64());
        if let Some(old_id) = old {
            if old_id != new_id {
                let history = metadata.as_object_mut()
                                      .unwrap()
                                      .entry("old_panda_id")
                                      .or_insert_with(|| Value::Array(Vec::new()));
                if let Some(arr) = history.as_array_mut() {
                    arr.push(Value::from(old_id));
                }
            }
        }
        metadata["panda_id"] = Value::from(new_id);
    }
}

/// Fila espejo de detalle de job externo (tabla contents_ext).
#[derive(Debug, Clone, Default)]
pub struct ContentExtRecord {
    pub content_id: i64,
    pub transform_id: i64,
    pub coll_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub map_id: i64,
    pub status: Option<ContentStatus>,
    pub panda_id: Option<i64>,
    pub job_status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub computing_site: Option<String>,
    pub attempt_nr: Option<i32>,
    pub core_count: Option<i32>,
    pub cpu_consumption_time: Option<i64>,
    pub max_rss: Option<i64>,
}
