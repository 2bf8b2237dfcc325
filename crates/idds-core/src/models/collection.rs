//! Fila de Collection.

use chrono::{DateTime, Utc};
use serde_json::Value;

use idds_common::{CollectionRelationType, CollectionStatus, CollectionType, Locking};

/// Conjunto de datos con nombre ligado a un Transform. Un Input primario y
/// uno o más Outputs por Transform; Log es opcional.
#[derive(Debug, Clone)]
pub struct CollectionRecord {
    pub coll_id: i64,
    pub request_id: i64,
    pub transform_id: i64,
    pub workload_id: Option<i64>,
    pub coll_type: CollectionType,
    pub relation_type: CollectionRelationType,
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    pub status: CollectionStatus,
    pub substatus: Option<CollectionStatus>,
    pub locking: Locking,
    pub total_files: i64,
    pub new_files: i64,
    pub processed_files: i64,
    pub processing_files: i64,
    pub failed_files: i64,
    pub missing_files: i64,
    /// Espejos de contadores del catálogo externo.
    pub ext_files: i64,
    pub processed_ext_files: i64,
    pub failed_ext_files: i64,
    pub missing_ext_files: i64,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    /// `{"is_open": bool, "did_type": str, ...}` reportado por upstream.
    pub coll_metadata: Value,
}

impl CollectionRecord {
    pub fn is_pseudo(&self) -> bool {
        self.coll_type == CollectionType::PseudoDataset
    }

    /// `is_open` reportado por el catálogo externo; las colecciones pseudo
    /// se cierran por política local, no por metadata.
    pub fn ext_is_open(&self) -> Option<bool> {
        self.coll_metadata.get("is_open").and_then(|v| v.as_bool())
    }
}
