//! Fila de Command: operaciones de control entrantes.

use chrono::{DateTime, Utc};
use serde_json::Value;

use idds_common::{CommandLocation, CommandStatus, CommandType, Locking};

/// Operación de control dirigida a un request/transform/processing.
/// Los agentes la consumen y la traducen a transiciones de substatus.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub cmd_id: i64,
    pub request_id: Option<i64>,
    pub workload_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub cmd_type: CommandType,
    pub status: CommandStatus,
    pub locking: Locking,
    pub username: Option<String>,
    pub retries: i32,
    pub source: CommandLocation,
    pub destination: CommandLocation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cmd_content: Value,
    pub errors: Option<String>,
}
