//! Fila de Message: notificaciones salientes, append-only.

use chrono::{DateTime, Utc};
use serde_json::Value;

use idds_common::{Locking, MessageDestination, MessageSource, MessageStatus, MessageType};

/// Notificación emitida en cambios de estado. Una vez persistida sólo
/// progresa su `status` (New → Delivered → Archived).
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub msg_id: i64,
    pub msg_type: MessageType,
    pub status: MessageStatus,
    pub locking: Locking,
    pub source: MessageSource,
    pub destination: MessageDestination,
    pub request_id: Option<i64>,
    pub workload_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub num_contents: i32,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub msg_content: Value,
}
