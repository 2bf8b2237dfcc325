//! Parámetros tipados de las operaciones del catálogo.
//!
//! Los `New*` describen altas completas; los `*Update` son parciales (sólo
//! los campos `Some` se aplican) y todo update toca `updated_at`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use idds_common::{CollectionRelationType, CollectionStatus, CollectionType, CommandLocation, CommandStatus,
                  CommandType, ContentRelationType, ContentStatus, ContentType, Locking, MessageDestination,
                  MessageSource, MessageStatus, MessageType, ProcessingStatus, RequestStatus, TransformStatus,
                  TransformType};

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub scope: String,
    pub name: String,
    pub requester: Option<String>,
    pub request_type: TransformType,
    pub workload_id: Option<i64>,
    pub priority: i32,
    pub status: RequestStatus,
    pub expired_at: Option<DateTime<Utc>>,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: Duration,
    pub update_poll_period: Duration,
    pub request_metadata: Value,
    pub processing_metadata: Value,
}

impl NewRequest {
    pub fn new(scope: &str, name: &str, request_type: TransformType) -> Self {
        Self { scope: scope.to_string(),
               name: name.to_string(),
               requester: None,
               request_type,
               workload_id: None,
               priority: 0,
               status: RequestStatus::New,
               expired_at: None,
               max_new_retries: 3,
               max_update_retries: 0,
               new_poll_period: Duration::from_secs(1),
               update_poll_period: Duration::from_secs(10),
               request_metadata: Value::Null,
               processing_metadata: Value::Null }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub status: Option<RequestStatus>,
    pub substatus: Option<RequestStatus>,
    pub oldstatus: Option<RequestStatus>,
    pub locking: Option<Locking>,
    pub priority: Option<i32>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub errors: Option<String>,
    pub new_retries: Option<i32>,
    pub update_retries: Option<i32>,
    pub request_metadata: Option<Value>,
    pub processing_metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewTransform {
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub transform_type: TransformType,
    pub transform_tag: String,
    pub priority: i32,
    pub name: String,
    pub status: TransformStatus,
    pub expired_at: Option<DateTime<Utc>>,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: Duration,
    pub update_poll_period: Duration,
    /// Id de instancia dentro del workflow, para parchear el work_id en la
    /// misma transacción que crea el transform.
    pub instance_id: Option<String>,
    pub transform_metadata: Value,
    pub running_metadata: Value,
    /// Colecciones creadas junto con el transform (un transform siempre
    /// lleva al menos input y output).
    pub collections: Vec<NewCollection>,
}

#[derive(Debug, Clone, Default)]
pub struct TransformUpdate {
    pub status: Option<TransformStatus>,
    pub substatus: Option<TransformStatus>,
    pub oldstatus: Option<TransformStatus>,
    pub locking: Option<Locking>,
    pub workload_id: Option<i64>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Option<String>,
    pub new_retries: Option<i32>,
    pub update_retries: Option<i32>,
    pub transform_metadata: Option<Value>,
    pub running_metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewCollection {
    pub request_id: i64,
    /// 0 si la colección nace junto con su transform; el catálogo completa
    /// el id real.
    pub transform_id: i64,
    pub workload_id: Option<i64>,
    pub coll_type: CollectionType,
    pub relation_type: CollectionRelationType,
    pub scope: String,
    pub name: String,
    pub status: CollectionStatus,
    pub total_files: i64,
    pub coll_metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionUpdate {
    pub status: Option<CollectionStatus>,
    pub substatus: Option<CollectionStatus>,
    pub bytes: Option<i64>,
    pub total_files: Option<i64>,
    pub new_files: Option<i64>,
    pub processed_files: Option<i64>,
    pub processing_files: Option<i64>,
    pub failed_files: Option<i64>,
    pub missing_files: Option<i64>,
    pub ext_files: Option<i64>,
    pub processed_ext_files: Option<i64>,
    pub failed_ext_files: Option<i64>,
    pub missing_ext_files: Option<i64>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub coll_metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewProcessing {
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub status: ProcessingStatus,
    pub submitter: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: Duration,
    pub update_poll_period: Duration,
    pub processing_metadata: Value,
    pub running_metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingUpdate {
    pub status: Option<ProcessingStatus>,
    pub substatus: Option<ProcessingStatus>,
    pub oldstatus: Option<ProcessingStatus>,
    pub locking: Option<Locking>,
    pub workload_id: Option<i64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub errors: Option<String>,
    pub new_retries: Option<i32>,
    pub update_retries: Option<i32>,
    pub processing_metadata: Option<Value>,
    pub running_metadata: Option<Value>,
    pub output_metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewContent {
    pub transform_id: i64,
    pub coll_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
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
    pub bytes: i64,
    pub path: Option<String>,
    pub content_metadata: Value,
}

/// Update parcial de un Content. Los carriers escriben substatus; el flush
/// del Transformer promueve substatus a status.
#[derive(Debug, Clone, Default)]
pub struct ContentUpdate {
    pub content_id: i64,
    pub status: Option<ContentStatus>,
    pub substatus: Option<ContentStatus>,
    pub path: Option<String>,
    pub content_metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub msg_type: MessageType,
    pub status: MessageStatus,
    pub source: MessageSource,
    pub destination: MessageDestination,
    pub request_id: Option<i64>,
    pub workload_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub num_contents: i32,
    pub msg_content: Value,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub msg_type: Option<MessageType>,
    pub status: Option<MessageStatus>,
    pub request_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub bulk_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub request_id: Option<i64>,
    pub workload_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub cmd_type: CommandType,
    pub status: CommandStatus,
    pub username: Option<String>,
    pub source: CommandLocation,
    pub destination: CommandLocation,
    pub cmd_content: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CommandUpdate {
    pub status: Option<CommandStatus>,
    pub locking: Option<Locking>,
    pub errors: Option<String>,
}

/// Upsert de liveness, claveado por `(agent, hostname, pid, thread_id)`.
#[derive(Debug, Clone)]
pub struct HealthItem {
    pub agent: String,
    pub hostname: String,
    pub pid: i32,
    pub thread_id: i64,
    pub thread_name: Option<String>,
    pub payload: Option<String>,
}

/// Operación compuesta del Transformer: contents nuevos, inputs mapeados,
/// colecciones tocadas y el processing nuevo, todo en una transacción.
#[derive(Debug, Clone, Default)]
pub struct TransformOutputs {
    pub new_contents: Vec<NewContent>,
    /// Inputs cuyos outputs ya existen: pasan a Mapped.
    pub mapped_input_ids: Vec<i64>,
    pub update_collections: Vec<(i64, CollectionUpdate)>,
    pub update_contents: Vec<ContentUpdate>,
    pub new_processing: Option<NewProcessing>,
    pub messages: Vec<NewMessage>,
}
