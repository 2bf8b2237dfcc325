//! Structs de fila y conversiones fila ↔ registro de dominio.
//!
//! Las filas llevan los tipos crudos de columna (Int4 para enums, Jsonb
//! opcional para metadata); la conversión a registros tipados valida los
//! valores de enum y normaliza metadata ausente a `Value::Null`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use std::time::Duration;

use idds_common::{CollectionRelationType, CollectionStatus, CollectionType, CommandLocation, CommandStatus,
                  CommandType, ContentRelationType, ContentStatus, ContentType, IddsError, Locking,
                  MessageDestination, MessageSource, MessageStatus, MessageType, ProcessingStatus, RequestStatus,
                  TransformStatus, TransformType};
use idds_core::models::{CollectionRecord, CommandRecord, ContentExtRecord, ContentRecord, HealthRecord,
                        MessageRecord, ProcessingRecord, RequestRecord, TransformRecord};

use crate::schema::{collections, commands, contents, contents_ext, contents_update, health, messages, processings,
                    requests, transforms};

fn opt_status<T: TryFrom<i32, Error = IddsError>>(value: Option<i32>) -> Result<Option<T>, IddsError> {
    value.map(T::try_from).transpose()
}

fn meta(value: Option<Value>) -> Value {
    value.unwrap_or(Value::Null)
}

// ----------------------------------------------------------------------
// requests
// ----------------------------------------------------------------------

#[derive(Queryable, Debug)]
pub struct RequestRow {
    pub request_id: i64,
    pub scope: String,
    pub name: String,
    pub requester: Option<String>,
    pub request_type: i32,
    pub workload_id: Option<i64>,
    pub priority: i32,
    pub status: i32,
    pub substatus: Option<i32>,
    pub oldstatus: Option<i32>,
    pub locking: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub new_retries: i32,
    pub update_retries: i32,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: i32,
    pub update_poll_period: i32,
    pub errors: Option<String>,
    pub request_metadata: Option<Value>,
    pub processing_metadata: Option<Value>,
}

impl TryFrom<RequestRow> for RequestRecord {
    type Error = IddsError;

    fn try_from(row: RequestRow) -> Result<Self, IddsError> {
        Ok(Self { request_id: row.request_id,
                  scope: row.scope,
                  name: row.name,
                  requester: row.requester,
                  request_type: TransformType::try_from(row.request_type)?,
                  workload_id: row.workload_id,
                  priority: row.priority,
                  status: RequestStatus::try_from(row.status)?,
                  substatus: opt_status(row.substatus)?,
                  oldstatus: opt_status(row.oldstatus)?,
                  locking: Locking::try_from(row.locking)?,
                  created_at: row.created_at,
                  updated_at: row.updated_at,
                  next_poll_at: row.next_poll_at,
                  expired_at: row.expired_at,
                  new_retries: row.new_retries,
                  update_retries: row.update_retries,
                  max_new_retries: row.max_new_retries,
                  max_update_retries: row.max_update_retries,
                  new_poll_period: Duration::from_secs(row.new_poll_period.max(0) as u64),
                  update_poll_period: Duration::from_secs(row.update_poll_period.max(0) as u64),
                  errors: row.errors,
                  request_metadata: meta(row.request_metadata),
                  processing_metadata: meta(row.processing_metadata) })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = requests)]
pub struct NewRequestRow {
    pub scope: String,
    pub name: String,
    pub requester: Option<String>,
    pub request_type: i32,
    pub workload_id: Option<i64>,
    pub priority: i32,
    pub status: i32,
    pub locking: i32,
    pub expired_at: Option<DateTime<Utc>>,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: i32,
    pub update_poll_period: i32,
    pub request_metadata: Option<Value>,
    pub processing_metadata: Option<Value>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = requests)]
pub struct RequestChangeset {
    pub status: Option<i32>,
    pub substatus: Option<i32>,
    pub oldstatus: Option<i32>,
    pub locking: Option<i32>,
    pub priority: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub errors: Option<String>,
    pub new_retries: Option<i32>,
    pub update_retries: Option<i32>,
    pub request_metadata: Option<Value>,
    pub processing_metadata: Option<Value>,
}

impl From<idds_core::catalog::RequestUpdate> for RequestChangeset {
    fn from(u: idds_core::catalog::RequestUpdate) -> Self {
        Self { status: u.status.map(|v| v.value()),
               substatus: u.substatus.map(|v| v.value()),
               oldstatus: u.oldstatus.map(|v| v.value()),
               locking: u.locking.map(|v| v.value()),
               priority: u.priority,
               updated_at: Some(Utc::now()),
               next_poll_at: u.next_poll_at,
               expired_at: u.expired_at,
               errors: u.errors,
               new_retries: u.new_retries,
               update_retries: u.update_retries,
               request_metadata: u.request_metadata,
               processing_metadata: u.processing_metadata }
    }
}

// ----------------------------------------------------------------------
// transforms
// ----------------------------------------------------------------------

#[derive(Queryable, Debug)]
pub struct TransformRow {
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub transform_type: i32,
    pub transform_tag: String,
    pub priority: i32,
    pub name: String,
    pub status: i32,
    pub substatus: Option<i32>,
    pub oldstatus: Option<i32>,
    pub locking: i32,
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
    pub new_poll_period: i32,
    pub update_poll_period: i32,
    pub errors: Option<String>,
    pub transform_metadata: Option<Value>,
    pub running_metadata: Option<Value>,
}

impl TryFrom<TransformRow> for TransformRecord {
    type Error = IddsError;

    fn try_from(row: TransformRow) -> Result<Self, IddsError> {
        Ok(Self { transform_id: row.transform_id,
                  request_id: row.request_id,
                  workload_id: row.workload_id,
                  transform_type: TransformType::try_from(row.transform_type)?,
                  transform_tag: row.transform_tag,
                  priority: row.priority,
                  name: row.name,
                  status: TransformStatus::try_from(row.status)?,
                  substatus: opt_status(row.substatus)?,
                  oldstatus: opt_status(row.oldstatus)?,
                  locking: Locking::try_from(row.locking)?,
                  retries: row.retries,
                  created_at: row.created_at,
                  updated_at: row.updated_at,
                  next_poll_at: row.next_poll_at,
                  started_at: row.started_at,
                  finished_at: row.finished_at,
                  expired_at: row.expired_at,
                  new_retries: row.new_retries,
                  update_retries: row.update_retries,
                  max_new_retries: row.max_new_retries,
                  max_update_retries: row.max_update_retries,
                  new_poll_period: Duration::from_secs(row.new_poll_period.max(0) as u64),
                  update_poll_period: Duration::from_secs(row.update_poll_period.max(0) as u64),
                  errors: row.errors,
                  transform_metadata: meta(row.transform_metadata),
                  running_metadata: meta(row.running_metadata) })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = transforms)]
pub struct NewTransformRow {
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub transform_type: i32,
    pub transform_tag: String,
    pub priority: i32,
    pub name: String,
    pub status: i32,
    pub locking: i32,
    pub expired_at: Option<DateTime<Utc>>,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: i32,
    pub update_poll_period: i32,
    pub transform_metadata: Option<Value>,
    pub running_metadata: Option<Value>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = transforms)]
pub struct TransformChangeset {
    pub status: Option<i32>,
    pub substatus: Option<i32>,
    pub oldstatus: Option<i32>,
    pub locking: Option<i32>,
    pub workload_id: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Option<String>,
    pub new_retries: Option<i32>,
    pub update_retries: Option<i32>,
    pub transform_metadata: Option<Value>,
    pub running_metadata: Option<Value>,
}

impl From<idds_core::catalog::TransformUpdate> for TransformChangeset {
    fn from(u: idds_core::catalog::TransformUpdate) -> Self {
        Self { status: u.status.map(|v| v.value()),
               substatus: u.substatus.map(|v| v.value()),
               oldstatus: u.oldstatus.map(|v| v.value()),
               locking: u.locking.map(|v| v.value()),
               workload_id: u.workload_id,
               updated_at: Some(Utc::now()),
               next_poll_at: u.next_poll_at,
               started_at: u.started_at,
               finished_at: u.finished_at,
               errors: u.errors,
               new_retries: u.new_retries,
               update_retries: u.update_retries,
               transform_metadata: u.transform_metadata,
               running_metadata: u.running_metadata }
    }
}

// ----------------------------------------------------------------------
// processings
// ----------------------------------------------------------------------

#[derive(Queryable, Debug)]
pub struct ProcessingRow {
    pub processing_id: i64,
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub status: i32,
    pub substatus: Option<i32>,
    pub oldstatus: Option<i32>,
    pub locking: i32,
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
    pub new_poll_period: i32,
    pub update_poll_period: i32,
    pub errors: Option<String>,
    pub processing_metadata: Option<Value>,
    pub running_metadata: Option<Value>,
    pub output_metadata: Option<Value>,
}

impl TryFrom<ProcessingRow> for ProcessingRecord {
    type Error = IddsError;

    fn try_from(row: ProcessingRow) -> Result<Self, IddsError> {
        Ok(Self { processing_id: row.processing_id,
                  transform_id: row.transform_id,
                  request_id: row.request_id,
                  workload_id: row.workload_id,
                  status: ProcessingStatus::try_from(row.status)?,
                  substatus: opt_status(row.substatus)?,
                  oldstatus: opt_status(row.oldstatus)?,
                  locking: Locking::try_from(row.locking)?,
                  submitter: row.submitter,
                  created_at: row.created_at,
                  updated_at: row.updated_at,
                  next_poll_at: row.next_poll_at,
                  submitted_at: row.submitted_at,
                  finished_at: row.finished_at,
                  expired_at: row.expired_at,
                  new_retries: row.new_retries,
                  update_retries: row.update_retries,
                  max_new_retries: row.max_new_retries,
                  max_update_retries: row.max_update_retries,
                  new_poll_period: Duration::from_secs(row.new_poll_period.max(0) as u64),
                  update_poll_period: Duration::from_secs(row.update_poll_period.max(0) as u64),
                  errors: row.errors,
                  processing_metadata: meta(row.processing_metadata),
                  running_metadata: meta(row.running_metadata),
                  output_metadata: meta(row.output_metadata) })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = processings)]
pub struct NewProcessingRow {
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub status: i32,
    pub locking: i32,
    pub submitter: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub max_new_retries: i32,
    pub max_update_retries: i32,
    pub new_poll_period: i32,
    pub update_poll_period: i32,
    pub processing_metadata: Option<Value>,
    pub running_metadata: Option<Value>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = processings)]
pub struct ProcessingChangeset {
    pub status: Option<i32>,
    pub substatus: Option<i32>,
    pub oldstatus: Option<i32>,
    pub locking: Option<i32>,
    pub workload_id: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub errors: Option<String>,
    pub new_retries: Option<i32>,
    pub update_retries: Option<i32>,
    pub processing_metadata: Option<Value>,
    pub running_metadata: Option<Value>,
    pub output_metadata: Option<Value>,
}

impl From<idds_core::catalog::ProcessingUpdate> for ProcessingChangeset {
    fn from(u: idds_core::catalog::ProcessingUpdate) -> Self {
        Self { status: u.status.map(|v| v.value()),
               substatus: u.substatus.map(|v| v.value()),
               oldstatus: u.oldstatus.map(|v| v.value()),
               locking: u.locking.map(|v| v.value()),
               workload_id: u.workload_id,
               updated_at: Some(Utc::now()),
               next_poll_at: u.next_poll_at,
               submitted_at: u.submitted_at,
               finished_at: u.finished_at,
               expired_at: u.expired_at,
               errors: u.errors,
               new_retries: u.new_retries,
               update_retries: u.update_retries,
               processing_metadata: u.processing_metadata,
               running_metadata: u.running_metadata,
               output_metadata: u.output_metadata }
    }
}

// ----------------------------------------------------------------------
// collections
// ----------------------------------------------------------------------

#[derive(Queryable, Debug)]
pub struct CollectionRow {
    pub coll_id: i64,
    pub request_id: i64,
    pub transform_id: i64,
    pub workload_id: Option<i64>,
    pub coll_type: i32,
    pub relation_type: i32,
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    pub status: i32,
    pub substatus: Option<i32>,
    pub locking: i32,
    pub total_files: i64,
    pub new_files: i64,
    pub processed_files: i64,
    pub processing_files: i64,
    pub failed_files: i64,
    pub missing_files: i64,
    pub ext_files: i64,
    pub processed_ext_files: i64,
    pub failed_ext_files: i64,
    pub missing_ext_files: i64,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub coll_metadata: Option<Value>,
}

impl TryFrom<CollectionRow> for CollectionRecord {
    type Error = IddsError;

    fn try_from(row: CollectionRow) -> Result<Self, IddsError> {
        Ok(Self { coll_id: row.coll_id,
                  request_id: row.request_id,
                  transform_id: row.transform_id,
                  workload_id: row.workload_id,
                  coll_type: CollectionType::try_from(row.coll_type)?,
                  relation_type: CollectionRelationType::try_from(row.relation_type)?,
                  scope: row.scope,
                  name: row.name,
                  bytes: row.bytes,
                  status: CollectionStatus::try_from(row.status)?,
                  substatus: opt_status(row.substatus)?,
                  locking: Locking::try_from(row.locking)?,
                  total_files: row.total_files,
                  new_files: row.new_files,
                  processed_files: row.processed_files,
                  processing_files: row.processing_files,
                  failed_files: row.failed_files,
                  missing_files: row.missing_files,
                  ext_files: row.ext_files,
                  processed_ext_files: row.processed_ext_files,
                  failed_ext_files: row.failed_ext_files,
                  missing_ext_files: row.missing_ext_files,
                  retries: row.retries,
                  created_at: row.created_at,
                  updated_at: row.updated_at,
                  next_poll_at: row.next_poll_at,
                  expired_at: row.expired_at,
                  coll_metadata: meta(row.coll_metadata) })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = collections)]
pub struct NewCollectionRow {
    pub request_id: i64,
    pub transform_id: i64,
    pub workload_id: Option<i64>,
    pub coll_type: i32,
    pub relation_type: i32,
    pub scope: String,
    pub name: String,
    pub status: i32,
    pub locking: i32,
    pub total_files: i64,
    pub coll_metadata: Option<Value>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = collections)]
pub struct CollectionChangeset {
    pub status: Option<i32>,
    pub substatus: Option<i32>,
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
    pub updated_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub coll_metadata: Option<Value>,
}

impl From<idds_core::catalog::CollectionUpdate> for CollectionChangeset {
    fn from(u: idds_core::catalog::CollectionUpdate) -> Self {
        Self { status: u.status.map(|v| v.value()),
               substatus: u.substatus.map(|v| v.value()),
               bytes: u.bytes,
               total_files: u.total_files,
               new_files: u.new_files,
               processed_files: u.processed_files,
               processing_files: u.processing_files,
               failed_files: u.failed_files,
               missing_files: u.missing_files,
               ext_files: u.ext_files,
               processed_ext_files: u.processed_ext_files,
               failed_ext_files: u.failed_ext_files,
               missing_ext_files: u.missing_ext_files,
               updated_at: Some(Utc::now()),
               next_poll_at: u.next_poll_at,
               coll_metadata: u.coll_metadata }
    }
}

// ----------------------------------------------------------------------
// contents
// ----------------------------------------------------------------------

#[derive(Queryable, Debug)]
pub struct ContentRow {
    pub content_id: i64,
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
    pub content_type: i32,
    pub content_relation_type: i32,
    pub status: i32,
    pub substatus: i32,
    pub locking: i32,
    pub bytes: i64,
    pub md5: Option<String>,
    pub adler32: Option<String>,
    pub path: Option<String>,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub content_metadata: Option<Value>,
}

impl TryFrom<ContentRow> for ContentRecord {
    type Error = IddsError;

    fn try_from(row: ContentRow) -> Result<Self, IddsError> {
        Ok(Self { content_id: row.content_id,
                  transform_id: row.transform_id,
                  coll_id: row.coll_id,
                  request_id: row.request_id,
                  workload_id: row.workload_id,
                  map_id: row.map_id,
                  content_dep_id: row.content_dep_id,
                  scope: row.scope,
                  name: row.name,
                  min_id: row.min_id,
                  max_id: row.max_id,
                  content_type: ContentType::try_from(row.content_type)?,
                  content_relation_type: ContentRelationType::try_from(row.content_relation_type)?,
                  status: ContentStatus::try_from(row.status)?,
                  substatus: ContentStatus::try_from(row.substatus)?,
                  locking: Locking::try_from(row.locking)?,
                  bytes: row.bytes,
                  md5: row.md5,
                  adler32: row.adler32,
                  path: row.path,
                  retries: row.retries,
                  created_at: row.created_at,
                  updated_at: row.updated_at,
                  expired_at: row.expired_at,
                  content_metadata: meta(row.content_metadata) })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = contents)]
pub struct NewContentRow {
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
    pub content_type: i32,
    pub content_relation_type: i32,
    pub status: i32,
    pub substatus: i32,
    pub locking: i32,
    pub bytes: i64,
    pub path: Option<String>,
    pub content_metadata: Option<Value>,
}

impl From<idds_core::catalog::NewContent> for NewContentRow {
    fn from(c: idds_core::catalog::NewContent) -> Self {
        Self { transform_id: c.transform_id,
               coll_id: c.coll_id,
               request_id: c.request_id,
               workload_id: c.workload_id,
               map_id: c.map_id,
               content_dep_id: c.content_dep_id,
               scope: c.scope,
               name: c.name,
               min_id: c.min_id,
               max_id: c.max_id,
               content_type: c.content_type.value(),
               content_relation_type: c.content_relation_type.value(),
               status: c.status.value(),
               substatus: c.substatus.value(),
               locking: Locking::Idle.value(),
               bytes: c.bytes,
               path: c.path,
               content_metadata: if c.content_metadata.is_null() {
                   None
               } else {
                   Some(c.content_metadata)
               } }
    }
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = contents)]
pub struct ContentChangeset {
    pub status: Option<i32>,
    pub substatus: Option<i32>,
    pub path: Option<String>,
    pub content_metadata: Option<Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&idds_core::catalog::ContentUpdate> for ContentChangeset {
    fn from(u: &idds_core::catalog::ContentUpdate) -> Self {
        Self { status: u.status.map(|v| v.value()),
               substatus: u.substatus.map(|v| v.value()),
               path: u.path.clone(),
               content_metadata: u.content_metadata.clone(),
               updated_at: Some(Utc::now()) }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = contents_update)]
pub struct NewContentUpdateRow {
    pub content_id: i64,
    pub substatus: i32,
    pub request_id: i64,
    pub transform_id: i64,
    pub workload_id: Option<i64>,
    pub coll_id: i64,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = contents_ext)]
pub struct NewContentExtRow {
    pub content_id: i64,
    pub transform_id: i64,
    pub coll_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub map_id: i64,
    pub status: Option<i32>,
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

#[derive(Queryable, Debug)]
pub struct ContentExtRow {
    pub content_id: i64,
    pub transform_id: i64,
    pub coll_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub map_id: i64,
    pub status: Option<i32>,
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

impl TryFrom<ContentExtRow> for ContentExtRecord {
    type Error = IddsError;

    fn try_from(row: ContentExtRow) -> Result<Self, IddsError> {
        Ok(Self { content_id: row.content_id,
                  transform_id: row.transform_id,
                  coll_id: row.coll_id,
                  request_id: row.request_id,
                  workload_id: row.workload_id,
                  map_id: row.map_id,
                  status: opt_status(row.status)?,
                  panda_id: row.panda_id,
                  job_status: row.job_status,
                  start_time: row.start_time,
                  end_time: row.end_time,
                  computing_site: row.computing_site,
                  attempt_nr: row.attempt_nr,
                  core_count: row.core_count,
                  cpu_consumption_time: row.cpu_consumption_time,
                  max_rss: row.max_rss })
    }
}

// ----------------------------------------------------------------------
// messages / health / commands
// ----------------------------------------------------------------------

#[derive(Queryable, Debug)]
pub struct MessageRow {
    pub msg_id: i64,
    pub msg_type: i32,
    pub status: i32,
    pub locking: i32,
    pub source: i32,
    pub destination: i32,
    pub request_id: Option<i64>,
    pub workload_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub num_contents: i32,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub msg_content: Option<Value>,
}

impl TryFrom<MessageRow> for MessageRecord {
    type Error = IddsError;

    fn try_from(row: MessageRow) -> Result<Self, IddsError> {
        Ok(Self { msg_id: row.msg_id,
                  msg_type: MessageType::try_from(row.msg_type)?,
                  status: MessageStatus::try_from(row.status)?,
                  locking: Locking::try_from(row.locking)?,
                  source: MessageSource::try_from(row.source)?,
                  destination: MessageDestination::try_from(row.destination)?,
                  request_id: row.request_id,
                  workload_id: row.workload_id,
                  transform_id: row.transform_id,
                  processing_id: row.processing_id,
                  num_contents: row.num_contents,
                  retries: row.retries,
                  created_at: row.created_at,
                  updated_at: row.updated_at,
                  msg_content: meta(row.msg_content) })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = messages)]
pub struct NewMessageRow {
    pub msg_type: i32,
    pub status: i32,
    pub locking: i32,
    pub source: i32,
    pub destination: i32,
    pub request_id: Option<i64>,
    pub workload_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub num_contents: i32,
    pub msg_content: Option<Value>,
}

impl From<idds_core::catalog::NewMessage> for NewMessageRow {
    fn from(m: idds_core::catalog::NewMessage) -> Self {
        Self { msg_type: m.msg_type.value(),
               status: m.status.value(),
               locking: Locking::Idle.value(),
               source: m.source.value(),
               destination: m.destination.value(),
               request_id: m.request_id,
               workload_id: m.workload_id,
               transform_id: m.transform_id,
               processing_id: m.processing_id,
               num_contents: m.num_contents,
               msg_content: if m.msg_content.is_null() { None } else { Some(m.msg_content) } }
    }
}

#[derive(Queryable, Debug)]
pub struct HealthRow {
    pub health_id: i64,
    pub agent: String,
    pub hostname: String,
    pub pid: i32,
    pub thread_id: i64,
    pub thread_name: Option<String>,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<HealthRow> for HealthRecord {
    fn from(row: HealthRow) -> Self {
        Self { health_id: row.health_id,
               agent: row.agent,
               hostname: row.hostname,
               pid: row.pid,
               thread_id: row.thread_id,
               thread_name: row.thread_name,
               payload: row.payload,
               created_at: row.created_at,
               updated_at: row.updated_at }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = health)]
pub struct NewHealthRow {
    pub agent: String,
    pub hostname: String,
    pub pid: i32,
    pub thread_id: i64,
    pub thread_name: Option<String>,
    pub payload: Option<String>,
}

#[derive(Queryable, Debug)]
pub struct CommandRow {
    pub cmd_id: i64,
    pub request_id: Option<i64>,
    pub workload_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub cmd_type: i32,
    pub status: i32,
    pub locking: i32,
    pub username: Option<String>,
    pub retries: i32,
    pub source: i32,
    pub destination: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cmd_content: Option<Value>,
    pub errors: Option<String>,
}

impl TryFrom<CommandRow> for CommandRecord {
    type Error = IddsError;

    fn try_from(row: CommandRow) -> Result<Self, IddsError> {
        Ok(Self { cmd_id: row.cmd_id,
                  request_id: row.request_id,
                  workload_id: row.workload_id,
                  transform_id: row.transform_id,
                  processing_id: row.processing_id,
                  cmd_type: CommandType::try_from(row.cmd_type)?,
                  status: CommandStatus::try_from(row.status)?,
                  locking: Locking::try_from(row.locking)?,
                  username: row.username,
                  retries: row.retries,
                  source: CommandLocation::try_from(row.source)?,
                  destination: CommandLocation::try_from(row.destination)?,
                  created_at: row.created_at,
                  updated_at: row.updated_at,
                  cmd_content: meta(row.cmd_content),
                  errors: row.errors })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = commands)]
pub struct NewCommandRow {
    pub request_id: Option<i64>,
    pub workload_id: Option<i64>,
    pub transform_id: Option<i64>,
    pub processing_id: Option<i64>,
    pub cmd_type: i32,
    pub status: i32,
    pub locking: i32,
    pub username: Option<String>,
    pub source: i32,
    pub destination: i32,
    pub cmd_content: Option<Value>,
}
