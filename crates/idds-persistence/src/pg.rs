//! `PgCatalog`: implementación Postgres del catálogo.
//!
//! Paridad 1:1 con `MemoryCatalog`. Puntos de cuidado:
//! - El listado con `locking=true` selecciona candidatos y luego voltea
//!   `locking` con `WHERE locking = Idle` en la misma transacción: sólo las
//!   filas que seguían Idle se devuelven (select-and-lock atómico).
//! - Las operaciones compuestas corren en una transacción Diesel; la
//!   propagación de dependencias se aplica ahí mismo, junto con las filas de
//!   auditoría en `contents_update`.
//! - Errores transitorios reintentan con backoff corto (`with_retry`).

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::debug;

use idds_common::error::Result;
use idds_common::{CommandStatus, ContentRelationType, ContentStatus, DbConfig, IddsError, Locking, MessageStatus,
                  ProcessingStatus, RequestStatus, TransformStatus};
use idds_core::catalog::{self, Catalog, CommandUpdate, ContentUpdate, HealthItem, MessageFilter, NewCommand,
                         NewContent, NewMessage, NewRequest, NewTransform, ProcessingUpdate, RequestUpdate,
                         TransformOutputs, TransformUpdate};
use idds_core::models::{CollectionRecord, CommandRecord, ContentExtRecord, ContentRecord, HealthRecord,
                        MessageRecord, ProcessingRecord, RequestRecord, TransformRecord};

use crate::error::{map_diesel_error, with_retry};
use crate::migrations::run_pending_migrations;
use crate::rows::*;
use crate::schema::{collections, commands, contents, contents_ext, contents_update, health, messages, processings,
                    requests, transforms};

pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Tamaño de lote para altas masivas de contents.
const CONTENT_INSERT_CHUNK: usize = 10_000;

/// Construye un pool r2d2 y corre las migraciones pendientes una vez.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool> {
    let min = min_size.max(1).min(max_size.max(1));
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(min))
                                    .max_size(max_size.max(1))
                                    .build(manager)
                                    .map_err(|e| IddsError::ConnectionFailure(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| IddsError::ConnectionFailure(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Pool desde `DATABASE_URL` (falla si no está definido).
pub fn build_pool_from_env() -> Result<PgPool> {
    let cfg = DbConfig::from_env().ok_or_else(|| IddsError::Validation("DATABASE_URL not set".into()))?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>> {
        self.pool
            .get()
            .map_err(|e| IddsError::ConnectionFailure(format!("pool error: {e}")))
    }
}

fn secs(d: Duration) -> i32 {
    d.as_secs().min(i32::MAX as u64) as i32
}

/// Aplica updates de contents dentro de una transacción y propaga los
/// substatus que cambiaron a los contents dependientes. Devuelve cuántas
/// filas dependientes se tocaron.
fn apply_content_updates_tx(tx: &mut PgConnection, updates: &[ContentUpdate]) -> QueryResult<usize> {
    if updates.is_empty() {
        return Ok(0);
    }
    let target_ids: Vec<i64> = updates.iter().map(|u| u.content_id).collect();
    let current: BTreeMap<i64, i32> = contents::table.filter(contents::content_id.eq_any(&target_ids))
                                                     .select((contents::content_id, contents::substatus))
                                                     .load::<(i64, i32)>(tx)?
                                                     .into_iter()
                                                     .collect();
    let mut flipped: Vec<(i64, i32)> = Vec::new();
    for update in updates {
        let changeset = ContentChangeset::from(update);
        diesel::update(contents::table.filter(contents::content_id.eq(update.content_id))).set(changeset)
                                                                                          .execute(tx)?;
        if let Some(sub) = update.substatus {
            if current.get(&update.content_id).copied() != Some(sub.value()) {
                flipped.push((update.content_id, sub.value()));
            }
        }
    }

    // auditoría: espejo de los flips en contents_update
    if !flipped.is_empty() {
        let audit: Vec<(i64, i32)> = flipped.clone();
        let rows: Vec<NewContentUpdateRow> =
            contents::table.filter(contents::content_id.eq_any(audit.iter().map(|(id, _)| *id).collect::<Vec<_>>()))
                           .load::<ContentRow>(tx)?
                           .into_iter()
                           .map(|c| {
                               let substatus = audit.iter()
                                                    .find(|(id, _)| *id == c.content_id)
                                                    .map(|(_, s)| *s)
                                                    .unwrap_or(c.substatus);
                               NewContentUpdateRow { content_id: c.content_id,
                                                     substatus,
                                                     request_id: c.request_id,
                                                     transform_id: c.transform_id,
                                                     workload_id: c.workload_id,
                                                     coll_id: c.coll_id }
                           })
                           .collect();
        diesel::insert_into(contents_update::table).values(&rows)
                                                   .on_conflict(contents_update::content_id)
                                                   .do_nothing()
                                                   .execute(tx)?;
    }

    // propagación: el substatus fuente se copia a los dependientes en la
    // misma transacción
    let mut by_substatus: BTreeMap<i32, Vec<i64>> = BTreeMap::new();
    for (content_id, sub) in flipped {
        if ContentStatus::try_from(sub).map(|s| s.propagates()).unwrap_or(false) {
            by_substatus.entry(sub).or_default().push(content_id);
        }
    }
    let mut propagated = 0;
    for (sub, source_ids) in by_substatus {
        propagated +=
            diesel::update(contents::table.filter(contents::content_dep_id.eq_any(source_ids))
                                          .filter(contents::substatus.ne(sub)))
                .set((contents::substatus.eq(sub), contents::updated_at.eq(Utc::now())))
                .execute(tx)?;
    }
    Ok(propagated)
}

fn insert_new_transform_tx(tx: &mut PgConnection, new: NewTransform) -> QueryResult<i64> {
    let row = NewTransformRow { request_id: new.request_id,
                                workload_id: new.workload_id,
                                transform_type: new.transform_type.value(),
                                transform_tag: new.transform_tag,
                                priority: new.priority,
                                name: new.name,
                                status: new.status.value(),
                                locking: Locking::Idle.value(),
                                expired_at: new.expired_at,
                                max_new_retries: new.max_new_retries,
                                max_update_retries: new.max_update_retries,
                                new_poll_period: secs(new.new_poll_period),
                                update_poll_period: secs(new.update_poll_period),
                                transform_metadata: Some(new.transform_metadata),
                                running_metadata: Some(new.running_metadata) };
    let transform_id: i64 = diesel::insert_into(transforms::table).values(&row)
                                                                  .returning(transforms::transform_id)
                                                                  .get_result(tx)?;
    for coll in new.collections {
        let coll_row = NewCollectionRow { request_id: coll.request_id,
                                          transform_id,
                                          workload_id: coll.workload_id,
                                          coll_type: coll.coll_type.value(),
                                          relation_type: coll.relation_type.value(),
                                          scope: coll.scope,
                                          name: coll.name,
                                          status: coll.status.value(),
                                          locking: Locking::Idle.value(),
                                          total_files: coll.total_files,
                                          coll_metadata: Some(coll.coll_metadata) };
        diesel::insert_into(collections::table).values(&coll_row)
                                               .on_conflict_do_nothing()
                                               .execute(tx)?;
    }
    Ok(transform_id)
}

fn insert_new_processing_tx(tx: &mut PgConnection, new: catalog::NewProcessing) -> QueryResult<i64> {
    let row = NewProcessingRow { transform_id: new.transform_id,
                                 request_id: new.request_id,
                                 workload_id: new.workload_id,
                                 status: new.status.value(),
                                 locking: Locking::Idle.value(),
                                 submitter: new.submitter,
                                 expired_at: new.expired_at,
                                 max_new_retries: new.max_new_retries,
                                 max_update_retries: new.max_update_retries,
                                 new_poll_period: secs(new.new_poll_period),
                                 update_poll_period: secs(new.update_poll_period),
                                 processing_metadata: Some(new.processing_metadata),
                                 running_metadata: Some(new.running_metadata) };
    diesel::insert_into(processings::table).values(&row)
                                           .returning(processings::processing_id)
                                           .get_result(tx)
}

fn insert_message_tx(tx: &mut PgConnection, message: NewMessage) -> QueryResult<i64> {
    let row = NewMessageRow::from(message);
    diesel::insert_into(messages::table).values(&row)
                                        .returning(messages::msg_id)
                                        .get_result(tx)
}

fn insert_contents_tx(tx: &mut PgConnection, new_contents: Vec<NewContent>) -> QueryResult<usize> {
    let mut inserted = 0;
    let rows: Vec<NewContentRow> = new_contents.into_iter().map(NewContentRow::from).collect();
    for chunk in rows.chunks(CONTENT_INSERT_CHUNK) {
        inserted += diesel::insert_into(contents::table).values(chunk)
                                                        .on_conflict_do_nothing()
                                                        .execute(tx)?;
    }
    Ok(inserted)
}

impl Catalog for PgCatalog {
    fn add_request(&self, request: NewRequest) -> Result<i64> {
        with_retry(|| {
            let mut conn = self.conn()?;
            let row = NewRequestRow { scope: request.scope.clone(),
                                      name: request.name.clone(),
                                      requester: request.requester.clone(),
                                      request_type: request.request_type.value(),
                                      workload_id: request.workload_id,
                                      priority: request.priority,
                                      status: request.status.value(),
                                      locking: Locking::Idle.value(),
                                      expired_at: request.expired_at,
                                      max_new_retries: request.max_new_retries,
                                      max_update_retries: request.max_update_retries,
                                      new_poll_period: secs(request.new_poll_period),
                                      update_poll_period: secs(request.update_poll_period),
                                      request_metadata: Some(request.request_metadata.clone()),
                                      processing_metadata: Some(request.processing_metadata.clone()) };
            diesel::insert_into(requests::table).values(&row)
                                                .returning(requests::request_id)
                                                .get_result(&mut conn)
                                                .map_err(map_diesel_error)
        })
    }

    fn get_request(&self, request_id: i64) -> Result<RequestRecord> {
        let mut conn = self.conn()?;
        let row: RequestRow = requests::table.filter(requests::request_id.eq(request_id))
                                             .first(&mut conn)
                                             .map_err(map_diesel_error)?;
        row.try_into()
    }

    fn get_requests_by_status(&self,
                              status: &[RequestStatus],
                              by_substatus: bool,
                              locking: bool,
                              bulk_size: usize)
                              -> Result<Vec<RequestRecord>> {
        let status_vals: Vec<i32> = status.iter().map(|s| s.value()).collect();
        let rows: Vec<RequestRow> = with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| {
                    let now = Utc::now();
                    let mut query = requests::table.select(requests::request_id).into_boxed();
                    if by_substatus {
                        query = query.filter(requests::substatus.eq_any(status_vals.clone()));
                    } else {
                        query = query.filter(requests::status.eq_any(status_vals.clone()));
                    }
                    query = query.filter(requests::next_poll_at.le(now));
                    if locking {
                        query = query.filter(requests::locking.eq(Locking::Idle.value()));
                    }
                    let ids: Vec<i64> = query.order((requests::priority.desc(),
                                                     requests::next_poll_at.asc(),
                                                     requests::created_at.asc()))
                                             .limit(bulk_size as i64)
                                             .load(tx)?;
                    let final_ids: Vec<i64> = if locking {
                        diesel::update(requests::table.filter(requests::request_id.eq_any(&ids))
                                                      .filter(requests::locking.eq(Locking::Idle.value())))
                            .set((requests::locking.eq(Locking::Locking.value()),
                                  requests::updated_at.eq(now)))
                            .returning(requests::request_id)
                            .get_results(tx)?
                    } else {
                        ids
                    };
                    requests::table.filter(requests::request_id.eq_any(final_ids))
                                   .order((requests::priority.desc(),
                                           requests::next_poll_at.asc(),
                                           requests::created_at.asc()))
                                   .load(tx)
                })
                .map_err(map_diesel_error)
        })?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn update_request(&self, request_id: i64, update: RequestUpdate) -> Result<()> {
        with_retry(|| {
            let mut conn = self.conn()?;
            let changeset = RequestChangeset::from(update.clone());
            diesel::update(requests::table.filter(requests::request_id.eq(request_id)))
                .set(changeset)
                .execute(&mut conn)
                .map_err(map_diesel_error)
                .map(|_| ())
        })
    }

    fn update_request_with_transforms(&self,
                                      request_id: i64,
                                      update: RequestUpdate,
                                      new_transforms: Vec<NewTransform>,
                                      update_transforms: Vec<(i64, TransformUpdate)>)
                                      -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        conn.build_transaction()
            .read_write()
            .run(|tx| {
                let mut update = update.clone();
                let mut created = Vec::with_capacity(new_transforms.len());
                for new in new_transforms.clone() {
                    let instance_id = new.instance_id.clone();
                    let transform_id = insert_new_transform_tx(tx, new)?;
                    if let (Some(instance), Some(pm)) = (instance_id, update.processing_metadata.as_mut()) {
                        RequestRecord::patch_work_id(pm, &instance, transform_id);
                    }
                    created.push(transform_id);
                }
                for (transform_id, tf_update) in update_transforms.clone() {
                    let changeset = TransformChangeset::from(tf_update);
                    diesel::update(transforms::table.filter(transforms::transform_id.eq(transform_id)))
                        .set(changeset)
                        .execute(tx)?;
                }
                let changeset = RequestChangeset::from(update);
                diesel::update(requests::table.filter(requests::request_id.eq(request_id))).set(changeset)
                                                                                           .execute(tx)?;
                Ok(created)
            })
            .map_err(map_diesel_error)
    }

    fn clean_request_locking(&self, older_than: Duration) -> Result<usize> {
        let mut conn = self.conn()?;
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        diesel::update(requests::table.filter(requests::locking.eq(Locking::Locking.value()))
                                      .filter(requests::updated_at.lt(cutoff)))
            .set(requests::locking.eq(Locking::Idle.value()))
            .execute(&mut conn)
            .map_err(map_diesel_error)
    }

    fn delete_request_cascade(&self, request_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        conn.build_transaction()
            .read_write()
            .run(|tx| {
                let tf_ids: Vec<i64> = transforms::table.filter(transforms::request_id.eq(request_id))
                                                        .select(transforms::transform_id)
                                                        .load(tx)?;
                diesel::delete(contents_ext::table.filter(contents_ext::request_id.eq(request_id))).execute(tx)?;
                diesel::delete(contents_update::table.filter(contents_update::request_id.eq(request_id)))
                    .execute(tx)?;
                diesel::delete(contents::table.filter(contents::request_id.eq(request_id))).execute(tx)?;
                diesel::delete(collections::table.filter(collections::transform_id.eq_any(&tf_ids))).execute(tx)?;
                diesel::delete(processings::table.filter(processings::request_id.eq(request_id))).execute(tx)?;
                diesel::delete(transforms::table.filter(transforms::request_id.eq(request_id))).execute(tx)?;
                diesel::delete(messages::table.filter(messages::request_id.eq(request_id))).execute(tx)?;
                diesel::delete(commands::table.filter(commands::request_id.eq(request_id))).execute(tx)?;
                diesel::delete(requests::table.filter(requests::request_id.eq(request_id))).execute(tx)?;
                Ok(())
            })
            .map_err(map_diesel_error)
    }

    fn get_transform(&self, transform_id: i64) -> Result<TransformRecord> {
        let mut conn = self.conn()?;
        let row: TransformRow = transforms::table.filter(transforms::transform_id.eq(transform_id))
                                                 .first(&mut conn)
                                                 .map_err(map_diesel_error)?;
        row.try_into()
    }

    fn get_transforms_by_request(&self, request_id: i64) -> Result<Vec<TransformRecord>> {
        let mut conn = self.conn()?;
        let rows: Vec<TransformRow> = transforms::table.filter(transforms::request_id.eq(request_id))
                                                       .order(transforms::transform_id.asc())
                                                       .load(&mut conn)
                                                       .map_err(map_diesel_error)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn get_transforms_by_status(&self,
                                status: &[TransformStatus],
                                locking: bool,
                                bulk_size: usize)
                                -> Result<Vec<TransformRecord>> {
        let status_vals: Vec<i32> = status.iter().map(|s| s.value()).collect();
        let rows: Vec<TransformRow> = with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| {
                    let now = Utc::now();
                    let mut query = transforms::table.select(transforms::transform_id)
                                                     .filter(transforms::status.eq_any(status_vals.clone()))
                                                     .filter(transforms::next_poll_at.le(now))
                                                     .into_boxed();
                    if locking {
                        query = query.filter(transforms::locking.eq(Locking::Idle.value()));
                    }
                    let ids: Vec<i64> = query.order((transforms::priority.desc(),
                                                     transforms::next_poll_at.asc(),
                                                     transforms::created_at.asc()))
                                             .limit(bulk_size as i64)
                                             .load(tx)?;
                    let final_ids: Vec<i64> = if locking {
                        diesel::update(transforms::table.filter(transforms::transform_id.eq_any(&ids))
                                                        .filter(transforms::locking.eq(Locking::Idle.value())))
                            .set((transforms::locking.eq(Locking::Locking.value()),
                                  transforms::updated_at.eq(now)))
                            .returning(transforms::transform_id)
                            .get_results(tx)?
                    } else {
                        ids
                    };
                    transforms::table.filter(transforms::transform_id.eq_any(final_ids))
                                     .order((transforms::priority.desc(),
                                             transforms::next_poll_at.asc(),
                                             transforms::created_at.asc()))
                                     .load(tx)
                })
                .map_err(map_diesel_error)
        })?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn update_transform(&self, transform_id: i64, update: TransformUpdate) -> Result<()> {
        with_retry(|| {
            let mut conn = self.conn()?;
            let changeset = TransformChangeset::from(update.clone());
            diesel::update(transforms::table.filter(transforms::transform_id.eq(transform_id)))
                .set(changeset)
                .execute(&mut conn)
                .map_err(map_diesel_error)
                .map(|_| ())
        })
    }

    fn add_transform_outputs(&self,
                             transform_id: i64,
                             update: TransformUpdate,
                             outputs: TransformOutputs)
                             -> Result<Option<i64>> {
        let mut conn = self.conn()?;
        conn.build_transaction()
            .read_write()
            .run(|tx| {
                let outputs = outputs.clone();
                insert_contents_tx(tx, outputs.new_contents)?;
                if !outputs.mapped_input_ids.is_empty() {
                    diesel::update(contents::table.filter(contents::content_id.eq_any(&outputs.mapped_input_ids)))
                        .set((contents::status.eq(ContentStatus::Mapped.value()),
                              contents::updated_at.eq(Utc::now())))
                        .execute(tx)?;
                }
                for (coll_id, coll_update) in outputs.update_collections {
                    let changeset = CollectionChangeset::from(coll_update);
                    diesel::update(collections::table.filter(collections::coll_id.eq(coll_id))).set(changeset)
                                                                                               .execute(tx)?;
                }
                apply_content_updates_tx(tx, &outputs.update_contents)?;
                let mut created = None;
                if let Some(new_processing) = outputs.new_processing {
                    let terminal: Vec<i32> = [ProcessingStatus::Finished,
                                              ProcessingStatus::SubFinished,
                                              ProcessingStatus::Failed,
                                              ProcessingStatus::Cancelled,
                                              ProcessingStatus::Suspended,
                                              ProcessingStatus::Expired,
                                              ProcessingStatus::TimeOut].iter()
                                                                        .map(|s| s.value())
                                                                        .collect();
                    let active: Option<i64> =
                        processings::table.filter(processings::transform_id.eq(transform_id))
                                          .filter(processings::status.ne_all(terminal))
                                          .select(processings::processing_id)
                                          .first(tx)
                                          .optional()?;
                    created = Some(match active {
                                       Some(id) => id,
                                       None => insert_new_processing_tx(tx, new_processing)?,
                                   });
                }
                for message in outputs.messages {
                    insert_message_tx(tx, message)?;
                }
                let changeset = TransformChangeset::from(update.clone());
                diesel::update(transforms::table.filter(transforms::transform_id.eq(transform_id)))
                    .set(changeset)
                    .execute(tx)?;
                Ok(created)
            })
            .map_err(map_diesel_error)
    }

    fn clean_transform_locking(&self, older_than: Duration) -> Result<usize> {
        let mut conn = self.conn()?;
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        diesel::update(transforms::table.filter(transforms::locking.eq(Locking::Locking.value()))
                                        .filter(transforms::updated_at.lt(cutoff)))
            .set(transforms::locking.eq(Locking::Idle.value()))
            .execute(&mut conn)
            .map_err(map_diesel_error)
    }

    fn get_processing(&self, processing_id: i64) -> Result<ProcessingRecord> {
        let mut conn = self.conn()?;
        let row: ProcessingRow = processings::table.filter(processings::processing_id.eq(processing_id))
                                                   .first(&mut conn)
                                                   .map_err(map_diesel_error)?;
        row.try_into()
    }

    fn get_active_processing_by_transform(&self, transform_id: i64) -> Result<Option<ProcessingRecord>> {
        let mut conn = self.conn()?;
        let terminal: Vec<i32> = [ProcessingStatus::Finished,
                                  ProcessingStatus::SubFinished,
                                  ProcessingStatus::Failed,
                                  ProcessingStatus::Cancelled,
                                  ProcessingStatus::Suspended,
                                  ProcessingStatus::Expired,
                                  ProcessingStatus::TimeOut].iter()
                                                            .map(|s| s.value())
                                                            .collect();
        let row: Option<ProcessingRow> = processings::table.filter(processings::transform_id.eq(transform_id))
                                                           .filter(processings::status.ne_all(terminal))
                                                           .first(&mut conn)
                                                           .optional()
                                                           .map_err(map_diesel_error)?;
        row.map(TryInto::try_into).transpose()
    }

    fn get_processings_by_transform(&self, transform_id: i64) -> Result<Vec<ProcessingRecord>> {
        let mut conn = self.conn()?;
        let rows: Vec<ProcessingRow> = processings::table.filter(processings::transform_id.eq(transform_id))
                                                         .order(processings::processing_id.asc())
                                                         .load(&mut conn)
                                                         .map_err(map_diesel_error)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn get_processings_by_status(&self,
                                 status: &[ProcessingStatus],
                                 locking: bool,
                                 bulk_size: usize)
                                 -> Result<Vec<ProcessingRecord>> {
        let status_vals: Vec<i32> = status.iter().map(|s| s.value()).collect();
        let rows: Vec<ProcessingRow> = with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| {
                    let now = Utc::now();
                    let mut query = processings::table.select(processings::processing_id)
                                                      .filter(processings::status.eq_any(status_vals.clone()))
                                                      .filter(processings::next_poll_at.le(now))
                                                      .into_boxed();
                    if locking {
                        query = query.filter(processings::locking.eq(Locking::Idle.value()));
                    }
                    let ids: Vec<i64> = query.order((processings::next_poll_at.asc(),
                                                     processings::created_at.asc()))
                                             .limit(bulk_size as i64)
                                             .load(tx)?;
                    let final_ids: Vec<i64> = if locking {
                        diesel::update(processings::table.filter(processings::processing_id.eq_any(&ids))
                                                         .filter(processings::locking.eq(Locking::Idle.value())))
                            .set((processings::locking.eq(Locking::Locking.value()),
                                  processings::updated_at.eq(now)))
                            .returning(processings::processing_id)
                            .get_results(tx)?
                    } else {
                        ids
                    };
                    processings::table.filter(processings::processing_id.eq_any(final_ids))
                                      .order((processings::next_poll_at.asc(), processings::created_at.asc()))
                                      .load(tx)
                })
                .map_err(map_diesel_error)
        })?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn update_processing(&self, processing_id: i64, update: ProcessingUpdate) -> Result<()> {
        with_retry(|| {
            let mut conn = self.conn()?;
            let changeset = ProcessingChangeset::from(update.clone());
            diesel::update(processings::table.filter(processings::processing_id.eq(processing_id)))
                .set(changeset)
                .execute(&mut conn)
                .map_err(map_diesel_error)
                .map(|_| ())
        })
    }

    fn update_processing_with_contents(&self,
                                       processing_id: i64,
                                       update: ProcessingUpdate,
                                       content_updates: Vec<ContentUpdate>,
                                       messages_to_add: Vec<NewMessage>)
                                       -> Result<usize> {
        let mut conn = self.conn()?;
        conn.build_transaction()
            .read_write()
            .run(|tx| {
                let propagated = apply_content_updates_tx(tx, &content_updates)?;
                for message in messages_to_add.clone() {
                    insert_message_tx(tx, message)?;
                }
                let changeset = ProcessingChangeset::from(update.clone());
                diesel::update(processings::table.filter(processings::processing_id.eq(processing_id)))
                    .set(changeset)
                    .execute(tx)?;
                Ok(propagated)
            })
            .map_err(map_diesel_error)
    }

    fn clean_processing_locking(&self, older_than: Duration) -> Result<usize> {
        let mut conn = self.conn()?;
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        diesel::update(processings::table.filter(processings::locking.eq(Locking::Locking.value()))
                                         .filter(processings::updated_at.lt(cutoff)))
            .set(processings::locking.eq(Locking::Idle.value()))
            .execute(&mut conn)
            .map_err(map_diesel_error)
    }

    fn get_collection(&self, coll_id: i64) -> Result<CollectionRecord> {
        let mut conn = self.conn()?;
        let row: CollectionRow = collections::table.filter(collections::coll_id.eq(coll_id))
                                                   .first(&mut conn)
                                                   .map_err(map_diesel_error)?;
        row.try_into()
    }

    fn get_collections_by_transform(&self, transform_id: i64) -> Result<Vec<CollectionRecord>> {
        let mut conn = self.conn()?;
        let rows: Vec<CollectionRow> = collections::table.filter(collections::transform_id.eq(transform_id))
                                                         .order(collections::coll_id.asc())
                                                         .load(&mut conn)
                                                         .map_err(map_diesel_error)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn update_collection(&self, coll_id: i64, update: catalog::CollectionUpdate) -> Result<()> {
        with_retry(|| {
            let mut conn = self.conn()?;
            let changeset = CollectionChangeset::from(update.clone());
            diesel::update(collections::table.filter(collections::coll_id.eq(coll_id)))
                .set(changeset)
                .execute(&mut conn)
                .map_err(map_diesel_error)
                .map(|_| ())
        })
    }

    fn add_contents(&self, new_contents: Vec<NewContent>) -> Result<usize> {
        with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| insert_contents_tx(tx, new_contents.clone()))
                .map_err(map_diesel_error)
        })
    }

    fn get_contents_by_transform(&self, transform_id: i64) -> Result<Vec<ContentRecord>> {
        let mut conn = self.conn()?;
        let rows: Vec<ContentRow> = contents::table.filter(contents::transform_id.eq(transform_id))
                                                   .order(contents::content_id.asc())
                                                   .load(&mut conn)
                                                   .map_err(map_diesel_error)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn get_contents_by_coll(&self, coll_id: i64) -> Result<Vec<ContentRecord>> {
        let mut conn = self.conn()?;
        let rows: Vec<ContentRow> = contents::table.filter(contents::coll_id.eq(coll_id))
                                                   .order(contents::content_id.asc())
                                                   .load(&mut conn)
                                                   .map_err(map_diesel_error)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn get_content_by_coll_name(&self,
                                coll_id: i64,
                                name: &str,
                                relation_type: ContentRelationType)
                                -> Result<Option<ContentRecord>> {
        let mut conn = self.conn()?;
        let row: Option<ContentRow> =
            contents::table.filter(contents::coll_id.eq(coll_id))
                           .filter(contents::name.eq(name))
                           .filter(contents::content_relation_type.eq(relation_type.value()))
                           .first(&mut conn)
                           .optional()
                           .map_err(map_diesel_error)?;
        row.map(TryInto::try_into).transpose()
    }

    fn update_contents(&self, updates: Vec<ContentUpdate>) -> Result<()> {
        with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| apply_content_updates_tx(tx, &updates).map(|_| ()))
                .map_err(map_diesel_error)
        })
    }

    fn add_contents_ext(&self, items: Vec<ContentExtRecord>) -> Result<()> {
        let mut conn = self.conn()?;
        for item in items {
            let row = NewContentExtRow { content_id: item.content_id,
                                         transform_id: item.transform_id,
                                         coll_id: item.coll_id,
                                         request_id: item.request_id,
                                         workload_id: item.workload_id,
                                         map_id: item.map_id,
                                         status: item.status.map(|s| s.value()),
                                         panda_id: item.panda_id,
                                         job_status: item.job_status,
                                         start_time: item.start_time,
                                         end_time: item.end_time,
                                         computing_site: item.computing_site,
                                         attempt_nr: item.attempt_nr,
                                         core_count: item.core_count,
                                         cpu_consumption_time: item.cpu_consumption_time,
                                         max_rss: item.max_rss };
            diesel::insert_into(contents_ext::table).values(&row)
                                                    .on_conflict(contents_ext::content_id)
                                                    .do_update()
                                                    .set((contents_ext::status.eq(row.status),
                                                          contents_ext::panda_id.eq(row.panda_id),
                                                          contents_ext::job_status.eq(row.job_status.clone()),
                                                          contents_ext::end_time.eq(row.end_time)))
                                                    .execute(&mut conn)
                                                    .map_err(map_diesel_error)?;
        }
        Ok(())
    }

    fn get_contents_ext_by_transform(&self, transform_id: i64) -> Result<Vec<ContentExtRecord>> {
        let mut conn = self.conn()?;
        let rows: Vec<ContentExtRow> = contents_ext::table.filter(contents_ext::transform_id.eq(transform_id))
                                                          .load(&mut conn)
                                                          .map_err(map_diesel_error)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn add_message(&self, message: NewMessage) -> Result<i64> {
        with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| insert_message_tx(tx, message.clone()))
                .map_err(map_diesel_error)
        })
    }

    fn retrieve_messages(&self, filter: MessageFilter) -> Result<Vec<MessageRecord>> {
        let mut conn = self.conn()?;
        let mut query = messages::table.into_boxed();
        if let Some(t) = filter.msg_type {
            query = query.filter(messages::msg_type.eq(t.value()));
        }
        if let Some(s) = filter.status {
            query = query.filter(messages::status.eq(s.value()));
        }
        if let Some(id) = filter.request_id {
            query = query.filter(messages::request_id.eq(id));
        }
        if let Some(id) = filter.transform_id {
            query = query.filter(messages::transform_id.eq(id));
        }
        if let Some(id) = filter.processing_id {
            query = query.filter(messages::processing_id.eq(id));
        }
        if let Some(bulk) = filter.bulk_size {
            query = query.limit(bulk as i64);
        }
        let rows: Vec<MessageRow> = query.order(messages::msg_id.asc())
                                         .load(&mut conn)
                                         .map_err(map_diesel_error)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn update_messages_status(&self, msg_ids: &[i64], status: MessageStatus) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::update(messages::table.filter(messages::msg_id.eq_any(msg_ids)))
            .set((messages::status.eq(status.value()), messages::updated_at.eq(Utc::now())))
            .execute(&mut conn)
            .map_err(map_diesel_error)
            .map(|_| ())
    }

    fn add_health_item(&self, item: HealthItem) -> Result<()> {
        let mut conn = self.conn()?;
        let row = NewHealthRow { agent: item.agent,
                                 hostname: item.hostname,
                                 pid: item.pid,
                                 thread_id: item.thread_id,
                                 thread_name: item.thread_name,
                                 payload: item.payload };
        diesel::insert_into(health::table).values(&row)
                                          .on_conflict((health::agent, health::hostname, health::pid,
                                                        health::thread_id))
                                          .do_update()
                                          .set((health::payload.eq(row.payload.clone()),
                                                health::thread_name.eq(row.thread_name.clone()),
                                                health::updated_at.eq(Utc::now())))
                                          .execute(&mut conn)
                                          .map_err(map_diesel_error)
                                          .map(|_| ())
    }

    fn get_health_items(&self) -> Result<Vec<HealthRecord>> {
        let mut conn = self.conn()?;
        let rows: Vec<HealthRow> = health::table.order(health::health_id.asc())
                                                .load(&mut conn)
                                                .map_err(map_diesel_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    fn clean_health(&self, older_than: Option<Duration>, hostname: Option<&str>, pids: &[i32]) -> Result<usize> {
        let mut conn = self.conn()?;
        let mut removed = 0;
        if let Some(older) = older_than {
            let cutoff = Utc::now() - chrono::Duration::seconds(older.as_secs() as i64);
            removed += diesel::delete(health::table.filter(health::updated_at.lt(cutoff))).execute(&mut conn)
                                                                                          .map_err(map_diesel_error)?;
        }
        if let Some(host) = hostname {
            if !pids.is_empty() {
                removed += diesel::delete(health::table.filter(health::hostname.eq(host))
                                                       .filter(health::pid.eq_any(pids)))
                    .execute(&mut conn)
                    .map_err(map_diesel_error)?;
            }
        }
        debug!("clean_health removed {removed} rows");
        Ok(removed)
    }

    fn add_command(&self, command: NewCommand) -> Result<i64> {
        let mut conn = self.conn()?;
        let row = NewCommandRow { request_id: command.request_id,
                                  workload_id: command.workload_id,
                                  transform_id: command.transform_id,
                                  processing_id: command.processing_id,
                                  cmd_type: command.cmd_type.value(),
                                  status: command.status.value(),
                                  locking: Locking::Idle.value(),
                                  username: command.username,
                                  source: command.source.value(),
                                  destination: command.destination.value(),
                                  cmd_content: if command.cmd_content.is_null() {
                                      None
                                  } else {
                                      Some(command.cmd_content)
                                  } };
        diesel::insert_into(commands::table).values(&row)
                                            .returning(commands::cmd_id)
                                            .get_result(&mut conn)
                                            .map_err(map_diesel_error)
    }

    fn get_commands_by_status(&self,
                              status: CommandStatus,
                              locking: bool,
                              bulk_size: usize)
                              -> Result<Vec<CommandRecord>> {
        let rows: Vec<CommandRow> = with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| {
                    let now = Utc::now();
                    let mut query = commands::table.select(commands::cmd_id)
                                                   .filter(commands::status.eq(status.value()))
                                                   .into_boxed();
                    if locking {
                        query = query.filter(commands::locking.eq(Locking::Idle.value()));
                    }
                    let ids: Vec<i64> = query.order(commands::cmd_id.asc())
                                             .limit(bulk_size as i64)
                                             .load(tx)?;
                    let final_ids: Vec<i64> = if locking {
                        diesel::update(commands::table.filter(commands::cmd_id.eq_any(&ids))
                                                      .filter(commands::locking.eq(Locking::Idle.value())))
                            .set((commands::locking.eq(Locking::Locking.value()), commands::updated_at.eq(now)))
                            .returning(commands::cmd_id)
                            .get_results(tx)?
                    } else {
                        ids
                    };
                    commands::table.filter(commands::cmd_id.eq_any(final_ids))
                                   .order(commands::cmd_id.asc())
                                   .load(tx)
                })
                .map_err(map_diesel_error)
        })?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    fn update_command(&self, cmd_id: i64, update: CommandUpdate) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::update(commands::table.filter(commands::cmd_id.eq(cmd_id)))
            .set((update.status.map(|s| commands::status.eq(s.value())),
                  update.locking.map(|l| commands::locking.eq(l.value())),
                  update.errors.map(|e| commands::errors.eq(e)),
                  commands::updated_at.eq(Utc::now())))
            .execute(&mut conn)
            .map_err(map_diesel_error)
            .map(|_| ())
    }
}
