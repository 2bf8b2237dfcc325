//! Backend en memoria del catálogo.
//!
//! Paridad 1:1 con el backend Postgres: mismos filtros, mismo volteo de
//! locking, misma propagación de dependencias. Un único `Mutex` hace de
//! transacción: toda operación compuesta se ve entera o no se ve.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use serde_json::Value;

use idds_common::error::Result;
use idds_common::{CommandStatus, ContentRelationType, ContentStatus, IddsError, Locking, MessageStatus,
                  ProcessingStatus, RequestStatus, TransformStatus};

use crate::models::{CollectionRecord, CommandRecord, ContentExtRecord, ContentRecord, HealthRecord, MessageRecord,
                    ProcessingRecord, RequestRecord, TransformRecord};

use super::types::*;
use super::Catalog;

#[derive(Default)]
struct Mem {
    requests: BTreeMap<i64, RequestRecord>,
    transforms: BTreeMap<i64, TransformRecord>,
    processings: BTreeMap<i64, ProcessingRecord>,
    collections: BTreeMap<i64, CollectionRecord>,
    contents: BTreeMap<i64, ContentRecord>,
    contents_ext: BTreeMap<i64, ContentExtRecord>,
    /// Audit de flips de substatus (espejo de la tabla contents_update).
    contents_update_log: Vec<(i64, ContentStatus)>,
    messages: BTreeMap<i64, MessageRecord>,
    health: Vec<HealthRecord>,
    commands: BTreeMap<i64, CommandRecord>,
    next_request_id: i64,
    next_transform_id: i64,
    next_processing_id: i64,
    next_coll_id: i64,
    next_content_id: i64,
    next_msg_id: i64,
    next_cmd_id: i64,
    next_health_id: i64,
}

/// Catálogo in-process. Volátil: sólo para tests y el binario demo.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Mem>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit de propagaciones (diagnóstico/tests).
    pub fn contents_update_log(&self) -> Vec<(i64, ContentStatus)> {
        self.inner.lock().expect("catalog poisoned").contents_update_log.clone()
    }
}

fn apply_request_update(rec: &mut RequestRecord, update: RequestUpdate) {
    let RequestUpdate { status,
                        substatus,
                        oldstatus,
                        locking,
                        priority,
                        next_poll_at,
                        expired_at,
                        errors,
                        new_retries,
                        update_retries,
                        request_metadata,
                        processing_metadata } = update;
    if let Some(v) = status {
        rec.oldstatus = Some(rec.status);
        rec.status = v;
    }
    if let Some(v) = substatus {
        rec.substatus = Some(v);
    }
    if let Some(v) = oldstatus {
        rec.oldstatus = Some(v);
    }
    if let Some(v) = locking {
        rec.locking = v;
    }
    if let Some(v) = priority {
        rec.priority = v;
    }
    if let Some(v) = next_poll_at {
        rec.next_poll_at = v;
    }
    if let Some(v) = expired_at {
        rec.expired_at = Some(v);
    }
    if let Some(v) = errors {
        rec.errors = Some(v);
    }
    if let Some(v) = new_retries {
        rec.new_retries = v;
    }
    if let Some(v) = update_retries {
        rec.update_retries = v;
    }
    if let Some(v) = request_metadata {
        rec.request_metadata = v;
    }
    if let Some(v) = processing_metadata {
        rec.processing_metadata = v;
    }
    rec.updated_at = Utc::now();
}

fn apply_transform_update(rec: &mut TransformRecord, update: TransformUpdate) {
    let TransformUpdate { status,
                          substatus,
                          oldstatus,
                          locking,
                          workload_id,
                          next_poll_at,
                          started_at,
                          finished_at,
                          errors,
                          new_retries,
                          update_retries,
                          transform_metadata,
                          running_metadata } = update;
    if let Some(v) = status {
        rec.oldstatus = Some(rec.status);
        rec.status = v;
    }
    if let Some(v) = substatus {
        rec.substatus = Some(v);
    }
    if let Some(v) = oldstatus {
        rec.oldstatus = Some(v);
    }
    if let Some(v) = locking {
        rec.locking = v;
    }
    if let Some(v) = workload_id {
        rec.workload_id = Some(v);
    }
    if let Some(v) = next_poll_at {
        rec.next_poll_at = v;
    }
    if let Some(v) = started_at {
        rec.started_at = Some(v);
    }
    if let Some(v) = finished_at {
        rec.finished_at = Some(v);
    }
    if let Some(v) = errors {
        rec.errors = Some(v);
    }
    if let Some(v) = new_retries {
        rec.new_retries = v;
    }
    if let Some(v) = update_retries {
        rec.update_retries = v;
    }
    if let Some(v) = transform_metadata {
        rec.transform_metadata = v;
    }
    if let Some(v) = running_metadata {
        rec.running_metadata = v;
    }
    rec.updated_at = Utc::now();
}

fn apply_processing_update(rec: &mut ProcessingRecord, update: ProcessingUpdate) {
    let ProcessingUpdate { status,
                           substatus,
                           oldstatus,
                           locking,
                           workload_id,
                           submitted_at,
                           finished_at,
                           expired_at,
                           next_poll_at,
                           errors,
                           new_retries,
                           update_retries,
                           processing_metadata,
                           running_metadata,
                           output_metadata } = update;
    if let Some(v) = status {
        rec.oldstatus = Some(rec.status);
        rec.status = v;
    }
    if let Some(v) = substatus {
        rec.substatus = Some(v);
    }
    if let Some(v) = oldstatus {
        rec.oldstatus = Some(v);
    }
    if let Some(v) = locking {
        rec.locking = v;
    }
    if let Some(v) = workload_id {
        rec.workload_id = Some(v);
    }
    if let Some(v) = submitted_at {
        rec.submitted_at = Some(v);
    }
    if let Some(v) = finished_at {
        rec.finished_at = Some(v);
    }
    if let Some(v) = expired_at {
        rec.expired_at = Some(v);
    }
    if let Some(v) = next_poll_at {
        rec.next_poll_at = v;
    }
    if let Some(v) = errors {
        rec.errors = Some(v);
    }
    if let Some(v) = new_retries {
        rec.new_retries = v;
    }
    if let Some(v) = update_retries {
        rec.update_retries = v;
    }
    if let Some(v) = processing_metadata {
        rec.processing_metadata = v;
    }
    if let Some(v) = running_metadata {
        rec.running_metadata = v;
    }
    if let Some(v) = output_metadata {
        rec.output_metadata = v;
    }
    rec.updated_at = Utc::now();
}

fn apply_collection_update(rec: &mut CollectionRecord, update: CollectionUpdate) {
    let CollectionUpdate { status,
                           substatus,
                           bytes,
                           total_files,
                           new_files,
                           processed_files,
                           processing_files,
                           failed_files,
                           missing_files,
                           ext_files,
                           processed_ext_files,
                           failed_ext_files,
                           missing_ext_files,
                           next_poll_at,
                           coll_metadata } = update;
    if let Some(v) = status {
        rec.status = v;
    }
    if let Some(v) = substatus {
        rec.substatus = Some(v);
    }
    if let Some(v) = bytes {
        rec.bytes = v;
    }
    if let Some(v) = total_files {
        rec.total_files = v;
    }
    if let Some(v) = new_files {
        rec.new_files = v;
    }
    if let Some(v) = processed_files {
        rec.processed_files = v;
    }
    if let Some(v) = processing_files {
        rec.processing_files = v;
    }
    if let Some(v) = failed_files {
        rec.failed_files = v;
    }
    if let Some(v) = missing_files {
        rec.missing_files = v;
    }
    if let Some(v) = ext_files {
        rec.ext_files = v;
    }
    if let Some(v) = processed_ext_files {
        rec.processed_ext_files = v;
    }
    if let Some(v) = failed_ext_files {
        rec.failed_ext_files = v;
    }
    if let Some(v) = missing_ext_files {
        rec.missing_ext_files = v;
    }
    if let Some(v) = next_poll_at {
        rec.next_poll_at = v;
    }
    if let Some(v) = coll_metadata {
        rec.coll_metadata = v;
    }
    rec.updated_at = Utc::now();
}

fn apply_content_update(rec: &mut ContentRecord, update: &ContentUpdate) {
    if let Some(v) = update.status {
        rec.status = v;
    }
    if let Some(v) = update.substatus {
        rec.substatus = v;
    }
    if let Some(v) = &update.path {
        rec.path = Some(v.clone());
    }
    if let Some(v) = &update.content_metadata {
        rec.content_metadata = v.clone();
    }
    rec.updated_at = Utc::now();
}

impl Mem {
    fn insert_transform(&mut self, mut new: NewTransform) -> i64 {
        let now = Utc::now();
        self.next_transform_id += 1;
        let transform_id = self.next_transform_id;
        let collections = std::mem::take(&mut new.collections);
        let rec = TransformRecord { transform_id,
                                    request_id: new.request_id,
                                    workload_id: new.workload_id,
                                    transform_type: new.transform_type,
                                    transform_tag: new.transform_tag,
                                    priority: new.priority,
                                    name: new.name,
                                    status: new.status,
                                    substatus: None,
                                    oldstatus: None,
                                    locking: Locking::Idle,
                                    retries: 0,
                                    created_at: now,
                                    updated_at: now,
                                    next_poll_at: now,
                                    started_at: None,
                                    finished_at: None,
                                    expired_at: new.expired_at,
                                    new_retries: 0,
                                    update_retries: 0,
                                    max_new_retries: new.max_new_retries,
                                    max_update_retries: new.max_update_retries,
                                    new_poll_period: new.new_poll_period,
                                    update_poll_period: new.update_poll_period,
                                    errors: None,
                                    transform_metadata: new.transform_metadata,
                                    running_metadata: new.running_metadata };
        self.transforms.insert(transform_id, rec);
        for mut coll in collections {
            coll.transform_id = transform_id;
            self.insert_collection(coll);
        }
        transform_id
    }

    fn insert_collection(&mut self, new: NewCollection) -> i64 {
        let now = Utc::now();
        self.next_coll_id += 1;
        let coll_id = self.next_coll_id;
        self.collections.insert(coll_id,
                                CollectionRecord { coll_id,
                                                   request_id: new.request_id,
                                                   transform_id: new.transform_id,
                                                   workload_id: new.workload_id,
                                                   coll_type: new.coll_type,
                                                   relation_type: new.relation_type,
                                                   scope: new.scope,
                                                   name: new.name,
                                                   bytes: 0,
                                                   status: new.status,
                                                   substatus: None,
                                                   locking: Locking::Idle,
                                                   total_files: new.total_files,
                                                   new_files: 0,
                                                   processed_files: 0,
                                                   processing_files: 0,
                                                   failed_files: 0,
                                                   missing_files: 0,
                                                   ext_files: 0,
                                                   processed_ext_files: 0,
                                                   failed_ext_files: 0,
                                                   missing_ext_files: 0,
                                                   retries: 0,
                                                   created_at: now,
                                                   updated_at: now,
                                                   next_poll_at: now,
                                                   expired_at: None,
                                                   coll_metadata: new.coll_metadata });
        coll_id
    }

    fn insert_processing(&mut self, new: NewProcessing) -> i64 {
        let now = Utc::now();
        self.next_processing_id += 1;
        let processing_id = self.next_processing_id;
        self.processings.insert(processing_id,
                                ProcessingRecord { processing_id,
                                                   transform_id: new.transform_id,
                                                   request_id: new.request_id,
                                                   workload_id: new.workload_id,
                                                   status: new.status,
                                                   substatus: None,
                                                   oldstatus: None,
                                                   locking: Locking::Idle,
                                                   submitter: new.submitter,
                                                   created_at: now,
                                                   updated_at: now,
                                                   next_poll_at: now,
                                                   submitted_at: None,
                                                   finished_at: None,
                                                   expired_at: new.expired_at,
                                                   new_retries: 0,
                                                   update_retries: 0,
                                                   max_new_retries: new.max_new_retries,
                                                   max_update_retries: new.max_update_retries,
                                                   new_poll_period: new.new_poll_period,
                                                   update_poll_period: new.update_poll_period,
                                                   errors: None,
                                                   processing_metadata: new.processing_metadata,
                                                   running_metadata: new.running_metadata,
                                                   output_metadata: Value::Null });
        processing_id
    }

    /// Alta idempotente: la colisión de la clave única devuelve el id
    /// existente y se trata como éxito.
    fn insert_content(&mut self, new: NewContent) -> i64 {
        let existing = self.contents
                           .values()
                           .find(|c| {
                               c.transform_id == new.transform_id
                               && c.coll_id == new.coll_id
                               && c.map_id == new.map_id
                               && c.name == new.name
                               && c.min_id == new.min_id
                               && c.max_id == new.max_id
                           })
                           .map(|c| c.content_id);
        if let Some(id) = existing {
            debug!("duplicated content insert tolerated: coll={} map={} name={}",
                   new.coll_id, new.map_id, new.name);
            return id;
        }
        let now = Utc::now();
        self.next_content_id += 1;
        let content_id = self.next_content_id;
        self.contents.insert(content_id,
                             ContentRecord { content_id,
                                             transform_id: new.transform_id,
                                             coll_id: new.coll_id,
                                             request_id: new.request_id,
                                             workload_id: new.workload_id,
                                             map_id: new.map_id,
                                             content_dep_id: new.content_dep_id,
                                             scope: new.scope,
                                             name: new.name,
                                             min_id: new.min_id,
                                             max_id: new.max_id,
                                             content_type: new.content_type,
                                             content_relation_type: new.content_relation_type,
                                             status: new.status,
                                             substatus: new.substatus,
                                             locking: Locking::Idle,
                                             bytes: new.bytes,
                                             md5: None,
                                             adler32: None,
                                             path: new.path,
                                             retries: 0,
                                             created_at: now,
                                             updated_at: now,
                                             expired_at: None,
                                             content_metadata: new.content_metadata });
        content_id
    }

    /// Aplica updates de contents y propaga substatus a los dependientes.
    /// Devuelve cuántas filas dependientes se tocaron.
    fn apply_content_updates(&mut self, updates: &[ContentUpdate]) -> usize {
        let mut flipped: Vec<(i64, ContentStatus)> = Vec::new();
        for update in updates {
            if let Some(rec) = self.contents.get_mut(&update.content_id) {
                let before = rec.substatus;
                apply_content_update(rec, update);
                if let Some(sub) = update.substatus {
                    if sub != before {
                        flipped.push((rec.content_id, sub));
                    }
                }
            }
        }
        let mut propagated = 0;
        let Mem { contents, contents_update_log, .. } = self;
        for (content_id, substatus) in flipped {
            contents_update_log.push((content_id, substatus));
            if !substatus.propagates() {
                continue;
            }
            for dep in contents.values_mut() {
                if dep.content_dep_id == Some(content_id) && dep.substatus != substatus {
                    dep.substatus = substatus;
                    dep.updated_at = Utc::now();
                    contents_update_log.push((dep.content_id, substatus));
                    propagated += 1;
                }
            }
        }
        propagated
    }
}

impl Catalog for MemoryCatalog {
    fn add_request(&self, request: NewRequest) -> Result<i64> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let now = Utc::now();
        mem.next_request_id += 1;
        let request_id = mem.next_request_id;
        mem.requests.insert(request_id,
                            RequestRecord { request_id,
                                            scope: request.scope,
                                            name: request.name,
                                            requester: request.requester,
                                            request_type: request.request_type,
                                            workload_id: request.workload_id,
                                            priority: request.priority,
                                            status: request.status,
                                            substatus: None,
                                            oldstatus: None,
                                            locking: Locking::Idle,
                                            created_at: now,
                                            updated_at: now,
                                            next_poll_at: now,
                                            expired_at: request.expired_at,
                                            new_retries: 0,
                                            update_retries: 0,
                                            max_new_retries: request.max_new_retries,
                                            max_update_retries: request.max_update_retries,
                                            new_poll_period: request.new_poll_period,
                                            update_poll_period: request.update_poll_period,
                                            errors: None,
                                            request_metadata: request.request_metadata,
                                            processing_metadata: request.processing_metadata });
        Ok(request_id)
    }

    fn get_request(&self, request_id: i64) -> Result<RequestRecord> {
        let mem = self.inner.lock().expect("catalog poisoned");
        mem.requests
           .get(&request_id)
           .cloned()
           .ok_or_else(|| IddsError::NotFound(format!("request {request_id}")))
    }

    fn get_requests_by_status(&self,
                              status: &[RequestStatus],
                              by_substatus: bool,
                              locking: bool,
                              bulk_size: usize)
                              -> Result<Vec<RequestRecord>> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let now = Utc::now();
        let mut ids: Vec<(i32, chrono::DateTime<Utc>, chrono::DateTime<Utc>, i64)> =
            mem.requests
               .values()
               .filter(|r| {
                   let matched = if by_substatus {
                       r.substatus.map(|s| status.contains(&s)).unwrap_or(false)
                   } else {
                       status.contains(&r.status)
                   };
                   matched && r.next_poll_at <= now && (!locking || r.locking == Locking::Idle)
               })
               .map(|r| (r.priority, r.next_poll_at, r.created_at, r.request_id))
               .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        ids.truncate(bulk_size);
        let mut out = Vec::with_capacity(ids.len());
        for (_, _, _, id) in ids {
            let rec = mem.requests.get_mut(&id).expect("request listed");
            if locking {
                rec.locking = Locking::Locking;
                rec.updated_at = now;
            }
            out.push(rec.clone());
        }
        Ok(out)
    }

    fn update_request(&self, request_id: i64, update: RequestUpdate) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let rec = mem.requests
                     .get_mut(&request_id)
                     .ok_or_else(|| IddsError::NotFound(format!("request {request_id}")))?;
        apply_request_update(rec, update);
        Ok(())
    }

    fn update_request_with_transforms(&self,
                                      request_id: i64,
                                      mut update: RequestUpdate,
                                      new_transforms: Vec<NewTransform>,
                                      update_transforms: Vec<(i64, TransformUpdate)>)
                                      -> Result<Vec<i64>> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        if !mem.requests.contains_key(&request_id) {
            return Err(IddsError::NotFound(format!("request {request_id}")));
        }
        let mut created = Vec::with_capacity(new_transforms.len());
        for new in new_transforms {
            let instance_id = new.instance_id.clone();
            let transform_id = mem.insert_transform(new);
            if let (Some(instance), Some(pm)) = (instance_id, update.processing_metadata.as_mut()) {
                RequestRecord::patch_work_id(pm, &instance, transform_id);
            }
            created.push(transform_id);
        }
        for (transform_id, tf_update) in update_transforms {
            if let Some(rec) = mem.transforms.get_mut(&transform_id) {
                apply_transform_update(rec, tf_update);
            }
        }
        let rec = mem.requests.get_mut(&request_id).expect("request checked");
        apply_request_update(rec, update);
        Ok(created)
    }

    fn clean_request_locking(&self, older_than: Duration) -> Result<usize> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut count = 0;
        for rec in mem.requests.values_mut() {
            if rec.locking == Locking::Locking && rec.updated_at < cutoff {
                rec.locking = Locking::Idle;
                count += 1;
            }
        }
        Ok(count)
    }

    fn delete_request_cascade(&self, request_id: i64) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        mem.requests.remove(&request_id);
        let tf_ids: Vec<i64> = mem.transforms
                                  .values()
                                  .filter(|t| t.request_id == request_id)
                                  .map(|t| t.transform_id)
                                  .collect();
        mem.transforms.retain(|_, t| t.request_id != request_id);
        mem.collections.retain(|_, c| !tf_ids.contains(&c.transform_id));
        mem.contents.retain(|_, c| c.request_id != request_id);
        mem.contents_ext.retain(|_, c| c.request_id != request_id);
        mem.processings.retain(|_, p| p.request_id != request_id);
        mem.messages.retain(|_, m| m.request_id != Some(request_id));
        mem.commands.retain(|_, c| c.request_id != Some(request_id));
        Ok(())
    }

    fn get_transform(&self, transform_id: i64) -> Result<TransformRecord> {
        let mem = self.inner.lock().expect("catalog poisoned");
        mem.transforms
           .get(&transform_id)
           .cloned()
           .ok_or_else(|| IddsError::NotFound(format!("transform {transform_id}")))
    }

    fn get_transforms_by_request(&self, request_id: i64) -> Result<Vec<TransformRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.transforms
              .values()
              .filter(|t| t.request_id == request_id)
              .cloned()
              .collect())
    }

    fn get_transforms_by_status(&self,
                                status: &[TransformStatus],
                                locking: bool,
                                bulk_size: usize)
                                -> Result<Vec<TransformRecord>> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let now = Utc::now();
        let mut ids: Vec<(i32, chrono::DateTime<Utc>, chrono::DateTime<Utc>, i64)> =
            mem.transforms
               .values()
               .filter(|t| {
                   status.contains(&t.status) && t.next_poll_at <= now && (!locking || t.locking == Locking::Idle)
               })
               .map(|t| (t.priority, t.next_poll_at, t.created_at, t.transform_id))
               .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        ids.truncate(bulk_size);
        let mut out = Vec::with_capacity(ids.len());
        for (_, _, _, id) in ids {
            let rec = mem.transforms.get_mut(&id).expect("transform listed");
            if locking {
                rec.locking = Locking::Locking;
                rec.updated_at = now;
            }
            out.push(rec.clone());
        }
        Ok(out)
    }

    fn update_transform(&self, transform_id: i64, update: TransformUpdate) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let rec = mem.transforms
                     .get_mut(&transform_id)
                     .ok_or_else(|| IddsError::NotFound(format!("transform {transform_id}")))?;
        apply_transform_update(rec, update);
        Ok(())
    }

    fn add_transform_outputs(&self,
                             transform_id: i64,
                             update: TransformUpdate,
                             outputs: TransformOutputs)
                             -> Result<Option<i64>> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        if !mem.transforms.contains_key(&transform_id) {
            return Err(IddsError::NotFound(format!("transform {transform_id}")));
        }
        for content in outputs.new_contents {
            mem.insert_content(content);
        }
        let now = Utc::now();
        for content_id in outputs.mapped_input_ids {
            if let Some(rec) = mem.contents.get_mut(&content_id) {
                rec.status = ContentStatus::Mapped;
                rec.updated_at = now;
            }
        }
        for (coll_id, coll_update) in outputs.update_collections {
            if let Some(rec) = mem.collections.get_mut(&coll_id) {
                apply_collection_update(rec, coll_update);
            }
        }
        mem.apply_content_updates(&outputs.update_contents);
        let mut created = None;
        if let Some(new_processing) = outputs.new_processing {
            // invariante: a lo sumo un processing activo por transform
            let active = mem.processings
                            .values()
                            .find(|p| p.transform_id == transform_id && !p.status.is_terminal())
                            .map(|p| p.processing_id);
            created = Some(match active {
                               Some(id) => id,
                               None => mem.insert_processing(new_processing),
                           });
        }
        for message in outputs.messages {
            insert_message(&mut mem, message);
        }
        let rec = mem.transforms.get_mut(&transform_id).expect("transform checked");
        apply_transform_update(rec, update);
        Ok(created)
    }

    fn clean_transform_locking(&self, older_than: Duration) -> Result<usize> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut count = 0;
        for rec in mem.transforms.values_mut() {
            if rec.locking == Locking::Locking && rec.updated_at < cutoff {
                rec.locking = Locking::Idle;
                count += 1;
            }
        }
        Ok(count)
    }

    fn get_processing(&self, processing_id: i64) -> Result<ProcessingRecord> {
        let mem = self.inner.lock().expect("catalog poisoned");
        mem.processings
           .get(&processing_id)
           .cloned()
           .ok_or_else(|| IddsError::NotFound(format!("processing {processing_id}")))
    }

    fn get_active_processing_by_transform(&self, transform_id: i64) -> Result<Option<ProcessingRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.processings
              .values()
              .find(|p| p.transform_id == transform_id && !p.status.is_terminal())
              .cloned())
    }

    fn get_processings_by_transform(&self, transform_id: i64) -> Result<Vec<ProcessingRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.processings
              .values()
              .filter(|p| p.transform_id == transform_id)
              .cloned()
              .collect())
    }

    fn get_processings_by_status(&self,
                                 status: &[ProcessingStatus],
                                 locking: bool,
                                 bulk_size: usize)
                                 -> Result<Vec<ProcessingRecord>> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let now = Utc::now();
        let mut ids: Vec<(chrono::DateTime<Utc>, chrono::DateTime<Utc>, i64)> =
            mem.processings
               .values()
               .filter(|p| {
                   status.contains(&p.status) && p.next_poll_at <= now && (!locking || p.locking == Locking::Idle)
               })
               .map(|p| (p.next_poll_at, p.created_at, p.processing_id))
               .collect();
        ids.sort();
        ids.truncate(bulk_size);
        let mut out = Vec::with_capacity(ids.len());
        for (_, _, id) in ids {
            let rec = mem.processings.get_mut(&id).expect("processing listed");
            if locking {
                rec.locking = Locking::Locking;
                rec.updated_at = now;
            }
            out.push(rec.clone());
        }
        Ok(out)
    }

    fn update_processing(&self, processing_id: i64, update: ProcessingUpdate) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let rec = mem.processings
                     .get_mut(&processing_id)
                     .ok_or_else(|| IddsError::NotFound(format!("processing {processing_id}")))?;
        apply_processing_update(rec, update);
        Ok(())
    }

    fn update_processing_with_contents(&self,
                                       processing_id: i64,
                                       update: ProcessingUpdate,
                                       content_updates: Vec<ContentUpdate>,
                                       messages: Vec<NewMessage>)
                                       -> Result<usize> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        if !mem.processings.contains_key(&processing_id) {
            return Err(IddsError::NotFound(format!("processing {processing_id}")));
        }
        let propagated = mem.apply_content_updates(&content_updates);
        for message in messages {
            insert_message(&mut mem, message);
        }
        let rec = mem.processings.get_mut(&processing_id).expect("processing checked");
        apply_processing_update(rec, update);
        Ok(propagated)
    }

    fn clean_processing_locking(&self, older_than: Duration) -> Result<usize> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut count = 0;
        for rec in mem.processings.values_mut() {
            if rec.locking == Locking::Locking && rec.updated_at < cutoff {
                rec.locking = Locking::Idle;
                count += 1;
            }
        }
        Ok(count)
    }

    fn get_collection(&self, coll_id: i64) -> Result<CollectionRecord> {
        let mem = self.inner.lock().expect("catalog poisoned");
        mem.collections
           .get(&coll_id)
           .cloned()
           .ok_or_else(|| IddsError::NotFound(format!("collection {coll_id}")))
    }

    fn get_collections_by_transform(&self, transform_id: i64) -> Result<Vec<CollectionRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.collections
              .values()
              .filter(|c| c.transform_id == transform_id)
              .cloned()
              .collect())
    }

    fn update_collection(&self, coll_id: i64, update: CollectionUpdate) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let rec = mem.collections
                     .get_mut(&coll_id)
                     .ok_or_else(|| IddsError::NotFound(format!("collection {coll_id}")))?;
        apply_collection_update(rec, update);
        Ok(())
    }

    fn add_contents(&self, contents: Vec<NewContent>) -> Result<usize> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let before = mem.contents.len();
        for content in contents {
            mem.insert_content(content);
        }
        Ok(mem.contents.len() - before)
    }

    fn get_contents_by_transform(&self, transform_id: i64) -> Result<Vec<ContentRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.contents
              .values()
              .filter(|c| c.transform_id == transform_id)
              .cloned()
              .collect())
    }

    fn get_contents_by_coll(&self, coll_id: i64) -> Result<Vec<ContentRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.contents.values().filter(|c| c.coll_id == coll_id).cloned().collect())
    }

    fn get_content_by_coll_name(&self,
                                coll_id: i64,
                                name: &str,
                                relation_type: ContentRelationType)
                                -> Result<Option<ContentRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.contents
              .values()
              .find(|c| c.coll_id == coll_id && c.name == name && c.content_relation_type == relation_type)
              .cloned())
    }

    fn update_contents(&self, updates: Vec<ContentUpdate>) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        mem.apply_content_updates(&updates);
        Ok(())
    }

    fn add_contents_ext(&self, items: Vec<ContentExtRecord>) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        for item in items {
            mem.contents_ext.insert(item.content_id, item);
        }
        Ok(())
    }

    fn get_contents_ext_by_transform(&self, transform_id: i64) -> Result<Vec<ContentExtRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.contents_ext
              .values()
              .filter(|c| c.transform_id == transform_id)
              .cloned()
              .collect())
    }

    fn add_message(&self, message: NewMessage) -> Result<i64> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        Ok(insert_message(&mut mem, message))
    }

    fn retrieve_messages(&self, filter: MessageFilter) -> Result<Vec<MessageRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        let mut out: Vec<MessageRecord> =
            mem.messages
               .values()
               .filter(|m| {
                   filter.msg_type.map(|t| m.msg_type == t).unwrap_or(true)
                   && filter.status.map(|s| m.status == s).unwrap_or(true)
                   && filter.request_id.map(|id| m.request_id == Some(id)).unwrap_or(true)
                   && filter.transform_id.map(|id| m.transform_id == Some(id)).unwrap_or(true)
                   && filter.processing_id.map(|id| m.processing_id == Some(id)).unwrap_or(true)
               })
               .cloned()
               .collect();
        out.sort_by_key(|m| m.msg_id);
        if let Some(bulk) = filter.bulk_size {
            out.truncate(bulk);
        }
        Ok(out)
    }

    fn update_messages_status(&self, msg_ids: &[i64], status: MessageStatus) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        for id in msg_ids {
            if let Some(rec) = mem.messages.get_mut(id) {
                rec.status = status;
                rec.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    fn add_health_item(&self, item: HealthItem) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let now = Utc::now();
        if let Some(rec) = mem.health.iter_mut().find(|h| {
                                                    h.agent == item.agent
                                                    && h.hostname == item.hostname
                                                    && h.pid == item.pid
                                                    && h.thread_id == item.thread_id
                                                }) {
            rec.payload = item.payload;
            rec.thread_name = item.thread_name;
            rec.updated_at = now;
            return Ok(());
        }
        mem.next_health_id += 1;
        let health_id = mem.next_health_id;
        mem.health.push(HealthRecord { health_id,
                                       agent: item.agent,
                                       hostname: item.hostname,
                                       pid: item.pid,
                                       thread_id: item.thread_id,
                                       thread_name: item.thread_name,
                                       payload: item.payload,
                                       created_at: now,
                                       updated_at: now });
        Ok(())
    }

    fn get_health_items(&self) -> Result<Vec<HealthRecord>> {
        let mem = self.inner.lock().expect("catalog poisoned");
        Ok(mem.health.clone())
    }

    fn clean_health(&self, older_than: Option<Duration>, hostname: Option<&str>, pids: &[i32]) -> Result<usize> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let before = mem.health.len();
        let cutoff = older_than.map(|d| Utc::now() - chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero()));
        mem.health.retain(|h| {
                      if let Some(cutoff) = cutoff {
                          if h.updated_at < cutoff {
                              return false;
                          }
                      }
                      if let Some(host) = hostname {
                          if h.hostname == host && pids.contains(&h.pid) {
                              return false;
                          }
                      }
                      true
                  });
        Ok(before - mem.health.len())
    }

    fn add_command(&self, command: NewCommand) -> Result<i64> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let now = Utc::now();
        mem.next_cmd_id += 1;
        let cmd_id = mem.next_cmd_id;
        mem.commands.insert(cmd_id,
                            CommandRecord { cmd_id,
                                            request_id: command.request_id,
                                            workload_id: command.workload_id,
                                            transform_id: command.transform_id,
                                            processing_id: command.processing_id,
                                            cmd_type: command.cmd_type,
                                            status: command.status,
                                            locking: Locking::Idle,
                                            username: command.username,
                                            retries: 0,
                                            source: command.source,
                                            destination: command.destination,
                                            created_at: now,
                                            updated_at: now,
                                            cmd_content: command.cmd_content,
                                            errors: None });
        Ok(cmd_id)
    }

    fn get_commands_by_status(&self,
                              status: CommandStatus,
                              locking: bool,
                              bulk_size: usize)
                              -> Result<Vec<CommandRecord>> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let now = Utc::now();
        let mut ids: Vec<i64> = mem.commands
                                   .values()
                                   .filter(|c| c.status == status && (!locking || c.locking == Locking::Idle))
                                   .map(|c| c.cmd_id)
                                   .collect();
        ids.sort();
        ids.truncate(bulk_size);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let rec = mem.commands.get_mut(&id).expect("command listed");
            if locking {
                rec.locking = Locking::Locking;
                rec.updated_at = now;
            }
            out.push(rec.clone());
        }
        Ok(out)
    }

    fn update_command(&self, cmd_id: i64, update: CommandUpdate) -> Result<()> {
        let mut mem = self.inner.lock().expect("catalog poisoned");
        let rec = mem.commands
                     .get_mut(&cmd_id)
                     .ok_or_else(|| IddsError::NotFound(format!("command {cmd_id}")))?;
        if let Some(v) = update.status {
            rec.status = v;
        }
        if let Some(v) = update.locking {
            rec.locking = v;
        }
        if let Some(v) = update.errors {
            rec.errors = Some(v);
        }
        rec.updated_at = Utc::now();
        Ok(())
    }
}

fn insert_message(mem: &mut Mem, message: NewMessage) -> i64 {
    let now = Utc::now();
    mem.next_msg_id += 1;
    let msg_id = mem.next_msg_id;
    mem.messages.insert(msg_id,
                        MessageRecord { msg_id,
                                        msg_type: message.msg_type,
                                        status: message.status,
                                        locking: Locking::Idle,
                                        source: message.source,
                                        destination: message.destination,
                                        request_id: message.request_id,
                                        workload_id: message.workload_id,
                                        transform_id: message.transform_id,
                                        processing_id: message.processing_id,
                                        num_contents: message.num_contents,
                                        retries: 0,
                                        created_at: now,
                                        updated_at: now,
                                        msg_content: message.msg_content });
    msg_id
}
