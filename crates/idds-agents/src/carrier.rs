//! Carrier: ciclo de vida de los Processings contra el workload manager.
//!
//! Orden del ciclo:
//! 1. operaciones pendientes primero (tocancel/tosuspend/toresume/toexpire/
//!    tofinish/toforcefinish): kill/kill forzado/reactivate del driver,
//!    luego se limpia la bandera y se resetean los reintentos de poll;
//! 2. sin workload_id externo: someter vía driver, registrar id y
//!    submitted_at; si la sumisión falla la fila queda como está y se
//!    reintenta con backoff;
//! 3. poll del estado externo y mapeo canónico a estado de Processing;
//! 4. terminal con reintentos restantes sobre SubFinished: reactivate,
//!    retry_number += 1, vuelta a Submitted, sin mensaje terminal;
//! 5. reconciliación por job en lotes de 2000 ids, indexando cada job por
//!    el nombre del input que lo originó; un PandaID que cambió entre
//!    reintentos conserva su historia en content_metadata.
//!
//! Regla de flush: con la task externa terminal pero contents recién
//! actualizados o menos de 3 polls extra, el Processing sigue Running un
//! ciclo más para no perder actualizaciones tardías.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use serde_json::json;

use idds_common::error::Result;
use idds_common::{utils, ContentStatus, IddsError, Locking, MessageDestination, MessageSource, MessageStatus,
                  MessageType, ProcessingStatus, ReturnCode};
use idds_core::catalog::{Catalog, ContentUpdate, NewMessage, ProcessingUpdate};
use idds_core::event::EventType;
use idds_core::externals::JobInfo;
use idds_core::models::{ContentExtRecord, ContentRecord, ProcessingData, ProcessingRecord};

use crate::context::AgentContext;
use crate::runtime::AgentRuntime;
use crate::transformer::group_maps;

/// Lote de consulta de estado de jobs externos.
const JOB_STATUS_CHUNK: usize = 2000;
/// Polls extra tras un estado externo terminal antes de cerrar.
const TERMINAL_FLUSH_POLLS: u32 = 3;

/// Mapeo canónico estado externo → estado de Processing.
pub fn processing_status_from_task_status(task_status: &str) -> ProcessingStatus {
    match task_status {
        "registered" | "defined" | "assigning" => ProcessingStatus::Submitting,
        "ready" | "pending" | "scouting" | "scouted" | "prepared" | "topreprocess" | "preprocessing" => {
            ProcessingStatus::Submitted
        }
        "running" | "toretry" | "toincexec" | "throttled" => ProcessingStatus::Running,
        "done" => ProcessingStatus::Finished,
        "finished" | "paused" => ProcessingStatus::SubFinished,
        "failed" | "aborted" | "broken" | "exhausted" => ProcessingStatus::Failed,
        _ => ProcessingStatus::Submitted,
    }
}

/// Estado de Content derivado del estado del job externo.
pub fn content_status_from_job_status(job_status: &str) -> ContentStatus {
    match job_status {
        "finished" => ContentStatus::Available,
        "failed" => ContentStatus::Failed,
        _ => ContentStatus::Processing,
    }
}

pub struct Carrier<C: Catalog> {
    ctx: Arc<AgentContext<C>>,
}

impl<C: Catalog> Carrier<C> {
    pub fn new(ctx: Arc<AgentContext<C>>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn build_runtime(self: &Arc<Self>) -> AgentRuntime<C> {
        let mut runtime = AgentRuntime::new("Carrier", self.ctx.clone());
        let poll = Duration::from_secs(self.ctx.config.poll_time_period);

        let carrier = self.clone();
        runtime.add_timer("pull_new_processings", poll, move || {
                   let carrier = carrier.clone();
                   async move {
                       if let Err(e) = carrier.pull_new_processings().await {
                           warn!("Carrier: pull_new_processings: {e}");
                       }
                   }
               });
        let carrier = self.clone();
        runtime.add_timer("pull_running_processings", poll, move || {
                   let carrier = carrier.clone();
                   async move {
                       if let Err(e) = carrier.pull_running_processings().await {
                           warn!("Carrier: pull_running_processings: {e}");
                       }
                   }
               });
        let carrier = self.clone();
        let older_than = self.ctx.config.clean_locks_older_than;
        runtime.add_timer("clean_locks", Duration::from_secs(1800), move || {
                   let carrier = carrier.clone();
                   async move { carrier.clean_locks(older_than).await }
               });

        let carrier = self.clone();
        runtime.on_event(EventType::NewProcessing, move |id| {
                   let carrier = carrier.clone();
                   async move { carrier.handle_new_processing(id).await }
               });
        let carrier = self.clone();
        runtime.on_event(EventType::UpdateProcessing, move |id| {
                   let carrier = carrier.clone();
                   async move { carrier.handle_update_processing(id).await }
               });
        runtime
    }

    pub async fn pull_new_processings(&self) -> Result<usize> {
        let bulk = self.ctx.config.retrieve_bulk_size;
        let ps = self.ctx
                     .db(move |cat| cat.get_processings_by_status(&[ProcessingStatus::New], true, bulk))
                     .await?;
        if !ps.is_empty() {
            info!("Carrier: {} new processings to submit", ps.len());
        }
        for p in &ps {
            self.ctx.publish(EventType::NewProcessing, p.processing_id);
        }
        Ok(ps.len())
    }

    pub async fn pull_running_processings(&self) -> Result<usize> {
        let bulk = self.ctx.config.retrieve_bulk_size;
        let ps = self.ctx
                     .db(move |cat| {
                         cat.get_processings_by_status(&[ProcessingStatus::Submitting,
                                                         ProcessingStatus::Submitted,
                                                         ProcessingStatus::Running,
                                                         ProcessingStatus::Resuming],
                                                       true,
                                                       bulk)
                     })
                     .await?;
        for p in &ps {
            self.ctx.publish(EventType::UpdateProcessing, p.processing_id);
        }
        Ok(ps.len())
    }

    pub async fn clean_locks(&self, older_than: Duration) {
        match self.ctx.db(move |cat| cat.clean_processing_locking(older_than)).await {
            Ok(n) if n > 0 => info!("Carrier: released {n} stale processing locks"),
            Ok(_) => {}
            Err(e) => warn!("Carrier: clean_locks: {e}"),
        }
    }

    pub async fn handle_new_processing(&self, processing_id: i64) -> ReturnCode {
        match self.submit_processing(processing_id).await {
            Ok(()) => ReturnCode::Ok,
            Err(IddsError::LockConflict(_)) => ReturnCode::Locked,
            Err(IddsError::NotFound(_)) => ReturnCode::Ok,
            Err(e) => {
                self.fail_processing(processing_id, &e).await;
                ReturnCode::Failed
            }
        }
    }

    pub async fn handle_update_processing(&self, processing_id: i64) -> ReturnCode {
        match self.poll_processing(processing_id).await {
            Ok(()) => ReturnCode::Ok,
            Err(IddsError::LockConflict(_)) => ReturnCode::Locked,
            Err(IddsError::NotFound(_)) => ReturnCode::Ok,
            Err(e) => {
                self.fail_processing(processing_id, &e).await;
                ReturnCode::Failed
            }
        }
    }

    async fn fail_processing(&self, processing_id: i64, err: &IddsError) {
        error!("Carrier: processing {processing_id} failed: {err}");
        let msg = err.to_string();
        let res = self.ctx
                      .db(move |cat| {
                          cat.update_processing(processing_id,
                                                ProcessingUpdate { status: Some(ProcessingStatus::Failed),
                                                                   locking: Some(Locking::Idle),
                                                                   errors: Some(msg),
                                                                   finished_at: Some(Utc::now()),
                                                                   ..Default::default() })
                      })
                      .await;
        if let Err(e) = res {
            error!("Carrier: could not record failure on processing {processing_id}: {e}");
        }
    }

    // ------------------------------------------------------------------
    // sumisión
    // ------------------------------------------------------------------

    async fn submit_processing(&self, processing_id: i64) -> Result<()> {
        let p = self.ctx.db(move |cat| cat.get_processing(processing_id)).await?;
        if p.status != ProcessingStatus::New {
            self.unlock_processing(processing_id).await;
            return Ok(());
        }
        let spec = p.spec()?;
        match self.ctx.with_deadline(self.ctx.driver.submit_task(&spec.task_param)).await {
            Ok(workload_id) => {
                info!("Carrier: processing {processing_id} submitted as workload {workload_id}");
                let mut data = p.data();
                data.workload_id = Some(workload_id);
                let running_metadata = ProcessingRecord::running_snapshot(&p.running_metadata, &data)?;
                self.ctx
                    .db(move |cat| {
                        cat.update_processing(processing_id,
                                              ProcessingUpdate { status: Some(ProcessingStatus::Submitting),
                                                                 locking: Some(Locking::Idle),
                                                                 workload_id: Some(workload_id),
                                                                 submitted_at: Some(Utc::now()),
                                                                 running_metadata: Some(running_metadata),
                                                                 next_poll_at: Some(Utc::now()),
                                                                 ..Default::default() })
                    })
                    .await?;
                self.ctx.publish(EventType::UpdateProcessing, processing_id);
                Ok(())
            }
            Err(e) => {
                // la sumisión fallida queda en New y reintenta con backoff
                let retries = p.new_retries + 1;
                warn!("Carrier: submit of processing {processing_id} failed (attempt {retries}): {e}");
                if p.max_new_retries > 0 && retries >= p.max_new_retries {
                    return Err(IddsError::DriverFailure(format!("submission retries exhausted: {e}")));
                }
                let backoff = ChronoDuration::seconds((p.new_poll_period.as_secs().max(1) * retries as u64)
                                                      as i64);
                self.ctx
                    .db(move |cat| {
                        cat.update_processing(processing_id,
                                              ProcessingUpdate { locking: Some(Locking::Idle),
                                                                 new_retries: Some(retries),
                                                                 next_poll_at: Some(Utc::now() + backoff),
                                                                 ..Default::default() })
                    })
                    .await?;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // operaciones y expiración
    // ------------------------------------------------------------------

    /// Devuelve true si una operación pendiente dejó el processing en
    /// estado terminal (el ciclo corta ahí).
    async fn handle_operations(&self, p: &ProcessingRecord) -> Result<bool> {
        let Some(substatus) = p.substatus else { return Ok(false) };
        let Some(workload_id) = p.workload_id else { return Ok(false) };
        let processing_id = p.processing_id;
        let terminal = match substatus {
            ProcessingStatus::ToCancel => {
                info!("Carrier: cancelling processing {processing_id} (workload {workload_id})");
                self.ctx.with_deadline(self.ctx.driver.kill_task(workload_id)).await?;
                Some(ProcessingStatus::Cancelled)
            }
            ProcessingStatus::ToSuspend => {
                info!("Carrier: suspending processing {processing_id} (workload {workload_id})");
                self.ctx.with_deadline(self.ctx.driver.kill_task(workload_id)).await?;
                Some(ProcessingStatus::Suspended)
            }
            ProcessingStatus::ToExpire => {
                info!("Carrier: expiring processing {processing_id} (workload {workload_id})");
                self.ctx.with_deadline(self.ctx.driver.finish_task(workload_id, true)).await?;
                Some(ProcessingStatus::Expired)
            }
            ProcessingStatus::ToResume => {
                info!("Carrier: resuming processing {processing_id} (workload {workload_id})");
                self.ctx.with_deadline(self.ctx.driver.retry_task(workload_id)).await?;
                let mut data = p.data();
                data.polling_retries = 0;
                let running_metadata = ProcessingRecord::running_snapshot(&p.running_metadata, &data)?;
                self.ctx
                    .db(move |cat| {
                        cat.update_processing(processing_id,
                                              ProcessingUpdate { status: Some(ProcessingStatus::Submitted),
                                                                 substatus:
                                                                     Some(ProcessingStatus::Submitted),
                                                                 locking: Some(Locking::Idle),
                                                                 running_metadata: Some(running_metadata),
                                                                 next_poll_at: Some(Utc::now()),
                                                                 ..Default::default() })
                    })
                    .await?;
                return Ok(true);
            }
            ProcessingStatus::ToFinish => {
                info!("Carrier: finishing processing {processing_id} softly (workload {workload_id})");
                self.ctx.with_deadline(self.ctx.driver.finish_task(workload_id, true)).await?;
                None
            }
            ProcessingStatus::ToForceFinish => {
                info!("Carrier: force finishing processing {processing_id} (workload {workload_id})");
                self.ctx.with_deadline(self.ctx.driver.finish_task(workload_id, false)).await?;
                None
            }
            _ => return Ok(false),
        };
        match terminal {
            Some(status) => {
                self.finalize(p, status, vec![], 0).await?;
                Ok(true)
            }
            None => {
                // bandera consumida; el poll decide el estado final
                self.ctx
                    .db(move |cat| {
                        cat.update_processing(processing_id,
                                              ProcessingUpdate { substatus: Some(ProcessingStatus::Running),
                                                                 next_poll_at: Some(Utc::now()),
                                                                 ..Default::default() })
                    })
                    .await?;
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------
    // poll + reconciliación
    // ------------------------------------------------------------------

    async fn poll_processing(&self, processing_id: i64) -> Result<()> {
        let p = self.ctx.db(move |cat| cat.get_processing(processing_id)).await?;
        if p.status.is_terminal() {
            self.unlock_processing(processing_id).await;
            return Ok(());
        }

        // 1. operaciones pendientes primero
        if self.handle_operations(&p).await? {
            return Ok(());
        }

        // 2. expiración por reloj de pared
        if p.is_expired(Utc::now()) {
            if let Some(workload_id) = p.workload_id {
                warn!("Carrier: processing {processing_id} expired, soft killing workload {workload_id}");
                self.ctx.with_deadline(self.ctx.driver.finish_task(workload_id, true)).await?;
            }
            self.finalize(&p, ProcessingStatus::Expired, vec![], 0).await?;
            return Ok(());
        }

        let spec = p.spec()?;
        let mut data = p.data();

        // 3. workload id: de la fila, o redescubierto por nombre de task
        let workload_id = match p.workload_id.or(data.workload_id) {
            Some(id) => id,
            None => match self.rediscover_workload_id(&spec.task_name, &spec.task_type).await? {
                Some(id) => {
                    info!("Carrier: processing {processing_id} rediscovered workload {id} by task name");
                    data.workload_id = Some(id);
                    id
                }
                None => {
                    self.backoff_poll(&p).await?;
                    return Ok(());
                }
            },
        };

        // 4. poll externo con deadline; si falla la fila queda intacta
        let details = match self.ctx
                                .with_deadline(self.ctx.driver.get_task_details(workload_id))
                                .await
        {
            Ok(details) => details,
            Err(e) => {
                warn!("Carrier: poll of workload {workload_id} failed: {e}");
                self.backoff_poll(&p).await?;
                return Ok(());
            }
        };
        let mut status = processing_status_from_task_status(&details.status);
        debug!("Carrier: processing {processing_id} external={} mapped={status:?}", details.status);

        // 5. reintento sobre SubFinished
        if status == ProcessingStatus::SubFinished && data.retry_number < spec.num_retries {
            info!("Carrier: reactivating workload {workload_id} (retry {} of {})",
                  data.retry_number + 1,
                  spec.num_retries);
            self.ctx.with_deadline(self.ctx.driver.retry_task(workload_id)).await?;
            data.retry_number += 1;
            data.polling_retries = 0;
            let running_metadata = ProcessingRecord::running_snapshot(&p.running_metadata, &data)?;
            self.ctx
                .db(move |cat| {
                    cat.update_processing(processing_id,
                                          ProcessingUpdate { status: Some(ProcessingStatus::Submitted),
                                                             locking: Some(Locking::Idle),
                                                             workload_id: Some(workload_id),
                                                             running_metadata: Some(running_metadata),
                                                             next_poll_at: Some(Utc::now()),
                                                             ..Default::default() })
                })
                .await?;
            return Ok(());
        }

        // 6. reconciliación por job
        let transform_id = p.transform_id;
        let contents = self.ctx
                           .db(move |cat| cat.get_contents_by_transform(transform_id))
                           .await?;
        let (content_updates, ext_rows) = self.reconcile_jobs(&p, &details.job_ids, &contents).await?;

        // 7. regla de flush terminal
        if status.is_terminal() && (!content_updates.is_empty() || data.polling_retries < TERMINAL_FLUSH_POLLS) {
            data.polling_retries += 1;
            status = ProcessingStatus::Running;
        } else if !status.is_terminal() {
            data.polling_retries = 0;
        }
        data.workload_id = Some(workload_id);

        if !ext_rows.is_empty() {
            self.ctx.db(move |cat| cat.add_contents_ext(ext_rows)).await?;
        }

        if status.is_terminal() {
            self.finalize_with_data(&p, status, content_updates, data).await?;
        } else {
            let touched = !content_updates.is_empty();
            let running_metadata = ProcessingRecord::running_snapshot(&p.running_metadata, &data)?;
            let update_poll = p.update_poll_period;
            let update = ProcessingUpdate { status: Some(status),
                                            locking: Some(Locking::Idle),
                                            workload_id: Some(workload_id),
                                            running_metadata: Some(running_metadata),
                                            next_poll_at:
                                                Some(Utc::now()
                                                     + ChronoDuration::seconds(update_poll.as_secs() as i64)),
                                            ..Default::default() };
            self.ctx
                .db(move |cat| cat.update_processing_with_contents(processing_id, update, content_updates, vec![]))
                .await?;
            if touched {
                self.ctx.publish(EventType::UpdateTransform, transform_id);
            }
        }
        Ok(())
    }

    /// Reconstruye el workload id perdido barriendo las tasks recientes por
    /// nombre. La unicidad del nombre de task es precondición validada en
    /// la sumisión.
    async fn rediscover_workload_id(&self, task_name: &str, task_type: &str) -> Result<Option<i64>> {
        let start = Utc::now() - ChronoDuration::hours(10);
        let handles = self.ctx
                          .with_deadline(self.ctx.driver.get_job_ids_in_time_range(start, task_type))
                          .await?;
        Ok(handles.values()
                  .find(|h| h.task_name == task_name)
                  .map(|h| h.workload_id))
    }

    /// Mapea cada job externo a los outputs de su mapa vía el índice por
    /// nombre de input, en lotes de `JOB_STATUS_CHUNK` ids.
    async fn reconcile_jobs(&self,
                            p: &ProcessingRecord,
                            job_ids: &[i64],
                            contents: &[ContentRecord])
                            -> Result<(Vec<ContentUpdate>, Vec<ContentExtRecord>)> {
        let mut updates = Vec::new();
        let mut ext_rows = Vec::new();
        if job_ids.is_empty() {
            return Ok((updates, ext_rows));
        }
        let registered = group_maps(contents);
        // índice: nombre del primer input del mapa → map_id
        let mut input_index: HashMap<&str, i64> = HashMap::new();
        for (map_id, map) in &registered {
            for input in &map.inputs {
                input_index.insert(input.name.as_str(), *map_id);
            }
        }
        for chunk in utils::chunked(job_ids, JOB_STATUS_CHUNK) {
            let jobs: Vec<JobInfo> = self.ctx
                                         .with_deadline(self.ctx.driver.get_job_status(&chunk))
                                         .await?;
            for job in jobs {
                let Some(first_file) = job.files.first() else { continue };
                // el lfn puede venir con scope por delante ("scope:name")
                let input_name = first_file.rsplit(':').next().unwrap_or(first_file.as_str());
                let Some(&map_id) = input_index.get(input_name) else {
                    debug!("Carrier: job {} has unknown input {input_name}", job.job_id);
                    continue;
                };
                let map = registered.get(&map_id).expect("map indexed");
                let new_substatus = content_status_from_job_status(&job.job_status);
                for output in &map.outputs {
                    let mut metadata = output.content_metadata.clone();
                    let id_changed = output.external_job_id() != Some(job.job_id);
                    if id_changed {
                        ContentRecord::record_external_job_id(&mut metadata, job.job_id);
                    }
                    if output.substatus != new_substatus || id_changed {
                        updates.push(ContentUpdate { content_id: output.content_id,
                                                     substatus: Some(new_substatus),
                                                     content_metadata: Some(metadata),
                                                     ..Default::default() });
                        ext_rows.push(ContentExtRecord { content_id: output.content_id,
                                                         transform_id: output.transform_id,
                                                         coll_id: output.coll_id,
                                                         request_id: output.request_id,
                                                         workload_id: p.workload_id,
                                                         map_id,
                                                         status: Some(new_substatus),
                                                         panda_id: Some(job.job_id),
                                                         job_status: Some(job.job_status.clone()),
                                                         ..Default::default() });
                    }
                }
            }
        }
        Ok((updates, ext_rows))
    }

    // ------------------------------------------------------------------
    // cierre
    // ------------------------------------------------------------------

    async fn finalize(&self,
                      p: &ProcessingRecord,
                      status: ProcessingStatus,
                      content_updates: Vec<ContentUpdate>,
                      _propagated: usize)
                      -> Result<()> {
        self.finalize_with_data(p, status, content_updates, p.data()).await
    }

    async fn finalize_with_data(&self,
                                p: &ProcessingRecord,
                                status: ProcessingStatus,
                                content_updates: Vec<ContentUpdate>,
                                data: ProcessingData)
                                -> Result<()> {
        let processing_id = p.processing_id;
        let transform_id = p.transform_id;
        info!("Carrier: processing {processing_id} terminated as {status:?}");
        let running_metadata = ProcessingRecord::running_snapshot(&p.running_metadata, &data)?;
        let num_contents = content_updates.len() as i32;
        let message = NewMessage { msg_type: MessageType::StatusReport,
                                   status: MessageStatus::New,
                                   source: MessageSource::Carrier,
                                   destination: MessageDestination::Outside,
                                   request_id: Some(p.request_id),
                                   workload_id: p.workload_id,
                                   transform_id: Some(transform_id),
                                   processing_id: Some(processing_id),
                                   num_contents,
                                   msg_content: json!({"processing_id": processing_id,
                                                       "status": format!("{status:?}"),
                                                       "workload_id": p.workload_id}) };
        let update = ProcessingUpdate { status: Some(status),
                                        substatus: Some(status),
                                        locking: Some(Locking::Idle),
                                        finished_at: Some(Utc::now()),
                                        running_metadata: Some(running_metadata),
                                        next_poll_at: Some(Utc::now()),
                                        ..Default::default() };
        let propagated = self.ctx
                             .db(move |cat| {
                                 cat.update_processing_with_contents(processing_id,
                                                                     update,
                                                                     content_updates,
                                                                     vec![message])
                             })
                             .await?;
        if propagated > 0 {
            debug!("Carrier: {propagated} dependent contents released by processing {processing_id}");
        }
        self.ctx.publish(EventType::UpdateTransform, transform_id);
        Ok(())
    }

    async fn backoff_poll(&self, p: &ProcessingRecord) -> Result<()> {
        let processing_id = p.processing_id;
        let retries = p.update_retries + 1;
        if p.max_update_retries > 0 && retries >= p.max_update_retries {
            return Err(IddsError::DriverFailure("polling retries exhausted".into()));
        }
        let backoff = ChronoDuration::seconds((p.update_poll_period.as_secs().max(1) * retries as u64) as i64);
        self.ctx
            .db(move |cat| {
                cat.update_processing(processing_id,
                                      ProcessingUpdate { locking: Some(Locking::Idle),
                                                         update_retries: Some(retries),
                                                         next_poll_at: Some(Utc::now() + backoff),
                                                         ..Default::default() })
            })
            .await?;
        Ok(())
    }

    async fn unlock_processing(&self, processing_id: i64) {
        let _ = self.ctx
                    .db(move |cat| {
                        cat.update_processing(processing_id,
                                              ProcessingUpdate { locking: Some(Locking::Idle),
                                                                 ..Default::default() })
                    })
                    .await;
    }
}
