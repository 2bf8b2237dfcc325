//! Clerk: ciclo de vida de los Requests.
//!
//! Tres pulls periódicos más dos handlers de evento:
//! - requests New/Extend: reconstruir el workflow, pedir works nuevos y
//!   crear sus Transforms; el request pasa a Transforming con el snapshot
//!   de estado dinámico persistido en la misma transacción.
//! - requests en curso: sincronizar el estado de cada Transform de vuelta
//!   al workflow, emitir los works recién desbloqueados y mapear el
//!   agregado al estado del request. Un estado terminal nunca se pisa con
//!   uno no terminal.
//! - requests operados (ToCancel/ToSuspend/ToResume y las operaciones de
//!   cierre ToExpire/ToFinish/ToForceFinish): registrar la operación,
//!   propagar el substatus a todos los Transforms no terminales y mover el
//!   request a Cancelling/Suspending/Resuming; las de cierre lo dejan en
//!   Transforming y el desenlace llega por la agregación del workflow.
//!
//! Todo camino que tomó `Locking` lo libera en cada salida, incluso en
//! fallo; el `clean_locking` periódico es red de seguridad, no el mecanismo
//! primario.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;

use idds_common::error::Result;
use idds_common::{CollectionRelationType, CollectionStatus, CollectionType, CommandStatus, IddsError, Locking,
                  MessageDestination, MessageSource, MessageStatus, MessageType, RequestStatus, ReturnCode,
                  TransformStatus};
use idds_core::catalog::{Catalog, CommandUpdate, NewCollection, NewMessage, NewTransform, RequestUpdate,
                         TransformUpdate};
use idds_core::event::EventType;
use idds_core::models::{RequestRecord, TransformRecord};
use idds_core::workflow::Work;

use crate::context::AgentContext;
use crate::runtime::AgentRuntime;

pub struct Clerk<C: Catalog> {
    ctx: Arc<AgentContext<C>>,
}

impl<C: Catalog> Clerk<C> {
    pub fn new(ctx: Arc<AgentContext<C>>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Runtime configurado con los pulls y handlers del Clerk.
    pub fn build_runtime(self: &Arc<Self>) -> AgentRuntime<C> {
        let mut runtime = AgentRuntime::new("Clerk", self.ctx.clone());
        let poll = Duration::from_secs(self.ctx.config.poll_time_period);

        let clerk = self.clone();
        runtime.add_timer("pull_new_requests", poll, move || {
                   let clerk = clerk.clone();
                   async move {
                       if let Err(e) = clerk.pull_new_requests().await {
                           warn!("Clerk: pull_new_requests: {e}");
                       }
                   }
               });
        let clerk = self.clone();
        runtime.add_timer("pull_running_requests", poll, move || {
                   let clerk = clerk.clone();
                   async move {
                       if let Err(e) = clerk.pull_running_requests().await {
                           warn!("Clerk: pull_running_requests: {e}");
                       }
                   }
               });
        let clerk = self.clone();
        runtime.add_timer("process_commands", poll, move || {
                   let clerk = clerk.clone();
                   async move {
                       if let Err(e) = clerk.process_commands().await {
                           warn!("Clerk: process_commands: {e}");
                       }
                   }
               });
        let clerk = self.clone();
        let older_than = self.ctx.config.clean_locks_older_than;
        runtime.add_timer("clean_locks", Duration::from_secs(1800), move || {
                   let clerk = clerk.clone();
                   async move { clerk.clean_locks(older_than).await }
               });

        let clerk = self.clone();
        runtime.on_event(EventType::NewRequest, move |id| {
                   let clerk = clerk.clone();
                   async move { clerk.handle_new_request(id).await }
               });
        let clerk = self.clone();
        runtime.on_event(EventType::UpdateRequest, move |id| {
                   let clerk = clerk.clone();
                   async move { clerk.handle_update_request(id).await }
               });
        runtime
    }

    // ------------------------------------------------------------------
    // pulls
    // ------------------------------------------------------------------

    pub async fn pull_new_requests(&self) -> Result<usize> {
        let bulk = self.ctx.config.retrieve_bulk_size;
        let reqs = self.ctx
                       .db(move |cat| {
                           cat.get_requests_by_status(&[RequestStatus::New, RequestStatus::Extend],
                                                      false,
                                                      true,
                                                      bulk)
                       })
                       .await?;
        if !reqs.is_empty() {
            info!("Clerk: {} [New+Extend] requests to process", reqs.len());
        }
        for req in &reqs {
            self.ctx.publish(EventType::NewRequest, req.request_id);
        }
        Ok(reqs.len())
    }

    pub async fn pull_running_requests(&self) -> Result<usize> {
        let bulk = self.ctx.config.retrieve_bulk_size;
        let mut reqs = self.ctx
                           .db(move |cat| {
                               cat.get_requests_by_status(&[RequestStatus::Transforming,
                                                            RequestStatus::ToCancel,
                                                            RequestStatus::Cancelling,
                                                            RequestStatus::ToSuspend,
                                                            RequestStatus::Suspending,
                                                            RequestStatus::Resuming],
                                                          false,
                                                          true,
                                                          bulk)
                           })
                           .await?;
        let more = self.ctx
                       .db(move |cat| cat.get_requests_by_status(&[RequestStatus::ToResume], true, true, bulk))
                       .await?;
        reqs.extend(more);
        if !reqs.is_empty() {
            debug!("Clerk: {} running requests to process", reqs.len());
        }
        for req in &reqs {
            self.ctx.publish(EventType::UpdateRequest, req.request_id);
        }
        Ok(reqs.len())
    }

    /// Consume Commands dirigidos a requests y los traduce a substatus.
    pub async fn process_commands(&self) -> Result<usize> {
        let bulk = self.ctx.config.retrieve_bulk_size;
        let cmds = self.ctx
                       .db(move |cat| cat.get_commands_by_status(CommandStatus::New, true, bulk))
                       .await?;
        let count = cmds.len();
        for cmd in cmds {
            let Some(request_id) = cmd.request_id else {
                let cmd_id = cmd.cmd_id;
                self.ctx
                    .db(move |cat| {
                        cat.update_command(cmd_id,
                                           CommandUpdate { status: Some(CommandStatus::Failed),
                                                           locking: Some(Locking::Idle),
                                                           errors: Some("command without request_id".into()) })
                    })
                    .await?;
                continue;
            };
            let substatus = cmd.cmd_type.request_substatus();
            let cmd_id = cmd.cmd_id;
            info!("Clerk: command {cmd_id} -> request {request_id} substatus {substatus:?}");
            self.ctx
                .db(move |cat| {
                    cat.update_request(request_id,
                                       RequestUpdate { substatus: Some(substatus),
                                                       next_poll_at: Some(Utc::now()),
                                                       ..Default::default() })?;
                    cat.update_command(cmd_id,
                                       CommandUpdate { status: Some(CommandStatus::Processed),
                                                       locking: Some(Locking::Idle),
                                                       errors: None })
                })
                .await?;
            self.ctx.publish(EventType::UpdateRequest, request_id);
        }
        Ok(count)
    }

    pub async fn clean_locks(&self, older_than: Duration) {
        match self.ctx.db(move |cat| cat.clean_request_locking(older_than)).await {
            Ok(n) if n > 0 => info!("Clerk: released {n} stale request locks"),
            Ok(_) => {}
            Err(e) => warn!("Clerk: clean_locks: {e}"),
        }
    }

    // ------------------------------------------------------------------
    // handlers
    // ------------------------------------------------------------------

    fn transform_from_work(req: &RequestRecord, instance_id: &str, work: &Work) -> Result<NewTransform> {
        let (transform_metadata, running_metadata) = TransformRecord::split_work(instance_id, work)?;
        let mut collections = Vec::new();
        if let Some(input) = &work.primary_input_collection {
            collections.push(NewCollection { request_id: req.request_id,
                                             transform_id: 0,
                                             workload_id: req.workload_id,
                                             coll_type: input.coll_type,
                                             relation_type: CollectionRelationType::Input,
                                             scope: input.scope.clone(),
                                             name: input.name.clone(),
                                             status: CollectionStatus::Open,
                                             total_files: 0,
                                             coll_metadata: json!({}) });
        }
        for output in &work.output_collections {
            collections.push(NewCollection { request_id: req.request_id,
                                             transform_id: 0,
                                             workload_id: req.workload_id,
                                             coll_type: output.coll_type,
                                             relation_type: CollectionRelationType::Output,
                                             scope: output.scope.clone(),
                                             name: output.name.clone(),
                                             status: CollectionStatus::Open,
                                             total_files: 0,
                                             coll_metadata: json!({}) });
        }
        for log_coll in &work.log_collections {
            collections.push(NewCollection { request_id: req.request_id,
                                             transform_id: 0,
                                             workload_id: req.workload_id,
                                             coll_type: log_coll.coll_type,
                                             relation_type: CollectionRelationType::Log,
                                             scope: log_coll.scope.clone(),
                                             name: log_coll.name.clone(),
                                             status: CollectionStatus::Open,
                                             total_files: 0,
                                             coll_metadata: json!({}) });
        }
        if collections.iter().all(|c| c.relation_type != CollectionRelationType::Input) {
            // works sin colección externa usan un pseudo dataset de entrada
            collections.push(NewCollection { request_id: req.request_id,
                                             transform_id: 0,
                                             workload_id: req.workload_id,
                                             coll_type: CollectionType::PseudoDataset,
                                             relation_type: CollectionRelationType::Input,
                                             scope: "pseudo".to_string(),
                                             name: format!("{}.input", work.work_name),
                                             status: CollectionStatus::Open,
                                             total_files: 0,
                                             coll_metadata: json!({}) });
        }
        Ok(NewTransform { request_id: req.request_id,
                          workload_id: req.workload_id,
                          transform_type: work.work_type,
                          transform_tag: work.work_tag.clone(),
                          priority: req.priority,
                          name: work.work_name.clone(),
                          status: TransformStatus::New,
                          expired_at: req.expired_at,
                          max_new_retries: req.max_new_retries,
                          max_update_retries: req.max_update_retries,
                          new_poll_period: req.new_poll_period,
                          update_poll_period: req.update_poll_period,
                          instance_id: Some(instance_id.to_string()),
                          transform_metadata,
                          running_metadata,
                          collections })
    }

    /// Marca el request como Failed con el error registrado y el lock
    /// liberado; última salida de todo handler que falla.
    async fn fail_request(&self, request_id: i64, err: &IddsError) {
        error!("Clerk: request {request_id} failed: {err}");
        let msg = err.to_string();
        let res = self.ctx
                      .db(move |cat| {
                          cat.update_request(request_id,
                                             RequestUpdate { status: Some(RequestStatus::Failed),
                                                             locking: Some(Locking::Idle),
                                                             errors: Some(msg),
                                                             ..Default::default() })
                      })
                      .await;
        if let Err(e) = res {
            error!("Clerk: could not record failure on request {request_id}: {e}");
        }
    }

    pub async fn handle_new_request(&self, request_id: i64) -> ReturnCode {
        match self.process_new_request(request_id).await {
            Ok(()) => ReturnCode::Ok,
            Err(IddsError::LockConflict(_)) => ReturnCode::Locked,
            Err(IddsError::NotFound(_)) => ReturnCode::Ok,
            Err(e) => {
                self.fail_request(request_id, &e).await;
                ReturnCode::Failed
            }
        }
    }

    async fn process_new_request(&self, request_id: i64) -> Result<()> {
        let req = self.ctx.db(move |cat| cat.get_request(request_id)).await?;
        if !matches!(req.status, RequestStatus::New | RequestStatus::Extend) {
            self.unlock_request(request_id).await;
            return Ok(());
        }
        let mut wf = req.workflow()?;
        wf.validate()?;
        let new_works = wf.get_new_works();
        let mut new_transforms = Vec::with_capacity(new_works.len());
        for (instance_id, work) in &new_works {
            new_transforms.push(Self::transform_from_work(&req, instance_id, work)?);
        }
        info!("Clerk: request {request_id} expands into {} transforms", new_transforms.len());
        let processing_metadata = RequestRecord::running_snapshot(&req.processing_metadata, &wf)?;
        let update_poll = req.update_poll_period;
        let params = RequestUpdate { status: Some(RequestStatus::Transforming),
                                     locking: Some(Locking::Idle),
                                     processing_metadata: Some(processing_metadata),
                                     next_poll_at:
                                         Some(Utc::now()
                                              + chrono::Duration::seconds(update_poll.as_secs() as i64)),
                                     ..Default::default() };
        let created = self.ctx
                          .db(move |cat| {
                              cat.update_request_with_transforms(request_id, params, new_transforms, vec![])
                          })
                          .await?;
        for transform_id in created {
            self.ctx.publish(EventType::NewTransform, transform_id);
        }
        Ok(())
    }

    pub async fn handle_update_request(&self, request_id: i64) -> ReturnCode {
        match self.process_update_request(request_id).await {
            Ok(()) => ReturnCode::Ok,
            Err(IddsError::LockConflict(_)) => ReturnCode::Locked,
            Err(IddsError::NotFound(_)) => ReturnCode::Ok,
            Err(e) => {
                self.fail_request(request_id, &e).await;
                ReturnCode::Failed
            }
        }
    }

    async fn process_update_request(&self, request_id: i64) -> Result<()> {
        let req = self.ctx.db(move |cat| cat.get_request(request_id)).await?;
        // un estado terminal nunca se pisa
        if req.status.is_terminal() {
            self.unlock_request(request_id).await;
            return Ok(());
        }
        if req.substatus.and_then(Self::operating_targets).is_some() {
            self.process_operating_request(&req).await
        } else {
            self.process_running_request(&req).await
        }
    }

    /// Substatus de transform y estado de request para cada operación. Las
    /// tres primeras atraviesan estados intermedios propios; las de cierre
    /// (expire/finish/forcefinish) dejan el request en Transforming y el
    /// desenlace llega por la agregación del workflow.
    fn operating_targets(substatus: RequestStatus) -> Option<(TransformStatus, RequestStatus)> {
        match substatus {
            RequestStatus::ToCancel => Some((TransformStatus::ToCancel, RequestStatus::Cancelling)),
            RequestStatus::ToSuspend => Some((TransformStatus::ToSuspend, RequestStatus::Suspending)),
            RequestStatus::ToResume => Some((TransformStatus::ToResume, RequestStatus::Resuming)),
            RequestStatus::ToExpire => Some((TransformStatus::ToExpire, RequestStatus::Transforming)),
            RequestStatus::ToFinish => Some((TransformStatus::ToFinish, RequestStatus::Transforming)),
            RequestStatus::ToForceFinish => Some((TransformStatus::ToForceFinish, RequestStatus::Transforming)),
            _ => None,
        }
    }

    async fn process_running_request(&self, req: &RequestRecord) -> Result<()> {
        let request_id = req.request_id;
        let mut wf = req.workflow()?;

        // sincronizar cada work materializado desde su fila de transform
        for (_, work) in wf.get_current_works() {
            let Some(work_id) = work.data.work_id else { continue };
            let tf = self.ctx.db(move |cat| cat.get_transform(work_id)).await?;
            let tf_work = tf.work()?;
            wf.sync_work_data(tf.transform_id, tf.status, tf.substatus, tf_work.data);
        }

        // works recién desbloqueados
        let new_works = wf.get_new_works();
        let mut new_transforms = Vec::with_capacity(new_works.len());
        for (instance_id, work) in &new_works {
            new_transforms.push(Self::transform_from_work(req, instance_id, work)?);
        }
        if !new_transforms.is_empty() {
            info!("Clerk: request {request_id} releases {} new transforms", new_transforms.len());
        }

        let (status, errors) = match wf.terminal_request_status() {
            Some(terminal) => (terminal, Some(wf.get_terminated_msg())),
            None => {
                let status = match req.status {
                    RequestStatus::ToSuspend | RequestStatus::Suspending => RequestStatus::Suspending,
                    RequestStatus::ToCancel | RequestStatus::Cancelling => RequestStatus::Cancelling,
                    _ => RequestStatus::Transforming,
                };
                (status, None)
            }
        };

        let processing_metadata = RequestRecord::running_snapshot(&req.processing_metadata, &wf)?;
        let params = RequestUpdate { status: Some(status),
                                     locking: Some(Locking::Idle),
                                     processing_metadata: Some(processing_metadata),
                                     errors,
                                     next_poll_at:
                                         Some(Utc::now()
                                              + chrono::Duration::seconds(req.update_poll_period.as_secs()
                                                                          as i64)),
                                     ..Default::default() };
        let created = self.ctx
                          .db(move |cat| {
                              cat.update_request_with_transforms(request_id, params, new_transforms, vec![])
                          })
                          .await?;
        for transform_id in created {
            self.ctx.publish(EventType::NewTransform, transform_id);
        }
        if status.is_terminal() {
            info!("Clerk: request {request_id} terminated as {status:?}");
            let workload_id = req.workload_id;
            self.ctx
                .db(move |cat| {
                    cat.add_message(NewMessage { msg_type: MessageType::StatusReport,
                                                 status: MessageStatus::New,
                                                 source: MessageSource::Clerk,
                                                 destination: MessageDestination::Outside,
                                                 request_id: Some(request_id),
                                                 workload_id,
                                                 transform_id: None,
                                                 processing_id: None,
                                                 num_contents: 0,
                                                 msg_content: json!({"request_id": request_id,
                                                                     "status": format!("{status:?}")}) })
                })
                .await?;
        }
        Ok(())
    }

    async fn process_operating_request(&self, req: &RequestRecord) -> Result<()> {
        let request_id = req.request_id;
        let substatus = req.substatus.expect("operating request has substatus");
        let (tf_substatus, req_status) = Self::operating_targets(substatus).ok_or_else(|| {
                                             IddsError::Internal(format!("unexpected operating substatus \
                                                                          {substatus:?}"))
                                         })?;
        info!("Clerk: request {request_id} operating {substatus:?} -> {req_status:?}");

        let mut wf = req.workflow()?;
        match substatus {
            RequestStatus::ToResume => wf.resume_works(),
            RequestStatus::ToCancel => wf.cancel_works(),
            RequestStatus::ToSuspend => wf.suspend_works(),
            _ => {}
        }

        // registrar la operación con timestamp en la mitad dinámica
        let mut processing_metadata = RequestRecord::running_snapshot(&req.processing_metadata, &wf)?;
        let ops = processing_metadata.as_object_mut()
                                     .expect("processing_metadata object")
                                     .entry("operations")
                                     .or_insert_with(|| json!([]));
        if let Some(arr) = ops.as_array_mut() {
            arr.push(json!({"status": format!("{substatus:?}"), "time": Utc::now().to_rfc3339()}));
        }

        let transforms = self.ctx
                             .db(move |cat| cat.get_transforms_by_request(request_id))
                             .await?;
        let mut update_transforms = Vec::new();
        for tf in &transforms {
            if !tf.status.is_terminal() {
                update_transforms.push((tf.transform_id,
                                        TransformUpdate { substatus: Some(tf_substatus),
                                                          next_poll_at: Some(Utc::now()),
                                                          ..Default::default() }));
            }
        }
        let touched: Vec<i64> = update_transforms.iter().map(|(id, _)| *id).collect();

        let params = RequestUpdate { status: Some(req_status),
                                     substatus: Some(req_status),
                                     locking: Some(Locking::Idle),
                                     processing_metadata: Some(processing_metadata),
                                     next_poll_at:
                                         Some(Utc::now()
                                              + chrono::Duration::seconds(req.update_poll_period.as_secs()
                                                                          as i64)),
                                     ..Default::default() };
        self.ctx
            .db(move |cat| cat.update_request_with_transforms(request_id, params, vec![], update_transforms))
            .await?;
        for transform_id in touched {
            self.ctx.publish(EventType::UpdateTransform, transform_id);
        }
        Ok(())
    }

    async fn unlock_request(&self, request_id: i64) {
        let _ = self.ctx
                    .db(move |cat| {
                        cat.update_request(request_id,
                                           RequestUpdate { locking: Some(Locking::Idle),
                                                           ..Default::default() })
                    })
                    .await;
    }
}
