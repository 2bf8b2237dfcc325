//! Transformer: ciclo de vida de los Transforms.
//!
//! Cada ciclo: pollear colecciones (las externas contra el resolver de
//! metadata, las pseudo por política local), pedir al Work los mapas
//! input→output nuevos (map_id monotónico, `max(existente) + 1`), persistir
//! los Contents de cada mapa, crear el único Processing activo cuando el
//! Work lo pide, y derivar el estado agregado del Transform del estado de
//! sus outputs.
//!
//! Política de inputs nuevos: cuando el Work declara `has_new_inputs=false`
//! y su colección primaria está Closed y no quedan inputs por liberar, la
//! generación de mapas se detiene. Los works con dependencias sólo emiten
//! un mapa cuando todas sus dependencias resuelven a Contents de salida
//! existentes; los jobs insatisfechos quedan en memoria del Work y se
//! reintentan al ciclo siguiente.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;

use idds_common::error::Result;
use idds_common::{CollectionRelationType, CollectionStatus, ContentRelationType, ContentStatus, IddsError,
                  Locking, MessageDestination, MessageSource, MessageStatus, MessageType, ProcessingStatus,
                  ReturnCode, TransformStatus};
use idds_core::catalog::{Catalog, CollectionUpdate, ContentUpdate, NewContent, NewMessage, NewProcessing,
                         TransformOutputs, TransformUpdate};
use idds_core::event::EventType;
use idds_core::models::{CollectionRecord, ContentRecord, ProcessingRecord, ProcessingSpec, TransformRecord};
use idds_core::workflow::{ContentSeed, JobDependency, MapCollections, RegisteredMap, ResolvedDep, Work};

use crate::context::AgentContext;
use crate::runtime::AgentRuntime;

pub struct Transformer<C: Catalog> {
    ctx: Arc<AgentContext<C>>,
}

/// Agrupa los contents de un transform por `map_id` y tipo de relación.
pub fn group_maps(contents: &[ContentRecord]) -> BTreeMap<i64, RegisteredMap> {
    let mut maps: BTreeMap<i64, RegisteredMap> = BTreeMap::new();
    for content in contents {
        let entry = maps.entry(content.map_id).or_default();
        match content.content_relation_type {
            ContentRelationType::Input => entry.inputs.push(content.clone()),
            ContentRelationType::Output => entry.outputs.push(content.clone()),
            ContentRelationType::Log => entry.logs.push(content.clone()),
            ContentRelationType::InputDependency => entry.inputs_dependency.push(content.clone()),
        }
    }
    maps
}

impl<C: Catalog> Transformer<C> {
    pub fn new(ctx: Arc<AgentContext<C>>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn build_runtime(self: &Arc<Self>) -> AgentRuntime<C> {
        let mut runtime = AgentRuntime::new("Transformer", self.ctx.clone());
        let poll = Duration::from_secs(self.ctx.config.poll_time_period);

        let transformer = self.clone();
        runtime.add_timer("pull_new_transforms", poll, move || {
                   let transformer = transformer.clone();
                   async move {
                       if let Err(e) = transformer.pull_new_transforms().await {
                           warn!("Transformer: pull_new_transforms: {e}");
                       }
                   }
               });
        let transformer = self.clone();
        runtime.add_timer("pull_running_transforms", poll, move || {
                   let transformer = transformer.clone();
                   async move {
                       if let Err(e) = transformer.pull_running_transforms().await {
                           warn!("Transformer: pull_running_transforms: {e}");
                       }
                   }
               });
        let transformer = self.clone();
        let older_than = self.ctx.config.clean_locks_older_than;
        runtime.add_timer("clean_locks", Duration::from_secs(1800), move || {
                   let transformer = transformer.clone();
                   async move { transformer.clean_locks(older_than).await }
               });

        let transformer = self.clone();
        runtime.on_event(EventType::NewTransform, move |id| {
                   let transformer = transformer.clone();
                   async move { transformer.handle_transform(id).await }
               });
        let transformer = self.clone();
        runtime.on_event(EventType::UpdateTransform, move |id| {
                   let transformer = transformer.clone();
                   async move { transformer.handle_transform(id).await }
               });
        runtime
    }

    pub async fn pull_new_transforms(&self) -> Result<usize> {
        let bulk = self.ctx.config.retrieve_bulk_size;
        let tfs = self.ctx
                      .db(move |cat| {
                          cat.get_transforms_by_status(&[TransformStatus::New,
                                                         TransformStatus::Extend,
                                                         TransformStatus::Ready],
                                                       true,
                                                       bulk)
                      })
                      .await?;
        if !tfs.is_empty() {
            info!("Transformer: {} new transforms to process", tfs.len());
        }
        for tf in &tfs {
            self.ctx.publish(EventType::NewTransform, tf.transform_id);
        }
        Ok(tfs.len())
    }

    pub async fn pull_running_transforms(&self) -> Result<usize> {
        let bulk = self.ctx.config.retrieve_bulk_size;
        let tfs = self.ctx
                      .db(move |cat| {
                          cat.get_transforms_by_status(&[TransformStatus::Transforming,
                                                         TransformStatus::Cancelling,
                                                         TransformStatus::Suspending,
                                                         TransformStatus::Resuming],
                                                       true,
                                                       bulk)
                      })
                      .await?;
        for tf in &tfs {
            self.ctx.publish(EventType::UpdateTransform, tf.transform_id);
        }
        Ok(tfs.len())
    }

    pub async fn clean_locks(&self, older_than: Duration) {
        match self.ctx.db(move |cat| cat.clean_transform_locking(older_than)).await {
            Ok(n) if n > 0 => info!("Transformer: released {n} stale transform locks"),
            Ok(_) => {}
            Err(e) => warn!("Transformer: clean_locks: {e}"),
        }
    }

    pub async fn handle_transform(&self, transform_id: i64) -> ReturnCode {
        match self.process_transform(transform_id).await {
            Ok(()) => ReturnCode::Ok,
            Err(IddsError::LockConflict(_)) => ReturnCode::Locked,
            Err(IddsError::NotFound(_)) => ReturnCode::Ok,
            Err(e) => {
                self.fail_transform(transform_id, &e).await;
                ReturnCode::Failed
            }
        }
    }

    async fn fail_transform(&self, transform_id: i64, err: &IddsError) {
        error!("Transformer: transform {transform_id} failed: {err}");
        let msg = err.to_string();
        let res = self.ctx
                      .db(move |cat| {
                          cat.update_transform(transform_id,
                                               TransformUpdate { status: Some(TransformStatus::Failed),
                                                                 locking: Some(Locking::Idle),
                                                                 errors: Some(msg),
                                                                 finished_at: Some(Utc::now()),
                                                                 ..Default::default() })
                      })
                      .await;
        if let Err(e) = res {
            error!("Transformer: could not record failure on transform {transform_id}: {e}");
        }
    }

    /// Poll de la colección primaria de entrada: metadata externa para
    /// colecciones reales, política local para pseudo datasets.
    async fn poll_input_collection(&self,
                                   work: &mut Work,
                                   input_coll: &CollectionRecord)
                                   -> (CollectionStatus, Option<CollectionUpdate>) {
        if input_coll.status == CollectionStatus::Closed {
            return (CollectionStatus::Closed, None);
        }
        if input_coll.is_pseudo() {
            if !work.has_new_inputs() {
                // los pseudo datasets se cierran por política local
                return (CollectionStatus::Closed,
                        Some(CollectionUpdate { status: Some(CollectionStatus::Closed),
                                                ..Default::default() }));
            }
            return (input_coll.status, None);
        }
        let meta = self.ctx
                       .with_deadline(self.ctx.resolver.get_metadata(&input_coll.scope, &input_coll.name))
                       .await;
        match meta {
            Ok(meta) => {
                let files = if meta.files.is_empty() {
                    (0..meta.length).map(|i| format!("{}.{:04}", input_coll.name, i)).collect()
                } else {
                    meta.files.clone()
                };
                work.data.input_files = files;
                let status = if meta.is_open { CollectionStatus::Open } else { CollectionStatus::Closed };
                (status,
                 Some(CollectionUpdate { status: Some(status),
                                         bytes: Some(meta.bytes),
                                         total_files: Some(meta.length),
                                         coll_metadata: Some(json!({"is_open": meta.is_open,
                                                                    "did_type": meta.did_type,
                                                                    "availability": meta.availability})),
                                         ..Default::default() }))
            }
            Err(e) => {
                // transitorio: la fila queda como está y se reintenta
                warn!("Transformer: metadata poll failed for {}:{}: {e}", input_coll.scope, input_coll.name);
                (input_coll.status, None)
            }
        }
    }

    /// Pre-resuelve las dependencias pendientes contra el catálogo:
    /// (work_name, input_name) → Content de salida aguas arriba.
    async fn prefetch_dependencies(&self,
                                   request_id: i64,
                                   work: &Work)
                                   -> Result<HashMap<(String, String), ResolvedDep>> {
        let mut index = HashMap::new();
        if !work.use_dependency_to_release_jobs() {
            return Ok(index);
        }
        let wanted: HashSet<(String, String)> =
            work.data
                .dependency_map
                .iter()
                .flat_map(|job| job.dependencies.iter())
                .map(|dep| (dep.work_name.clone(), dep.input_name.clone()))
                .collect();
        if wanted.is_empty() {
            return Ok(index);
        }
        // nombre de work → colección de salida de su transform
        let transforms = self.ctx
                             .db(move |cat| cat.get_transforms_by_request(request_id))
                             .await?;
        let mut coll_by_work: HashMap<String, i64> = HashMap::new();
        for tf in &transforms {
            let tf_id = tf.transform_id;
            let colls = self.ctx.db(move |cat| cat.get_collections_by_transform(tf_id)).await?;
            if let Some(out) = colls.iter().find(|c| c.relation_type == CollectionRelationType::Output) {
                coll_by_work.insert(tf.name.clone(), out.coll_id);
            }
        }
        for (work_name, input_name) in wanted {
            let Some(&coll_id) = coll_by_work.get(&work_name) else { continue };
            let name = input_name.clone();
            let found = self.ctx
                            .db(move |cat| {
                                cat.get_content_by_coll_name(coll_id, &name, ContentRelationType::Output)
                            })
                            .await?;
            if let Some(content) = found {
                index.insert((work_name, input_name),
                             ResolvedDep { content_id: content.content_id,
                                           substatus: content.substatus });
            }
        }
        Ok(index)
    }

    fn seed_to_content(tf: &TransformRecord, map_id: i64, seed: &ContentSeed) -> NewContent {
        NewContent { transform_id: tf.transform_id,
                     coll_id: seed.coll_id,
                     request_id: tf.request_id,
                     workload_id: tf.workload_id,
                     map_id,
                     content_dep_id: seed.content_dep_id,
                     scope: seed.scope.clone(),
                     name: seed.name.clone(),
                     min_id: seed.min_id,
                     max_id: seed.max_id,
                     content_type: seed.content_type,
                     content_relation_type: seed.content_relation_type,
                     status: ContentStatus::New,
                     substatus: seed.substatus,
                     bytes: 0,
                     path: None,
                     content_metadata: json!({}) }
    }

    /// Liberación por dependencias: cuando todas las dependencias de un
    /// mapa llegaron a Available el input del mapa queda liberado; una
    /// dependencia perdida marca el input Missing.
    fn release_inputs(registered: &BTreeMap<i64, RegisteredMap>) -> Vec<ContentUpdate> {
        let mut updates = Vec::new();
        for map in registered.values() {
            if map.inputs_dependency.is_empty() {
                continue;
            }
            let all_available = map.inputs_dependency
                                   .iter()
                                   .all(|d| d.substatus == ContentStatus::Available);
            let any_lost = map.inputs_dependency.iter().any(|d| {
                                                           matches!(d.substatus,
                                                                    ContentStatus::Failed
                                                                    | ContentStatus::FinalFailed
                                                                    | ContentStatus::Lost
                                                                    | ContentStatus::Missing)
                                                       });
            let target = if all_available {
                Some(ContentStatus::Available)
            } else if any_lost {
                Some(ContentStatus::Missing)
            } else {
                None
            };
            let Some(target) = target else { continue };
            for input in &map.inputs {
                if input.status != target {
                    updates.push(ContentUpdate { content_id: input.content_id,
                                                 status: Some(target),
                                                 substatus: Some(target),
                                                 ..Default::default() });
                }
            }
            for dep in &map.inputs_dependency {
                if dep.status != dep.substatus {
                    updates.push(ContentUpdate { content_id: dep.content_id,
                                                 status: Some(dep.substatus),
                                                 ..Default::default() });
                }
            }
        }
        updates
    }

    /// Flush de outputs: un substatus terminal se promueve a status.
    fn flush_outputs(registered: &BTreeMap<i64, RegisteredMap>) -> Vec<ContentUpdate> {
        let mut updates = Vec::new();
        for map in registered.values() {
            for output in &map.outputs {
                if output.substatus.is_terminal() && output.status != output.substatus {
                    updates.push(ContentUpdate { content_id: output.content_id,
                                                 status: Some(output.substatus),
                                                 ..Default::default() });
                }
            }
        }
        updates
    }

    /// Vista post-flush de los mapas, para decidir el estado agregado en la
    /// misma transacción que aplica el flush.
    fn flushed_view(registered: &BTreeMap<i64, RegisteredMap>) -> BTreeMap<i64, RegisteredMap> {
        let mut view = registered.clone();
        for map in view.values_mut() {
            for output in map.outputs.iter_mut() {
                if output.substatus.is_terminal() {
                    output.status = output.substatus;
                }
            }
        }
        view
    }

    fn output_counters(registered: &BTreeMap<i64, RegisteredMap>) -> CollectionUpdate {
        let outputs: Vec<&ContentRecord> = registered.values().flat_map(|m| m.outputs.iter()).collect();
        let processed = outputs.iter().filter(|c| c.substatus == ContentStatus::Available).count() as i64;
        let failed = outputs.iter()
                            .filter(|c| {
                                matches!(c.substatus, ContentStatus::Failed | ContentStatus::FinalFailed)
                            })
                            .count() as i64;
        let missing = outputs.iter()
                             .filter(|c| matches!(c.substatus, ContentStatus::Missing | ContentStatus::Lost))
                             .count() as i64;
        CollectionUpdate { total_files: Some(outputs.len() as i64),
                           processed_files: Some(processed),
                           failed_files: Some(failed),
                           missing_files: Some(missing),
                           processing_files: Some(outputs.len() as i64 - processed - failed - missing),
                           ..Default::default() }
    }

    async fn process_transform(&self, transform_id: i64) -> Result<()> {
        let tf = self.ctx.db(move |cat| cat.get_transform(transform_id)).await?;
        if tf.status.is_terminal() {
            self.unlock_transform(transform_id).await;
            return Ok(());
        }
        let mut work = tf.work()?;

        let colls = self.ctx
                        .db(move |cat| cat.get_collections_by_transform(transform_id))
                        .await?;
        let input_coll = colls.iter()
                              .find(|c| c.relation_type == CollectionRelationType::Input)
                              .ok_or_else(|| {
                                  IddsError::Validation(format!("transform {transform_id} has no input collection"))
                              })?;
        let output_coll = colls.iter()
                               .find(|c| c.relation_type == CollectionRelationType::Output)
                               .ok_or_else(|| {
                                   IddsError::Validation(format!("transform {transform_id} has no output collection"))
                               })?;

        // 1. poll de colecciones
        let mut update_collections: Vec<(i64, CollectionUpdate)> = Vec::new();
        let (input_status, input_update) = self.poll_input_collection(&mut work, input_coll).await;
        if let Some(update) = input_update {
            update_collections.push((input_coll.coll_id, update));
        }

        // 2. mapas registrados + liberación por dependencias
        let contents = self.ctx
                           .db(move |cat| cat.get_contents_by_transform(transform_id))
                           .await?;
        let registered = group_maps(&contents);
        let mut update_contents = Self::release_inputs(&registered);
        // inputs todavía New cuyos mapas ya tienen outputs pasan a Mapped en
        // la misma transacción; la liberación por dependencias, si aplica en
        // este ciclo, se escribe después y prevalece
        let mapped_input_ids: Vec<i64> = registered.values()
                                                   .filter(|m| !m.outputs.is_empty())
                                                   .flat_map(|m| m.inputs.iter())
                                                   .filter(|c| c.status == ContentStatus::New)
                                                   .map(|c| c.content_id)
                                                   .collect();

        // 3. mapas nuevos
        let dep_index = self.prefetch_dependencies(tf.request_id, &work).await?;
        let map_colls = MapCollections { input_coll_id: input_coll.coll_id,
                                         input_scope: input_coll.scope.clone(),
                                         input_status,
                                         output_coll_id: output_coll.coll_id,
                                         output_scope: output_coll.scope.clone() };
        let resolve = |dep: &JobDependency| -> Option<ResolvedDep> {
            dep_index.get(&(dep.work_name.clone(), dep.input_name.clone())).cloned()
        };
        let new_maps = work.get_new_input_output_maps(&registered, &map_colls, &resolve);
        let mut new_contents = Vec::new();
        for (map_id, map) in &new_maps {
            let has_outputs = !map.outputs.is_empty();
            for seed in map.inputs
                           .iter()
                           .chain(map.outputs.iter())
                           .chain(map.logs.iter())
                           .chain(map.inputs_dependency.iter())
            {
                let mut content = Self::seed_to_content(&tf, *map_id, seed);
                // el input nace mapeado: su output entra en la misma
                // transacción
                if has_outputs && seed.content_relation_type == ContentRelationType::Input {
                    content.status = ContentStatus::Mapped;
                }
                new_contents.push(content);
            }
        }
        if !new_maps.is_empty() {
            debug!("Transformer: transform {transform_id} adds {} maps ({} contents)",
                   new_maps.len(),
                   new_contents.len());
        }

        // 4. processing único
        let processings = self.ctx
                              .db(move |cat| cat.get_processings_by_transform(transform_id))
                              .await?;
        let active = processings.iter().find(|p| !p.status.is_terminal());
        let processings_terminated = !processings.is_empty() && active.is_none();
        let mut new_processing = None;
        if processings.is_empty() && (!registered.is_empty() || !new_maps.is_empty()) {
            let mut input_names: Vec<String> = registered.values()
                                                         .flat_map(|m| m.inputs.iter().map(|c| c.name.clone()))
                                                         .collect();
            input_names.extend(new_maps.values()
                                       .flat_map(|m| m.inputs.iter().map(|s| s.name.clone())));
            let spec = ProcessingSpec { task_name: work.unique_task_name(),
                                        task_type: work.work_tag.clone(),
                                        task_param: work.build_task_param(&input_names),
                                        num_retries: work.num_retries };
            let (processing_metadata, running_metadata) = ProcessingRecord::split_spec(&spec)?;
            new_processing = Some(NewProcessing { transform_id,
                                                  request_id: tf.request_id,
                                                  workload_id: tf.workload_id,
                                                  status: ProcessingStatus::New,
                                                  submitter: Some("transformer".to_string()),
                                                  expired_at: tf.expired_at,
                                                  max_new_retries: tf.max_new_retries,
                                                  max_update_retries: tf.max_update_retries,
                                                  new_poll_period: tf.new_poll_period,
                                                  update_poll_period: tf.update_poll_period,
                                                  processing_metadata,
                                                  running_metadata });
        }

        // 5. operaciones pendientes hacia el processing
        let mut touched_processing = None;
        if let Some(sub) = tf.substatus {
            let op = match sub {
                TransformStatus::ToCancel => Some(ProcessingStatus::ToCancel),
                TransformStatus::ToSuspend => Some(ProcessingStatus::ToSuspend),
                TransformStatus::ToResume => Some(ProcessingStatus::ToResume),
                TransformStatus::ToExpire => Some(ProcessingStatus::ToExpire),
                TransformStatus::ToFinish => Some(ProcessingStatus::ToFinish),
                TransformStatus::ToForceFinish => Some(ProcessingStatus::ToForceFinish),
                _ => None,
            };
            if let (Some(op), Some(p)) = (op, active) {
                let processing_id = p.processing_id;
                self.ctx
                    .db(move |cat| {
                        cat.update_processing(processing_id,
                                              idds_core::catalog::ProcessingUpdate { substatus: Some(op),
                                                                                     next_poll_at:
                                                                                         Some(Utc::now()),
                                                                                     ..Default::default() })
                    })
                    .await?;
                touched_processing = Some(processing_id);
            }
        }

        // 6. flush de outputs y contadores
        update_contents.extend(Self::flush_outputs(&registered));
        update_collections.push((output_coll.coll_id, Self::output_counters(&registered)));

        // 7. estado agregado
        let flushed = Self::flushed_view(&registered);
        let last_processing_status = processings.last().map(|p| p.status);
        let new_status = if let Some(settled) = work.syn_work_status(&flushed, processings_terminated) {
            settled
        } else if processings_terminated {
            match last_processing_status {
                Some(ProcessingStatus::Cancelled) => TransformStatus::Cancelled,
                Some(ProcessingStatus::Suspended) => TransformStatus::Suspended,
                Some(ProcessingStatus::Expired) => TransformStatus::Expired,
                Some(ProcessingStatus::Failed) => TransformStatus::Failed,
                _ => TransformStatus::Transforming,
            }
        } else {
            match tf.substatus {
                Some(TransformStatus::ToCancel) => TransformStatus::Cancelling,
                Some(TransformStatus::ToSuspend) => TransformStatus::Suspending,
                _ => TransformStatus::Transforming,
            }
        };

        // 8. mensajes de cierre
        let mut messages = Vec::new();
        if new_status.is_terminal() {
            let outputs_total: i32 = registered.values().map(|m| m.outputs.len() as i32).sum();
            info!("Transformer: transform {transform_id} terminated as {new_status:?}");
            messages.push(NewMessage { msg_type: MessageType::StatusReport,
                                       status: MessageStatus::New,
                                       source: MessageSource::Transformer,
                                       destination: MessageDestination::Outside,
                                       request_id: Some(tf.request_id),
                                       workload_id: tf.workload_id,
                                       transform_id: Some(transform_id),
                                       processing_id: None,
                                       num_contents: outputs_total,
                                       msg_content: json!({"transform_id": transform_id,
                                                           "status": format!("{new_status:?}")}) });
            update_collections.push((output_coll.coll_id,
                                     CollectionUpdate { status: Some(CollectionStatus::Closed),
                                                        ..Default::default() }));
        }

        // 9. escribir todo junto
        let running_metadata = TransformRecord::running_snapshot(&tf.running_metadata, &work)?;
        let update = TransformUpdate { status: Some(new_status),
                                       locking: Some(Locking::Idle),
                                       started_at: tf.started_at.is_none().then(Utc::now),
                                       finished_at: new_status.is_terminal().then(Utc::now),
                                       running_metadata: Some(running_metadata),
                                       next_poll_at:
                                           Some(Utc::now()
                                                + chrono::Duration::seconds(tf.update_poll_period.as_secs()
                                                                            as i64)),
                                       ..Default::default() };
        let outputs = TransformOutputs { new_contents,
                                         mapped_input_ids,
                                         update_collections,
                                         update_contents,
                                         new_processing,
                                         messages };
        let created = self.ctx
                          .db(move |cat| cat.add_transform_outputs(transform_id, update, outputs))
                          .await?;

        if let Some(processing_id) = created {
            self.ctx.publish(EventType::NewProcessing, processing_id);
        }
        if let Some(processing_id) = touched_processing {
            self.ctx.publish(EventType::UpdateProcessing, processing_id);
        }
        if new_status.is_terminal() {
            self.ctx.publish(EventType::UpdateRequest, tf.request_id);
        }
        Ok(())
    }

    async fn unlock_transform(&self, transform_id: i64) {
        let _ = self.ctx
                    .db(move |cat| {
                        cat.update_transform(transform_id,
                                             TransformUpdate { locking: Some(Locking::Idle),
                                                               ..Default::default() })
                    })
                    .await;
    }
}
