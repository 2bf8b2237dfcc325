//! Escenarios end-to-end sobre el catálogo en memoria y los adaptadores
//! simulados, manejando los ciclos de los agentes paso a paso.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use idds_adapters::{SimDatasetCatalog, SimWorkloadManager};
use idds_agents::{AgentContext, Carrier, Clerk, Transformer};
use idds_common::{AgentConfig, CollectionRelationType, CollectionStatus, CollectionType, CommandLocation,
                  CommandStatus, CommandType, ContentRelationType, ContentStatus, ProcessingStatus, RequestStatus,
                  ReturnCode, TransformStatus, TransformType};
use idds_core::catalog::{Catalog, ContentUpdate, MessageFilter, NewCommand, NewRequest, ProcessingUpdate,
                         TransformUpdate};
use idds_core::event::{EventBusBackend, LocalEventBus};
use idds_core::externals::{MetadataResolver, TaskDriver};
use idds_core::models::{ProcessingRecord, RequestRecord, TransformRecord};
use idds_core::workflow::{CollectionSpec, ConditionTrigger, JobDependency, JobSpec, Work, WorkCondition,
                          Workflow};
use idds_core::MemoryCatalog;

struct Harness {
    catalog: Arc<MemoryCatalog>,
    driver: Arc<SimWorkloadManager>,
    datasets: Arc<SimDatasetCatalog>,
    clerk: Arc<Clerk<MemoryCatalog>>,
    transformer: Arc<Transformer<MemoryCatalog>>,
    carrier: Arc<Carrier<MemoryCatalog>>,
}

fn test_config() -> AgentConfig {
    AgentConfig { section: "test".to_string(),
                  heartbeat_delay: 3600,
                  poll_time_period: 1,
                  retrieve_bulk_size: 100,
                  max_number_workers: 2,
                  event_interval_delay: 1,
                  new_poll_period: Duration::from_secs(0),
                  update_poll_period: Duration::from_secs(0),
                  max_new_retries: 3,
                  max_update_retries: 0,
                  clean_locks_older_than: Duration::from_secs(3600),
                  driver_call_timeout: Duration::from_secs(5) }
}

fn harness() -> Harness {
    let catalog = Arc::new(MemoryCatalog::new());
    let driver = Arc::new(SimWorkloadManager::new());
    let datasets = Arc::new(SimDatasetCatalog::new());
    let bus: Arc<dyn EventBusBackend> = Arc::new(LocalEventBus::new());
    let ctx = AgentContext::new(catalog.clone(),
                                driver.clone() as Arc<dyn TaskDriver>,
                                datasets.clone() as Arc<dyn MetadataResolver>,
                                bus,
                                test_config());
    Harness { catalog,
              driver,
              datasets,
              clerk: Clerk::new(ctx.clone()),
              transformer: Transformer::new(ctx.clone()),
              carrier: Carrier::new(ctx) }
}

fn dataset_work(id: &str, work_name: &str, scope: &str, dataset: &str) -> Work {
    let mut work = Work::new(id, work_name, TransformType::Processing, "sim");
    work.primary_input_collection = Some(CollectionSpec::new(scope, dataset, CollectionType::Dataset));
    work.output_collections
        .push(CollectionSpec::new(scope, &format!("{dataset}.out"), CollectionType::Dataset));
    work.task_params = json!({"taskType": "sim"});
    work
}

fn submit_request(catalog: &MemoryCatalog, name: &str, wf: &Workflow) -> i64 {
    let mut request = NewRequest::new("tests", name, TransformType::Workflow);
    let (request_metadata, processing_metadata) = RequestRecord::split_workflow(wf).unwrap();
    request.request_metadata = request_metadata;
    request.processing_metadata = processing_metadata;
    request.update_poll_period = Duration::from_secs(0);
    catalog.add_request(request).unwrap()
}

fn transforms_of(catalog: &MemoryCatalog, request_id: i64) -> Vec<TransformRecord> {
    catalog.get_transforms_by_request(request_id).unwrap()
}

fn processing_of(catalog: &MemoryCatalog, transform_id: i64) -> ProcessingRecord {
    catalog.get_processings_by_transform(transform_id)
           .unwrap()
           .into_iter()
           .next()
           .expect("processing created")
}

fn issue_command(catalog: &MemoryCatalog, request_id: i64, cmd_type: CommandType) {
    catalog.add_command(NewCommand { request_id: Some(request_id),
                                     workload_id: None,
                                     transform_id: None,
                                     processing_id: None,
                                     cmd_type,
                                     status: CommandStatus::New,
                                     username: Some("tester".to_string()),
                                     source: CommandLocation::Rest,
                                     destination: CommandLocation::Clerk,
                                     cmd_content: json!({}) })
           .unwrap();
}

/// Corre los polls del Carrier hasta que el processing cierre (la regla de
/// flush terminal exige algunos polls extra).
async fn drain_processing(h: &Harness, processing_id: i64) -> ProcessingRecord {
    for _ in 0..8 {
        let rc = h.carrier.handle_update_processing(processing_id).await;
        assert_eq!(rc, ReturnCode::Ok);
        let p = h.catalog.get_processing(processing_id).unwrap();
        if p.status.is_terminal() {
            return p;
        }
    }
    h.catalog.get_processing(processing_id).unwrap()
}

// ----------------------------------------------------------------------
// S2: mapeo de task a partir de metadata externa
// ----------------------------------------------------------------------

#[tokio::test]
async fn s2_metadata_drives_collection_close_and_submission() {
    let h = harness();
    h.datasets
     .put_closed("tests", "ds.001", &["f1", "f2", "f3", "f4", "f5"]);

    let mut wf = Workflow::new("s2");
    wf.add_work(dataset_work("w1", "s2_task", "tests", "ds.001"), true);
    let request_id = submit_request(&h.catalog, "req.s2", &wf);

    assert_eq!(h.clerk.handle_new_request(request_id).await, ReturnCode::Ok);
    let req = h.catalog.get_request(request_id).unwrap();
    assert_eq!(req.status, RequestStatus::Transforming);
    let tfs = transforms_of(&h.catalog, request_id);
    assert_eq!(tfs.len(), 1);
    let transform_id = tfs[0].transform_id;

    assert_eq!(h.transformer.handle_transform(transform_id).await, ReturnCode::Ok);

    // Open → Closed según metadata externa
    let colls = h.catalog.get_collections_by_transform(transform_id).unwrap();
    let input = colls.iter()
                     .find(|c| c.relation_type == CollectionRelationType::Input)
                     .unwrap();
    assert_eq!(input.status, CollectionStatus::Closed);
    assert_eq!(input.total_files, 5);

    // 5 contents de entrada, ya Mapped (sus outputs entran en la misma
    // transacción), y payload de sumisión con nFiles=5
    let contents = h.catalog.get_contents_by_transform(transform_id).unwrap();
    let inputs: Vec<_> = contents.iter()
                                 .filter(|c| c.content_relation_type == ContentRelationType::Input)
                                 .collect();
    assert_eq!(inputs.len(), 5);
    assert!(inputs.iter().all(|c| c.status == ContentStatus::Mapped));

    let p = processing_of(&h.catalog, transform_id);
    let spec = p.spec().unwrap();
    assert_eq!(spec.task_param["nFiles"], json!(5));
    assert_eq!(spec.task_param["pfnList"].as_array().unwrap().len(), 5);

    // sumisión
    assert_eq!(h.carrier.handle_new_processing(p.processing_id).await, ReturnCode::Ok);
    let p = h.catalog.get_processing(p.processing_id).unwrap();
    assert_eq!(p.status, ProcessingStatus::Submitting);
    assert!(p.workload_id.is_some());
    assert!(p.submitted_at.is_some());

    // un input registrado que quedó New vuelve a Mapped en el siguiente
    // ciclo (barrido de mapped_input_ids sobre mapas con outputs)
    let reset_id = inputs[0].content_id;
    h.catalog
     .update_contents(vec![ContentUpdate { content_id: reset_id,
                                           status: Some(ContentStatus::New),
                                           ..Default::default() }])
     .unwrap();
    assert_eq!(h.transformer.handle_transform(transform_id).await, ReturnCode::Ok);
    let input = h.catalog
                 .get_contents_by_transform(transform_id)
                 .unwrap()
                 .into_iter()
                 .find(|c| c.content_id == reset_id)
                 .unwrap();
    assert_eq!(input.status, ContentStatus::Mapped);
}

// ----------------------------------------------------------------------
// S3: cancelación en cascada
// ----------------------------------------------------------------------

#[tokio::test]
async fn s3_cancel_fans_out_to_transforms_and_processings() {
    let h = harness();
    h.datasets.put_closed("tests", "ds.a", &["a1", "a2"]);
    h.datasets.put_closed("tests", "ds.b", &["b1"]);

    let mut wf = Workflow::new("s3");
    wf.add_work(dataset_work("wa", "s3_task_a", "tests", "ds.a"), true);
    wf.add_work(dataset_work("wb", "s3_task_b", "tests", "ds.b"), true);
    let request_id = submit_request(&h.catalog, "req.s3", &wf);

    h.clerk.handle_new_request(request_id).await;
    let tfs = transforms_of(&h.catalog, request_id);
    assert_eq!(tfs.len(), 2);
    for tf in &tfs {
        h.transformer.handle_transform(tf.transform_id).await;
        let p = processing_of(&h.catalog, tf.transform_id);
        h.carrier.handle_new_processing(p.processing_id).await;
    }

    // comando entrante ToCancel consumido por el Clerk
    issue_command(&h.catalog, request_id, CommandType::ToCancel);
    h.clerk.process_commands().await.unwrap();

    // un ciclo de Clerk: transforms a ToCancel, request a Cancelling
    assert_eq!(h.clerk.handle_update_request(request_id).await, ReturnCode::Ok);
    let req = h.catalog.get_request(request_id).unwrap();
    assert_eq!(req.status, RequestStatus::Cancelling);
    for tf in transforms_of(&h.catalog, request_id) {
        assert_eq!(tf.substatus, Some(TransformStatus::ToCancel));
    }

    // un ciclo de Transformer propaga la operación al processing
    for tf in transforms_of(&h.catalog, request_id) {
        h.transformer.handle_transform(tf.transform_id).await;
        let p = processing_of(&h.catalog, tf.transform_id);
        assert_eq!(p.substatus, Some(ProcessingStatus::ToCancel));
    }

    // un ciclo de Carrier: killTask y Cancelled
    for tf in transforms_of(&h.catalog, request_id) {
        let p = processing_of(&h.catalog, tf.transform_id);
        assert_eq!(h.carrier.handle_update_processing(p.processing_id).await, ReturnCode::Ok);
        let p = h.catalog.get_processing(p.processing_id).unwrap();
        assert_eq!(p.status, ProcessingStatus::Cancelled);
        let external = h.driver.get_task_status(p.workload_id.unwrap()).await.unwrap();
        assert_eq!(external, "aborted", "killTask was invoked");
    }

    // Transformer cierra los transforms, Clerk cierra el request
    for tf in transforms_of(&h.catalog, request_id) {
        h.transformer.handle_transform(tf.transform_id).await;
        let tf = h.catalog.get_transform(tf.transform_id).unwrap();
        assert_eq!(tf.status, TransformStatus::Cancelled);
    }
    h.clerk.handle_update_request(request_id).await;
    let req = h.catalog.get_request(request_id).unwrap();
    assert_eq!(req.status, RequestStatus::Cancelled);
}

#[tokio::test]
async fn force_finish_command_drains_to_finished() {
    let h = harness();
    h.datasets.put_closed("tests", "ds.ff", &["f1", "f2"]);
    let mut wf = Workflow::new("ff");
    wf.add_work(dataset_work("w1", "ff_task", "tests", "ds.ff"), true);
    let request_id = submit_request(&h.catalog, "req.ff", &wf);

    h.clerk.handle_new_request(request_id).await;
    let transform_id = transforms_of(&h.catalog, request_id)[0].transform_id;
    h.transformer.handle_transform(transform_id).await;
    let processing_id = processing_of(&h.catalog, transform_id).processing_id;
    h.carrier.handle_new_processing(processing_id).await;
    let workload_id = h.catalog.get_processing(processing_id).unwrap().workload_id.unwrap();
    h.driver.set_task_status(workload_id, "running");
    h.driver.complete_job(workload_id, "f1", true);
    h.driver.complete_job(workload_id, "f2", true);

    // el comando ToForceFinish atraviesa Clerk -> Transformer -> Carrier
    issue_command(&h.catalog, request_id, CommandType::ToForceFinish);
    h.clerk.process_commands().await.unwrap();
    assert_eq!(h.clerk.handle_update_request(request_id).await, ReturnCode::Ok);
    let req = h.catalog.get_request(request_id).unwrap();
    assert_eq!(req.status, RequestStatus::Transforming, "closing ops keep the request running");
    let tf = h.catalog.get_transform(transform_id).unwrap();
    assert_eq!(tf.substatus, Some(TransformStatus::ToForceFinish));

    h.transformer.handle_transform(transform_id).await;
    let p = h.catalog.get_processing(processing_id).unwrap();
    assert_eq!(p.substatus, Some(ProcessingStatus::ToForceFinish));

    // el Carrier fuerza el cierre de la task y consume la bandera
    assert_eq!(h.carrier.handle_update_processing(processing_id).await, ReturnCode::Ok);
    assert_eq!(h.driver.get_task_status(workload_id).await.unwrap(), "done", "finishTask was invoked");
    let p = drain_processing(&h, processing_id).await;
    assert_eq!(p.status, ProcessingStatus::Finished);

    h.transformer.handle_transform(transform_id).await;
    assert_eq!(h.catalog.get_transform(transform_id).unwrap().status, TransformStatus::Finished);
    h.clerk.handle_update_request(request_id).await;
    assert_eq!(h.catalog.get_request(request_id).unwrap().status, RequestStatus::Finished);
}

#[tokio::test]
async fn expire_command_cascades_to_expired() {
    let h = harness();
    h.datasets.put_closed("tests", "ds.exp", &["f1"]);
    let mut wf = Workflow::new("exp");
    wf.add_work(dataset_work("w1", "exp_task", "tests", "ds.exp"), true);
    let request_id = submit_request(&h.catalog, "req.exp", &wf);

    h.clerk.handle_new_request(request_id).await;
    let transform_id = transforms_of(&h.catalog, request_id)[0].transform_id;
    h.transformer.handle_transform(transform_id).await;
    let processing_id = processing_of(&h.catalog, transform_id).processing_id;
    h.carrier.handle_new_processing(processing_id).await;
    let workload_id = h.catalog.get_processing(processing_id).unwrap().workload_id.unwrap();
    h.driver.set_task_status(workload_id, "running");

    issue_command(&h.catalog, request_id, CommandType::ToExpire);
    h.clerk.process_commands().await.unwrap();
    h.clerk.handle_update_request(request_id).await;
    let tf = h.catalog.get_transform(transform_id).unwrap();
    assert_eq!(tf.substatus, Some(TransformStatus::ToExpire));

    h.transformer.handle_transform(transform_id).await;
    let p = h.catalog.get_processing(processing_id).unwrap();
    assert_eq!(p.substatus, Some(ProcessingStatus::ToExpire));

    // un ciclo de Carrier: kill suave y Expired
    assert_eq!(h.carrier.handle_update_processing(processing_id).await, ReturnCode::Ok);
    let p = h.catalog.get_processing(processing_id).unwrap();
    assert_eq!(p.status, ProcessingStatus::Expired);
    assert_eq!(h.driver.get_task_status(workload_id).await.unwrap(), "finished", "soft kill was invoked");

    h.transformer.handle_transform(transform_id).await;
    assert_eq!(h.catalog.get_transform(transform_id).unwrap().status, TransformStatus::Expired);
    h.clerk.handle_update_request(request_id).await;
    assert_eq!(h.catalog.get_request(request_id).unwrap().status, RequestStatus::Expired);
}

// ----------------------------------------------------------------------
// S4: reintento sobre SubFinished
// ----------------------------------------------------------------------

#[tokio::test]
async fn s4_subfinished_triggers_reactivation_without_terminal_message() {
    let h = harness();
    h.datasets.put_closed("tests", "ds.s4", &["f1", "f2"]);

    let mut wf = Workflow::new("s4");
    let mut work = dataset_work("w1", "s4_task", "tests", "ds.s4");
    work.num_retries = 5;
    wf.add_work(work, true);
    let request_id = submit_request(&h.catalog, "req.s4", &wf);

    h.clerk.handle_new_request(request_id).await;
    let transform_id = transforms_of(&h.catalog, request_id)[0].transform_id;
    h.transformer.handle_transform(transform_id).await;
    let processing_id = processing_of(&h.catalog, transform_id).processing_id;
    h.carrier.handle_new_processing(processing_id).await;

    let p = h.catalog.get_processing(processing_id).unwrap();
    let workload_id = p.workload_id.unwrap();

    // retry_number previo = 2
    let mut data = p.data();
    data.retry_number = 2;
    let running_metadata = ProcessingRecord::running_snapshot(&p.running_metadata, &data).unwrap();
    h.catalog
     .update_processing(processing_id,
                        ProcessingUpdate { running_metadata: Some(running_metadata),
                                           ..Default::default() })
     .unwrap();

    // el externo reporta `finished` (SubFinished)
    h.driver.set_task_status(workload_id, "finished");
    assert_eq!(h.carrier.handle_update_processing(processing_id).await, ReturnCode::Ok);

    let p = h.catalog.get_processing(processing_id).unwrap();
    assert_eq!(p.status, ProcessingStatus::Submitted, "back to Submitted after retry");
    assert_eq!(p.data().retry_number, 3);
    assert_eq!(h.driver.get_task_status(workload_id).await.unwrap(), "toretry", "retryTask was invoked");

    let messages = h.catalog
                    .retrieve_messages(MessageFilter { processing_id: Some(processing_id),
                                                       ..Default::default() })
                    .unwrap();
    assert!(messages.is_empty(), "no terminal message on retry");
}

// ----------------------------------------------------------------------
// S6: liberación por dependencias entre transforms
// ----------------------------------------------------------------------

#[tokio::test]
async fn s6_dependency_release_across_transforms() {
    let h = harness();
    h.datasets.put_closed("tests", "ds.up", &["f1"]);

    let mut wf = Workflow::new("s6");
    wf.add_work(dataset_work("up", "s6_upstream", "tests", "ds.up"), true);
    let mut downstream = Work::new("down", "s6_downstream", TransformType::Processing, "sim");
    downstream.primary_input_collection =
        Some(CollectionSpec::new("pseudo", "s6_downstream.in", CollectionType::PseudoDataset));
    downstream.output_collections
              .push(CollectionSpec::new("tests", "s6_downstream.out", CollectionType::Dataset));
    downstream.task_params = json!({"taskType": "sim"});
    downstream.use_dependency = true;
    downstream.dependency_map_template =
        vec![JobSpec { name: "d1".to_string(),
                       dependencies: vec![JobDependency { work_name: "s6_upstream".to_string(),
                                                          input_name: "f1".to_string() }] }];
    wf.add_work(downstream, true);
    let request_id = submit_request(&h.catalog, "req.s6", &wf);

    h.clerk.handle_new_request(request_id).await;
    let tfs = transforms_of(&h.catalog, request_id);
    let up_tf = tfs.iter().find(|t| t.name == "s6_upstream").unwrap().transform_id;
    let down_tf = tfs.iter().find(|t| t.name == "s6_downstream").unwrap().transform_id;

    // upstream registra su contenido de salida primero
    h.transformer.handle_transform(up_tf).await;
    // downstream resuelve la dependencia contra el output existente
    h.transformer.handle_transform(down_tf).await;
    let down_contents = h.catalog.get_contents_by_transform(down_tf).unwrap();
    let dep = down_contents.iter()
                           .find(|c| c.content_relation_type == ContentRelationType::InputDependency)
                           .expect("dependency row persisted");
    assert_eq!(dep.substatus, ContentStatus::New);
    let up_out = h.catalog
                  .get_contents_by_transform(up_tf)
                  .unwrap()
                  .into_iter()
                  .find(|c| c.content_relation_type == ContentRelationType::Output)
                  .unwrap();
    assert_eq!(dep.content_dep_id, Some(up_out.content_id));

    // el upstream termina: la propagación es atómica con el update fuente
    let up_processing = processing_of(&h.catalog, up_tf).processing_id;
    h.carrier.handle_new_processing(up_processing).await;
    let workload_id = h.catalog.get_processing(up_processing).unwrap().workload_id.unwrap();
    h.driver.finish_all(workload_id, &[]);
    h.carrier.handle_update_processing(up_processing).await;

    let dep = h.catalog
               .get_contents_by_transform(down_tf)
               .unwrap()
               .into_iter()
               .find(|c| c.content_relation_type == ContentRelationType::InputDependency)
               .unwrap();
    assert_eq!(dep.substatus, ContentStatus::Available, "propagated with the source update");

    // el próximo ciclo del Transformer libera el input del mapa
    h.transformer.handle_transform(down_tf).await;
    let released = h.catalog
                    .get_contents_by_transform(down_tf)
                    .unwrap()
                    .into_iter()
                    .find(|c| c.content_relation_type == ContentRelationType::Input)
                    .unwrap();
    assert_eq!(released.status, ContentStatus::Available, "input is releasable");
}

// ----------------------------------------------------------------------
// S1: lazo HPO generador/actuador
// ----------------------------------------------------------------------

#[tokio::test]
async fn s1_hpo_feedback_loop() {
    let h = harness();
    let points: Vec<String> = (0..10).map(|i| format!("point_{i}")).collect();
    let point_refs: Vec<&str> = points.iter().map(String::as_str).collect();
    h.datasets.put_closed("tests", "ds.points", &point_refs);

    let mut wf = Workflow::new("hpo");
    wf.add_work(dataset_work("generator", "hpo_generator", "tests", "ds.points"), true);
    let mut actuator = Work::new("actuator", "hpo_actuator", TransformType::Actuating, "sim");
    actuator.primary_input_collection =
        Some(CollectionSpec::new("pseudo", "hpo_actuator.in", CollectionType::PseudoDataset));
    actuator.output_collections
            .push(CollectionSpec::new("tests", "hpo_actuator.out", CollectionType::Dataset));
    actuator.task_params = json!({"taskType": "sim"});
    actuator.use_dependency = true;
    actuator.dependency_map_template =
        points.iter()
              .map(|p| JobSpec { name: format!("eval_{p}"),
                                 dependencies: vec![JobDependency { work_name: "hpo_generator".to_string(),
                                                                    input_name: p.clone() }] })
              .collect();
    wf.add_work(actuator, false);
    wf.add_condition(WorkCondition::new("generator", ConditionTrigger::IsTerminated, Some("actuator"), None));
    wf.add_condition(WorkCondition::new("actuator", ConditionTrigger::GenerateNewTask, Some("generator"), None));
    let request_id = submit_request(&h.catalog, "req.s1", &wf);

    // sólo el generador arranca
    h.clerk.handle_new_request(request_id).await;
    let tfs = transforms_of(&h.catalog, request_id);
    assert_eq!(tfs.len(), 1);
    let gen_tf = tfs[0].transform_id;

    // el generador corre sus 10 puntos: 7 disponibles, 3 fallados
    h.transformer.handle_transform(gen_tf).await;
    let gen_processing = processing_of(&h.catalog, gen_tf).processing_id;
    h.carrier.handle_new_processing(gen_processing).await;
    let workload_id = h.catalog.get_processing(gen_processing).unwrap().workload_id.unwrap();
    h.driver.finish_all(workload_id, &["point_7", "point_8", "point_9"]);
    let p = drain_processing(&h, gen_processing).await;
    assert_eq!(p.status, ProcessingStatus::Finished);

    let outputs = h.catalog.get_contents_by_transform(gen_tf).unwrap();
    let available = outputs.iter()
                           .filter(|c| {
                               c.content_relation_type == ContentRelationType::Output
                               && c.substatus == ContentStatus::Available
                           })
                           .count();
    let failed = outputs.iter()
                        .filter(|c| {
                            c.content_relation_type == ContentRelationType::Output
                            && c.substatus == ContentStatus::Failed
                        })
                        .count();
    assert_eq!((available, failed), (7, 3), "carrier wrote all 10 content substatuses");

    // el transformer cierra el generador como SubFinished
    h.transformer.handle_transform(gen_tf).await;
    assert_eq!(h.catalog.get_transform(gen_tf).unwrap().status, TransformStatus::SubFinished);

    // el clerk re-entra Transforming y materializa el actuador
    h.clerk.handle_update_request(request_id).await;
    assert_eq!(h.catalog.get_request(request_id).unwrap().status, RequestStatus::Transforming);
    let tfs = transforms_of(&h.catalog, request_id);
    assert_eq!(tfs.len(), 2);
    let act_tf = tfs.iter().find(|t| t.name == "hpo_actuator").unwrap().transform_id;

    // dos ciclos: registrar mapas, luego liberar los 7 inputs disponibles
    h.transformer.handle_transform(act_tf).await;
    h.transformer.handle_transform(act_tf).await;
    let act_contents = h.catalog.get_contents_by_transform(act_tf).unwrap();
    let releasable = act_contents.iter()
                                 .filter(|c| {
                                     c.content_relation_type == ContentRelationType::Input
                                     && c.status == ContentStatus::Available
                                 })
                                 .count();
    assert_eq!(releasable, 7, "actuator materialized with the 7 available inputs");

    // el actuador completa y pide otra vuelta del lazo
    let act_processing = processing_of(&h.catalog, act_tf).processing_id;
    h.carrier.handle_new_processing(act_processing).await;
    let act_workload = h.catalog.get_processing(act_processing).unwrap().workload_id.unwrap();
    h.driver.finish_all(act_workload, &[]);
    let p = drain_processing(&h, act_processing).await;
    assert_eq!(p.status, ProcessingStatus::Finished);

    // la bandera generate_new_task queda en el estado del work del actuador
    let tf = h.catalog.get_transform(act_tf).unwrap();
    let mut act_work = tf.work().unwrap();
    act_work.data.generate_new_task = true;
    let running_metadata = TransformRecord::running_snapshot(&tf.running_metadata, &act_work).unwrap();
    h.catalog
     .update_transform(act_tf,
                       TransformUpdate { running_metadata: Some(running_metadata),
                                         ..Default::default() })
     .unwrap();
    h.transformer.handle_transform(act_tf).await;
    assert_eq!(h.catalog.get_transform(act_tf).unwrap().status, TransformStatus::Finished);

    // el clerk re-materializa el generador (secuencia 1)
    h.clerk.handle_update_request(request_id).await;
    let tfs = transforms_of(&h.catalog, request_id);
    let generators: Vec<_> = tfs.iter().filter(|t| t.name == "hpo_generator").collect();
    assert_eq!(generators.len(), 2, "generator re-materialized by the feedback condition");
    assert_eq!(h.catalog.get_request(request_id).unwrap().status, RequestStatus::Transforming);
}

// ----------------------------------------------------------------------
// S5: recuperación de locks vía pulls de agentes
// ----------------------------------------------------------------------

#[tokio::test]
async fn s5_stale_locks_recovered_and_repulled() {
    let h = harness();
    h.datasets.put_closed("tests", "ds.s5", &["f1"]);
    let mut wf = Workflow::new("s5");
    wf.add_work(dataset_work("w1", "s5_task", "tests", "ds.s5"), true);
    for i in 0..3 {
        let request_id = submit_request(&h.catalog, &format!("req.s5.{i}"), &wf);
        h.clerk.handle_new_request(request_id).await;
    }

    // un agente reclama los 3 transforms y muere sin liberar
    let claimed = h.transformer.pull_new_transforms().await.unwrap();
    assert_eq!(claimed, 3);
    let claimed_again = h.transformer.pull_new_transforms().await.unwrap();
    assert_eq!(claimed_again, 0, "rows are locked");

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.transformer.clean_locks(Duration::from_millis(1)).await;

    // un agente hermano las retoma en el siguiente poll
    let retaken = h.transformer.pull_new_transforms().await.unwrap();
    assert_eq!(retaken, 3);
}

// ----------------------------------------------------------------------
// fin a fin con timers reales
// ----------------------------------------------------------------------

#[tokio::test]
async fn full_pipeline_reaches_finished() {
    let h = harness();
    h.datasets.put_closed("tests", "ds.full", &["f1", "f2"]);
    let mut wf = Workflow::new("full");
    wf.add_work(dataset_work("w1", "full_task", "tests", "ds.full"), true);
    let request_id = submit_request(&h.catalog, "req.full", &wf);

    // clerk → transformer → carrier, a mano hasta que el request cierre
    h.clerk.handle_new_request(request_id).await;
    let transform_id = transforms_of(&h.catalog, request_id)[0].transform_id;
    h.transformer.handle_transform(transform_id).await;
    let processing_id = processing_of(&h.catalog, transform_id).processing_id;
    h.carrier.handle_new_processing(processing_id).await;
    let workload_id = h.catalog.get_processing(processing_id).unwrap().workload_id.unwrap();
    h.driver.finish_all(workload_id, &[]);
    let p = drain_processing(&h, processing_id).await;
    assert_eq!(p.status, ProcessingStatus::Finished);

    h.transformer.handle_transform(transform_id).await;
    assert_eq!(h.catalog.get_transform(transform_id).unwrap().status, TransformStatus::Finished);

    h.clerk.handle_update_request(request_id).await;
    let req = h.catalog.get_request(request_id).unwrap();
    assert_eq!(req.status, RequestStatus::Finished);

    // mensajes emitidos en cada cierre
    let messages = h.catalog
                    .retrieve_messages(MessageFilter { request_id: Some(request_id),
                                                       ..Default::default() })
                    .unwrap();
    assert!(messages.len() >= 3, "processing, transform and request messages");
}
