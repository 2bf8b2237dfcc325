//! Tests del motor de workflow: instanciación por condiciones, lazo
//! generador/actuador, idempotencia del sync y round-trip del split
//! estático/dinámico.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::json;

use idds_common::{CollectionStatus, CollectionType, ContentRelationType, ContentStatus, ContentType, Locking,
                  TransformStatus, TransformType};
use idds_core::models::ContentRecord;
use idds_core::workflow::{CollectionSpec, ConditionTrigger, JobDependency, JobSpec, MapCollections,
                          RegisteredMap, Work, WorkCondition, Workflow};

fn simple_work(id: &str) -> Work {
    let mut work = Work::new(id, &format!("task_{id}"), TransformType::Processing, "test");
    work.primary_input_collection = Some(CollectionSpec::new("tests", &format!("{id}.in"), CollectionType::Dataset));
    work.output_collections
        .push(CollectionSpec::new("tests", &format!("{id}.out"), CollectionType::Dataset));
    work
}

fn content(name: &str, relation: ContentRelationType, status: ContentStatus, substatus: ContentStatus)
           -> ContentRecord {
    ContentRecord { content_id: 0,
                    transform_id: 1,
                    coll_id: if relation == ContentRelationType::Output { 2 } else { 1 },
                    request_id: 1,
                    workload_id: None,
                    map_id: 1,
                    content_dep_id: None,
                    scope: "tests".to_string(),
                    name: name.to_string(),
                    min_id: 0,
                    max_id: 0,
                    content_type: ContentType::File,
                    content_relation_type: relation,
                    status,
                    substatus,
                    locking: Locking::Idle,
                    bytes: 0,
                    md5: None,
                    adler32: None,
                    path: None,
                    retries: 0,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                    expired_at: None,
                    content_metadata: json!({}) }
}

fn map_colls(input_status: CollectionStatus) -> MapCollections {
    MapCollections { input_coll_id: 1,
                     input_scope: "tests".to_string(),
                     input_status,
                     output_coll_id: 2,
                     output_scope: "tests".to_string() }
}

#[test]
fn initial_work_is_instantiated_once() {
    let mut wf = Workflow::new("wf");
    wf.add_work(simple_work("a"), true);
    let first = wf.get_new_works();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].0, "a:0");

    // sin materializar, sigue apareciendo pero no se duplica
    let again = wf.get_new_works();
    assert_eq!(again.len(), 1);

    wf.set_work_id("a:0", 42);
    assert!(wf.get_new_works().is_empty());
}

#[test]
fn condition_releases_follower_on_finish() {
    let mut wf = Workflow::new("wf");
    wf.add_work(simple_work("a"), true);
    wf.add_work(simple_work("b"), false);
    wf.add_condition(WorkCondition::new("a", ConditionTrigger::IsFinished, Some("b"), None));

    let works = wf.get_new_works();
    assert_eq!(works.len(), 1, "only the initial work starts");
    wf.set_work_id("a:0", 1);

    // a no terminó: b no aparece
    assert!(wf.get_new_works().is_empty());

    let mut data = wf.instantiated("a:0").unwrap().data;
    data.has_new_inputs = false;
    wf.sync_work_data(1, TransformStatus::Finished, None, data);

    let released = wf.get_new_works();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].0, "b:0");
    assert!(!wf.is_terminated(), "b is not yet materialized");
}

#[test]
fn failed_branch_goes_to_false_work() {
    let mut wf = Workflow::new("wf");
    wf.add_work(simple_work("a"), true);
    wf.add_work(simple_work("ok"), false);
    wf.add_work(simple_work("recover"), false);
    wf.add_condition(WorkCondition::new("a", ConditionTrigger::IsFinished, Some("ok"), Some("recover")));

    wf.get_new_works();
    wf.set_work_id("a:0", 1);
    let data = wf.instantiated("a:0").unwrap().data;
    wf.sync_work_data(1, TransformStatus::Failed, None, data);

    let released = wf.get_new_works();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].0, "recover:0");
}

#[test]
fn generate_new_task_loops_generator() {
    let mut wf = Workflow::new("hpo");
    wf.add_work(simple_work("generator"), true);
    wf.add_work(simple_work("actuator"), false);
    wf.add_condition(WorkCondition::new("generator", ConditionTrigger::IsFinished, Some("actuator"), None));
    wf.add_condition(WorkCondition::new("actuator", ConditionTrigger::GenerateNewTask, Some("generator"), None));

    wf.get_new_works();
    wf.set_work_id("generator:0", 1);
    let data = wf.instantiated("generator:0").unwrap().data;
    wf.sync_work_data(1, TransformStatus::Finished, None, data);

    let released = wf.get_new_works();
    assert_eq!(released[0].0, "actuator:0");
    wf.set_work_id("actuator:0", 2);

    // el actuador termina pidiendo otra vuelta
    let mut data = wf.instantiated("actuator:0").unwrap().data;
    data.generate_new_task = true;
    wf.sync_work_data(2, TransformStatus::Finished, None, data);

    let looped = wf.get_new_works();
    assert_eq!(looped.len(), 1);
    assert_eq!(looped[0].0, "generator:1", "generator re-materialized with bumped sequence");
    assert_eq!(looped[0].1.data.sequence_id, 1);
    assert!(!wf.is_terminated());

    // segunda vuelta sin generate_new_task: el lazo se cierra
    wf.set_work_id("generator:1", 3);
    let data = wf.instantiated("generator:1").unwrap().data;
    wf.sync_work_data(3, TransformStatus::Finished, None, data);
    let released = wf.get_new_works();
    assert_eq!(released[0].0, "actuator:1");
    wf.set_work_id("actuator:1", 4);
    let data = wf.instantiated("actuator:1").unwrap().data;
    wf.sync_work_data(4, TransformStatus::Finished, None, data);
    assert!(wf.get_new_works().is_empty());
    assert!(wf.is_terminated());
    assert!(wf.is_finished());
}

#[test]
fn sync_work_data_is_idempotent() {
    let mut wf = Workflow::new("wf");
    wf.add_work(simple_work("a"), true);
    wf.get_new_works();
    wf.set_work_id("a:0", 7);

    let mut data = wf.instantiated("a:0").unwrap().data;
    data.input_files = vec!["x".to_string()];
    wf.sync_work_data(7, TransformStatus::Transforming, Some(TransformStatus::ToCancel), data.clone());
    let once = serde_json::to_value(wf.get_running_data()).unwrap();
    wf.sync_work_data(7, TransformStatus::Transforming, Some(TransformStatus::ToCancel), data);
    let twice = serde_json::to_value(wf.get_running_data()).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn running_data_roundtrip_preserves_state() {
    let mut wf = Workflow::new("wf");
    wf.add_work(simple_work("a"), true);
    wf.add_work(simple_work("b"), false);
    wf.add_condition(WorkCondition::new("a", ConditionTrigger::IsFinished, Some("b"), None));
    wf.get_new_works();
    wf.set_work_id("a:0", 1);
    let mut data = wf.instantiated("a:0").unwrap().data;
    data.custom_flags.insert("checked".to_string(), true);
    wf.sync_work_data(1, TransformStatus::Transforming, None, data);

    // split: la estructura serializada no arrastra estado
    let statics = serde_json::to_value(&wf).unwrap();
    let running = wf.get_running_data();
    let mut restored: Workflow = serde_json::from_value(statics).unwrap();
    assert!(restored.get_current_works().is_empty(), "static half carries no instances");
    restored.load_running_data(running.clone());

    assert_eq!(serde_json::to_value(restored.get_running_data()).unwrap(),
               serde_json::to_value(&running).unwrap());
    assert_eq!(restored.get_current_works().len(), 1);
    let work = restored.instantiated("a:0").unwrap();
    assert_eq!(work.data.custom_flags.get("checked"), Some(&true));
}

#[test]
fn map_ids_are_monotonic_and_never_reused() {
    let mut work = simple_work("a");
    work.data.input_files = vec!["f1".to_string(), "f2".to_string()];
    let maps = work.get_new_input_output_maps(&BTreeMap::new(), &map_colls(CollectionStatus::Open), &|_| None);
    assert_eq!(maps.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

    // con el mapa 1..2 registrados, el siguiente arranca en 3
    let mut registered: BTreeMap<i64, RegisteredMap> = BTreeMap::new();
    for (id, name) in [(1_i64, "f1"), (2, "f2")] {
        let mut map = RegisteredMap::default();
        map.inputs.push(content(name, ContentRelationType::Input, ContentStatus::New, ContentStatus::New));
        registered.insert(id, map);
    }
    work.data.input_files.push("f3".to_string());
    let maps = work.get_new_input_output_maps(&registered, &map_colls(CollectionStatus::Open), &|_| None);
    assert_eq!(maps.keys().copied().collect::<Vec<_>>(), vec![3]);
}

#[test]
fn new_inputs_gate_closes_with_collection() {
    let mut work = simple_work("a");
    work.data.input_files = vec!["f1".to_string()];
    let mut registered: BTreeMap<i64, RegisteredMap> = BTreeMap::new();
    let mut map = RegisteredMap::default();
    map.inputs.push(content("f1", ContentRelationType::Input, ContentStatus::New, ContentStatus::New));
    registered.insert(1, map);

    // colección abierta: el gate no cierra
    let maps = work.get_new_input_output_maps(&registered, &map_colls(CollectionStatus::Open), &|_| None);
    assert!(maps.is_empty());
    assert!(work.has_new_inputs());

    // colección cerrada y sin pendientes: se apaga has_new_inputs
    let maps = work.get_new_input_output_maps(&registered, &map_colls(CollectionStatus::Closed), &|_| None);
    assert!(maps.is_empty());
    assert!(!work.has_new_inputs());
}

#[test]
fn dependency_maps_wait_for_upstream() {
    let mut work = simple_work("b");
    work.use_dependency = true;
    work.data.dependency_map =
        vec![JobSpec { name: "job1".to_string(),
                       dependencies: vec![JobDependency { work_name: "task_a".to_string(),
                                                          input_name: "out1".to_string() }] },
             JobSpec { name: "job2".to_string(),
                       dependencies: vec![JobDependency { work_name: "task_a".to_string(),
                                                          input_name: "out2".to_string() }] }];

    // sólo out1 existe aguas arriba: job2 queda retenido en memoria
    let resolve = |dep: &JobDependency| {
        (dep.input_name == "out1").then(|| idds_core::workflow::ResolvedDep { content_id: 99,
                                                                              substatus:
                                                                                  ContentStatus::Available })
    };
    let maps = work.get_new_input_output_maps(&BTreeMap::new(), &map_colls(CollectionStatus::Open), &resolve);
    assert_eq!(maps.len(), 1);
    let map = maps.values().next().unwrap();
    assert_eq!(map.inputs[0].name, "job1");
    assert_eq!(map.inputs_dependency.len(), 1);
    assert_eq!(map.inputs_dependency[0].content_dep_id, Some(99));
    assert_eq!(work.data.dependency_map.len(), 1, "unmet job held in memory");
    assert_eq!(work.data.dependency_map_deleted.len(), 1);

    // con job1 ya registrado en el catálogo, el job retenido sale cuando su
    // dependencia aparece y el map_id continúa desde el máximo
    let mut registered: BTreeMap<i64, RegisteredMap> = BTreeMap::new();
    let mut job1_map = RegisteredMap::default();
    job1_map.outputs
            .push(content("job1", ContentRelationType::Output, ContentStatus::New, ContentStatus::New));
    registered.insert(1, job1_map);
    let resolve_all = |_: &JobDependency| {
        Some(idds_core::workflow::ResolvedDep { content_id: 100,
                                                substatus: ContentStatus::New })
    };
    let maps = work.get_new_input_output_maps(&registered, &map_colls(CollectionStatus::Open), &resolve_all);
    assert_eq!(maps.len(), 1);
    assert_eq!(maps.keys().copied().collect::<Vec<_>>(), vec![2]);
    assert!(work.data.dependency_map.is_empty());
}

#[test]
fn syn_work_status_aggregates_outputs() {
    let mut work = simple_work("a");
    work.data.has_new_inputs = false;
    let mut registered: BTreeMap<i64, RegisteredMap> = BTreeMap::new();
    let mut map = RegisteredMap::default();
    map.outputs.push(content("o1",
                             ContentRelationType::Output,
                             ContentStatus::Available,
                             ContentStatus::Available));
    map.outputs
       .push(content("o2", ContentRelationType::Output, ContentStatus::Failed, ContentStatus::Failed));
    registered.insert(1, map);

    // sin processings terminados no decide
    assert_eq!(work.syn_work_status(&registered, false), None);
    // mezcla disponible/fallado: SubFinished
    assert_eq!(work.syn_work_status(&registered, true), Some(TransformStatus::SubFinished));

    // todo disponible: Finished
    let mut all_ok = registered.clone();
    for output in all_ok.get_mut(&1).unwrap().outputs.iter_mut() {
        output.status = ContentStatus::Available;
        output.substatus = ContentStatus::Available;
    }
    assert_eq!(work.syn_work_status(&all_ok, true), Some(TransformStatus::Finished));

    // outputs sin flushear (status != substatus) posponen la decisión
    let mut unflushed = registered.clone();
    unflushed.get_mut(&1).unwrap().outputs[0].status = ContentStatus::New;
    assert_eq!(work.syn_work_status(&unflushed, true), None);
}

#[test]
fn cancel_and_resume_flags() {
    let mut wf = Workflow::new("wf");
    wf.add_work(simple_work("a"), true);
    wf.get_new_works();
    wf.set_work_id("a:0", 1);

    wf.cancel_works();
    assert!(wf.instantiated("a:0").unwrap().data.tocancel);

    wf.resume_works();
    assert!(wf.instantiated("a:0").unwrap().data.toresume);
}
