//! Tests del catálogo en memoria: select-and-lock, recuperación de locks
//! huérfanos, propagación de dependencias y el invariante de un único
//! processing activo.

use std::time::Duration;

use serde_json::json;

use idds_common::{CollectionRelationType, CollectionStatus, CollectionType, ContentRelationType, ContentStatus,
                  ContentType, Locking, MessageDestination, MessageSource, MessageStatus, MessageType,
                  ProcessingStatus, RequestStatus, TransformStatus, TransformType};
use idds_core::catalog::{Catalog, ContentUpdate, MessageFilter, NewCollection, NewContent, NewMessage,
                         NewProcessing, NewRequest, NewTransform, RequestUpdate, TransformOutputs,
                         TransformUpdate};
use idds_core::MemoryCatalog;

fn new_request(cat: &MemoryCatalog, name: &str) -> i64 {
    cat.add_request(NewRequest::new("tests", name, TransformType::Workflow)).unwrap()
}

fn new_transform(cat: &MemoryCatalog, request_id: i64, name: &str) -> i64 {
    let tf = NewTransform { request_id,
                            workload_id: None,
                            transform_type: TransformType::Processing,
                            transform_tag: "test".to_string(),
                            priority: 0,
                            name: name.to_string(),
                            status: TransformStatus::New,
                            expired_at: None,
                            max_new_retries: 3,
                            max_update_retries: 0,
                            new_poll_period: Duration::from_secs(0),
                            update_poll_period: Duration::from_secs(0),
                            instance_id: None,
                            transform_metadata: json!({}),
                            running_metadata: json!({}),
                            collections: vec![NewCollection { request_id,
                                                              transform_id: 0,
                                                              workload_id: None,
                                                              coll_type: CollectionType::Dataset,
                                                              relation_type: CollectionRelationType::Input,
                                                              scope: "tests".to_string(),
                                                              name: format!("{name}.in"),
                                                              status: CollectionStatus::Open,
                                                              total_files: 0,
                                                              coll_metadata: json!({}) },
                                              NewCollection { request_id,
                                                              transform_id: 0,
                                                              workload_id: None,
                                                              coll_type: CollectionType::Dataset,
                                                              relation_type: CollectionRelationType::Output,
                                                              scope: "tests".to_string(),
                                                              name: format!("{name}.out"),
                                                              status: CollectionStatus::Open,
                                                              total_files: 0,
                                                              coll_metadata: json!({}) }] };
    let ids = cat.update_request_with_transforms(request_id, RequestUpdate::default(), vec![tf], vec![])
                 .unwrap();
    ids[0]
}

fn new_content(cat: &MemoryCatalog,
               request_id: i64,
               transform_id: i64,
               coll_id: i64,
               map_id: i64,
               name: &str,
               relation: ContentRelationType,
               dep: Option<i64>)
               -> i64 {
    cat.add_contents(vec![NewContent { transform_id,
                                       coll_id,
                                       request_id,
                                       workload_id: None,
                                       map_id,
                                       content_dep_id: dep,
                                       scope: "tests".to_string(),
                                       name: name.to_string(),
                                       min_id: 0,
                                       max_id: 0,
                                       content_type: ContentType::File,
                                       content_relation_type: relation,
                                       status: ContentStatus::New,
                                       substatus: ContentStatus::New,
                                       bytes: 0,
                                       path: None,
                                       content_metadata: json!({}) }])
       .unwrap();
    cat.get_contents_by_transform(transform_id)
       .unwrap()
       .into_iter()
       .find(|c| c.name == name && c.content_relation_type == relation)
       .unwrap()
       .content_id
}

#[test]
fn select_and_lock_returns_only_idle_rows() {
    let cat = MemoryCatalog::new();
    let a = new_request(&cat, "req.a");
    let b = new_request(&cat, "req.b");

    let first = cat.get_requests_by_status(&[RequestStatus::New], false, true, 10).unwrap();
    assert_eq!(first.len(), 2);

    // ya quedaron Locking: un segundo worker no las ve
    let second = cat.get_requests_by_status(&[RequestStatus::New], false, true, 10).unwrap();
    assert!(second.is_empty());

    // al liberar una, vuelve a ser elegible
    cat.update_request(a,
                       RequestUpdate { locking: Some(Locking::Idle),
                                       ..Default::default() })
       .unwrap();
    let third = cat.get_requests_by_status(&[RequestStatus::New], false, true, 10).unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].request_id, a);
    let _ = b;
}

#[test]
fn listing_respects_priority_and_bulk() {
    let cat = MemoryCatalog::new();
    let low = new_request(&cat, "req.low");
    let high = new_request(&cat, "req.high");
    cat.update_request(high,
                       RequestUpdate { priority: Some(10),
                                       ..Default::default() })
       .unwrap();

    let rows = cat.get_requests_by_status(&[RequestStatus::New], false, false, 1).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].request_id, high, "higher priority first");
    let _ = low;
}

#[test]
fn clean_locking_restores_stale_rows() {
    let cat = MemoryCatalog::new();
    let request_id = new_request(&cat, "req.a");
    for i in 0..3 {
        new_transform(&cat, request_id, &format!("tf{i}"));
    }
    let locked = cat.get_transforms_by_status(&[TransformStatus::New], true, 10).unwrap();
    assert_eq!(locked.len(), 3);

    // el dueño murió: nadie libera. El barrido devuelve las filas a Idle.
    std::thread::sleep(Duration::from_millis(20));
    let cleaned = cat.clean_transform_locking(Duration::from_millis(1)).unwrap();
    assert_eq!(cleaned, 3);

    let retaken = cat.get_transforms_by_status(&[TransformStatus::New], true, 10).unwrap();
    assert_eq!(retaken.len(), 3, "a sibling agent picks them up");
}

#[test]
fn dependency_propagation_follows_source_substatus() {
    let cat = MemoryCatalog::new();
    let request_id = new_request(&cat, "req.a");
    let t1 = new_transform(&cat, request_id, "t1");
    let t2 = new_transform(&cat, request_id, "t2");
    let t1_out = cat.get_collections_by_transform(t1)
                    .unwrap()
                    .into_iter()
                    .find(|c| c.relation_type == CollectionRelationType::Output)
                    .unwrap()
                    .coll_id;
    let t2_in = cat.get_collections_by_transform(t2)
                   .unwrap()
                   .into_iter()
                   .find(|c| c.relation_type == CollectionRelationType::Input)
                   .unwrap()
                   .coll_id;

    let a = new_content(&cat, request_id, t1, t1_out, 1, "f1", ContentRelationType::Output, None);
    let b = new_content(&cat, request_id, t2, t2_in, 1, "f1", ContentRelationType::InputDependency, Some(a));

    // A pasa a Available: B recibe el mismo substatus atómicamente
    let propagated = cat.update_contents(vec![ContentUpdate { content_id: a,
                                                              substatus: Some(ContentStatus::Available),
                                                              ..Default::default() }])
                        .map(|_| ())
                        .and_then(|_| {
                            cat.get_contents_by_transform(t2)
                               .map(|cs| cs.into_iter().find(|c| c.content_id == b).unwrap())
                        })
                        .unwrap();
    assert_eq!(propagated.substatus, ContentStatus::Available);

    // estados no propagables (p.ej. Processing) no se copian
    let c = new_content(&cat, request_id, t2, t2_in, 2, "f2", ContentRelationType::InputDependency, Some(a));
    cat.update_contents(vec![ContentUpdate { content_id: a,
                                             substatus: Some(ContentStatus::Processing),
                                             ..Default::default() }])
       .unwrap();
    let c_row = cat.get_contents_by_transform(t2)
                   .unwrap()
                   .into_iter()
                   .find(|x| x.content_id == c)
                   .unwrap();
    assert_eq!(c_row.substatus, ContentStatus::New);
}

#[test]
fn at_most_one_active_processing_per_transform() {
    let cat = MemoryCatalog::new();
    let request_id = new_request(&cat, "req.a");
    let transform_id = new_transform(&cat, request_id, "t1");

    let make_processing = || NewProcessing { transform_id,
                                             request_id,
                                             workload_id: None,
                                             status: ProcessingStatus::New,
                                             submitter: Some("test".to_string()),
                                             expired_at: None,
                                             max_new_retries: 3,
                                             max_update_retries: 0,
                                             new_poll_period: Duration::from_secs(0),
                                             update_poll_period: Duration::from_secs(0),
                                             processing_metadata: json!({}),
                                             running_metadata: json!({}) };

    let first = cat.add_transform_outputs(transform_id,
                                          TransformUpdate::default(),
                                          TransformOutputs { new_processing: Some(make_processing()),
                                                             ..Default::default() })
                   .unwrap();
    let second = cat.add_transform_outputs(transform_id,
                                           TransformUpdate::default(),
                                           TransformOutputs { new_processing: Some(make_processing()),
                                                              ..Default::default() })
                    .unwrap();
    assert_eq!(first, second, "second create resolves to the existing active processing");
    assert_eq!(cat.get_processings_by_transform(transform_id).unwrap().len(), 1);
}

#[test]
fn mapped_inputs_flip_with_outputs() {
    let cat = MemoryCatalog::new();
    let request_id = new_request(&cat, "req.a");
    let transform_id = new_transform(&cat, request_id, "t1");
    let colls = cat.get_collections_by_transform(transform_id).unwrap();
    let in_coll = colls.iter()
                       .find(|c| c.relation_type == CollectionRelationType::Input)
                       .unwrap()
                       .coll_id;
    let out_coll = colls.iter()
                        .find(|c| c.relation_type == CollectionRelationType::Output)
                        .unwrap()
                        .coll_id;
    let input_id = new_content(&cat, request_id, transform_id, in_coll, 1, "f1", ContentRelationType::Input, None);
    new_content(&cat, request_id, transform_id, out_coll, 1, "f1", ContentRelationType::Output, None);

    // el input cuyo output ya existe pasa a Mapped en la misma transacción
    cat.add_transform_outputs(transform_id,
                              TransformUpdate::default(),
                              TransformOutputs { mapped_input_ids: vec![input_id],
                                                 ..Default::default() })
       .unwrap();
    let input = cat.get_contents_by_transform(transform_id)
                   .unwrap()
                   .into_iter()
                   .find(|c| c.content_id == input_id)
                   .unwrap();
    assert_eq!(input.status, ContentStatus::Mapped);
}

#[test]
fn add_contents_tolerates_duplicates() {
    let cat = MemoryCatalog::new();
    let request_id = new_request(&cat, "req.a");
    let transform_id = new_transform(&cat, request_id, "t1");
    let coll_id = cat.get_collections_by_transform(transform_id).unwrap()[0].coll_id;

    let seed = NewContent { transform_id,
                            coll_id,
                            request_id,
                            workload_id: None,
                            map_id: 1,
                            content_dep_id: None,
                            scope: "tests".to_string(),
                            name: "f1".to_string(),
                            min_id: 0,
                            max_id: 0,
                            content_type: ContentType::File,
                            content_relation_type: ContentRelationType::Input,
                            status: ContentStatus::New,
                            substatus: ContentStatus::New,
                            bytes: 0,
                            path: None,
                            content_metadata: json!({}) };
    assert_eq!(cat.add_contents(vec![seed.clone()]).unwrap(), 1);
    assert_eq!(cat.add_contents(vec![seed]).unwrap(), 0, "duplicated insert is a no-op success");
}

#[test]
fn messages_only_progress_status() {
    let cat = MemoryCatalog::new();
    let msg_id = cat.add_message(NewMessage { msg_type: MessageType::StatusReport,
                                              status: MessageStatus::New,
                                              source: MessageSource::Clerk,
                                              destination: MessageDestination::Outside,
                                              request_id: Some(1),
                                              workload_id: None,
                                              transform_id: None,
                                              processing_id: None,
                                              num_contents: 0,
                                              msg_content: json!({"k": "v"}) })
                    .unwrap();
    cat.update_messages_status(&[msg_id], MessageStatus::Delivered).unwrap();
    let rows = cat.retrieve_messages(MessageFilter { request_id: Some(1),
                                                     ..Default::default() })
                  .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, MessageStatus::Delivered);
    assert_eq!(rows[0].msg_content, json!({"k": "v"}), "content is never mutated");
}

#[test]
fn delete_request_cascades_to_owned_rows() {
    let cat = MemoryCatalog::new();
    let request_id = new_request(&cat, "req.a");
    let transform_id = new_transform(&cat, request_id, "t1");
    let coll_id = cat.get_collections_by_transform(transform_id).unwrap()[0].coll_id;
    new_content(&cat, request_id, transform_id, coll_id, 1, "f1", ContentRelationType::Input, None);

    cat.delete_request_cascade(request_id).unwrap();
    assert!(cat.get_request(request_id).is_err());
    assert!(cat.get_transforms_by_request(request_id).unwrap().is_empty());
    assert!(cat.get_contents_by_transform(transform_id).unwrap().is_empty());
}
