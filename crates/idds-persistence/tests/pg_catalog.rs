//! Tests de integración del catálogo Postgres.
//!
//! Requieren una base accesible vía `DATABASE_URL`; sin esa variable los
//! tests se saltean (patrón de los entornos de CI sin Postgres).

use std::time::Duration;

use serde_json::json;

use idds_common::{CollectionRelationType, CollectionStatus, CollectionType, ContentRelationType, ContentStatus,
                  ContentType, RequestStatus, TransformStatus, TransformType};
use idds_core::catalog::{Catalog, ContentUpdate, NewCollection, NewContent, NewRequest, NewTransform,
                         RequestUpdate};
use idds_persistence::{build_pool_from_env, PgCatalog};

fn pg_catalog() -> Option<PgCatalog> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set, skipping postgres test");
        return None;
    }
    Some(PgCatalog::new(build_pool_from_env().expect("pool")))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}.{}", uuid::Uuid::new_v4())
}

#[test]
fn request_roundtrip_and_lock_flip() {
    let Some(cat) = pg_catalog() else { return };
    let name = unique("req");
    let mut request = NewRequest::new("tests", &name, TransformType::Workflow);
    request.request_metadata = json!({"workflow": null});
    let request_id = cat.add_request(request).unwrap();

    let rec = cat.get_request(request_id).unwrap();
    assert_eq!(rec.status, RequestStatus::New);
    assert_eq!(rec.name, name);

    let listed = cat.get_requests_by_status(&[RequestStatus::New], false, true, 1000).unwrap();
    assert!(listed.iter().any(|r| r.request_id == request_id));
    // la misma fila no es elegible dos veces mientras está Locking
    let relisted = cat.get_requests_by_status(&[RequestStatus::New], false, true, 1000).unwrap();
    assert!(!relisted.iter().any(|r| r.request_id == request_id));

    std::thread::sleep(Duration::from_millis(10));
    let cleaned = cat.clean_request_locking(Duration::from_millis(1)).unwrap();
    assert!(cleaned >= 1);

    cat.delete_request_cascade(request_id).unwrap();
    assert!(cat.get_request(request_id).is_err());
}

#[test]
fn dependency_propagation_in_one_transaction() {
    let Some(cat) = pg_catalog() else { return };
    let mut request = NewRequest::new("tests", &unique("req.dep"), TransformType::Workflow);
    request.request_metadata = json!({"workflow": null});
    let request_id = cat.add_request(request).unwrap();

    let tf_name = unique("tf");
    let new_tf = NewTransform { request_id,
                                workload_id: None,
                                transform_type: TransformType::Processing,
                                transform_tag: "test".to_string(),
                                priority: 0,
                                name: tf_name.clone(),
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
                                                                  name: unique("coll.in"),
                                                                  status: CollectionStatus::Open,
                                                                  total_files: 0,
                                                                  coll_metadata: json!({}) },
                                                  NewCollection { request_id,
                                                                  transform_id: 0,
                                                                  workload_id: None,
                                                                  coll_type: CollectionType::Dataset,
                                                                  relation_type: CollectionRelationType::Output,
                                                                  scope: "tests".to_string(),
                                                                  name: unique("coll.out"),
                                                                  status: CollectionStatus::Open,
                                                                  total_files: 0,
                                                                  coll_metadata: json!({}) }] };
    let transform_id = cat.update_request_with_transforms(request_id, RequestUpdate::default(), vec![new_tf], vec![])
                          .unwrap()[0];
    let colls = cat.get_collections_by_transform(transform_id).unwrap();
    let out_coll = colls.iter()
                        .find(|c| c.relation_type == CollectionRelationType::Output)
                        .unwrap()
                        .coll_id;
    let in_coll = colls.iter()
                       .find(|c| c.relation_type == CollectionRelationType::Input)
                       .unwrap()
                       .coll_id;

    let seed = |coll_id: i64, name: &str, relation: ContentRelationType, dep: Option<i64>| NewContent {
        transform_id,
        coll_id,
        request_id,
        workload_id: None,
        map_id: 1,
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
        content_metadata: json!({}),
    };
    cat.add_contents(vec![seed(out_coll, "up", ContentRelationType::Output, None)]).unwrap();
    let up = cat.get_content_by_coll_name(out_coll, "up", ContentRelationType::Output)
                .unwrap()
                .unwrap();
    cat.add_contents(vec![seed(in_coll, "down", ContentRelationType::InputDependency, Some(up.content_id))])
       .unwrap();

    cat.update_contents(vec![ContentUpdate { content_id: up.content_id,
                                             substatus: Some(ContentStatus::Available),
                                             ..Default::default() }])
       .unwrap();
    let down = cat.get_content_by_coll_name(in_coll, "down", ContentRelationType::InputDependency)
                  .unwrap()
                  .unwrap();
    assert_eq!(down.substatus, ContentStatus::Available);

    cat.delete_request_cascade(request_id).unwrap();
}
