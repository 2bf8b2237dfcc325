//! Tests del workload manager simulado.

use chrono::{Duration, Utc};
use serde_json::json;

use idds_adapters::{SimDatasetCatalog, SimWorkloadManager};
use idds_core::externals::{MetadataResolver, TaskDriver};

fn task_param(name: &str, files: &[&str]) -> serde_json::Value {
    json!({"taskName": name, "taskType": "sim", "pfnList": files, "nFiles": files.len()})
}

#[tokio::test]
async fn submit_poll_and_finish() {
    let mgr = SimWorkloadManager::new();
    let workload_id = mgr.submit_task(&task_param("t1", &["f1", "f2"])).await.unwrap();
    assert_eq!(mgr.get_task_status(workload_id).await.unwrap(), "registered");

    mgr.set_task_status(workload_id, "running");
    let details = mgr.get_task_details(workload_id).await.unwrap();
    assert_eq!(details.status, "running");
    assert_eq!(details.job_ids.len(), 2);

    mgr.finish_all(workload_id, &["f2"]);
    let jobs = mgr.get_job_status(&details.job_ids).await.unwrap();
    let finished = jobs.iter().filter(|j| j.job_status == "finished").count();
    let failed = jobs.iter().filter(|j| j.job_status == "failed").count();
    assert_eq!((finished, failed), (1, 1));
    assert_eq!(jobs[0].files.len(), 1, "first file identifies the originating input");
}

#[tokio::test]
async fn duplicated_task_name_is_rejected() {
    let mgr = SimWorkloadManager::new();
    mgr.submit_task(&task_param("t1", &["f1"])).await.unwrap();
    assert!(mgr.submit_task(&task_param("t1", &["f1"])).await.is_err());
}

#[tokio::test]
async fn kill_fails_pending_jobs() {
    let mgr = SimWorkloadManager::new();
    let workload_id = mgr.submit_task(&task_param("t1", &["f1", "f2"])).await.unwrap();
    mgr.complete_job(workload_id, "f1", true);
    mgr.kill_task(workload_id).await.unwrap();
    assert_eq!(mgr.get_task_status(workload_id).await.unwrap(), "aborted");
    let details = mgr.get_task_details(workload_id).await.unwrap();
    let jobs = mgr.get_job_status(&details.job_ids).await.unwrap();
    assert!(jobs.iter().any(|j| j.job_status == "finished"));
    assert!(jobs.iter().any(|j| j.job_status == "failed"));
}

#[tokio::test]
async fn retry_resets_failed_jobs() {
    let mgr = SimWorkloadManager::new();
    let workload_id = mgr.submit_task(&task_param("t1", &["f1"])).await.unwrap();
    mgr.complete_job(workload_id, "f1", false);
    mgr.retry_task(workload_id).await.unwrap();
    assert_eq!(mgr.get_task_status(workload_id).await.unwrap(), "toretry");
    let details = mgr.get_task_details(workload_id).await.unwrap();
    let jobs = mgr.get_job_status(&details.job_ids).await.unwrap();
    assert!(jobs.iter().all(|j| j.job_status == "starting"));
}

#[tokio::test]
async fn time_range_scan_finds_task_by_name() {
    let mgr = SimWorkloadManager::new();
    let workload_id = mgr.submit_task(&task_param("t.unique", &["f1"])).await.unwrap();
    let handles = mgr.get_job_ids_in_time_range(Utc::now() - Duration::hours(10), "sim")
                     .await
                     .unwrap();
    let handle = handles.values().find(|h| h.task_name == "t.unique").unwrap();
    assert_eq!(handle.workload_id, workload_id);

    // otro tipo de task no aparece en el barrido
    let none = mgr.get_job_ids_in_time_range(Utc::now() - Duration::hours(10), "other")
                  .await
                  .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn dataset_catalog_serves_metadata() {
    let catalog = SimDatasetCatalog::new();
    catalog.put_closed("tests", "ds.001", &["a", "b", "c"]);
    let meta = catalog.get_metadata("tests", "ds.001").await.unwrap();
    assert_eq!(meta.length, 3);
    assert!(!meta.is_open);
    assert_eq!(meta.files, vec!["a", "b", "c"]);
    assert!(catalog.get_metadata("tests", "missing").await.is_err());
}
