//! Binario demo: levanta los tres agentes sobre el catálogo en memoria y
//! los adaptadores simulados, somete un request de ejemplo y lo acompaña
//! hasta su estado terminal.
//!
//! El despliegue real usa el catálogo Postgres (`idds-persistence`) y los
//! adaptadores del workload manager concreto; el cableado es idéntico.

use std::error::Error;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde_json::json;

use idds_adapters::{SimDatasetCatalog, SimWorkloadManager};
use idds_agents::{AgentContext, Carrier, Clerk, Transformer};
use idds_common::{init_dotenv, AgentConfig, CollectionType, TransformType};
use idds_core::catalog::{Catalog, NewRequest};
use idds_core::event::{EventBusBackend, LocalEventBus};
use idds_core::externals::{MetadataResolver, TaskDriver};
use idds_core::models::RequestRecord;
use idds_core::workflow::{CollectionSpec, Work, Workflow};
use idds_core::MemoryCatalog;

fn demo_workflow() -> Workflow {
    let mut wf = Workflow::new("demo_workflow");
    let mut work = Work::new("processing", "demo_task", TransformType::Processing, "sim");
    work.primary_input_collection = Some(CollectionSpec::new("demo", "ds.demo.001", CollectionType::Dataset));
    work.output_collections
        .push(CollectionSpec::new("demo", "ds.demo.001.out", CollectionType::Dataset));
    work.task_params = json!({"taskType": "sim", "site": "local"});
    wf.add_work(work, true);
    wf
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    init_dotenv();

    let catalog = Arc::new(MemoryCatalog::new());
    let driver: Arc<dyn TaskDriver> = Arc::new(SimWorkloadManager::auto_completing());
    let resolver_impl = Arc::new(SimDatasetCatalog::new());
    resolver_impl.put_closed("demo", "ds.demo.001", &["file.0001", "file.0002", "file.0003"]);
    let resolver: Arc<dyn MetadataResolver> = resolver_impl;
    let bus: Arc<dyn EventBusBackend> = Arc::new(LocalEventBus::new());

    let mut config = AgentConfig::from_env("common");
    config.poll_time_period = 1;
    config.event_interval_delay = 1;
    config.heartbeat_delay = 30;
    config.update_poll_period = Duration::from_secs(1);

    // request de ejemplo
    let wf = demo_workflow();
    let mut request = NewRequest::new("demo", "req.demo.001", TransformType::Workflow);
    let (request_metadata, processing_metadata) = RequestRecord::split_workflow(&wf)?;
    request.request_metadata = request_metadata;
    request.processing_metadata = processing_metadata;
    let request_id = catalog.add_request(request)?;
    info!("submitted demo request {request_id}");

    let ctx = AgentContext::new(catalog.clone(), driver, resolver, bus, config);
    let clerk = Clerk::new(ctx.clone()).build_runtime();
    let transformer = Transformer::new(ctx.clone()).build_runtime();
    let carrier = Carrier::new(ctx.clone()).build_runtime();

    let stops = [clerk.stop_flag(), transformer.stop_flag(), carrier.stop_flag()];
    let handles = vec![tokio::spawn(clerk.run()), tokio::spawn(transformer.run()), tokio::spawn(carrier.run())];

    // acompañar el request hasta su estado terminal
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let req = catalog.get_request(request_id)?;
        info!("request {request_id}: {:?}", req.status);
        if req.status.is_terminal() {
            println!("request {request_id} terminated as {:?}", req.status);
            break;
        }
        if tokio::time::Instant::now() > deadline {
            println!("request {request_id} still {:?} after deadline", req.status);
            break;
        }
    }

    for stop in &stops {
        stop.store(true, Ordering::SeqCst);
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
