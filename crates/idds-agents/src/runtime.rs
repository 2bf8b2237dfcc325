//! Esqueleto común de los agentes.
//!
//! Cada agente es un proceso de larga vida con:
//! - un pool de workers de tamaño fijo (semáforo): cada worker maneja un
//!   evento a la vez;
//! - tareas de timer `(función, delay)` para polls periódicos, heartbeat y
//!   limpieza de locks;
//! - una tabla de despacho tipo de evento → handler, con la convención
//!   `ReturnCode::Locked`: el evento vuelve a la cola con backoff;
//! - parada ordenada: una bandera única drena el trabajo en vuelo y sale.
//!
//! Cada heartbeat escribe una fila de Health; el reaping purga filas más
//! viejas que 2x el intervalo y las de pids muertos en este host, y publica
//! un mensaje agregado de salud.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::Semaphore;

use idds_common::error::Result;
use idds_common::{utils, ReturnCode};
use idds_core::catalog::{Catalog, HealthItem, NewMessage};
use idds_core::event::EventType;

use crate::context::AgentContext;

type HandlerFuture = Pin<Box<dyn Future<Output = ReturnCode> + Send>>;
type EventHandler = Arc<dyn Fn(i64) -> HandlerFuture + Send + Sync>;
type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TimerFn = Arc<dyn Fn() -> TimerFuture + Send + Sync>;

struct TimerTask {
    name: String,
    delay: Duration,
    func: TimerFn,
}

pub struct AgentRuntime<C: Catalog> {
    name: String,
    ctx: Arc<AgentContext<C>>,
    timers: Vec<TimerTask>,
    handlers: HashMap<EventType, EventHandler>,
    stop: Arc<AtomicBool>,
    workers: Arc<Semaphore>,
}

impl<C: Catalog> AgentRuntime<C> {
    pub fn new(name: &str, ctx: Arc<AgentContext<C>>) -> Self {
        let workers = Arc::new(Semaphore::new(ctx.config.max_number_workers.max(1)));
        Self { name: name.to_string(),
               ctx,
               timers: Vec::new(),
               handlers: HashMap::new(),
               stop: Arc::new(AtomicBool::new(false)),
               workers }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Registra una tarea periódica.
    pub fn add_timer<F, Fut>(&mut self, name: &str, delay: Duration, func: F)
        where F: Fn() -> Fut + Send + Sync + 'static,
              Fut: Future<Output = ()> + Send + 'static
    {
        self.timers.push(TimerTask { name: name.to_string(),
                                     delay,
                                     func: Arc::new(move || Box::pin(func()) as TimerFuture) });
    }

    /// Registra el handler de un tipo de evento.
    pub fn on_event<F, Fut>(&mut self, event_type: EventType, handler: F)
        where F: Fn(i64) -> Fut + Send + Sync + 'static,
              Fut: Future<Output = ReturnCode> + Send + 'static
    {
        self.handlers.insert(event_type,
                             Arc::new(move |id| Box::pin(handler(id)) as HandlerFuture));
    }

    /// Heartbeat: upsert de la fila Health propia, reaping por antigüedad y
    /// por pids muertos, y mensaje agregado de salud.
    async fn health_heartbeat(ctx: Arc<AgentContext<C>>, agent_name: String) {
        let hostname = utils::hostname();
        let pid = utils::pid();
        let heartbeat_delay = ctx.config.heartbeat_delay;
        let item = HealthItem { agent: agent_name.clone(),
                                hostname: hostname.clone(),
                                pid,
                                thread_id: 0,
                                thread_name: Some("main".to_string()),
                                payload: None };
        let result = ctx.db(move |cat| {
                            cat.add_health_item(item)?;
                            cat.clean_health(Some(Duration::from_secs(heartbeat_delay * 2)), None, &[])?;
                            let items = cat.get_health_items()?;
                            Ok(items)
                        })
                        .await;
        let items = match result {
            Ok(items) => items,
            Err(e) => {
                warn!("{agent_name}: health heartbeat failed: {e}");
                return;
            }
        };
        // pids muertos en este host
        let dead: Vec<i32> = items.iter()
                                  .filter(|h| h.hostname == hostname)
                                  .map(|h| h.pid)
                                  .filter(|p| !utils::pid_exists(*p))
                                  .collect();
        let host = hostname.clone();
        if !dead.is_empty() {
            let _ = ctx.db(move |cat| cat.clean_health(None, Some(&host), &dead)).await;
        }
        let agents: Vec<serde_json::Value> = items.iter()
                                                  .map(|h| {
                                                      json!({"agent": h.agent, "hostname": h.hostname,
                                                             "pid": h.pid, "updated_at": h.updated_at.to_rfc3339()})
                                                  })
                                                  .collect();
        let num = agents.len() as i32;
        let _ = ctx.db(move |cat| {
                       cat.add_message(NewMessage { msg_type: idds_common::MessageType::HealthHeartbeat,
                                                    status: idds_common::MessageStatus::New,
                                                    source: idds_common::MessageSource::Conductor,
                                                    destination: idds_common::MessageDestination::Outside,
                                                    request_id: None,
                                                    workload_id: None,
                                                    transform_id: None,
                                                    processing_id: None,
                                                    num_contents: num,
                                                    msg_content: json!({"agents": agents}) })
                })
                .await;
    }

    /// Loop principal: timers + despacho de eventos hasta la parada.
    pub async fn run(mut self) -> Result<()> {
        info!("{}: starting", self.name);
        let stop = self.stop.clone();

        // timers, incluido el heartbeat por defecto
        let heartbeat_ctx = self.ctx.clone();
        let heartbeat_name = self.name.clone();
        self.add_timer("health_heartbeat",
                       Duration::from_secs(self.ctx.config.heartbeat_delay),
                       move || Self::health_heartbeat(heartbeat_ctx.clone(), heartbeat_name.clone()));

        let mut timer_handles = Vec::new();
        for timer in self.timers.drain(..) {
            let stop = stop.clone();
            let name = format!("{}::{}", self.name, timer.name);
            let func = timer.func.clone();
            let delay = timer.delay;
            timer_handles.push(tokio::spawn(async move {
                                   loop {
                                       if stop.load(Ordering::SeqCst) {
                                           debug!("{name}: timer stopped");
                                           break;
                                       }
                                       func().await;
                                       tokio::time::sleep(delay).await;
                                   }
                               }));
        }

        // despacho de eventos
        let tick = Duration::from_secs(self.ctx.config.event_interval_delay.max(1));
        while !stop.load(Ordering::SeqCst) {
            for (event_type, handler) in &self.handlers {
                if self.workers.available_permits() == 0 {
                    break;
                }
                let Some(event) = self.ctx.bus.get(*event_type, 0) else {
                    continue;
                };
                let permit = self.workers
                                 .clone()
                                 .acquire_owned()
                                 .await
                                 .expect("worker semaphore closed");
                let handler = handler.clone();
                let ctx = self.ctx.clone();
                let agent = self.name.clone();
                tokio::spawn(async move {
                    let start = Utc::now().timestamp_millis();
                    let rc = handler(event.entity_id).await;
                    let end = Utc::now().timestamp_millis();
                    match rc {
                        ReturnCode::Ok => {
                            ctx.bus.clean(&event);
                            ctx.bus
                               .report(&event, "finished", start, end, &utils::hostname(), ReturnCode::Ok);
                        }
                        ReturnCode::Locked => {
                            // recurso reclamado por otro worker: reencolar
                            ctx.bus.fail(&event);
                            let mut event = event.clone();
                            event.requeue();
                            warn!("{agent}: resource locked, requeue {:?} id={}",
                                  event.event_type, event.entity_id);
                            ctx.bus.publish(event.clone());
                            ctx.bus
                               .report(&event, "locked", start, end, &utils::hostname(), ReturnCode::Locked);
                        }
                        ReturnCode::Failed => {
                            ctx.bus.fail(&event);
                            ctx.bus
                               .report(&event, "failed", start, end, &utils::hostname(), ReturnCode::Failed);
                        }
                    }
                    drop(permit);
                });
            }
            tokio::time::sleep(tick).await;
        }

        // drenar trabajo en vuelo
        info!("{}: draining workers", self.name);
        let _all = self.workers
                       .acquire_many(self.ctx.config.max_number_workers.max(1) as u32)
                       .await;
        for handle in timer_handles {
            handle.abort();
        }
        // la fila de Health propia se retira en la parada limpia
        let _ = self.ctx
                    .db(move |cat| {
                        let host = utils::hostname();
                        cat.clean_health(None, Some(&host), &[utils::pid()])?;
                        Ok(())
                    })
                    .await;
        info!("{}: stopped", self.name);
        Ok(())
    }
}
