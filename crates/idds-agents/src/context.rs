//! Contexto compartido de un agente.
//!
//! Reúne las dependencias inyectadas (catálogo, driver, resolver, bus) y
//! los helpers de ejecución: las llamadas al catálogo corren en el pool
//! blocking de tokio, y toda RPC al driver externo lleva deadline de pared.

use std::future::Future;
use std::sync::Arc;

use idds_common::error::Result;
use idds_common::{AgentConfig, IddsError};
use idds_core::catalog::Catalog;
use idds_core::event::{Event, EventBusBackend, EventType};
use idds_core::externals::{MetadataResolver, TaskDriver};

pub struct AgentContext<C: Catalog> {
    pub catalog: Arc<C>,
    pub driver: Arc<dyn TaskDriver>,
    pub resolver: Arc<dyn MetadataResolver>,
    pub bus: Arc<dyn EventBusBackend>,
    pub config: AgentConfig,
}

impl<C: Catalog> AgentContext<C> {
    pub fn new(catalog: Arc<C>,
               driver: Arc<dyn TaskDriver>,
               resolver: Arc<dyn MetadataResolver>,
               bus: Arc<dyn EventBusBackend>,
               config: AgentConfig)
               -> Arc<Self> {
        Arc::new(Self { catalog,
                        driver,
                        resolver,
                        bus,
                        config })
    }

    /// Ejecuta una operación de catálogo en el pool blocking.
    pub async fn db<T, F>(&self, f: F) -> Result<T>
        where T: Send + 'static,
              F: FnOnce(&C) -> Result<T> + Send + 'static
    {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || f(&catalog)).await
                                                        .map_err(|e| IddsError::Internal(format!("db task: {e}")))?
    }

    /// Envuelve una RPC al driver con el deadline configurado. Al vencer,
    /// la llamada devuelve error y el estado de la fila queda intacto (se
    /// reintenta en el próximo ciclo).
    pub async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.driver_call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(IddsError::DriverFailure(format!("driver call timed out after {:?}",
                                                           self.config.driver_call_timeout))),
        }
    }

    pub fn publish(&self, event_type: EventType, entity_id: i64) {
        self.bus.publish(Event::new(event_type, entity_id));
    }
}
