//! Tipos de evento y estructura `Event`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tipo de evento por entidad y fase. FIFO garantizado sólo dentro de un
/// mismo tipo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NewRequest,
    UpdateRequest,
    NewTransform,
    UpdateTransform,
    NewProcessing,
    UpdateProcessing,
}

impl EventType {
    pub const ALL: [EventType; 6] = [EventType::NewRequest,
                                     EventType::UpdateRequest,
                                     EventType::NewTransform,
                                     EventType::UpdateTransform,
                                     EventType::NewProcessing,
                                     EventType::UpdateProcessing];
}

/// Evento direccionando una entidad por id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub entity_id: i64,
    pub payload: Value,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// No elegible para despacho antes de este instante (backoff de
    /// reencolado).
    pub available_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, entity_id: i64) -> Self {
        let now = Utc::now();
        Self { event_id: Uuid::new_v4(),
               event_type,
               entity_id,
               payload: Value::Null,
               retry_count: 0,
               created_at: now,
               available_at: now }
    }

    /// Prepara el evento para volver a la cola con backoff lineal.
    pub fn requeue(&mut self) {
        self.retry_count += 1;
        self.available_at = Utc::now() + Duration::seconds(i64::from(self.retry_count.min(60)));
    }
}
