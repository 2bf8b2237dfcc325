//! Backend local del bus de eventos.
//!
//! Contrato:
//! - `publish` encola al final del tipo; si ya hay una copia sin reconocer
//!   para la misma `(tipo, entidad)` la publicación se coalesce (queda una).
//! - `get` entrega FIFO dentro del tipo, salteando eventos cuyo
//!   `available_at` todavía no llegó.
//! - `clean`/`fail` reconocen el evento (éxito / fracaso); tras cualquiera
//!   de los dos una nueva publicación de la misma entidad vuelve a entrar.
//! - `report` es un hook de observabilidad; el backend local sólo loguea.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use log::debug;

use idds_common::ReturnCode;

use super::types::{Event, EventType};

pub trait EventBusBackend: Send + Sync {
    fn publish(&self, event: Event);

    /// Próximo evento del tipo, si hay uno elegible. `wait_ms` es el tope
    /// de espera para backends bloqueantes; el backend local devuelve de
    /// inmediato.
    fn get(&self, event_type: EventType, wait_ms: u64) -> Option<Event>;

    /// Reconoce un evento procesado con éxito.
    fn clean(&self, event: &Event);

    /// Reconoce un evento fallido; el emisor decide si re-publicarlo.
    fn fail(&self, event: &Event);

    fn report(&self, event: &Event, status: &str, start_ms: i64, end_ms: i64, host: &str, ret: ReturnCode);
}

#[derive(Default)]
struct BusInner {
    queues: HashMap<EventType, VecDeque<Event>>,
    /// `(tipo, entidad)` con copia encolada o en vuelo, para coalescing.
    unacked: HashSet<(EventType, i64)>,
}

/// Backend in-process por defecto.
#[derive(Default)]
pub struct LocalEventBus {
    inner: Mutex<BusInner>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cantidad de eventos encolados de un tipo (diagnóstico/tests).
    pub fn queued(&self, event_type: EventType) -> usize {
        let inner = self.inner.lock().expect("event bus poisoned");
        inner.queues.get(&event_type).map(|q| q.len()).unwrap_or(0)
    }
}

impl EventBusBackend for LocalEventBus {
    fn publish(&self, event: Event) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let key = (event.event_type, event.entity_id);
        if inner.unacked.contains(&key) {
            debug!("event coalesced: {:?} id={}", event.event_type, event.entity_id);
            return;
        }
        inner.unacked.insert(key);
        inner.queues.entry(event.event_type).or_default().push_back(event);
    }

    fn get(&self, event_type: EventType, _wait_ms: u64) -> Option<Event> {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let queue = inner.queues.get_mut(&event_type)?;
        let now = Utc::now();
        let pos = queue.iter().position(|e| e.available_at <= now)?;
        queue.remove(pos)
    }

    fn clean(&self, event: &Event) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.unacked.remove(&(event.event_type, event.entity_id));
    }

    fn fail(&self, event: &Event) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.unacked.remove(&(event.event_type, event.entity_id));
    }

    fn report(&self, event: &Event, status: &str, start_ms: i64, end_ms: i64, host: &str, ret: ReturnCode) {
        debug!("event report: type={:?} id={} status={} host={} rc={:?} elapsed_ms={}",
               event.event_type,
               event.entity_id,
               status,
               host,
               ret,
               end_ms - start_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_within_type() {
        let bus = LocalEventBus::new();
        bus.publish(Event::new(EventType::NewRequest, 1));
        bus.publish(Event::new(EventType::NewRequest, 2));
        assert_eq!(bus.get(EventType::NewRequest, 0).unwrap().entity_id, 1);
        assert_eq!(bus.get(EventType::NewRequest, 0).unwrap().entity_id, 2);
        assert!(bus.get(EventType::NewRequest, 0).is_none());
    }

    #[test]
    fn coalesces_unacked_duplicates() {
        let bus = LocalEventBus::new();
        bus.publish(Event::new(EventType::UpdateTransform, 7));
        bus.publish(Event::new(EventType::UpdateTransform, 7));
        assert_eq!(bus.queued(EventType::UpdateTransform), 1);

        // en vuelo (get sin clean) sigue coalesceando
        let ev = bus.get(EventType::UpdateTransform, 0).unwrap();
        bus.publish(Event::new(EventType::UpdateTransform, 7));
        assert_eq!(bus.queued(EventType::UpdateTransform), 0);

        // tras clean, se acepta de nuevo
        bus.clean(&ev);
        bus.publish(Event::new(EventType::UpdateTransform, 7));
        assert_eq!(bus.queued(EventType::UpdateTransform), 1);
    }

    #[test]
    fn requeued_event_waits_for_backoff() {
        let bus = LocalEventBus::new();
        let mut ev = Event::new(EventType::UpdateProcessing, 3);
        ev.requeue();
        bus.publish(ev);
        // available_at quedó en el futuro: todavía no elegible
        assert!(bus.get(EventType::UpdateProcessing, 0).is_none());
        assert_eq!(bus.queued(EventType::UpdateProcessing), 1);
    }
}
