//! Bus de eventos tipados in-process.
//!
//! Los eventos direccionan entidades por id; el backend local entrega FIFO
//! por tipo y coalesce publicaciones repetidas de la misma entidad mientras
//! haya una copia sin reconocer. La pérdida de eventos ante un crash se
//! tolera: el estado autoritativo está en el catálogo y los agentes
//! redescubren trabajo por polling.

mod bus;
mod types;

pub use bus::{EventBusBackend, LocalEventBus};
pub use types::{Event, EventType};
