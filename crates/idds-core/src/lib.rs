//! idds-core: modelos de entidad, motor de workflow, bus de eventos y el
//! contrato de catálogo sobre el almacén relacional compartido.
//!
//! Propósito:
//! - Proveer los contratos neutrales que los agentes (Clerk, Transformer,
//!   Carrier) orquestan: ningún módulo de este crate hace IO por sí mismo.
//! - El `Catalog` es la única fuente de verdad; el bus de eventos sólo
//!   acelera el despacho dentro de un proceso (la pérdida de eventos se
//!   tolera porque los agentes redescubren trabajo por polling).
//!
//! Componentes principales:
//! - `models`: registros por entidad + codecs del split estático/dinámico
//!   (workflow/work/processing) entre columnas `*_metadata` y
//!   `running_metadata`.
//! - `workflow`: DAG de Works con condiciones etiquetadas, generación de
//!   mapas input→output y agregación de estado; función pura de su estado.
//! - `event`: eventos tipados por entidad y backend local FIFO con
//!   coalescing por (tipo, id).
//! - `catalog`: trait de accesores tipados (listado con select-and-lock,
//!   operaciones compuestas transaccionales, propagación de dependencias) y
//!   su backend en memoria con paridad de comportamiento.
//! - `externals`: traits del driver de workload y del resolver de metadata
//!   de datasets.

pub mod catalog;
pub mod event;
pub mod externals;
pub mod models;
pub mod workflow;

pub use catalog::{Catalog, MemoryCatalog};
pub use event::{Event, EventBusBackend, EventType, LocalEventBus};
pub use externals::{DatasetMeta, JobInfo, MetadataResolver, TaskDetails, TaskDriver};
pub use models::{CollectionRecord, CommandRecord, ContentRecord, HealthRecord, MessageRecord, ProcessingRecord,
                 RequestRecord, TransformRecord};
pub use workflow::{ConditionTrigger, Work, WorkCondition, WorkData, Workflow, WorkflowData};
