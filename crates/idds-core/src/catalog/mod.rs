//! Catálogo: accesores tipados sobre el almacén relacional compartido.
//!
//! Contrato central de la coordinación entre procesos:
//! - Los listados por estado filtran `next_poll_at <= now` y, con
//!   `locking=true`, voltean atómicamente `locking` Idle→Locking dentro de
//!   una sola transacción, devolviendo sólo filas que estaban Idle, acotadas
//!   a `bulk_size` y ordenadas por `(priority desc, next_poll_at asc,
//!   created_at asc)`.
//! - `clean_*_locking` devuelve a Idle las filas Locking huérfanas (red de
//!   seguridad; el camino primario es que todo handler libere su lock en
//!   cada salida, incluso en fallo).
//! - Las operaciones compuestas agrupan las modificaciones multi-fila que
//!   deben verse juntas en una sola transacción; ahí vive también la
//!   propagación de dependencias (§ resolver): un substatus que entra a
//!   {Available, Missing, Failed, FinalFailed, Lost} se copia a todo Content
//!   cuyo `content_dep_id` apunte a la fila actualizada, atómicamente con la
//!   actualización fuente.
//!
//! Dos backends con paridad de comportamiento: `MemoryCatalog` (tests,
//! binario demo) y el Postgres de `idds-persistence`.

mod memory;
pub mod types;

pub use memory::MemoryCatalog;
pub use types::*;

use std::time::Duration;

use idds_common::error::Result;
use idds_common::{CommandStatus, ContentRelationType, MessageStatus, ProcessingStatus, RequestStatus,
                  TransformStatus};

use crate::models::{CollectionRecord, CommandRecord, ContentExtRecord, ContentRecord, HealthRecord, MessageRecord,
                    ProcessingRecord, RequestRecord, TransformRecord};

pub trait Catalog: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // requests
    // ------------------------------------------------------------------

    fn add_request(&self, request: NewRequest) -> Result<i64>;

    fn get_request(&self, request_id: i64) -> Result<RequestRecord>;

    fn get_requests_by_status(&self,
                              status: &[RequestStatus],
                              by_substatus: bool,
                              locking: bool,
                              bulk_size: usize)
                              -> Result<Vec<RequestRecord>>;

    fn update_request(&self, request_id: i64, update: RequestUpdate) -> Result<()>;

    /// Update de request + altas de transforms (con sus colecciones) +
    /// updates de transforms, en una transacción. Devuelve los ids creados.
    /// El `work_id` de cada instancia se parchea en la mitad dinámica del
    /// request dentro de la misma transacción.
    fn update_request_with_transforms(&self,
                                      request_id: i64,
                                      update: RequestUpdate,
                                      new_transforms: Vec<NewTransform>,
                                      update_transforms: Vec<(i64, TransformUpdate)>)
                                      -> Result<Vec<i64>>;

    fn clean_request_locking(&self, older_than: Duration) -> Result<usize>;

    /// Borra el request y todo lo que posee (transforms, colecciones,
    /// contents, processings, mensajes asociados).
    fn delete_request_cascade(&self, request_id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // transforms
    // ------------------------------------------------------------------

    fn get_transform(&self, transform_id: i64) -> Result<TransformRecord>;

    fn get_transforms_by_request(&self, request_id: i64) -> Result<Vec<TransformRecord>>;

    fn get_transforms_by_status(&self,
                                status: &[TransformStatus],
                                locking: bool,
                                bulk_size: usize)
                                -> Result<Vec<TransformRecord>>;

    fn update_transform(&self, transform_id: i64, update: TransformUpdate) -> Result<()>;

    /// Operación compuesta del ciclo del Transformer (ver `TransformOutputs`).
    /// Devuelve el processing creado, si lo hubo.
    fn add_transform_outputs(&self,
                             transform_id: i64,
                             update: TransformUpdate,
                             outputs: TransformOutputs)
                             -> Result<Option<i64>>;

    fn clean_transform_locking(&self, older_than: Duration) -> Result<usize>;

    // ------------------------------------------------------------------
    // processings
    // ------------------------------------------------------------------

    fn get_processing(&self, processing_id: i64) -> Result<ProcessingRecord>;

    /// Processing no terminal del transform, si existe (a lo sumo uno).
    fn get_active_processing_by_transform(&self, transform_id: i64) -> Result<Option<ProcessingRecord>>;

    /// Todos los processings del transform (histórico incluido).
    fn get_processings_by_transform(&self, transform_id: i64) -> Result<Vec<ProcessingRecord>>;

    fn get_processings_by_status(&self,
                                 status: &[ProcessingStatus],
                                 locking: bool,
                                 bulk_size: usize)
                                 -> Result<Vec<ProcessingRecord>>;

    fn update_processing(&self, processing_id: i64, update: ProcessingUpdate) -> Result<()>;

    /// Update del processing + updates masivos de contents + propagación de
    /// dependencias, en una transacción. Devuelve cuántos contents
    /// dependientes recibieron el substatus propagado.
    fn update_processing_with_contents(&self,
                                       processing_id: i64,
                                       update: ProcessingUpdate,
                                       content_updates: Vec<ContentUpdate>,
                                       messages: Vec<NewMessage>)
                                       -> Result<usize>;

    fn clean_processing_locking(&self, older_than: Duration) -> Result<usize>;

    // ------------------------------------------------------------------
    // collections
    // ------------------------------------------------------------------

    fn get_collection(&self, coll_id: i64) -> Result<CollectionRecord>;

    fn get_collections_by_transform(&self, transform_id: i64) -> Result<Vec<CollectionRecord>>;

    fn update_collection(&self, coll_id: i64, update: CollectionUpdate) -> Result<()>;

    // ------------------------------------------------------------------
    // contents
    // ------------------------------------------------------------------

    /// Alta masiva; las colisiones de la clave única se registran y se
    /// tratan como éxito (inserts idempotentes). Devuelve cuántas filas
    /// nuevas entraron.
    fn add_contents(&self, contents: Vec<NewContent>) -> Result<usize>;

    fn get_contents_by_transform(&self, transform_id: i64) -> Result<Vec<ContentRecord>>;

    fn get_contents_by_coll(&self, coll_id: i64) -> Result<Vec<ContentRecord>>;

    /// Content por colección+nombre+relación (resolución de dependencias).
    fn get_content_by_coll_name(&self,
                                coll_id: i64,
                                name: &str,
                                relation_type: ContentRelationType)
                                -> Result<Option<ContentRecord>>;

    fn update_contents(&self, updates: Vec<ContentUpdate>) -> Result<()>;

    // contents_ext: espejo de detalle de jobs externos
    fn add_contents_ext(&self, items: Vec<ContentExtRecord>) -> Result<()>;

    fn get_contents_ext_by_transform(&self, transform_id: i64) -> Result<Vec<ContentExtRecord>>;

    // ------------------------------------------------------------------
    // messages
    // ------------------------------------------------------------------

    fn add_message(&self, message: NewMessage) -> Result<i64>;

    fn retrieve_messages(&self, filter: MessageFilter) -> Result<Vec<MessageRecord>>;

    fn update_messages_status(&self, msg_ids: &[i64], status: MessageStatus) -> Result<()>;

    // ------------------------------------------------------------------
    // health
    // ------------------------------------------------------------------

    fn add_health_item(&self, item: HealthItem) -> Result<()>;

    fn get_health_items(&self) -> Result<Vec<HealthRecord>>;

    /// Purga por antigüedad y/o por pids muertos de un host.
    fn clean_health(&self, older_than: Option<Duration>, hostname: Option<&str>, pids: &[i32]) -> Result<usize>;

    // ------------------------------------------------------------------
    // commands
    // ------------------------------------------------------------------

    fn add_command(&self, command: NewCommand) -> Result<i64>;

    fn get_commands_by_status(&self, status: CommandStatus, locking: bool, bulk_size: usize)
                              -> Result<Vec<CommandRecord>>;

    fn update_command(&self, cmd_id: i64, update: CommandUpdate) -> Result<()>;
}
