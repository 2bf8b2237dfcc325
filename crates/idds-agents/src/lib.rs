//! idds-agents: el plano de control.
//!
//! Tres agentes avanzan los ciclos de vida sobre el catálogo compartido:
//! - `Clerk`: Requests — expande el workflow en Transforms y agrega el
//!   estado de vuelta.
//! - `Transformer`: Transforms — materializa colecciones y contents, crea el
//!   único Processing activo.
//! - `Carrier`: Processings — somete/pollea/mata la task externa y
//!   reconcilia el estado por content.
//!
//! El `runtime` provee el esqueleto común: pool de workers acotado, tareas
//! de timer, despacho de eventos con la convención `ReturnCode::Locked`,
//! heartbeat de salud y parada ordenada. Los ciclos de cada agente son
//! métodos públicos para poder manejarlos paso a paso en tests.

pub mod carrier;
pub mod clerk;
pub mod context;
pub mod runtime;
pub mod transformer;

pub use carrier::Carrier;
pub use clerk::Clerk;
pub use context::AgentContext;
pub use runtime::AgentRuntime;
pub use transformer::Transformer;
