//! idds-common: constantes, errores y configuración compartidos.
//!
//! Este crate no contiene lógica de orquestación: sólo los contratos
//! transversales que el resto del workspace comparte.
//!
//! - `constants`: enums de estado/tipo/relación para cada entidad, con su
//!   valor entero estable para columnas de base de datos.
//! - `error`: taxonomía `IddsError` usada por catálogo, agentes y drivers.
//! - `config`: carga de configuración desde variables de entorno (.env).
//! - `utils`: helpers de host/pid usados por el heartbeat de salud.

pub mod config;
pub mod constants;
pub mod error;
pub mod utils;

pub use config::{init_dotenv, AgentConfig, DbConfig};
pub use constants::*;
pub use error::IddsError;
