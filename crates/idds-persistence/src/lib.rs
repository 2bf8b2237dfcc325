//! idds-persistence
//!
//! Implementación Postgres (Diesel) del `Catalog` del core, con paridad de
//! comportamiento respecto al backend en memoria: mismos filtros de listado,
//! mismo volteo atómico de locking y la misma propagación de dependencias
//! dentro de la transacción que registra la actualización fuente.
//!
//! Módulos:
//! - `pg`: `PgCatalog` sobre un pool r2d2.
//! - `schema`: tablas Diesel declaradas a mano (reemplazable con `diesel
//!   print-schema`).
//! - `rows`: structs de fila y conversiones fila ↔ registro de dominio.
//! - `migrations`: runner embebido de migraciones.
//! - `error`: mapeo de errores Diesel a la taxonomía común.

pub mod error;
pub mod migrations;
pub mod pg;
pub mod rows;
pub mod schema;

pub use pg::{build_pool, build_pool_from_env, PgCatalog, PgPool};
