//! Taxonomía de errores compartida.
//!
//! Los agentes atrapan en el tope del handler: el error se registra sobre la
//! fila de la entidad y el lock se libera; ningún error escapa del pool de
//! workers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IddsError {
    /// Forma de petición inválida o parámetro requerido ausente. Visible al
    /// usuario, nunca se reintenta.
    #[error("validation error: {0}")]
    Validation(String),

    /// Entidad inexistente. Visible en REST; no-op dentro de los agentes.
    #[error("no object found: {0}")]
    NotFound(String),

    /// Colisión de constraint único; tratada como éxito en inserts
    /// idempotentes.
    #[error("duplicated object: {0}")]
    Duplicated(String),

    /// IO transitorio hacia la base de datos o el driver; se reintenta con
    /// backoff acotado.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// El workload manager externo devolvió un código de error.
    #[error("driver failure: {0}")]
    DriverFailure(String),

    /// La fila está reclamada por otro worker; el evento se reencola.
    #[error("lock conflict: {0}")]
    LockConflict(String),

    /// Excepción inesperada en un handler; la entidad se marca Failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IddsError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal(err.to_string())
    }

    /// Errores que vale la pena reintentar con backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailure(_) | Self::LockConflict(_))
    }
}

impl From<serde_json::Error> for IddsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json codec: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, IddsError>;
