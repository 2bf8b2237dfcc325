//! Mapeo de errores Diesel/pool a la taxonomía común.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use log::warn;

use idds_common::IddsError;

pub fn map_diesel_error(err: DieselError) -> IddsError {
    match err {
        DieselError::NotFound => IddsError::NotFound("row not found".into()),
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::UniqueViolation => IddsError::Duplicated(info.message().to_string()),
            DatabaseErrorKind::SerializationFailure => {
                IddsError::ConnectionFailure(format!("serialization conflict: {}", info.message()))
            }
            DatabaseErrorKind::ClosedConnection => {
                IddsError::ConnectionFailure(format!("closed connection: {}", info.message()))
            }
            other => IddsError::Internal(format!("db error kind {:?}: {}", other, info.message())),
        },
        DieselError::BrokenTransactionManager => IddsError::ConnectionFailure("broken transaction manager".into()),
        other => IddsError::Internal(format!("diesel: {other}")),
    }
}

/// Retry acotado con backoff pequeño para errores transitorios de DB.
///
/// Política: 3 intentos, 15/30/45 ms. No altera semántica de negocio.
pub fn with_retry<F, T>(mut f: F) -> Result<T, IddsError>
    where F: FnMut() -> Result<T, IddsError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if e.is_retryable() && attempts < 3 => {
                let delay_ms = 15 * (attempts + 1) as u64;
                warn!("retryable db error (attempt {}): {e} -> sleeping {delay_ms}ms", attempts + 1);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}
