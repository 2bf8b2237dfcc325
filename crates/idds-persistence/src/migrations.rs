//! Wrapper para correr migraciones embebidas.

use diesel::pg::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use idds_common::IddsError;

// Directorio esperado: `migrations/` en este crate.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub fn run_pending_migrations(conn: &mut PgConnection) -> Result<(), IddsError> {
    conn.run_pending_migrations(MIGRATIONS)
        .map(|_| ())
        .map_err(|e| IddsError::Internal(format!("migration error: {e}")))
}
