//! Fila de Health: vida de los workers de agente.

use chrono::{DateTime, Utc};

/// Liveness por `(agent, hostname, pid, thread_id)`. Las filas más viejas
/// que 2x el heartbeat, o de pids muertos en el mismo host, se purgan.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub health_id: i64,
    pub agent: String,
    pub hostname: String,
    pub pid: i32,
    pub thread_id: i64,
    pub thread_name: Option<String>,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
