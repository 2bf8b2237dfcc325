//! Carga de configuración desde variables de entorno.
//!
//! Convención `.env` cargada una sola vez; cada agente recibe un
//! `AgentConfig` ya resuelto (sección por agente vía prefijo, p.ej.
//! `IDDS_CLERK_POLL_TIME_PERIOD`), con fallback al valor global
//! `IDDS_POLL_TIME_PERIOD` y por último al default.

use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

/// Forzar carga temprana de .env desde binarios externos si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

fn lookup(section: &str, option: &str) -> Option<String> {
    let scoped = format!("IDDS_{}_{}", section.to_uppercase(), option.to_uppercase());
    let global = format!("IDDS_{}", option.to_uppercase());
    env::var(scoped).or_else(|_| env::var(global)).ok()
}

fn parse_or<T: std::str::FromStr>(section: &str, option: &str, default: T) -> T {
    lookup(section, option).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Configuración de un agente (sección + opciones reconocidas en spec §6).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub section: String,
    /// Segundos entre filas de Health; el reaping usa 2x este valor.
    pub heartbeat_delay: u64,
    /// Segundos entre polls de estado.
    pub poll_time_period: u64,
    /// Máximo de filas por listado.
    pub retrieve_bulk_size: usize,
    /// Tamaño del pool de workers.
    pub max_number_workers: usize,
    /// Tick de despacho de eventos, en segundos.
    pub event_interval_delay: u64,
    /// Backoff de poll por entidad nueva.
    pub new_poll_period: Duration,
    /// Backoff de poll por entidad en curso.
    pub update_poll_period: Duration,
    /// Reintentos antes de marcar Failed (0 = sin tope).
    pub max_new_retries: u32,
    pub max_update_retries: u32,
    /// Antigüedad a partir de la cual un lock se considera huérfano.
    pub clean_locks_older_than: Duration,
    /// Deadline de pared para cada RPC al driver externo.
    pub driver_call_timeout: Duration,
}

impl AgentConfig {
    pub fn from_env(section: &str) -> Self {
        Lazy::force(&DOTENV_LOADED);
        Self { section: section.to_string(),
               heartbeat_delay: parse_or(section, "heartbeat_delay", 600),
               poll_time_period: parse_or(section, "poll_time_period", 10),
               retrieve_bulk_size: parse_or(section, "retrieve_bulk_size", 10),
               max_number_workers: parse_or(section, "max_number_workers", 3),
               event_interval_delay: parse_or(section, "event_interval_delay", 1),
               new_poll_period: Duration::from_secs(parse_or(section, "new_poll_period", 1)),
               update_poll_period: Duration::from_secs(parse_or(section, "update_poll_period", 10)),
               max_new_retries: parse_or(section, "max_new_retries", 3),
               max_update_retries: parse_or(section, "max_update_retries", 0),
               clean_locks_older_than: Duration::from_secs(parse_or(section, "clean_locks_older_than", 3600)),
               driver_call_timeout: Duration::from_secs(parse_or(section, "driver_call_timeout", 180)) }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_env("common")
    }
}

/// Configuración de conexión a la base de datos.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Option<Self> {
        Lazy::force(&DOTENV_LOADED);
        let url = env::var("DATABASE_URL").ok()?;
        let min_connections = env::var("DATABASE_MIN_CONNECTIONS").ok()
                                                                  .and_then(|v| v.parse().ok())
                                                                  .unwrap_or(2);
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS").ok()
                                                                  .and_then(|v| v.parse().ok())
                                                                  .unwrap_or(16);
        Some(Self { url, min_connections, max_connections })
    }
}
