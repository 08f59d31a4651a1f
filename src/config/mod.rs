//! `CoreConfig` — priority-layered configuration for the collaboration core.
//!
//! Priority (highest to lowest): CLI / env var > `{data_dir}/config.toml` >
//! built-in default. Mirrors the layering the rest of this family of
//! daemons uses for its own `DaemonConfig`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_WS_PORT: u16 = 8443;
const DEFAULT_REST_PORT: u16 = 8080;
/// Default inactivity grace period before an idle session is reaped —
/// resolves the "15 minutes... or configurable" ambiguity in spec.md §9.
const DEFAULT_SESSION_GRACE_SECS: u64 = 15 * 60;
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 128;
const DEFAULT_CAS_RETRY_LIMIT: u32 = 3;
const DEFAULT_MAX_CONNECTIONS_PER_MIN: usize = 30;
const DEFAULT_MAX_MESSAGES_PER_SEC: u32 = 50;

#[derive(Deserialize, Default)]
struct TomlConfig {
    host: Option<String>,
    ws_port: Option<u16>,
    rest_port: Option<u16>,
    log: Option<String>,
    session_grace_secs: Option<u64>,
    outbound_queue_capacity: Option<usize>,
    cas_retry_limit: Option<u32>,
    max_connections_per_min: Option<usize>,
    max_messages_per_sec: Option<u32>,
    database_url: Option<String>,
}

fn load_toml(data_dir: &Path) -> TomlConfig {
    let path = data_dir.join("config.toml");
    match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            TomlConfig::default()
        }),
        Err(_) => TomlConfig::default(),
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub host: String,
    pub ws_port: u16,
    pub rest_port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// How long a session may sit with zero participants before it is
    /// reaped (spec.md §3 "Lifecycles").
    pub session_grace: std::time::Duration,
    /// Bounded capacity of each participant's outbound queue (spec.md §4.6).
    pub outbound_queue_capacity: usize,
    /// Bounded CAS retry count inside `UpdateCoordinator::apply` (spec.md §4.3).
    pub cas_retry_limit: u32,
    pub max_connections_per_min: usize,
    pub max_messages_per_sec: u32,
    pub database_url: String,
}

impl CoreConfig {
    pub fn new(
        host: Option<String>,
        ws_port: Option<u16>,
        rest_port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        session_grace_secs: Option<u64>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir);

        let host = host.or(toml.host).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let ws_port = ws_port.or(toml.ws_port).unwrap_or(DEFAULT_WS_PORT);
        let rest_port = rest_port.or(toml.rest_port).unwrap_or(DEFAULT_REST_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let session_grace_secs = std::env::var("TMCORE_SESSION_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(session_grace_secs)
            .or(toml.session_grace_secs)
            .unwrap_or(DEFAULT_SESSION_GRACE_SECS);

        let outbound_queue_capacity = toml
            .outbound_queue_capacity
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY);
        let cas_retry_limit = toml.cas_retry_limit.unwrap_or(DEFAULT_CAS_RETRY_LIMIT);
        let max_connections_per_min = toml
            .max_connections_per_min
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_MIN);
        let max_messages_per_sec = toml
            .max_messages_per_sec
            .unwrap_or(DEFAULT_MAX_MESSAGES_PER_SEC);

        let database_url = std::env::var("TMCORE_DATABASE_URL")
            .ok()
            .or(toml.database_url)
            .unwrap_or_else(|| {
                format!("sqlite://{}?mode=rwc", data_dir.join("tmcore.db").display())
            });

        Self {
            host,
            ws_port,
            rest_port,
            data_dir,
            log,
            session_grace: std::time::Duration::from_secs(session_grace_secs),
            outbound_queue_capacity,
            cas_retry_limit,
            max_connections_per_min,
            max_messages_per_sec,
            database_url,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("tmcore");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("tmcore");
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("tmcore");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("tmcore");
        }
    }
    PathBuf::from(".tmcore")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CoreConfig::new(None, None, None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.ws_port, DEFAULT_WS_PORT);
        assert_eq!(
            cfg.session_grace,
            std::time::Duration::from_secs(DEFAULT_SESSION_GRACE_SECS)
        );
    }

    #[test]
    fn explicit_override_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CoreConfig::new(
            None,
            Some(9999),
            None,
            Some(dir.path().to_path_buf()),
            None,
            Some(60),
        );
        assert_eq!(cfg.ws_port, 9999);
        assert_eq!(cfg.session_grace, std::time::Duration::from_secs(60));
    }
}
