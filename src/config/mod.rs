//! Engine configuration: CLI/env overrides over a `config.toml` file over
//! built-in defaults, the same three-tier priority the teacher's
//! `DaemonConfig` uses.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::error;

const DEFAULT_HTTP_PORT: u16 = 4310;
const DEFAULT_DEFAULT_MAX_RETRIES: i64 = 3;
const DEFAULT_LEASE_DURATION_MINUTES: i64 = 10;
const DEFAULT_REAPER_INTERVAL_MINUTES: i64 = 1;
const DEFAULT_SESSION_TTL_MINUTES: i64 = 60;

/// `{data_dir}/config.toml` — every field is an optional override.
/// Priority: CLI / env  >  TOML  >  built-in default.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    /// HTTP shell listen port (default: 4310).
    http_port: Option<u16>,
    /// Log filter string passed to `tracing_subscriber::EnvFilter`
    /// (default: "info").
    log: Option<String>,
    /// Default `maxRetries` for new task types when not specified explicitly.
    default_max_retries: Option<i64>,
    /// Default `leaseDurationMinutes` for new task types.
    default_lease_duration_minutes: Option<i64>,
    /// Default reaper sweep interval for new projects.
    default_reaper_interval_minutes: Option<i64>,
    /// How long an HTTP session token stays valid.
    session_ttl_minutes: Option<i64>,
    /// Use the in-memory backend instead of SQLite — for local smoke testing.
    in_memory: Option<bool>,
    /// Bearer token the HTTP shell requires on every request. Empty/absent
    /// disables auth entirely.
    api_token: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub http_port: u16,
    pub log: String,
    pub default_max_retries: i64,
    pub default_lease_duration_minutes: i64,
    pub default_reaper_interval_minutes: i64,
    pub session_ttl_minutes: i64,
    pub in_memory: bool,
    pub api_token: Option<String>,
}

impl EngineConfig {
    /// Build config from CLI/env args plus an optional TOML file found under
    /// `data_dir`.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI flag (passed as `Some(value)`)
    ///   2. `QUESTLOAD_*` environment variable
    ///   3. `{data_dir}/config.toml`
    ///   4. Built-in default
    pub fn new(data_dir: Option<PathBuf>, http_port: Option<u16>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let http_port = http_port
            .or_else(|| env_parse("QUESTLOAD_HTTP_PORT"))
            .or(toml.http_port)
            .unwrap_or(DEFAULT_HTTP_PORT);

        let log = log
            .or_else(|| std::env::var("QUESTLOAD_LOG").ok())
            .or(toml.log)
            .unwrap_or_else(|| "info".to_string());

        let default_max_retries = toml
            .default_max_retries
            .unwrap_or(DEFAULT_DEFAULT_MAX_RETRIES);
        let default_lease_duration_minutes = toml
            .default_lease_duration_minutes
            .unwrap_or(DEFAULT_LEASE_DURATION_MINUTES);
        let default_reaper_interval_minutes = toml
            .default_reaper_interval_minutes
            .unwrap_or(DEFAULT_REAPER_INTERVAL_MINUTES);
        let session_ttl_minutes = toml
            .session_ttl_minutes
            .unwrap_or(DEFAULT_SESSION_TTL_MINUTES);
        let in_memory = toml.in_memory.unwrap_or(false)
            || std::env::var("QUESTLOAD_IN_MEMORY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

        let api_token = std::env::var("QUESTLOAD_API_TOKEN")
            .ok()
            .or(toml.api_token)
            .filter(|t| !t.is_empty());

        Self {
            data_dir,
            http_port,
            log,
            default_max_retries,
            default_lease_duration_minutes,
            default_reaper_interval_minutes,
            session_ttl_minutes,
            in_memory,
            api_token,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("questload");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("questload");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("questload");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("questload");
        }
    }
    PathBuf::from(".questload")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_toml_or_env() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::new(Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(cfg.log, "info");
        assert_eq!(cfg.default_max_retries, DEFAULT_DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn explicit_args_beat_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "http_port = 9000\n").unwrap();
        let cfg = EngineConfig::new(Some(dir.path().to_path_buf()), Some(4000), None);
        assert_eq!(cfg.http_port, 4000);
    }

    #[test]
    fn toml_beats_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "http_port = 9000\n").unwrap();
        let cfg = EngineConfig::new(Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.http_port, 9000);
    }
}
