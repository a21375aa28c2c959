use std::path::PathBuf;

/// Process configuration, read once at startup from `FLEETD_*` environment
/// variables. Components receive this (or a snapshot of the values they
/// need) explicitly; nothing reads the environment after boot.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub db_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub ingest_host: String,
    pub ingest_port: u16,
    /// Run the ingest listener inside the main process. Disable when a
    /// standalone `fleetd ingest` process owns the listener.
    pub embed_ingest: bool,
    /// Shared secret for the admin API and restricted downloads. When unset,
    /// the admin API is only safe bound to loopback.
    pub operator_token: Option<String>,
    pub command_ttl_minutes: u32,
    pub sweep_interval_secs: u32,
    pub retention_days: u32,
    pub pool_workers: usize,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleetd")
        .join("fleetd.db")
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            api_host: "127.0.0.1".to_string(),
            api_port: 8440,
            ingest_host: "0.0.0.0".to_string(),
            ingest_port: 8449,
            embed_ingest: true,
            operator_token: None,
            command_ttl_minutes: 60,
            sweep_interval_secs: 30,
            retention_days: 60,
            pool_workers: 4,
        }
    }
}

impl FleetConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("FLEETD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            api_host: env_string("FLEETD_API_HOST", &defaults.api_host),
            api_port: env_parse("FLEETD_API_PORT", defaults.api_port),
            ingest_host: env_string("FLEETD_INGEST_HOST", &defaults.ingest_host),
            ingest_port: env_parse("FLEETD_INGEST_PORT", defaults.ingest_port),
            embed_ingest: env_string("FLEETD_EMBED_INGEST", "1") != "0",
            operator_token: std::env::var("FLEETD_OPERATOR_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            command_ttl_minutes: env_parse("FLEETD_COMMAND_TTL_MINUTES", defaults.command_ttl_minutes),
            sweep_interval_secs: env_parse("FLEETD_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            retention_days: env_parse("FLEETD_RETENTION_DAYS", defaults.retention_days),
            pool_workers: env_parse("FLEETD_POOL_WORKERS", defaults.pool_workers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_api_to_loopback() {
        let cfg = FleetConfig::default();
        assert_eq!(cfg.api_host, "127.0.0.1");
        assert_eq!(cfg.api_port, 8440);
    }

    #[test]
    fn defaults_expose_ingest_on_all_interfaces() {
        let cfg = FleetConfig::default();
        assert_eq!(cfg.ingest_host, "0.0.0.0");
        assert_eq!(cfg.ingest_port, 8449);
        assert!(cfg.embed_ingest);
    }

    #[test]
    fn default_pool_is_small_and_fixed() {
        let cfg = FleetConfig::default();
        assert_eq!(cfg.pool_workers, 4);
    }
}
