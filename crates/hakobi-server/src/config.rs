//! Server configuration: TOML file plus environment overrides.
//!
//! The engine sections live in `hakobi_core::config`; this file adds the
//! process-level concerns (database, HTTP, object-store backend, logging).

use std::path::Path;

use serde::Deserialize;

use hakobi_core::config::EngineConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    /// 0 means "derive from worker concurrency".
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 0,
            acquire_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Database export function invoked once per unit.
    pub function: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            function: "export_rows".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// `s3`, `local`, or `memory`.
    pub kind: String,
    /// Root directory for the `local` backend.
    pub root: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            kind: "s3".to_string(),
            root: "./artifacts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerTuning {
    /// Poller tasks in this process, each with its own worker identity.
    pub pollers: usize,
}

impl Default for ServerTuning {
    fn default() -> Self {
        Self { pollers: 1 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
    pub source: SourceConfig,
    pub object_store: ObjectStoreConfig,
    pub server: ServerTuning,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// Load from a TOML file (all keys optional), then apply env overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("failed to read config file {}: {e}", path.display())
                })?;
                toml::from_str(&content)
                    .map_err(|e| anyhow::anyhow!("failed to parse config file: {e}"))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment takes precedence over file values for deploy-sensitive
    /// settings:
    /// - `HAKOBI_DATABASE_URL`
    /// - `HAKOBI_HTTP_ADDR`
    /// - `HAKOBI_LOG_LEVEL`
    /// - `HAKOBI_STORAGE_BUCKET`
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HAKOBI_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(addr) = std::env::var("HAKOBI_HTTP_ADDR") {
            self.http.addr = addr;
        }
        if let Ok(level) = std::env::var("HAKOBI_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(bucket) = std::env::var("HAKOBI_STORAGE_BUCKET") {
            self.engine.storage.bucket = bucket;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;
        if self.database.url.is_empty() {
            anyhow::bail!("database.url is required (or set HAKOBI_DATABASE_URL)");
        }
        if self.server.pollers == 0 {
            anyhow::bail!("server.pollers must be > 0");
        }
        match self.object_store.kind.as_str() {
            "s3" => {
                if self.engine.storage.bucket.is_empty() {
                    anyhow::bail!("storage.bucket is required for the s3 backend");
                }
            }
            "local" | "memory" => {}
            other => anyhow::bail!("unknown object_store.kind {other:?}"),
        }
        Ok(())
    }

    /// Pool must cover every in-flight unit plus its export stream; see the
    /// documented `max_in_flight * 2` floor.
    pub fn pool_size(&self) -> u32 {
        if self.database.max_connections > 0 {
            return self.database.max_connections;
        }
        let per_poller = self.engine.worker.max_in_flight as u32 * 2;
        (per_poller * self.server.pollers as u32).max(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.http.addr, "0.0.0.0:8080");
        assert_eq!(config.engine.worker.max_in_flight, 4);
        assert_eq!(config.engine.reuse.days, 7);
    }

    #[test]
    fn engine_sections_flatten_into_the_file() {
        let config: ServerConfig = toml::from_str(
            r#"
            timezone = "+09:00"

            [database]
            url = "postgres://localhost/hakobi"

            [worker]
            max_in_flight = 8
            lease_seconds = 120

            [retry]
            max_attempts = 3

            [storage]
            base_path = "exports"
            bucket = "hakobi-artifacts"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.worker.max_in_flight, 8);
        assert_eq!(config.engine.retry.max_attempts, 3);
        assert_eq!(config.engine.storage.bucket, "hakobi-artifacts");
        config.validate().unwrap();
    }

    #[test]
    fn pool_size_floors_at_twice_in_flight() {
        let config: ServerConfig = toml::from_str(
            r#"
            [database]
            url = "postgres://localhost/hakobi"

            [worker]
            max_in_flight = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.pool_size(), 32);
    }
}
