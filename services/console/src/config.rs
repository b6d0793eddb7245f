//! Console service configuration.
//!
//! Values come from `CONSOLE_*` environment variables; a YAML file named by
//! `CONSOLE_CONFIG` overrides any field it sets.
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:8443";
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_CHANGE_RETENTION: usize = 10_000;
pub const DEFAULT_CONVERGENCE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CURSOR_IDLE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DIGEST_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_MIRROR_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_PG_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_PG_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PG_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl PostgresConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_PG_MAX_CONNECTIONS,
            connect_timeout_ms: DEFAULT_PG_CONNECT_TIMEOUT_MS,
            acquire_timeout_ms: DEFAULT_PG_ACQUIRE_TIMEOUT_MS,
        }
    }
}

/// Where the orchestration API lives. Without one the console serves reads only.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    pub change_retention: usize,
    pub convergence_timeout: Duration,
    pub cursor_idle_timeout: Duration,
    pub orchestrator: Option<OrchestratorConfig>,
    pub digest_interval: Duration,
    pub mirror_interval: Duration,
    pub admin_user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConsoleConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    storage: Option<String>,
    postgres_url: Option<String>,
    postgres_max_connections: Option<u32>,
    change_retention: Option<usize>,
    convergence_timeout_ms: Option<u64>,
    cursor_idle_timeout_ms: Option<u64>,
    orchestrator_url: Option<String>,
    orchestrator_token: Option<String>,
    digest_interval_secs: Option<u64>,
    mirror_interval_secs: Option<u64>,
    admin_user: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse().with_context(|| format!("parse {key}")),
        Err(_) => Ok(default),
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl ConsoleConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_or("CONSOLE_BIND", DEFAULT_BIND)
            .parse()
            .with_context(|| "parse CONSOLE_BIND")?;
        let metrics_bind = env_or("CONSOLE_METRICS_BIND", DEFAULT_METRICS_BIND)
            .parse()
            .with_context(|| "parse CONSOLE_METRICS_BIND")?;
        let storage = env_or("CONSOLE_STORAGE", "memory")
            .parse()
            .with_context(|| "parse CONSOLE_STORAGE")?;
        let postgres = std::env::var("CONSOLE_POSTGRES_URL")
            .ok()
            .and_then(non_empty)
            .map(PostgresConfig::with_url);
        let orchestrator = std::env::var("CONSOLE_ORCHESTRATOR_URL")
            .ok()
            .and_then(non_empty)
            .map(|base_url| OrchestratorConfig {
                base_url,
                token: std::env::var("CONSOLE_ORCHESTRATOR_TOKEN")
                    .ok()
                    .and_then(non_empty),
            });
        Ok(Self {
            bind_addr,
            metrics_bind,
            storage,
            postgres,
            change_retention: env_parsed("CONSOLE_CHANGE_RETENTION", DEFAULT_CHANGE_RETENTION)?,
            convergence_timeout: Duration::from_millis(env_parsed(
                "CONSOLE_CONVERGENCE_TIMEOUT_MS",
                DEFAULT_CONVERGENCE_TIMEOUT_MS,
            )?),
            cursor_idle_timeout: Duration::from_millis(env_parsed(
                "CONSOLE_CURSOR_IDLE_TIMEOUT_MS",
                DEFAULT_CURSOR_IDLE_TIMEOUT_MS,
            )?),
            orchestrator,
            digest_interval: Duration::from_secs(env_parsed(
                "CONSOLE_DIGEST_INTERVAL_SECS",
                DEFAULT_DIGEST_INTERVAL_SECS,
            )?),
            mirror_interval: Duration::from_secs(env_parsed(
                "CONSOLE_MIRROR_INTERVAL_SECS",
                DEFAULT_MIRROR_INTERVAL_SECS,
            )?),
            admin_user: std::env::var("CONSOLE_ADMIN_USER").ok().and_then(non_empty),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CONSOLE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CONSOLE_CONFIG: {path}"))?;
            let override_cfg: ConsoleConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse console config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, cfg: ConsoleConfigOverride) -> Result<()> {
        if let Some(value) = cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = cfg.storage {
            self.storage = value.parse().with_context(|| "parse storage")?;
        }
        if let Some(url) = cfg.postgres_url {
            self.postgres = Some(PostgresConfig::with_url(url));
        }
        if let Some(max) = cfg.postgres_max_connections {
            let pg = self
                .postgres
                .as_mut()
                .context("postgres_max_connections set without a postgres url")?;
            pg.max_connections = max;
        }
        if let Some(value) = cfg.change_retention {
            self.change_retention = value;
        }
        if let Some(ms) = cfg.convergence_timeout_ms {
            self.convergence_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = cfg.cursor_idle_timeout_ms {
            self.cursor_idle_timeout = Duration::from_millis(ms);
        }
        if let Some(base_url) = cfg.orchestrator_url {
            let token = self.orchestrator.take().and_then(|existing| existing.token);
            self.orchestrator = Some(OrchestratorConfig { base_url, token });
        }
        if let Some(token) = cfg.orchestrator_token {
            let orchestrator = self
                .orchestrator
                .as_mut()
                .context("orchestrator_token set without an orchestrator url")?;
            orchestrator.token = Some(token);
        }
        if let Some(secs) = cfg.digest_interval_secs {
            self.digest_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = cfg.mirror_interval_secs {
            self.mirror_interval = Duration::from_secs(secs);
        }
        if let Some(user) = cfg.admin_user {
            self.admin_user = non_empty(user);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const KEYS: &[&str] = &[
        "CONSOLE_BIND",
        "CONSOLE_METRICS_BIND",
        "CONSOLE_STORAGE",
        "CONSOLE_POSTGRES_URL",
        "CONSOLE_CHANGE_RETENTION",
        "CONSOLE_CONVERGENCE_TIMEOUT_MS",
        "CONSOLE_CURSOR_IDLE_TIMEOUT_MS",
        "CONSOLE_ORCHESTRATOR_URL",
        "CONSOLE_ORCHESTRATOR_TOKEN",
        "CONSOLE_DIGEST_INTERVAL_SECS",
        "CONSOLE_MIRROR_INTERVAL_SECS",
        "CONSOLE_ADMIN_USER",
        "CONSOLE_CONFIG",
    ];

    /// Clears every console variable and restores the previous values on drop.
    struct EnvGuard(Vec<(&'static str, Option<String>)>);

    impl EnvGuard {
        fn clean() -> Self {
            let saved = KEYS
                .iter()
                .map(|key| (*key, std::env::var(key).ok()))
                .collect();
            for key in KEYS {
                unsafe { std::env::remove_var(key) };
            }
            Self(saved)
        }

        fn set(&self, key: &str, value: &str) {
            unsafe { std::env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.0 {
                match value {
                    Some(value) => unsafe { std::env::set_var(key, value) },
                    None => unsafe { std::env::remove_var(key) },
                }
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        let _env = EnvGuard::clean();
        let config = ConsoleConfig::from_env().expect("config");
        assert_eq!(config.bind_addr, DEFAULT_BIND.parse().expect("addr"));
        assert_eq!(config.metrics_bind, DEFAULT_METRICS_BIND.parse().expect("addr"));
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(config.postgres.is_none());
        assert!(config.orchestrator.is_none());
        assert_eq!(config.change_retention, DEFAULT_CHANGE_RETENTION);
        assert_eq!(config.convergence_timeout, Duration::from_secs(30));
        assert_eq!(config.digest_interval, Duration::from_secs(600));
        assert!(config.admin_user.is_none());
    }

    #[test]
    #[serial]
    fn environment_values_are_parsed() {
        let env = EnvGuard::clean();
        env.set("CONSOLE_STORAGE", "Postgres");
        env.set("CONSOLE_POSTGRES_URL", "postgres://localhost/console");
        env.set("CONSOLE_CONVERGENCE_TIMEOUT_MS", "1500");
        env.set("CONSOLE_ORCHESTRATOR_URL", "https://cluster.local:6443");
        env.set("CONSOLE_ORCHESTRATOR_TOKEN", "secret");
        env.set("CONSOLE_ADMIN_USER", "  ");

        let config = ConsoleConfig::from_env().expect("config");
        assert_eq!(config.storage, StorageBackend::Postgres);
        assert_eq!(
            config.postgres.as_ref().map(|pg| pg.url.as_str()),
            Some("postgres://localhost/console")
        );
        assert_eq!(config.convergence_timeout, Duration::from_millis(1500));
        let orchestrator = config.orchestrator.expect("orchestrator");
        assert_eq!(orchestrator.base_url, "https://cluster.local:6443");
        assert_eq!(orchestrator.token.as_deref(), Some("secret"));
        assert!(config.admin_user.is_none());
    }

    #[test]
    #[serial]
    fn invalid_values_name_the_variable() {
        let env = EnvGuard::clean();
        env.set("CONSOLE_CHANGE_RETENTION", "lots");
        let err = ConsoleConfig::from_env().expect_err("invalid");
        assert!(err.to_string().contains("CONSOLE_CHANGE_RETENTION"));

        env.set("CONSOLE_CHANGE_RETENTION", "5");
        env.set("CONSOLE_STORAGE", "mongo");
        assert!(ConsoleConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn yaml_overrides_environment() {
        let env = EnvGuard::clean();
        env.set("CONSOLE_MIRROR_INTERVAL_SECS", "9");
        env.set("CONSOLE_ORCHESTRATOR_URL", "http://env:8001");
        env.set("CONSOLE_ORCHESTRATOR_TOKEN", "from-env");

        let path = std::env::temp_dir().join(format!("console-config-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&path).expect("create");
        writeln!(
            file,
            "bind_addr: 127.0.0.1:9000\nmirror_interval_secs: 3\norchestrator_url: http://yaml:8001\nadmin_user: root"
        )
        .expect("write");
        env.set("CONSOLE_CONFIG", path.to_str().expect("utf8 path"));

        let config = ConsoleConfig::from_env_or_yaml().expect("config");
        let _ = fs::remove_file(&path);
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().expect("addr"));
        assert_eq!(config.mirror_interval, Duration::from_secs(3));
        let orchestrator = config.orchestrator.expect("orchestrator");
        assert_eq!(orchestrator.base_url, "http://yaml:8001");
        assert_eq!(orchestrator.token.as_deref(), Some("from-env"));
        assert_eq!(config.admin_user.as_deref(), Some("root"));
    }

    #[test]
    #[serial]
    fn missing_yaml_file_is_an_error() {
        let env = EnvGuard::clean();
        env.set("CONSOLE_CONFIG", "/nonexistent/console.yaml");
        let err = ConsoleConfig::from_env_or_yaml().expect_err("missing file");
        assert!(err.to_string().contains("CONSOLE_CONFIG"));
    }

    #[test]
    fn pool_settings_require_a_url() {
        let mut config = ConsoleConfig {
            bind_addr: DEFAULT_BIND.parse().expect("addr"),
            metrics_bind: DEFAULT_METRICS_BIND.parse().expect("addr"),
            storage: StorageBackend::Memory,
            postgres: None,
            change_retention: 1,
            convergence_timeout: Duration::from_secs(1),
            cursor_idle_timeout: Duration::from_secs(1),
            orchestrator: None,
            digest_interval: Duration::from_secs(1),
            mirror_interval: Duration::from_secs(1),
            admin_user: None,
        };
        let err = config
            .apply(ConsoleConfigOverride {
                postgres_max_connections: Some(4),
                ..ConsoleConfigOverride::default()
            })
            .expect_err("no url");
        assert!(err.to_string().contains("postgres url"));
    }
}
