use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/app-metrics/config.json";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("APP_METRICS_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => bail!("unknown store backend `{other}`; expected memory or postgres"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    app_metrics_store: Option<String>,
    #[serde(default)]
    app_metrics_topic: Option<String>,
    #[serde(default)]
    app_metrics_share_group: Option<String>,
    #[serde(default)]
    app_metrics_consumer_workers: Option<usize>,
    #[serde(default)]
    app_metrics_mqtt_keepalive_secs: Option<u64>,
    #[serde(default)]
    app_metrics_batch_size: Option<usize>,
    #[serde(default)]
    app_metrics_flush_interval_ms: Option<u64>,
    #[serde(default)]
    app_metrics_max_queue: Option<usize>,
    #[serde(default)]
    app_metrics_compaction_interval_secs: Option<u64>,
    #[serde(default)]
    app_metrics_status_interval_ms: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "app-metrics failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_overrides(contents.into_bytes(), &path)
}

fn parse_setup_overrides(mut bytes: Vec<u8>, path: &std::path::Path) -> Option<SetupConfigOverrides> {
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "app-metrics failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_unset(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_none()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Applies setup-file values for every key whose environment variable is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("APP_METRICS_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("APP_METRICS_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("APP_METRICS_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if env_allows("APP_METRICS_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if env_allows("APP_METRICS_STORE") {
        if let Some(store) = non_empty(overrides.app_metrics_store.as_deref()) {
            match store.parse() {
                Ok(backend) => config.store_backend = backend,
                Err(err) => tracing::warn!(error=%err, "ignoring store backend from setup config"),
            }
        }
    }
    if env_allows("APP_METRICS_TOPIC") {
        if let Some(topic) = non_empty(overrides.app_metrics_topic.as_deref()) {
            config.topic = topic;
        }
    }
    if env_allows("APP_METRICS_SHARE_GROUP") {
        if let Some(group) = non_empty(overrides.app_metrics_share_group.as_deref()) {
            config.share_group = group;
        }
    }
    if env_allows("APP_METRICS_CONSUMER_WORKERS") {
        if let Some(value) = overrides.app_metrics_consumer_workers.filter(|v| *v != 0) {
            config.consumer_workers = value;
        }
    }
    if env_allows("APP_METRICS_MQTT_KEEPALIVE_SECS") {
        if let Some(value) = overrides.app_metrics_mqtt_keepalive_secs.filter(|v| *v != 0) {
            config.mqtt_keepalive_secs = value;
        }
    }

    let mut batch_overridden = false;
    if env_allows("APP_METRICS_BATCH_SIZE") {
        if let Some(value) = overrides.app_metrics_batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
            batch_overridden = true;
        }
    }
    if env_allows("APP_METRICS_FLUSH_INTERVAL_MS") {
        if let Some(value) = overrides.app_metrics_flush_interval_ms.filter(|v| *v != 0) {
            config.flush_interval_ms = value;
        }
    }
    if env_allows("APP_METRICS_COMPACTION_INTERVAL_SECS") {
        if let Some(value) = overrides
            .app_metrics_compaction_interval_secs
            .filter(|v| *v != 0)
        {
            config.compaction_interval_secs = value;
        }
    }
    if env_allows("APP_METRICS_STATUS_INTERVAL_MS") {
        if let Some(value) = overrides.app_metrics_status_interval_ms.filter(|v| *v != 0) {
            config.status_interval_ms = value;
        }
    }

    if env_allows("APP_METRICS_MAX_QUEUE") {
        if let Some(value) = overrides.app_metrics_max_queue.filter(|v| *v != 0) {
            config.max_queue = value;
        } else if batch_overridden {
            config.max_queue = config.batch_size.saturating_mul(10);
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub topic: String,
    pub share_group: String,
    pub consumer_workers: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub compaction_interval_secs: u64,
    pub status_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let batch_size = 500;
        Self {
            store_backend: StoreBackend::Memory,
            database_url: None,
            db_pool_size: 10,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: format!("app-metrics-{}", std::process::id()),
            mqtt_keepalive_secs: 30,
            topic: "app_metrics".to_string(),
            share_group: "app-metrics".to_string(),
            consumer_workers: 1,
            batch_size,
            flush_interval_ms: 750,
            max_queue: batch_size * 10,
            compaction_interval_secs: 60,
            status_interval_ms: 30_000,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();
        let defaults = Config::default();

        let store_backend = match env::var("APP_METRICS_STORE") {
            Ok(raw) if !raw.trim().is_empty() => raw.parse::<StoreBackend>().context("APP_METRICS_STORE")?,
            _ => defaults.store_backend,
        };
        let database_url = env::var("APP_METRICS_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .and_then(|value| non_empty(Some(&value)))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.database_url.as_deref()))
            })
            .map(normalize_database_url);

        let batch_size = env_parse("APP_METRICS_BATCH_SIZE").unwrap_or(defaults.batch_size);
        let mut config = Self {
            store_backend,
            database_url,
            db_pool_size: env_parse("APP_METRICS_DB_POOL_SIZE").unwrap_or(defaults.db_pool_size),
            mqtt_host: env::var("APP_METRICS_MQTT_HOST").unwrap_or(defaults.mqtt_host),
            mqtt_port: env_parse("APP_METRICS_MQTT_PORT").unwrap_or(defaults.mqtt_port),
            mqtt_username: env::var("APP_METRICS_MQTT_USERNAME").ok(),
            mqtt_password: env::var("APP_METRICS_MQTT_PASSWORD").ok(),
            mqtt_client_id: env::var("APP_METRICS_MQTT_CLIENT_ID")
                .unwrap_or(defaults.mqtt_client_id),
            mqtt_keepalive_secs: env_parse("APP_METRICS_MQTT_KEEPALIVE_SECS")
                .unwrap_or(defaults.mqtt_keepalive_secs),
            topic: env::var("APP_METRICS_TOPIC").unwrap_or(defaults.topic),
            share_group: env::var("APP_METRICS_SHARE_GROUP").unwrap_or(defaults.share_group),
            consumer_workers: env_parse("APP_METRICS_CONSUMER_WORKERS")
                .unwrap_or(defaults.consumer_workers),
            batch_size,
            flush_interval_ms: env_parse("APP_METRICS_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval_ms),
            max_queue: env_parse("APP_METRICS_MAX_QUEUE").unwrap_or(batch_size * 10),
            compaction_interval_secs: env_parse("APP_METRICS_COMPACTION_INTERVAL_SECS")
                .unwrap_or(defaults.compaction_interval_secs),
            status_interval_ms: env_parse("APP_METRICS_STATUS_INTERVAL_MS")
                .unwrap_or(defaults.status_interval_ms),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, env_unset);
        }
        config.consumer_workers = config.consumer_workers.max(1);
        config.batch_size = config.batch_size.max(1);

        if config.store_backend == StoreBackend::Postgres && config.database_url.is_none() {
            bail!("APP_METRICS_DATABASE_URL or DATABASE_URL is required for the postgres store (or present as database_url in the setup config)");
        }
        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }

    /// Subscription filter; several workers share one broker-side queue.
    pub fn subscription_topic(&self) -> String {
        if self.consumer_workers > 1 {
            format!("$share/{}/{}", self.share_group, self.topic)
        } else {
            self.topic.clone()
        }
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
