use crate::timestamp::TimestampMode;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/condition-monitor/config.json";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("CONDMON_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Ok(state_dir) = env::var("CONDMON_STATE_DIR") {
        let trimmed = state_dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join("config.json");
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
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
    timestamp_mode: Option<String>,
    #[serde(default)]
    worker_count: Option<usize>,
    #[serde(default)]
    worker_queue: Option<usize>,
    #[serde(default)]
    message_timeout_ms: Option<u64>,
    #[serde(default)]
    auto_close_acked: Option<bool>,
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
                "condition-monitor failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_config(contents).or_else(|| {
        tracing::warn!(
            path = %path.display(),
            "condition-monitor failed to parse setup config; using env defaults"
        );
        None
    })
}

fn parse_setup_config(contents: String) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes).ok()
}

fn env_is_unset(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_none()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
}

fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) -> Result<()> {
    if env_is_unset("CONDMON_MQTT_HOST") {
        if let Some(host) = overrides
            .mqtt_host
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.mqtt_host = host.to_string();
        }
    }
    if env_is_unset("CONDMON_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_is_unset("CONDMON_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            let trimmed = username.trim();
            config.mqtt_username = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
    }
    if env_is_unset("CONDMON_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            let trimmed = password.trim();
            config.mqtt_password = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
    }
    if env_is_unset("CONDMON_TIMESTAMP_MODE") {
        if let Some(mode) = overrides
            .timestamp_mode
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.timestamp_mode = mode
                .parse::<TimestampMode>()
                .map_err(|err| anyhow!("setup config timestamp_mode: {err}"))?;
        }
    }
    if env_is_unset("CONDMON_WORKERS") {
        if let Some(value) = overrides.worker_count.filter(|v| *v != 0) {
            config.worker_count = value;
        }
    }
    if env_is_unset("CONDMON_WORKER_QUEUE") {
        if let Some(value) = overrides.worker_queue.filter(|v| *v != 0) {
            config.worker_queue = value;
        }
    }
    if env_is_unset("CONDMON_MESSAGE_TIMEOUT_MS") {
        if let Some(value) = overrides.message_timeout_ms.filter(|v| *v != 0) {
            config.message_timeout_ms = value;
        }
    }
    if env_is_unset("CONDMON_AUTO_CLOSE_ACKED") {
        if let Some(value) = overrides.auto_close_acked {
            config.auto_close_acked = value;
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub apply_schema: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub worker_count: usize,
    pub worker_queue: usize,
    pub message_timeout_ms: u64,
    pub timestamp_mode: TimestampMode,
    pub auto_close_acked: bool,
    pub window_idle_ttl_secs: u64,
    pub shutdown_drain_ms: u64,
    pub grpc_socket_path: String,
    pub alert_feed_url: Option<String>,
    pub alert_feed_token: Option<String>,
    pub alert_feed_batch_size: usize,
    pub alert_feed_flush_ms: u64,
    pub alert_feed_queue: usize,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env::var("CONDMON_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("CONDMON_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let timestamp_mode = match env::var("CONDMON_TIMESTAMP_MODE") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .parse::<TimestampMode>()
                .map_err(|err| anyhow!("CONDMON_TIMESTAMP_MODE: {err}"))?,
            _ => TimestampMode::Auto,
        };

        let worker_count = env_parse::<usize>("CONDMON_WORKERS")
            .filter(|v| *v != 0)
            .unwrap_or(8);
        let alert_feed_batch_size =
            env_parse::<usize>("CONDMON_ALERT_FEED_BATCH_SIZE").unwrap_or(50);

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("CONDMON_DB_POOL_SIZE").unwrap_or(10),
            apply_schema: env_flag("CONDMON_APPLY_SCHEMA").unwrap_or(false),
            mqtt_host: env::var("CONDMON_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            mqtt_port: env_parse("CONDMON_MQTT_PORT").unwrap_or(1883),
            mqtt_username: env::var("CONDMON_MQTT_USERNAME").ok(),
            mqtt_password: env::var("CONDMON_MQTT_PASSWORD").ok(),
            mqtt_keepalive_secs: env_parse("CONDMON_MQTT_KEEPALIVE_SECS").unwrap_or(30),
            mqtt_client_id: env::var("CONDMON_MQTT_CLIENT_ID")
                .unwrap_or_else(|_| "condition-monitor".to_string()),
            enable_mqtt_listener: env_flag("CONDMON_ENABLE_MQTT").unwrap_or(true),
            worker_count,
            worker_queue: env_parse("CONDMON_WORKER_QUEUE").unwrap_or(256),
            message_timeout_ms: env_parse("CONDMON_MESSAGE_TIMEOUT_MS").unwrap_or(5_000),
            timestamp_mode,
            auto_close_acked: env_flag("CONDMON_AUTO_CLOSE_ACKED").unwrap_or(true),
            window_idle_ttl_secs: env_parse("CONDMON_WINDOW_IDLE_TTL_SECS").unwrap_or(3_600),
            shutdown_drain_ms: env_parse("CONDMON_SHUTDOWN_DRAIN_MS").unwrap_or(10_000),
            grpc_socket_path: env::var("CONDMON_GRPC_SOCKET")
                .unwrap_or_else(|_| "/tmp/condition_monitor.sock".to_string()),
            alert_feed_url: env::var("CONDMON_ALERT_FEED_URL").ok(),
            alert_feed_token: env::var("CONDMON_ALERT_FEED_TOKEN").ok(),
            alert_feed_batch_size,
            alert_feed_flush_ms: env_parse("CONDMON_ALERT_FEED_FLUSH_MS").unwrap_or(1_000),
            alert_feed_queue: env_parse("CONDMON_ALERT_FEED_QUEUE")
                .unwrap_or(alert_feed_batch_size.saturating_mul(4)),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides)?;
        }

        Ok(config)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms.max(1))
    }

    pub fn window_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.window_idle_ttl_secs.max(1))
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }

    pub fn alert_feed_flush_interval(&self) -> Duration {
        Duration::from_millis(self.alert_feed_flush_ms.max(1))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_database_url_strips_driver_suffix() {
        assert_eq!(
            normalize_database_url("postgresql+asyncpg://u:p@db/telemetry".to_string()),
            "postgresql://u:p@db/telemetry"
        );
        assert_eq!(
            normalize_database_url("postgres://db/telemetry".to_string()),
            "postgres://db/telemetry"
        );
    }

    #[test]
    fn setup_config_parses_partial_overrides() {
        let parsed = parse_setup_config(
            r#"{"mqtt_host":"broker.local","timestamp_mode":"server","worker_count":4}"#
                .to_string(),
        )
        .expect("parsed");
        assert_eq!(parsed.mqtt_host.as_deref(), Some("broker.local"));
        assert_eq!(parsed.timestamp_mode.as_deref(), Some("server"));
        assert_eq!(parsed.worker_count, Some(4));
        assert!(parsed.database_url.is_none());
    }

    #[test]
    fn setup_config_rejects_garbage() {
        assert!(parse_setup_config("not json".to_string()).is_none());
    }

    fn base_config() -> Config {
        Config {
            database_url: "postgres://db/telemetry".to_string(),
            db_pool_size: 1,
            apply_schema: false,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_keepalive_secs: 30,
            mqtt_client_id: "condition-monitor".to_string(),
            enable_mqtt_listener: false,
            worker_count: 1,
            worker_queue: 1,
            message_timeout_ms: 1_000,
            timestamp_mode: TimestampMode::Auto,
            auto_close_acked: true,
            window_idle_ttl_secs: 60,
            shutdown_drain_ms: 1_000,
            grpc_socket_path: "/tmp/condition_monitor.sock".to_string(),
            alert_feed_url: None,
            alert_feed_token: None,
            alert_feed_batch_size: 1,
            alert_feed_flush_ms: 1_000,
            alert_feed_queue: 1,
            otlp_endpoint: None,
        }
    }

    #[test]
    fn env_mqtt_credentials_win_over_setup_config() {
        env::set_var("CONDMON_MQTT_USERNAME", "from-env");
        env::remove_var("CONDMON_MQTT_PASSWORD");
        let overrides = parse_setup_config(
            r#"{"mqtt_username":"from-file","mqtt_password":"file-secret"}"#.to_string(),
        )
        .expect("parsed");

        let mut config = base_config();
        config.mqtt_username = Some("from-env".to_string());
        apply_setup_overrides(&mut config, &overrides).expect("applied");
        env::remove_var("CONDMON_MQTT_USERNAME");

        assert_eq!(config.mqtt_username.as_deref(), Some("from-env"));
        assert_eq!(config.mqtt_password.as_deref(), Some("file-secret"));
    }
}
