//! Configuration for the realtime supervision plane
//!
//! Everything is environment-driven with the same variable names the
//! deployment tooling already exports (`REALTIME_*`, `GENESYS_*`,
//! `GENESYS_AUDIOHOOK_*`). Out-of-range values are clamped to safe floors
//! rather than rejected.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub genesys: GenesysConfig,
    pub audiohook: AudioHookConfig,
}

/// HTTP server + data layout
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Root data directory
    pub data_dir: PathBuf,
    /// Uploaded recordings, used by the audio fallback resolver
    pub uploads_dir: PathBuf,
    /// Worker status files live here
    pub runtime_dir: PathBuf,
}

/// Ingest, alerting, and rolling-audio knobs
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// If non-empty, required on ingest endpoints
    pub ingest_token: String,
    pub negative_sentiment_threshold: f64,
    pub high_risk_threshold: f64,
    pub alert_cooldown_seconds: i64,
    pub supervisor_keyword_triggers: Vec<String>,
    pub audio_dir: PathBuf,
    pub audio_window_seconds: u64,
    pub audio_default_sample_rate: u32,
    pub audio_default_channels: u16,
    pub audio_max_chunk_bytes: usize,
}

/// Genesys Cloud notification connector
#[derive(Debug, Clone)]
pub struct GenesysConfig {
    pub login_base_url: String,
    pub api_base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_topics: Vec<String>,
    pub queue_ids: Vec<String>,
    pub user_ids: Vec<String>,
    pub target_ingest_url: String,
    pub target_ingest_token: String,
    pub verify_ssl: bool,
    pub http_timeout_seconds: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_seconds: f64,
    pub reconnect_delay_seconds: u64,
    pub topic_builder_mode: String,
    pub topic_builder_queue_name_filters: Vec<String>,
    pub topic_builder_user_name_filters: Vec<String>,
    pub topic_builder_user_email_domain_filters: Vec<String>,
    pub topic_builder_max_queues: usize,
    pub topic_builder_max_users: usize,
    pub topic_builder_refresh_seconds: u64,
    pub connector_status_path: PathBuf,
    pub connector_health_stale_seconds: u64,
}

/// AudioHook media listener
#[derive(Debug, Clone)]
pub struct AudioHookConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub target_audio_ingest_url: String,
    pub target_event_ingest_url: String,
    pub target_ingest_token: String,
    pub verify_ssl: bool,
    pub http_timeout_seconds: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_seconds: f64,
    pub flush_interval_ms: u64,
    pub min_chunk_duration_ms: u64,
    pub max_chunk_duration_ms: u64,
    pub status_path: PathBuf,
    pub health_stale_seconds: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(env_str("DATA_DIR", "data"));
        let runtime_dir = data_dir.join("runtime");

        let server = ServerConfig {
            host: env_str("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8009)?,
            uploads_dir: env_path("UPLOADS_DIR", data_dir.join("uploads")),
            runtime_dir: runtime_dir.clone(),
            data_dir: data_dir.clone(),
        };

        let realtime = RealtimeConfig {
            ingest_token: env_str("REALTIME_INGEST_TOKEN", ""),
            negative_sentiment_threshold: env_parse(
                "REALTIME_NEGATIVE_SENTIMENT_THRESHOLD",
                -0.45,
            )?,
            high_risk_threshold: env_parse("REALTIME_HIGH_RISK_THRESHOLD", 0.72)?,
            alert_cooldown_seconds: env_parse::<i64>("REALTIME_ALERT_COOLDOWN_SECONDS", 75)?
                .max(5),
            supervisor_keyword_triggers: split_csv(&env_str(
                "REALTIME_SUPERVISOR_KEYWORD_TRIGGERS",
                "manager,supervisor,escalate,cancel account,lawyer,legal,complaint,refund now",
            ))
            .into_iter()
            .map(|term| term.to_lowercase())
            .collect(),
            audio_dir: env_path("REALTIME_AUDIO_DIR", runtime_dir.join("live_audio")),
            audio_window_seconds: env_parse::<u64>("REALTIME_AUDIO_WINDOW_SECONDS", 300)?.max(30),
            audio_default_sample_rate: env_parse("REALTIME_AUDIO_DEFAULT_SAMPLE_RATE", 16_000)?,
            audio_default_channels: env_parse("REALTIME_AUDIO_DEFAULT_CHANNELS", 1)?,
            audio_max_chunk_bytes: env_parse::<usize>("REALTIME_AUDIO_MAX_CHUNK_BYTES", 2_000_000)?
                .max(8_192),
        };

        let genesys = GenesysConfig {
            login_base_url: normalize_base_url(&env_str(
                "GENESYS_LOGIN_BASE_URL",
                "https://login.mypurecloud.com",
            )),
            api_base_url: normalize_base_url(&env_str(
                "GENESYS_API_BASE_URL",
                "https://api.mypurecloud.com",
            )),
            client_id: env_str("GENESYS_CLIENT_ID", ""),
            client_secret: env_str("GENESYS_CLIENT_SECRET", ""),
            subscription_topics: split_csv(&env_str("GENESYS_SUBSCRIPTION_TOPICS", "")),
            queue_ids: split_csv(&env_str("GENESYS_QUEUE_IDS", "")),
            user_ids: split_csv(&env_str("GENESYS_USER_IDS", "")),
            target_ingest_url: env_str(
                "GENESYS_TARGET_INGEST_URL",
                "http://127.0.0.1:8009/api/realtime/events",
            ),
            target_ingest_token: first_non_empty(&[
                env_str("GENESYS_TARGET_INGEST_TOKEN", ""),
                realtime.ingest_token.clone(),
            ]),
            verify_ssl: env_bool("GENESYS_VERIFY_SSL", true),
            http_timeout_seconds: env_parse::<u64>("GENESYS_HTTP_TIMEOUT_SECONDS", 20)?.max(5),
            retry_max_attempts: env_parse::<u32>("GENESYS_RETRY_MAX_ATTEMPTS", 5)?.max(1),
            retry_backoff_seconds: env_parse::<f64>("GENESYS_RETRY_BACKOFF_SECONDS", 1.5)?
                .max(0.2),
            reconnect_delay_seconds: env_parse::<u64>("GENESYS_RECONNECT_DELAY_SECONDS", 5)?
                .max(2),
            topic_builder_mode: env_str("GENESYS_TOPIC_BUILDER_MODE", "queues_users")
                .to_lowercase(),
            topic_builder_queue_name_filters: split_csv(&env_str(
                "GENESYS_TOPIC_BUILDER_QUEUE_NAME_FILTERS",
                "",
            )),
            topic_builder_user_name_filters: split_csv(&env_str(
                "GENESYS_TOPIC_BUILDER_USER_NAME_FILTERS",
                "",
            )),
            topic_builder_user_email_domain_filters: split_csv(&env_str(
                "GENESYS_TOPIC_BUILDER_USER_EMAIL_DOMAIN_FILTERS",
                "",
            )),
            topic_builder_max_queues: env_parse("GENESYS_TOPIC_BUILDER_MAX_QUEUES", 25)?,
            topic_builder_max_users: env_parse("GENESYS_TOPIC_BUILDER_MAX_USERS", 50)?,
            topic_builder_refresh_seconds: env_parse::<u64>(
                "GENESYS_TOPIC_BUILDER_REFRESH_SECONDS",
                900,
            )?
            .max(60),
            connector_status_path: env_path(
                "GENESYS_CONNECTOR_STATUS_PATH",
                runtime_dir.join("genesys_connector_status.json"),
            ),
            connector_health_stale_seconds: env_parse(
                "GENESYS_CONNECTOR_HEALTH_STALE_SECONDS",
                90,
            )?,
        };

        let audiohook = AudioHookConfig {
            host: env_str("GENESYS_AUDIOHOOK_HOST", "0.0.0.0"),
            port: env_parse("GENESYS_AUDIOHOOK_PORT", 9011)?,
            path: normalize_ws_path(&env_str("GENESYS_AUDIOHOOK_PATH", "/audiohook/ws")),
            target_audio_ingest_url: env_str(
                "GENESYS_AUDIOHOOK_TARGET_AUDIO_INGEST_URL",
                "http://127.0.0.1:8009/api/realtime/audio/chunk",
            ),
            target_event_ingest_url: first_non_empty(&[
                env_str("GENESYS_AUDIOHOOK_TARGET_EVENT_INGEST_URL", ""),
                genesys.target_ingest_url.clone(),
            ]),
            target_ingest_token: first_non_empty(&[
                env_str("GENESYS_AUDIOHOOK_TARGET_INGEST_TOKEN", ""),
                genesys.target_ingest_token.clone(),
                realtime.ingest_token.clone(),
            ]),
            verify_ssl: env_bool("GENESYS_AUDIOHOOK_VERIFY_SSL", true),
            http_timeout_seconds: env_parse::<u64>("GENESYS_AUDIOHOOK_HTTP_TIMEOUT_SECONDS", 20)?
                .max(5),
            retry_max_attempts: env_parse::<u32>("GENESYS_AUDIOHOOK_RETRY_MAX_ATTEMPTS", 5)?
                .max(1),
            retry_backoff_seconds: env_parse::<f64>(
                "GENESYS_AUDIOHOOK_RETRY_BACKOFF_SECONDS",
                1.5,
            )?
            .max(0.2),
            flush_interval_ms: env_parse::<u64>("GENESYS_AUDIOHOOK_FLUSH_INTERVAL_MS", 750)?
                .max(120),
            min_chunk_duration_ms: env_parse::<u64>(
                "GENESYS_AUDIOHOOK_MIN_CHUNK_DURATION_MS",
                300,
            )?
            .max(80),
            max_chunk_duration_ms: env_parse::<u64>(
                "GENESYS_AUDIOHOOK_MAX_CHUNK_DURATION_MS",
                2000,
            )?
            .max(120),
            status_path: env_path(
                "GENESYS_AUDIOHOOK_STATUS_PATH",
                runtime_dir.join("genesys_audiohook_status.json"),
            ),
            health_stale_seconds: env_parse("GENESYS_AUDIOHOOK_HEALTH_STALE_SECONDS", 90)?,
        };

        Ok(Self {
            server,
            realtime,
            genesys,
            audiohook,
        })
    }

    /// Get socket address for the ingest API
    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid bind address: {err}"))
    }
}

impl GenesysConfig {
    /// Worker startup validation; connector cannot run without credentials
    pub fn validate(&self, dry_run: bool) -> crate::Result<()> {
        if self.client_id.is_empty() {
            return Err(crate::Error::Config("GENESYS_CLIENT_ID is required".into()));
        }
        if self.client_secret.is_empty() {
            return Err(crate::Error::Config(
                "GENESYS_CLIENT_SECRET is required".into(),
            ));
        }
        if self.target_ingest_url.is_empty() && !dry_run {
            return Err(crate::Error::Config(
                "GENESYS_TARGET_INGEST_URL is required when not in --dry-run mode".into(),
            ));
        }
        Ok(())
    }
}

impl AudioHookConfig {
    pub fn validate(&self, dry_run: bool) -> crate::Result<()> {
        if self.target_audio_ingest_url.is_empty() && !dry_run {
            return Err(crate::Error::Config(
                "GENESYS_AUDIOHOOK_TARGET_AUDIO_INGEST_URL is required".into(),
            ));
        }
        if self.target_event_ingest_url.is_empty() && !dry_run {
            return Err(crate::Error::Config(
                "GENESYS_AUDIOHOOK_TARGET_EVENT_INGEST_URL is required".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid audiohook bind address: {err}"))
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .map(|value| value.trim().to_string())
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => default,
    }
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {key}: {err}")),
        _ => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn first_non_empty(candidates: &[String]) -> String {
    candidates
        .iter()
        .find(|value| !value.is_empty())
        .cloned()
        .unwrap_or_default()
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn normalize_ws_path(path: &str) -> String {
    let mut value = path.trim().to_string();
    if value.is_empty() {
        value = "/audiohook/ws".to_string();
    }
    if !value.starts_with('/') {
        value.insert(0, '/');
    }
    while value.len() > 1 && value.ends_with('/') {
        value.pop();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv_trims_and_drops_empty() {
        assert_eq!(split_csv("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_csv("").is_empty());
    }

    #[test]
    fn test_normalize_ws_path() {
        assert_eq!(normalize_ws_path("audiohook/ws/"), "/audiohook/ws");
        assert_eq!(normalize_ws_path(""), "/audiohook/ws");
        assert_eq!(normalize_ws_path("/"), "/");
    }

    #[test]
    fn test_normalize_base_url_strips_trailing_slash() {
        assert_eq!(
            normalize_base_url("https://login.mypurecloud.com/"),
            "https://login.mypurecloud.com"
        );
    }
}
