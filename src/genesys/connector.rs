//! Genesys Cloud notification connector worker
//!
//! Long-running cycle: OAuth -> notification channel -> topic subscriptions
//! -> websocket consume -> normalize -> forward to the ingest API. Any
//! failure degrades the worker and schedules a reconnect; the status file
//! tracks every transition for the health probe.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use crate::config::GenesysConfig;
use crate::genesys::normalize;
use crate::genesys::topics::{self, DirectoryEntry, TopicPreview};
use crate::retry::{post_json_with_retries, RetryPolicy};
use crate::status::{StatusWriter, WorkerState, HEARTBEAT_INTERVAL};
use crate::{Error, Result};

/// Reset by any inbound frame; Genesys pings well inside this
const WS_READ_TIMEOUT: Duration = Duration::from_secs(60);
const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 60;
const DISCOVERY_PAGE_SIZE: u32 = 100;
const DISCOVERY_PAGE_CAP: u32 = 50;

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct GenesysConnector {
    config: GenesysConfig,
    http: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
    topic_cache: RwLock<Option<(TopicPreview, DateTime<Utc>)>>,
    status: Arc<StatusWriter>,
    policy: RetryPolicy,
    dry_run: bool,
}

impl GenesysConnector {
    pub fn new(config: GenesysConfig, dry_run: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .user_agent("callwatch-genesys-connector/1.0")
            .build()
            .map_err(|err| Error::Internal(err.to_string()))?;

        let status = Arc::new(StatusWriter::new(
            config.connector_status_path.clone(),
            "genesys_connector",
            dry_run,
        ));
        status.update(&[
            ("topics_count", json!(0)),
            ("forwarded_events", json!(0)),
            ("forward_failures", json!(0)),
            ("reconnect_count", json!(0)),
            ("channel_id", json!("")),
            ("websocket_uri", json!("")),
            ("topic_builder_mode", json!(&config.topic_builder_mode)),
        ]);

        let policy = RetryPolicy::new(config.retry_max_attempts, config.retry_backoff_seconds);

        Ok(Self {
            config,
            http,
            token: RwLock::new(None),
            topic_cache: RwLock::new(None),
            status,
            policy,
            dry_run,
        })
    }

    /// Run until the shutdown signal flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.status.set_state(WorkerState::Starting);
        info!(
            login_base = %self.config.login_base_url,
            api_base = %self.config.api_base_url,
            target = %self.config.target_ingest_url,
            dry_run = self.dry_run,
            "genesys connector starting"
        );

        let heartbeat = {
            let status = self.status.clone();
            let mut signal = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => status.heartbeat(),
                        _ = signal.changed() => break,
                    }
                }
            })
        };

        while !*shutdown.borrow() {
            match self.cycle(&mut shutdown).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.status.set_state(WorkerState::Degraded);
                }
                Err(err) => {
                    warn!(error = %err, "genesys connector cycle failed");
                    self.status.set_error(WorkerState::Degraded, &err.to_string());
                }
            }
            self.status.increment("reconnect_count", 1);
            sleep_with_shutdown(
                Duration::from_secs(self.config.reconnect_delay_seconds),
                &mut shutdown,
            )
            .await;
        }

        heartbeat.abort();
        self.status.set_state(WorkerState::Stopped);
        info!("genesys connector stopped");
        Ok(())
    }

    async fn cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.status.set_state(WorkerState::Connecting);

        let preview = self.build_topics_preview(false).await?;
        if preview.topics.is_empty() {
            return Err(Error::Config(
                "No Genesys topics configured. Set GENESYS_SUBSCRIPTION_TOPICS, or configure \
                 builder mode with queue/user filters."
                    .to_string(),
            ));
        }
        self.status.update(&[
            ("topics_count", json!(preview.topics.len())),
            (
                "topic_preview",
                json!(preview.topics.iter().take(20).collect::<Vec<_>>()),
            ),
            (
                "topic_builder",
                json!({
                    "mode": &preview.mode,
                    "queues": preview.queues.len(),
                    "users": preview.users.len(),
                    "generated_at": preview.generated_at.to_rfc3339(),
                }),
            ),
        ]);

        self.ensure_token().await?;
        self.status.set_state(WorkerState::Authenticated);

        let (channel_id, connect_uri) = self.create_notification_channel().await?;
        self.status.update(&[
            ("state", json!(WorkerState::ChannelCreated.as_str())),
            ("channel_id", json!(&channel_id)),
            ("websocket_uri", json!(&connect_uri)),
        ]);

        self.subscribe_to_topics(&channel_id, &preview.topics).await?;
        self.status.set_state(WorkerState::Subscribed);

        self.run_websocket(&connect_uri, shutdown).await
    }

    // ------------------------------------------------------------------
    // Topic discovery
    // ------------------------------------------------------------------

    /// Manual + discovered topics, cached between refresh windows
    pub async fn build_topics_preview(&self, refresh: bool) -> Result<TopicPreview> {
        let (include_queues, include_users) =
            topics::builder_scope(&self.config.topic_builder_mode);
        if !include_queues && !include_users {
            return Ok(topics::assemble_preview(
                &self.config,
                Vec::new(),
                Vec::new(),
                Utc::now(),
            ));
        }

        if !refresh {
            let cache = self.topic_cache.read().await;
            if let Some((preview, refreshed_at)) = cache.as_ref() {
                let age = (Utc::now() - *refreshed_at).num_seconds();
                if age < self.config.topic_builder_refresh_seconds as i64 {
                    return Ok(preview.clone());
                }
            }
        }

        let queues = if include_queues {
            self.discover_queues().await?
        } else {
            Vec::new()
        };
        let users = if include_users {
            self.discover_users().await?
        } else {
            Vec::new()
        };

        let preview = topics::assemble_preview(&self.config, queues, users, Utc::now());
        info!(
            mode = %preview.mode,
            queues = preview.queues.len(),
            users = preview.users.len(),
            topics = preview.topics.len(),
            "genesys topic builder refreshed"
        );
        *self.topic_cache.write().await = Some((preview.clone(), Utc::now()));
        Ok(preview)
    }

    async fn discover_queues(&self) -> Result<Vec<DirectoryEntry>> {
        let max = self.config.topic_builder_max_queues;
        if max == 0 {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/v2/routing/queues", self.config.api_base_url);
        let mut selected = Vec::new();
        for page_number in 1..=DISCOVERY_PAGE_CAP {
            let payload = self
                .api_get(
                    &url,
                    &[
                        ("pageSize".to_string(), DISCOVERY_PAGE_SIZE.to_string()),
                        ("pageNumber".to_string(), page_number.to_string()),
                    ],
                )
                .await?;
            let Some(entities) = payload.get("entities").and_then(Value::as_array) else {
                break;
            };
            if entities.is_empty() {
                break;
            }
            if topics::filter_queue_page(
                entities,
                &self.config.topic_builder_queue_name_filters,
                &mut selected,
                max,
            ) {
                break;
            }
            if last_page(&payload, page_number, entities.len()) {
                break;
            }
        }
        Ok(selected)
    }

    async fn discover_users(&self) -> Result<Vec<DirectoryEntry>> {
        let max = self.config.topic_builder_max_users;
        if max == 0 {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/v2/users", self.config.api_base_url);
        let mut selected = Vec::new();
        for page_number in 1..=DISCOVERY_PAGE_CAP {
            let payload = self
                .api_get(
                    &url,
                    &[
                        ("pageSize".to_string(), DISCOVERY_PAGE_SIZE.to_string()),
                        ("pageNumber".to_string(), page_number.to_string()),
                        ("state".to_string(), "active".to_string()),
                    ],
                )
                .await?;
            let Some(entities) = payload.get("entities").and_then(Value::as_array) else {
                break;
            };
            if entities.is_empty() {
                break;
            }
            if topics::filter_user_page(
                entities,
                &self.config.topic_builder_user_name_filters,
                &self.config.topic_builder_user_email_domain_filters,
                &mut selected,
                max,
            ) {
                break;
            }
            if last_page(&payload, page_number, entities.len()) {
                break;
            }
        }
        Ok(selected)
    }

    // ------------------------------------------------------------------
    // Channel lifecycle
    // ------------------------------------------------------------------

    async fn create_notification_channel(&self) -> Result<(String, String)> {
        let url = format!("{}/api/v2/notifications/channels", self.config.api_base_url);
        let payload = self.api_post(&url, &json!({})).await?;

        let channel_id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let connect_uri = payload
            .get("connectUri")
            .or_else(|| payload.get("websocketUri"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if channel_id.is_empty() || connect_uri.is_empty() {
            return Err(Error::Protocol(
                "Genesys channel response missing id/connect URI".to_string(),
            ));
        }

        info!(
            channel_id = %channel_id,
            expires = ?payload.get("expires"),
            "genesys notification channel created"
        );
        Ok((channel_id, connect_uri))
    }

    async fn subscribe_to_topics(&self, channel_id: &str, topic_ids: &[String]) -> Result<()> {
        let url = format!(
            "{}/api/v2/notifications/channels/{channel_id}/subscriptions",
            self.config.api_base_url
        );
        let body: Vec<Value> = topic_ids.iter().map(|topic| json!({ "id": topic })).collect();
        self.api_post(&url, &Value::Array(body)).await?;
        info!(
            channel_id = %channel_id,
            topics = topic_ids.len(),
            "genesys channel subscribed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // WebSocket consume
    // ------------------------------------------------------------------

    async fn run_websocket(
        &self,
        connect_uri: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (socket, _response) = tokio_tungstenite::connect_async(connect_uri)
            .await
            .map_err(|err| Error::Upstream(format!("websocket connect: {err}")))?;
        self.status.update(&[
            ("state", json!(WorkerState::Running.as_str())),
            ("last_error", json!("")),
        ]);
        info!(uri = %connect_uri, "genesys websocket connected");

        let (mut sink, mut frames) = socket.split();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(tungstenite::Message::Close(None)).await;
                    return Ok(());
                }
                frame = tokio::time::timeout(WS_READ_TIMEOUT, frames.next()) => match frame {
                    Err(_) => return Err(Error::Upstream("websocket read timeout".to_string())),
                    Ok(None) => return Err(Error::Upstream("websocket stream ended".to_string())),
                    Ok(Some(Err(err))) => {
                        return Err(Error::Upstream(format!("websocket error: {err}")));
                    }
                    Ok(Some(Ok(message))) => match message {
                        tungstenite::Message::Text(text) => {
                            self.handle_notification_frame(&text).await;
                        }
                        tungstenite::Message::Ping(data) => {
                            let _ = sink.send(tungstenite::Message::Pong(data)).await;
                        }
                        tungstenite::Message::Close(frame) => {
                            warn!(frame = ?frame, "genesys websocket closed by peer");
                            return Err(Error::Upstream("websocket closed by peer".to_string()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_notification_frame(&self, text: &str) {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                debug!("genesys message ignored: invalid json");
                return;
            }
        };

        let mut forwarded = 0u64;
        for notification in normalize::flatten_notifications(&parsed) {
            if normalize::is_channel_metadata(notification) {
                debug!("genesys channel keep-alive acknowledged");
                continue;
            }
            for payload in normalize::map_notification(notification) {
                match self.forward_payload(&payload).await {
                    Ok(()) => {
                        forwarded += 1;
                        self.status.update(&[
                            ("last_event_at", json!(Utc::now().to_rfc3339())),
                            (
                                "last_payload_call_id",
                                payload.get("call_id").cloned().unwrap_or(json!("")),
                            ),
                            (
                                "last_payload_type",
                                payload.get("event_type").cloned().unwrap_or(json!("")),
                            ),
                        ]);
                    }
                    Err(err) => {
                        warn!(
                            call_id = ?payload.get("call_id"),
                            event_type = ?payload.get("event_type"),
                            error = %err,
                            "genesys payload forward failed"
                        );
                        self.status.increment("forward_failures", 1);
                    }
                }
            }
        }

        if forwarded > 0 {
            self.status.increment("forwarded_events", forwarded);
            debug!(payloads = forwarded, "genesys message forwarded");
        }
    }

    async fn forward_payload(&self, payload: &Value) -> Result<()> {
        if self.dry_run {
            info!(
                call_id = ?payload.get("call_id"),
                event_type = ?payload.get("event_type"),
                speaker = ?payload.get("speaker"),
                "genesys payload (dry run)"
            );
            return Ok(());
        }

        post_json_with_retries(
            &self.http,
            &self.config.target_ingest_url,
            Some(&self.config.target_ingest_token),
            payload,
            &self.policy,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Authenticated HTTP
    // ------------------------------------------------------------------

    async fn api_get(&self, url: &str, query: &[(String, String)]) -> Result<Value> {
        self.api_request(reqwest::Method::GET, url, Some(query), None)
            .await
    }

    async fn api_post(&self, url: &str, body: &Value) -> Result<Value> {
        self.api_request(reqwest::Method::POST, url, None, Some(body))
            .await
    }

    async fn api_request(
        &self,
        method: reqwest::Method,
        url: &str,
        query: Option<&[(String, String)]>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            let token = self.ensure_token().await?;
            let mut request = self.http.request(method.clone(), url).bearer_auth(&token);
            if let Some(query) = query {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json().await.map_err(|err| {
                            Error::Protocol(format!("invalid response body from {url}: {err}"))
                        });
                    }

                    if status == reqwest::StatusCode::UNAUTHORIZED {
                        self.invalidate_token().await;
                    }

                    let retryable = RetryPolicy::is_retryable_status(status)
                        || status == reqwest::StatusCode::UNAUTHORIZED;
                    let text = response.text().await.unwrap_or_default();
                    last_error = format!("status={status} body={}", text.trim());
                    if !retryable || attempt >= self.policy.max_attempts {
                        return Err(Error::Upstream(format!(
                            "{method} {url}: {last_error}"
                        )));
                    }
                    warn!(
                        url = %url,
                        status = %status,
                        attempt,
                        "genesys api retry after status"
                    );
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt >= self.policy.max_attempts {
                        return Err(Error::Upstream(format!("{method} {url}: {last_error}")));
                    }
                    warn!(url = %url, error = %err, attempt, "genesys api retry after network error");
                }
            }

            tokio::time::sleep(self.policy.delay(attempt)).await;
        }

        Err(Error::Upstream(format!("{url}: {last_error}")))
    }

    // ------------------------------------------------------------------
    // OAuth token cache
    // ------------------------------------------------------------------

    async fn ensure_token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token_is_fresh(token) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut cached = self.token.write().await;
        if let Some(token) = cached.as_ref() {
            if token_is_fresh(token) {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!("{}/oauth/token", self.config.login_base_url);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|err| Error::Upstream(format!("oauth request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "oauth rejected: status={status} body={}",
                body.trim()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| Error::Protocol(format!("invalid oauth response: {err}")))?;
        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if access_token.is_empty() {
            return Err(Error::Protocol(
                "Genesys OAuth response missing access_token".to_string(),
            ));
        }
        let expires_in = payload
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(3600)
            .max(60);
        let expires_at = Utc::now() + ChronoDuration::seconds(expires_in);

        self.status
            .set("token_expires_at", json!(expires_at.to_rfc3339()));
        info!(expires_in, "genesys oauth token refreshed");

        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at,
        });
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }
}

fn token_is_fresh(token: &CachedToken) -> bool {
    Utc::now() < token.expires_at - ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECONDS)
}

fn last_page(payload: &Value, page_number: u32, entity_count: usize) -> bool {
    if let Some(page_count) = payload.get("pageCount").and_then(Value::as_u64) {
        if u64::from(page_number) >= page_count {
            return true;
        }
    }
    entity_count < DISCOVERY_PAGE_SIZE as usize
}

async fn sleep_with_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}
