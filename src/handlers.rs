//! HTTP handlers for the realtime supervision API

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::codec::{self, AudioEncoding};
use crate::ingest;
use crate::model::{Envelope, SupervisorAlert};
use crate::status::{read_health, HealthReport};
use crate::{AppState, Error, Result};

/// Service health response
#[derive(Serialize)]
pub struct ServiceHealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

// ============================================
// Service health
// ============================================

pub async fn health() -> Json<ServiceHealthResponse> {
    Json(ServiceHealthResponse {
        status: "healthy".to_string(),
        service: "callwatch".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================
// Event ingest
// ============================================

pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    authorize_ingest(&state, &headers)?;
    let payload = parse_json_body(&body)?;
    let outcome = ingest::ingest_event(&state, &payload)?;

    Ok(Json(json!({
        "ok": true,
        "call_id": outcome.call_id,
        "risk_score": outcome.risk_score,
        "sentiment_score": outcome.sentiment_score,
        "alerts": outcome.alerts,
        "snapshot": outcome.snapshot,
    })))
}

// ============================================
// Audio chunk ingest
// ============================================

pub async fn ingest_audio_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    authorize_ingest(&state, &headers)?;
    let payload = parse_json_body(&body)?;
    if !payload.is_object() {
        return Err(Error::InvalidRequest(
            "JSON payload must be an object".to_string(),
        ));
    }

    let call_id = ingest::extract_call_id(&payload);
    if call_id.is_empty() {
        return Err(Error::InvalidRequest("Missing call_id".to_string()));
    }

    let decoded = decode_audio_payload(&state, &payload)?;
    let audio_state = state.audio.append(
        &call_id,
        decoded.pcm.into(),
        decoded.sample_rate,
        decoded.channels,
        decoded.occurred_at,
        decoded.chunk_id,
    )?;

    let mut warnings: Vec<String> = Vec::new();
    let mut ingested = Vec::new();
    for event_payload in ingest::build_audio_events(&payload, &call_id, &audio_state) {
        match ingest::ingest_event(&state, &event_payload) {
            Ok(outcome) => ingested.push(outcome),
            Err(err) => {
                warn!(call_id = %call_id, error = %err, "audio event ingest failed");
                warnings.push(err.to_string());
            }
        }
    }

    if ingested.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "detail": "No realtime events were ingested from audio payload",
                "audio": audio_state,
                "warnings": warnings,
            })),
        )
            .into_response());
    }

    // The same alert can surface from several segment ingests; report each once.
    let mut alerts: Vec<SupervisorAlert> = Vec::new();
    for outcome in &ingested {
        for alert in &outcome.alerts {
            if !alerts.iter().any(|existing| existing.id == alert.id) {
                alerts.push(alert.clone());
            }
        }
    }
    let snapshot = &ingested.last().expect("non-empty ingest results").snapshot;

    Ok(Json(json!({
        "ok": true,
        "call_id": call_id,
        "audio": audio_state,
        "ingested_events": ingested.len(),
        "alerts": alerts,
        "snapshot": snapshot,
        "warnings": warnings,
    }))
    .into_response())
}

struct DecodedAudio {
    pcm: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    occurred_at: chrono::DateTime<Utc>,
    chunk_id: Option<String>,
}

fn decode_audio_payload(state: &AppState, payload: &Value) -> Result<DecodedAudio> {
    let chunk_b64 = ["audio_b64", "chunk_b64", "audio_chunk_b64", "audio_chunk"]
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::InvalidRequest("Missing audio chunk base64 (audio_b64)".to_string()))?;

    let raw = base64::engine::general_purpose::STANDARD
        .decode(chunk_b64)
        .map_err(|_| Error::Decode("Invalid base64 audio payload".to_string()))?;
    if raw.is_empty() {
        return Err(Error::Decode("Empty decoded audio payload".to_string()));
    }

    let encoding_tag = payload
        .get("audio_encoding")
        .or_else(|| payload.get("encoding"))
        .and_then(Value::as_str)
        .unwrap_or("pcm_s16le");
    let encoding = AudioEncoding::parse(encoding_tag)
        .ok_or_else(|| Error::Decode(format!("Unsupported audio_encoding: {encoding_tag}")))?;

    let occurred_at = ingest::parse_timestamp(
        payload.get("timestamp").or_else(|| payload.get("occurred_at")),
        Utc::now(),
    );
    let chunk_id = payload
        .get("chunk_id")
        .or_else(|| payload.get("sequence_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);

    let (pcm, sample_rate, channels) = match encoding {
        AudioEncoding::Wav => {
            let parsed = codec::parse_wav(&raw)?;
            (parsed.pcm, parsed.sample_rate, parsed.channels)
        }
        other => {
            let sample_rate = payload
                .get("sample_rate")
                .and_then(Value::as_u64)
                .map(|value| value as u32)
                .unwrap_or(state.config.realtime.audio_default_sample_rate);
            let channels = payload
                .get("channels")
                .and_then(Value::as_u64)
                .map(|value| value as u16)
                .unwrap_or(state.config.realtime.audio_default_channels);
            (codec::decode_frames(other, &raw)?, sample_rate, channels)
        }
    };

    if pcm.is_empty() {
        return Err(Error::Decode("Audio payload has no PCM frames".to_string()));
    }

    Ok(DecodedAudio {
        pcm,
        sample_rate,
        channels,
        occurred_at,
        chunk_id,
    })
}

// ============================================
// Snapshot & audio
// ============================================

pub async fn call_snapshot(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Json<Value> {
    Json(json!(ingest::build_snapshot(&state, &call_id)))
}

#[derive(Debug, Deserialize)]
pub struct AudioParams {
    #[serde(default)]
    pub max_seconds: Option<u64>,
    #[serde(default)]
    pub fallback: Option<String>,
}

pub async fn call_audio(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Query(params): Query<AudioParams>,
) -> Result<Response> {
    if let Some(wav) = state
        .audio
        .render_wav(&call_id, params.max_seconds.filter(|seconds| *seconds > 0))
    {
        let headers = [
            (header::CONTENT_TYPE, "audio/wav".to_string()),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate, max-age=0".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{call_id}_live.wav\""),
            ),
        ];
        let mut response = (headers, wav).into_response();
        response
            .headers_mut()
            .insert("X-Live-Audio", header::HeaderValue::from_static("1"));
        return Ok(response);
    }

    let fallback_requested = matches!(
        params.fallback.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes")
    );
    if fallback_requested {
        if let Some(path) = resolve_fallback_recording(&state, &call_id) {
            let bytes = tokio::fs::read(&path).await?;
            let content_type = match path.extension().and_then(|ext| ext.to_str()) {
                Some("wav") => "audio/wav",
                Some("mp3") => "audio/mpeg",
                Some("m4a") => "audio/mp4",
                Some("ogg") => "audio/ogg",
                Some("flac") => "audio/flac",
                _ => "application/octet-stream",
            };
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("recording")
                .to_string();
            let headers = [
                (header::CONTENT_TYPE, content_type.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("inline; filename=\"{name}\""),
                ),
            ];
            let mut response = (headers, bytes).into_response();
            response
                .headers_mut()
                .insert("X-Live-Audio", header::HeaderValue::from_static("0"));
            return Ok(response);
        }
    }

    Err(Error::NotFound("Live audio".to_string()))
}

pub async fn call_audio_meta(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Json<Value> {
    let live_audio = state.audio.snapshot(&call_id);
    let fallback_available = resolve_fallback_recording(&state, &call_id).is_some();
    let preferred = if live_audio.available {
        "live"
    } else {
        "fallback"
    };

    Json(json!({
        "call_id": call_id,
        "live_audio": live_audio,
        "fallback_audio_available": fallback_available,
        "preferred_source": preferred,
    }))
}

/// `<uploads_dir>/<call_id>_*.{wav,mp3,m4a,ogg,flac}`, first match wins
fn resolve_fallback_recording(state: &AppState, call_id: &str) -> Option<std::path::PathBuf> {
    const EXTENSIONS: [&str; 5] = ["wav", "mp3", "m4a", "ogg", "flac"];
    let prefix = format!("{call_id}_");

    let entries = std::fs::read_dir(&state.config.server.uploads_dir).ok()?;
    let mut matches: Vec<std::path::PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().and_then(|name| name.to_str()).unwrap_or("");
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("")
                .to_lowercase();
            name.starts_with(&prefix) && EXTENSIONS.contains(&extension.as_str())
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}

// ============================================
// Alerts
// ============================================

#[derive(Debug, Deserialize)]
pub struct AlertListParams {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub open_only: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertListParams>,
) -> Json<Value> {
    let call_id = params
        .call_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let open_only = params
        .open_only
        .as_deref()
        .map(|value| value.trim().to_lowercase() != "false")
        .unwrap_or(true);
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    Json(json!({
        "alerts": state.repository.recent_alerts(call_id, open_only, limit),
    }))
}

pub async fn ack_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
) -> Result<Json<Value>> {
    let (alert, newly_acknowledged) = state.repository.ack_alert(alert_id, Utc::now())?;
    if newly_acknowledged {
        state.bus.publish(
            &alert.call_id,
            &Envelope::SupervisorAlertAck {
                call_id: alert.call_id.clone(),
                alert: alert.clone(),
            },
        );
    }
    Ok(Json(json!({ "ok": true, "alert": alert })))
}

// ============================================
// Worker health probes
// ============================================

#[derive(Debug, Deserialize)]
pub struct WorkerHealthParams {
    #[serde(default)]
    pub stale_after: Option<u64>,
}

pub async fn genesys_connector_health(
    State(state): State<AppState>,
    Query(params): Query<WorkerHealthParams>,
) -> Response {
    worker_health(
        &state.config.genesys.connector_status_path,
        params
            .stale_after
            .unwrap_or(state.config.genesys.connector_health_stale_seconds),
    )
}

pub async fn genesys_audiohook_health(
    State(state): State<AppState>,
    Query(params): Query<WorkerHealthParams>,
) -> Response {
    worker_health(
        &state.config.audiohook.status_path,
        params
            .stale_after
            .unwrap_or(state.config.audiohook.health_stale_seconds),
    )
}

fn worker_health(path: &std::path::Path, stale_after: u64) -> Response {
    let stale_after = stale_after.max(10);
    match read_health(path, stale_after, Utc::now()) {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "status file unreadable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HealthReport {
                    healthy: false,
                    state: "unknown".to_string(),
                    age_seconds: None,
                    reason: Some("status_file_unreadable".to_string()),
                    stale_after_seconds: stale_after,
                    status_path: path.display().to_string(),
                    status: None,
                }),
            )
                .into_response()
        }
    }
}

// ============================================
// Shared helpers
// ============================================

fn parse_json_body(body: &Bytes) -> Result<Value> {
    serde_json::from_slice(body).map_err(|_| Error::InvalidRequest("Invalid JSON body".to_string()))
}

fn authorize_ingest(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let expected = state.config.realtime.ingest_token.trim();
    if expected.is_empty() {
        return Ok(());
    }

    if let Some(token) = headers.get("X-Cloud-Token").and_then(|value| value.to_str().ok()) {
        if token.trim() == expected {
            return Ok(());
        }
    }

    if let Some(authorization) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        let trimmed = authorization.trim();
        if trimmed.len() > 7 && trimmed[..7].eq_ignore_ascii_case("bearer ") {
            if trimmed[7..].trim() == expected {
                return Ok(());
            }
        }
    }

    Err(Error::Auth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_body_rejects_garbage() {
        assert!(parse_json_body(&Bytes::from_static(b"{not json")).is_err());
        assert!(parse_json_body(&Bytes::from_static(b"{\"a\":1}")).is_ok());
    }
}
