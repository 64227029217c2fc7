//! Realtime ingest pipeline
//!
//! Normalizes provider payloads into the event schema, merges them into
//! per-call state, runs the alert evaluator, persists the results, and fans
//! envelopes out to stream subscribers. The alert envelopes for an event are
//! always published after its `realtime_event` envelope.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::info;

use crate::audio::AudioSnapshot;
use crate::model::{
    CallSnapshot, CallStatus, Envelope, EventType, Metadata, RealtimeEvent, Speaker,
    SupervisorAlert,
};
use crate::repository::{CallMutation, NewAlertRow, NewEvent};
use crate::{alerts, AppState, Error, Result};

const SNAPSHOT_EVENT_LIMIT: usize = 50;
const SNAPSHOT_ALERT_LIMIT: usize = 20;
const SEGMENT_LIMIT: usize = 50;

/// Result of one ingested event
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub call_id: String,
    pub risk_score: f64,
    pub sentiment_score: f64,
    pub alerts: Vec<SupervisorAlert>,
    pub snapshot: CallSnapshot,
    pub event: RealtimeEvent,
}

/// Payload normalized into the event schema
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub call_id: String,
    pub provider: String,
    pub event_type: EventType,
    pub speaker: Option<Speaker>,
    pub text: String,
    pub sentiment: Option<f64>,
    pub confidence: Option<f64>,
    pub status: Option<CallStatus>,
    pub agent_id: String,
    pub customer_id: String,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Accept `call_id` with the aliases upstream connectors actually send
pub fn extract_call_id(payload: &Value) -> String {
    for key in ["call_id", "conversation_id", "session_id"] {
        if let Some(value) = payload.get(key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

pub fn normalize_event_payload(payload: &Value, now: DateTime<Utc>) -> Result<NormalizedEvent> {
    let Some(object) = payload.as_object() else {
        return Err(Error::InvalidRequest(
            "JSON payload must be an object".to_string(),
        ));
    };

    let call_id = extract_call_id(payload);
    if call_id.is_empty() {
        return Err(Error::InvalidRequest("Missing call_id".to_string()));
    }

    let mut metadata = match object.get("metadata") {
        Some(Value::Object(map)) => map.clone(),
        _ => Metadata::new(),
    };
    // Top-level metrics ride along under metadata.metrics
    if let Some(Value::Object(metrics)) = object.get("metrics") {
        metadata.insert("metrics".to_string(), Value::Object(metrics.clone()));
    }

    let raw_event_type = string_field(object, "event_type");
    let event_type = EventType::parse(&raw_event_type);
    if event_type == EventType::Custom && !raw_event_type.is_empty() {
        metadata.insert("source_event_type".to_string(), Value::String(raw_event_type));
    }

    let text = {
        let direct = string_field(object, "text");
        if direct.is_empty() {
            string_field(object, "transcript")
        } else {
            direct
        }
    };

    let status = CallStatus::parse(&string_field(object, "status")).or({
        if event_type == EventType::End {
            Some(CallStatus::Ended)
        } else {
            None
        }
    });

    Ok(NormalizedEvent {
        call_id,
        provider: {
            let provider = string_field(object, "provider");
            if provider.is_empty() {
                "generic".to_string()
            } else {
                provider
            }
        },
        event_type,
        speaker: Speaker::parse(&string_field(object, "speaker")),
        text,
        sentiment: float_field(object, "sentiment").map(|value| value.clamp(-1.0, 1.0)),
        confidence: float_field(object, "confidence").map(|value| value.clamp(0.0, 1.0)),
        status,
        agent_id: string_field(object, "agent_id"),
        customer_id: string_field(object, "customer_id"),
        occurred_at: parse_timestamp(object.get("timestamp").or_else(|| object.get("occurred_at")), now),
        metadata,
    })
}

/// Run the full pipeline for one event payload
pub fn ingest_event(state: &AppState, payload: &Value) -> Result<IngestOutcome> {
    let now = Utc::now();
    let normalized = normalize_event_payload(payload, now)?;
    let call_id = normalized.call_id.clone();

    let prior_status = state.repository.get_call(&call_id).map(|call| call.status);

    let mutation = CallMutation {
        provider: Some(normalized.provider.clone()),
        status: normalized.status,
        agent_id: Some(normalized.agent_id.clone()),
        customer_id: Some(normalized.customer_id.clone()),
        speaker: normalized.speaker,
        text: Some(normalized.text.clone()),
        metadata: Some(normalized.metadata.clone()),
    };
    let call = state.repository.upsert_call(&call_id, &mutation, now);

    let event = state.repository.append_event(NewEvent {
        call_id: call_id.clone(),
        event_type: normalized.event_type,
        speaker: normalized.speaker,
        text: normalized.text,
        sentiment: normalized.sentiment,
        confidence: normalized.confidence,
        occurred_at: normalized.occurred_at,
        metadata: normalized.metadata,
    });

    let marks = state.repository.alert_marks(&call_id);
    let evaluation = alerts::evaluate(&call, &event, &state.config.realtime, &marks, now);

    let call = state
        .repository
        .set_scores(
            &call_id,
            evaluation.risk_score,
            evaluation.sentiment_score,
            now,
        )
        .unwrap_or(call);

    let persisted: Vec<SupervisorAlert> = evaluation
        .alerts
        .into_iter()
        .map(|alert| {
            state.repository.append_alert(
                NewAlertRow {
                    call_id: call_id.clone(),
                    alert_type: alert.alert_type,
                    severity: alert.severity,
                    message: alert.message,
                    metadata: alert.metadata,
                },
                now,
            )
        })
        .collect();

    let snapshot = build_snapshot(state, &call_id);

    state.bus.publish(
        &call_id,
        &Envelope::RealtimeEvent {
            call_id: call_id.clone(),
            provider: call.provider.clone(),
            status: call.status,
            event: event.clone(),
            risk_score: call.risk_score,
            sentiment_score: call.sentiment_score,
        },
    );

    if let Some(previous) = prior_status {
        if previous != call.status {
            state.bus.publish(
                &call_id,
                &Envelope::Status {
                    call_id: call_id.clone(),
                    status: call.status.as_str().to_string(),
                    timestamp: now,
                },
            );
        }
    }

    for alert in &persisted {
        state.bus.publish(
            &call_id,
            &Envelope::SupervisorAlert {
                call_id: call_id.clone(),
                provider: call.provider.clone(),
                risk_score: call.risk_score,
                alert: alert.clone(),
            },
        );
    }

    info!(
        call_id = %call_id,
        event_type = ?event.event_type,
        alerts = persisted.len(),
        risk_score = call.risk_score,
        "realtime event ingested"
    );

    Ok(IngestOutcome {
        call_id,
        risk_score: call.risk_score,
        sentiment_score: call.sentiment_score,
        alerts: persisted,
        snapshot,
        event,
    })
}

/// Current call view plus recent events, open alerts, and audio metadata.
/// Unknown calls yield an idle snapshot rather than an error.
pub fn build_snapshot(state: &AppState, call_id: &str) -> CallSnapshot {
    let live_audio = state.audio.snapshot(call_id);
    match state.repository.get_call(call_id) {
        Some(call) => {
            let mut events = state
                .repository
                .recent_events(call_id, SNAPSHOT_EVENT_LIMIT);
            events.reverse();
            CallSnapshot {
                call_id: call.call_id.clone(),
                provider: call.provider.clone(),
                status: call.status,
                risk_score: call.risk_score,
                sentiment_score: call.sentiment_score,
                updated_at: Some(call.updated_at),
                events,
                alerts: state
                    .repository
                    .recent_alerts(Some(call_id), true, SNAPSHOT_ALERT_LIMIT),
                live_audio,
            }
        }
        None => CallSnapshot::idle(call_id, live_audio),
    }
}

/// Expand an audio-chunk payload into the events it implies: one per
/// transcript segment, else one for a whole-payload transcript, else a
/// synthetic `audio_chunk` event so the call stays active.
pub fn build_audio_events(
    payload: &Value,
    call_id: &str,
    audio_state: &AudioSnapshot,
) -> Vec<Value> {
    let object = match payload.as_object() {
        Some(object) => object,
        None => return Vec::new(),
    };

    let provider = {
        let value = string_field(object, "provider");
        if value.is_empty() {
            "generic".to_string()
        } else {
            value
        }
    };
    let status = {
        let value = string_field(object, "status");
        if value.is_empty() {
            "active".to_string()
        } else {
            value
        }
    };
    let agent_id = string_field(object, "agent_id");
    let customer_id = string_field(object, "customer_id");
    let fallback_speaker = string_field(object, "speaker");
    let fallback_timestamp = object
        .get("timestamp")
        .or_else(|| object.get("occurred_at"))
        .cloned();

    let mut base_metadata = match object.get("metadata") {
        Some(Value::Object(map)) => map.clone(),
        _ => Metadata::new(),
    };
    base_metadata.insert(
        "audio".to_string(),
        serde_json::to_value(audio_state).unwrap_or(Value::Null),
    );

    let segments = match object.get("transcript_segments").or_else(|| object.get("segments")) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };

    let mut events = Vec::new();
    for segment in segments.iter().take(SEGMENT_LIMIT) {
        let Some(segment) = segment.as_object() else {
            continue;
        };
        let text = {
            let direct = string_field(segment, "text");
            if direct.is_empty() {
                string_field(segment, "transcript")
            } else {
                direct
            }
        };
        if text.is_empty() {
            continue;
        }

        let mut metadata = base_metadata.clone();
        if let Some(Value::Object(extra)) = segment.get("metadata") {
            for (key, value) in extra {
                metadata.insert(key.clone(), value.clone());
            }
        }

        let event_type = {
            let value = string_field(segment, "event_type");
            if value.is_empty() {
                "transcript".to_string()
            } else {
                value
            }
        };
        let speaker = {
            let value = string_field(segment, "speaker");
            if value.is_empty() {
                fallback_speaker.clone()
            } else {
                value
            }
        };

        events.push(serde_json::json!({
            "provider": &provider,
            "call_id": call_id,
            "event_type": event_type,
            "speaker": speaker,
            "text": text,
            "sentiment": segment.get("sentiment").cloned().unwrap_or(Value::Null),
            "confidence": segment.get("confidence").cloned().unwrap_or(Value::Null),
            "status": segment.get("status").cloned().unwrap_or(Value::String(status.clone())),
            "timestamp": segment
                .get("timestamp")
                .or_else(|| segment.get("occurred_at"))
                .cloned()
                .or_else(|| fallback_timestamp.clone())
                .unwrap_or(Value::Null),
            "agent_id": &agent_id,
            "customer_id": &customer_id,
            "metadata": metadata,
        }));
    }
    if !events.is_empty() {
        return events;
    }

    let text = {
        let direct = string_field(object, "text");
        if direct.is_empty() {
            string_field(object, "transcript")
        } else {
            direct
        }
    };
    let event_type = if text.is_empty() { "audio_chunk" } else { "transcript" };

    vec![serde_json::json!({
        "provider": provider,
        "call_id": call_id,
        "event_type": event_type,
        "speaker": fallback_speaker,
        "text": text,
        "sentiment": object.get("sentiment").cloned().unwrap_or(Value::Null),
        "confidence": object.get("confidence").cloned().unwrap_or(Value::Null),
        "status": status,
        "timestamp": fallback_timestamp.unwrap_or(Value::Null),
        "agent_id": agent_id,
        "customer_id": customer_id,
        "metadata": base_metadata,
    })]
}

/// RFC 3339 strings and epoch-second numbers; anything else falls back to
/// the server clock.
pub fn parse_timestamp(value: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => {
            DateTime::parse_from_rfc3339(text.trim())
                .map(|parsed| parsed.with_timezone(&Utc))
                .unwrap_or(now)
        }
        Some(Value::Number(number)) => number
            .as_f64()
            .and_then(|seconds| {
                let millis = (seconds * 1000.0) as i64;
                Utc.timestamp_millis_opt(millis).single()
            })
            .unwrap_or(now),
        _ => now,
    }
}

fn string_field(object: &Metadata, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}

fn float_field(object: &Metadata, key: &str) -> Option<f64> {
    match object.get(key) {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_requires_call_id() {
        let now = Utc::now();
        assert!(normalize_event_payload(&json!({"event_type": "transcript"}), now).is_err());
        assert!(normalize_event_payload(&json!([1, 2]), now).is_err());
    }

    #[test]
    fn test_normalize_accepts_conversation_id_alias() {
        let now = Utc::now();
        let normalized =
            normalize_event_payload(&json!({"conversation_id": " RT-9 "}), now).unwrap();
        assert_eq!(normalized.call_id, "RT-9");
        assert_eq!(normalized.event_type, EventType::Transcript);
        assert_eq!(normalized.provider, "generic");
    }

    #[test]
    fn test_normalize_merges_top_level_metrics() {
        let now = Utc::now();
        let normalized = normalize_event_payload(
            &json!({
                "call_id": "RT-1",
                "metrics": {"dead_air_seconds": 6},
                "metadata": {"origin": "test"}
            }),
            now,
        )
        .unwrap();
        assert_eq!(normalized.metadata["origin"], json!("test"));
        assert_eq!(normalized.metadata["metrics"]["dead_air_seconds"], json!(6));
    }

    #[test]
    fn test_normalize_end_event_marks_call_ended() {
        let now = Utc::now();
        let normalized = normalize_event_payload(
            &json!({"call_id": "RT-1", "event_type": "call_end"}),
            now,
        )
        .unwrap();
        assert_eq!(normalized.event_type, EventType::End);
        assert_eq!(normalized.status, Some(CallStatus::Ended));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let now = Utc::now();
        let parsed = parse_timestamp(Some(&json!("2026-03-01T10:20:30Z")), now);
        assert_eq!(parsed.timestamp(), 1_772_360_430);

        let epoch = parse_timestamp(Some(&json!(1_772_360_430)), now);
        assert_eq!(epoch.timestamp(), 1_772_360_430);

        assert_eq!(parse_timestamp(Some(&json!("nonsense")), now), now);
        assert_eq!(parse_timestamp(None, now), now);
    }

    #[test]
    fn test_audio_events_prefer_segments() {
        let audio = AudioSnapshot {
            call_id: "RT-1".to_string(),
            available: true,
            duration_seconds: 1.0,
            sample_rate: Some(16_000),
            channels: Some(1),
            sample_width: Some(2),
            chunk_count: 1,
            updated_at: None,
            last_chunk_id: "1_1".to_string(),
            window_seconds: 300,
        };
        let payload = json!({
            "call_id": "RT-1",
            "transcript": "whole utterance",
            "transcript_segments": [
                {"text": "first", "speaker": "agent"},
                {"transcript": "second", "sentiment": -0.5},
                {"note": "no text, skipped"}
            ]
        });
        let events = build_audio_events(&payload, "RT-1", &audio);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["text"], json!("first"));
        assert_eq!(events[0]["speaker"], json!("agent"));
        assert_eq!(events[1]["sentiment"], json!(-0.5));
        assert_eq!(events[0]["metadata"]["audio"]["available"], json!(true));
    }

    #[test]
    fn test_audio_events_fall_back_to_synthetic_chunk() {
        let audio = AudioSnapshot {
            call_id: "RT-1".to_string(),
            available: true,
            duration_seconds: 0.5,
            sample_rate: Some(8_000),
            channels: Some(1),
            sample_width: Some(2),
            chunk_count: 1,
            updated_at: None,
            last_chunk_id: "1_1".to_string(),
            window_seconds: 300,
        };
        let events = build_audio_events(&json!({"call_id": "RT-1"}), "RT-1", &audio);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event_type"], json!("audio_chunk"));
    }
}
