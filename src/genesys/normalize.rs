//! Genesys notification payloads -> realtime ingest events
//!
//! Notification frames arrive in a few shapes (single object, batch array,
//! `{notifications: [...]}`) and the event bodies vary per topic. The
//! mapping is deliberately permissive: anything with a resolvable
//! conversation id becomes at least one ingest payload; everything else is
//! dropped with a debug log upstream.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Split a websocket frame into individual notification objects
pub fn flatten_notifications(payload: &Value) -> Vec<&Map<String, Value>> {
    match payload {
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        Value::Object(object) => {
            if let Some(Value::Array(items)) = object.get("notifications") {
                items.iter().filter_map(Value::as_object).collect()
            } else {
                vec![object]
            }
        }
        _ => Vec::new(),
    }
}

/// True for the channel keep-alive frames the connector should swallow
pub fn is_channel_metadata(notification: &Map<String, Value>) -> bool {
    topic_of(notification).ends_with("channel.metadata")
}

fn topic_of(notification: &Map<String, Value>) -> String {
    notification
        .get("topicName")
        .or_else(|| notification.get("topic"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Map one notification onto zero or more ingest payloads
pub fn map_notification(notification: &Map<String, Value>) -> Vec<Value> {
    let topic = topic_of(notification);
    if topic.is_empty() || topic.ends_with("channel.metadata") {
        return Vec::new();
    }

    let empty = Map::new();
    let event_body = notification
        .get("eventBody")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let call_id = extract_call_id(&topic, event_body);
    if call_id.is_empty() {
        return Vec::new();
    }

    let event_type = extract_event_type(&topic, event_body);
    let status = extract_status(&event_type, event_body);
    let sentiment = extract_sentiment(event_body);
    let confidence = extract_confidence(event_body);
    let occurred_at = extract_occurred_at(notification, event_body);
    let default_speaker = extract_speaker(event_body);
    let agent_id = extract_agent_id(event_body);
    let customer_id = extract_customer_id(event_body);

    let mut records = extract_text_records(event_body, &default_speaker);
    if records.is_empty() {
        records.push(TextRecord {
            text: String::new(),
            speaker: default_speaker.clone(),
            source: "topic_only".to_string(),
        });
    }

    let is_custom = !matches!(
        event_type.as_str(),
        "transcript" | "sentiment" | "status" | "metric" | "alert_trigger" | "audio_chunk"
            | "end" | "call_end"
    );

    records
        .into_iter()
        .take(6)
        .map(|record| {
            let mut metadata = Map::new();
            metadata.insert("genesys_topic".to_string(), json!(&topic));
            metadata.insert("genesys_source".to_string(), json!(record.source));
            let mut keys: Vec<&String> = event_body.keys().collect();
            keys.sort();
            metadata.insert(
                "genesys_event_keys".to_string(),
                json!(keys.iter().take(40).collect::<Vec<_>>()),
            );
            if let Some(metrics) = extract_monitoring_metrics(event_body) {
                metadata.insert("metrics".to_string(), metrics);
            }
            if is_custom {
                // Unmapped topics keep the raw body for downstream consumers
                metadata.insert(
                    "genesys_event".to_string(),
                    Value::Object(event_body.clone()),
                );
            }

            json!({
                "provider": "genesys_cloud",
                "call_id": &call_id,
                "event_type": &event_type,
                "speaker": record.speaker,
                "text": record.text,
                "sentiment": &sentiment,
                "confidence": &confidence,
                "status": &status,
                "timestamp": occurred_at.to_rfc3339(),
                "agent_id": &agent_id,
                "customer_id": &customer_id,
                "metadata": metadata,
            })
        })
        .collect()
}

struct TextRecord {
    text: String,
    speaker: String,
    source: String,
}

fn extract_call_id(topic: &str, event_body: &Map<String, Value>) -> String {
    let mut candidates: Vec<Option<&Value>> = vec![
        event_body.get("conversationId"),
        event_body.get("conversation_id"),
        event_body.get("id"),
    ];
    if let Some(Value::Object(conversation)) = event_body.get("conversation") {
        candidates.push(conversation.get("id"));
        candidates.push(conversation.get("conversationId"));
    }

    for candidate in candidates.into_iter().flatten() {
        if let Some(value) = candidate.as_str() {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    // v2.routing.queues.{id}.conversations.{conversationId}... style topics
    if let Some(position) = topic.find("conversations.") {
        let tail = &topic[position + "conversations.".len()..];
        let candidate: String = tail
            .chars()
            .take_while(|ch| ch.is_ascii_hexdigit() || *ch == '-')
            .collect();
        if candidate.len() >= 16 {
            return candidate;
        }
    }

    String::new()
}

fn extract_event_type(topic: &str, event_body: &Map<String, Value>) -> String {
    let explicit = event_body
        .get("eventType")
        .or_else(|| event_body.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if !explicit.is_empty() {
        return explicit;
    }
    topic
        .rsplit('.')
        .find(|part| !part.is_empty())
        .unwrap_or("transcript")
        .to_lowercase()
}

fn extract_status(event_type: &str, event_body: &Map<String, Value>) -> String {
    let raw = ["status", "state", "conversationState"]
        .iter()
        .find_map(|key| event_body.get(*key).and_then(Value::as_str))
        .unwrap_or("")
        .trim()
        .to_lowercase();

    let terminal = |value: &str| {
        ["disconnect", "terminated", "ended", "complete", "closed"]
            .iter()
            .any(|token| value.contains(token))
    };

    if !raw.is_empty() {
        if terminal(&raw) {
            return "ended".to_string();
        }
        return "active".to_string();
    }
    if ["disconnect", "terminate", "end", "complete"]
        .iter()
        .any(|token| event_type.contains(token))
    {
        return "ended".to_string();
    }
    "active".to_string()
}

fn extract_occurred_at(
    notification: &Map<String, Value>,
    event_body: &Map<String, Value>,
) -> DateTime<Utc> {
    for key in ["eventTime", "timestamp", "eventDate", "createdDate", "startTime"] {
        if let Some(parsed) = event_body.get(key).and_then(parse_datetime) {
            return parsed;
        }
    }
    if let Some(Value::Object(metadata)) = notification.get("metadata") {
        if let Some(parsed) = metadata.get("messageTime").and_then(parse_datetime) {
            return parsed;
        }
    }
    Utc::now()
}

fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) if !text.trim().is_empty() => {
            DateTime::parse_from_rfc3339(text.trim())
                .map(|parsed| parsed.with_timezone(&Utc))
                .ok()
        }
        Value::Number(number) => number.as_f64().and_then(|seconds| {
            chrono::TimeZone::timestamp_millis_opt(&Utc, (seconds * 1000.0) as i64).single()
        }),
        _ => None,
    }
}

fn extract_speaker(event_body: &Map<String, Value>) -> String {
    for key in ["speaker", "speakerType", "participantPurpose", "purpose", "role"] {
        if let Some(value) = event_body.get(key).and_then(Value::as_str) {
            let normalized = normalize_speaker(value);
            if !normalized.is_empty() {
                return normalized;
            }
        }
    }

    if let Some(Value::Array(participants)) = event_body.get("participants") {
        for participant in participants.iter().filter_map(Value::as_object) {
            let purpose = participant
                .get("purpose")
                .or_else(|| participant.get("participantPurpose"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            if purpose.is_empty() {
                continue;
            }
            let state = participant
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            if state == "connected" || state == "alerting" {
                return normalize_speaker(purpose);
            }
        }
    }
    String::new()
}

pub fn normalize_speaker(value: &str) -> String {
    let normalized = value.trim().to_lowercase();
    match normalized.as_str() {
        "" => String::new(),
        "agent" | "user" | "acd" => "agent".to_string(),
        "customer" | "external" | "client" => "customer".to_string(),
        other => other.to_string(),
    }
}

fn extract_agent_id(event_body: &Map<String, Value>) -> String {
    for key in ["agentId", "agent_id", "userId"] {
        if let Some(value) = event_body.get(key).and_then(Value::as_str) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }

    if let Some(Value::Array(participants)) = event_body.get("participants") {
        for participant in participants.iter().filter_map(Value::as_object) {
            let purpose = participant
                .get("purpose")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            if purpose != "agent" && purpose != "user" {
                continue;
            }
            if let Some(value) = participant
                .get("userId")
                .or_else(|| participant.get("id"))
                .and_then(Value::as_str)
            {
                if !value.trim().is_empty() {
                    return value.trim().to_string();
                }
            }
        }
    }
    String::new()
}

fn extract_customer_id(event_body: &Map<String, Value>) -> String {
    for key in ["customerId", "externalContactId", "customer_id"] {
        if let Some(value) = event_body.get(key).and_then(Value::as_str) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }

    if let Some(Value::Array(participants)) = event_body.get("participants") {
        for participant in participants.iter().filter_map(Value::as_object) {
            let purpose = participant
                .get("purpose")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            if purpose != "customer" && purpose != "external" {
                continue;
            }
            if let Some(value) = participant
                .get("id")
                .or_else(|| participant.get("externalContactId"))
                .and_then(Value::as_str)
            {
                if !value.trim().is_empty() {
                    return value.trim().to_string();
                }
            }
        }
    }
    String::new()
}

fn extract_text_records(event_body: &Map<String, Value>, default_speaker: &str) -> Vec<TextRecord> {
    let mut records = Vec::new();

    if let Some(Value::Array(transcripts)) = event_body.get("transcripts") {
        for entry in transcripts.iter().filter_map(Value::as_object) {
            let text = ["text", "transcript", "utteranceText"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(Value::as_str))
                .unwrap_or("")
                .trim();
            if text.is_empty() {
                continue;
            }
            let speaker = ["speaker", "participantPurpose", "role"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(Value::as_str))
                .unwrap_or("");
            records.push(TextRecord {
                text: text.to_string(),
                speaker: normalize_speaker(speaker),
                source: "transcripts".to_string(),
            });
        }
    }

    if let Some(Value::Array(utterances)) = event_body.get("utterances") {
        for entry in utterances.iter().filter_map(Value::as_object) {
            let text = ["text", "utteranceText"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(Value::as_str))
                .unwrap_or("")
                .trim();
            if text.is_empty() {
                continue;
            }
            let speaker = ["speaker", "role"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(Value::as_str))
                .unwrap_or("");
            records.push(TextRecord {
                text: text.to_string(),
                speaker: normalize_speaker(speaker),
                source: "utterances".to_string(),
            });
        }
    }

    for key in ["text", "transcript", "utteranceText", "message"] {
        match event_body.get(key) {
            Some(Value::String(value)) if !value.trim().is_empty() => {
                records.push(TextRecord {
                    text: value.trim().to_string(),
                    speaker: default_speaker.to_string(),
                    source: key.to_string(),
                });
            }
            Some(Value::Object(nested)) => {
                let text = nested
                    .get("text")
                    .or_else(|| nested.get("body"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim();
                if !text.is_empty() {
                    records.push(TextRecord {
                        text: text.to_string(),
                        speaker: default_speaker.to_string(),
                        source: key.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    // Dedupe case-insensitively, first source wins
    let mut seen: Vec<String> = Vec::new();
    records.retain(|record| {
        let key = record.text.to_lowercase();
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
    records
}

fn extract_sentiment(event_body: &Map<String, Value>) -> Value {
    for key in ["sentiment", "sentimentScore", "overallSentiment", "sentiment_score"] {
        if let Some(parsed) = event_body.get(key).and_then(parse_sentiment) {
            return json!(parsed);
        }
    }
    if let Some(Value::Object(sentiment)) = event_body.get("sentiment") {
        for key in ["score", "overall", "value"] {
            if let Some(parsed) = sentiment.get(key).and_then(parse_sentiment) {
                return json!(parsed);
            }
        }
    }
    Value::Null
}

fn parse_sentiment(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().map(|parsed| parsed.clamp(-1.0, 1.0)),
        Value::String(text) => {
            let trimmed = text.trim().to_lowercase();
            if let Ok(parsed) = trimmed.parse::<f64>() {
                return Some(parsed.clamp(-1.0, 1.0));
            }
            match trimmed.as_str() {
                "negative" | "neg" => Some(-0.7),
                "neutral" => Some(0.0),
                "positive" | "pos" => Some(0.7),
                _ => None,
            }
        }
        _ => None,
    }
}

fn extract_confidence(event_body: &Map<String, Value>) -> Value {
    let mut candidates: Vec<Option<&Value>> = vec![
        event_body.get("confidence"),
        event_body.get("confidenceScore"),
        event_body.get("sentimentConfidence"),
    ];
    if let Some(Value::Object(sentiment)) = event_body.get("sentiment") {
        candidates.push(sentiment.get("confidence"));
        candidates.push(sentiment.get("confidenceScore"));
    }

    for candidate in candidates.into_iter().flatten() {
        if let Some(parsed) = candidate.as_f64() {
            return json!(parsed.clamp(0.0, 1.0));
        }
    }
    Value::Null
}

fn extract_monitoring_metrics(event_body: &Map<String, Value>) -> Option<Value> {
    let silence = ["deadAirSeconds", "silenceSeconds", "dead_air_seconds"]
        .iter()
        .find_map(|key| event_body.get(*key))?;
    let parsed = match silence {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }?;
    Some(json!({ "dead_air_seconds": parsed.max(0.0) }))
}
