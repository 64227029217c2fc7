//! Domain types shared by the ingest pipeline, repository, and fan-out layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form metadata attached to calls, events, and alerts
pub type Metadata = serde_json::Map<String, Value>;

/// Lifecycle state of a live call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Active,
    Ended,
    Unknown,
}

impl CallStatus {
    /// Map provider status strings onto the three-state lifecycle.
    /// Terminal vocabulary varies per provider, so match on substrings.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }
        if ["disconnect", "terminated", "ended", "complete", "closed"]
            .iter()
            .any(|token| normalized.contains(token))
        {
            return Some(CallStatus::Ended);
        }
        Some(CallStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Unknown => "unknown",
        }
    }
}

/// What a realtime event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Transcript,
    Sentiment,
    Status,
    Metric,
    AlertTrigger,
    AudioChunk,
    End,
    Custom,
}

impl EventType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "transcript" | "" => EventType::Transcript,
            "sentiment" => EventType::Sentiment,
            "status" => EventType::Status,
            "metric" => EventType::Metric,
            "alert_trigger" => EventType::AlertTrigger,
            "audio_chunk" => EventType::AudioChunk,
            "end" | "call_end" => EventType::End,
            _ => EventType::Custom,
        }
    }
}

/// Who spoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    Customer,
    System,
}

impl Speaker {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "agent" | "user" | "acd" | "internal" => Some(Speaker::Agent),
            "customer" | "external" | "client" => Some(Speaker::Customer),
            "system" => Some(Speaker::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Agent => "agent",
            Speaker::Customer => "customer",
            Speaker::System => "system",
        }
    }
}

/// Alert rule tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    NegativeSentiment,
    EscalationKeyword,
    DeadAir,
    HighRisk,
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One live call, keyed by the upstream-assigned call id
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeCall {
    pub call_id: String,
    pub provider: String,
    pub status: CallStatus,
    pub risk_score: f64,
    pub sentiment_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agent_id: Option<String>,
    pub customer_id: Option<String>,
    pub last_speaker: Option<Speaker>,
    pub last_text: String,
    pub metadata: Metadata,
}

/// Append-only per-call event row
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    pub id: i64,
    pub call_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub speaker: Option<Speaker>,
    pub text: String,
    pub sentiment: Option<f64>,
    pub confidence: Option<f64>,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Persisted rule-fired signal surfaced to supervisors
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorAlert {
    pub id: i64,
    pub call_id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Point-in-time view of a call served on the snapshot endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub provider: String,
    pub status: CallStatus,
    pub risk_score: f64,
    pub sentiment_score: f64,
    pub updated_at: Option<DateTime<Utc>>,
    pub events: Vec<RealtimeEvent>,
    pub alerts: Vec<SupervisorAlert>,
    pub live_audio: crate::audio::AudioSnapshot,
}

impl CallSnapshot {
    /// Placeholder snapshot for a call the plane has never seen
    pub fn idle(call_id: &str, live_audio: crate::audio::AudioSnapshot) -> Self {
        Self {
            call_id: call_id.to_string(),
            provider: "generic".to_string(),
            status: CallStatus::Unknown,
            risk_score: 0.0,
            sentiment_score: 0.0,
            updated_at: None,
            events: Vec::new(),
            alerts: Vec::new(),
            live_audio,
        }
    }
}

/// Messages emitted on the per-call SSE stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Connected {
        call_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    RealtimeEvent {
        call_id: String,
        provider: String,
        status: CallStatus,
        event: RealtimeEvent,
        risk_score: f64,
        sentiment_score: f64,
    },
    SupervisorAlert {
        call_id: String,
        provider: String,
        risk_score: f64,
        alert: SupervisorAlert,
    },
    SupervisorAlertAck {
        call_id: String,
        alert: SupervisorAlert,
    },
    Status {
        call_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl Envelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_status_parse_terminal_vocabulary() {
        assert_eq!(CallStatus::parse("ended"), Some(CallStatus::Ended));
        assert_eq!(CallStatus::parse("Disconnected"), Some(CallStatus::Ended));
        assert_eq!(CallStatus::parse("completed"), Some(CallStatus::Ended));
        assert_eq!(CallStatus::parse("connected"), Some(CallStatus::Active));
        assert_eq!(CallStatus::parse(""), None);
    }

    #[test]
    fn test_event_type_parse_falls_back_to_custom() {
        assert_eq!(EventType::parse("transcript"), EventType::Transcript);
        assert_eq!(EventType::parse("call_end"), EventType::End);
        assert_eq!(EventType::parse("presence"), EventType::Custom);
    }

    #[test]
    fn test_speaker_aliases() {
        assert_eq!(Speaker::parse("acd"), Some(Speaker::Agent));
        assert_eq!(Speaker::parse("external"), Some(Speaker::Customer));
        assert_eq!(Speaker::parse("ivr"), None);
    }

    #[test]
    fn test_envelope_serializes_with_type_tag() {
        let json = Envelope::Heartbeat {
            timestamp: Utc::now(),
        }
        .to_json();
        assert!(json.contains("\"type\":\"heartbeat\""));
    }
}
