//! Supervisor alert evaluation
//!
//! A pure function of (call state, new event, configuration, recent alert
//! history, now) to (blended scores, newly fired alerts). Keeping it pure
//! makes the rule engine deterministic under replay: same ordered inputs and
//! config always yield the same outputs.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::config::RealtimeConfig;
use crate::model::{AlertType, Metadata, RealtimeCall, RealtimeEvent, Severity};
use crate::repository::AlertMark;

const RISK_CARRY: f64 = 0.6;
const RISK_GAIN: f64 = 0.4;
const SENTIMENT_CARRY: f64 = 0.7;
const SENTIMENT_GAIN: f64 = 0.3;
const KEYWORD_SIGNAL: f64 = 0.9;
const DEAD_AIR_ALERT_SECONDS: f64 = 5.0;
const DEAD_AIR_SIGNAL_SCALE: f64 = 10.0;

/// An alert the evaluator wants persisted
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub metadata: Metadata,
}

/// Evaluator output: post-update scores plus alerts to persist
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub risk_score: f64,
    pub sentiment_score: f64,
    pub alerts: Vec<NewAlert>,
}

pub fn evaluate(
    call: &RealtimeCall,
    event: &RealtimeEvent,
    config: &RealtimeConfig,
    recent: &[AlertMark],
    now: DateTime<Utc>,
) -> Evaluation {
    let text = event.text.to_lowercase();
    let keyword_hits: Vec<&str> = config
        .supervisor_keyword_triggers
        .iter()
        .filter(|term| contains_term(&text, term))
        .map(String::as_str)
        .collect();
    let dead_air_seconds = extract_dead_air_seconds(&event.metadata);
    let metric_risk = extract_metric_risk(&event.metadata);

    let mut signal: f64 = 0.0;
    if let Some(sentiment) = event.sentiment {
        signal = signal.max(sentiment.min(0.0).abs().min(1.0));
    }
    if !keyword_hits.is_empty() {
        signal = signal.max(KEYWORD_SIGNAL);
    }
    if let Some(seconds) = dead_air_seconds {
        signal = signal.max((seconds / DEAD_AIR_SIGNAL_SCALE).min(1.0));
    }
    if let Some(risk) = metric_risk {
        signal = signal.max(risk.clamp(0.0, 1.0));
    }

    let risk_score = round3((RISK_CARRY * call.risk_score + RISK_GAIN * signal).clamp(0.0, 1.0));
    let sentiment_score = match event.sentiment {
        Some(sentiment) => round3(
            (SENTIMENT_CARRY * call.sentiment_score + SENTIMENT_GAIN * sentiment)
                .clamp(-1.0, 1.0),
        ),
        None => call.sentiment_score,
    };

    let cooldown = Duration::seconds(config.alert_cooldown_seconds);
    let allowed = |alert_type: AlertType| {
        !recent
            .iter()
            .any(|mark| mark.alert_type == alert_type && now - mark.created_at < cooldown)
    };

    let mut alerts = Vec::new();

    if let Some(sentiment) = event.sentiment {
        if sentiment <= config.negative_sentiment_threshold
            && allowed(AlertType::NegativeSentiment)
        {
            alerts.push(NewAlert {
                alert_type: AlertType::NegativeSentiment,
                severity: Severity::High,
                message: format!("Negative sentiment detected ({sentiment:.2}) in live call."),
                metadata: alert_metadata(&[
                    ("sentiment", json!(sentiment)),
                    ("threshold", json!(config.negative_sentiment_threshold)),
                    ("event_id", json!(event.id)),
                ]),
            });
        }
    }

    if !keyword_hits.is_empty() && allowed(AlertType::EscalationKeyword) {
        let preview: Vec<&str> = keyword_hits.iter().take(4).copied().collect();
        alerts.push(NewAlert {
            alert_type: AlertType::EscalationKeyword,
            severity: Severity::Critical,
            message: format!("Escalation keywords detected: {}", preview.join(", ")),
            metadata: alert_metadata(&[
                ("keywords", json!(keyword_hits)),
                ("event_id", json!(event.id)),
            ]),
        });
    }

    if let Some(seconds) = dead_air_seconds {
        if seconds >= DEAD_AIR_ALERT_SECONDS && allowed(AlertType::DeadAir) {
            alerts.push(NewAlert {
                alert_type: AlertType::DeadAir,
                severity: Severity::Medium,
                message: format!("Extended dead air detected ({seconds:.1}s)."),
                metadata: alert_metadata(&[
                    ("dead_air_seconds", json!(seconds)),
                    ("event_id", json!(event.id)),
                ]),
            });
        }
    }

    if risk_score >= config.high_risk_threshold && allowed(AlertType::HighRisk) {
        alerts.push(NewAlert {
            alert_type: AlertType::HighRisk,
            severity: Severity::High,
            message: format!("Live risk score crossed threshold ({risk_score:.2})."),
            metadata: alert_metadata(&[
                ("risk_score", json!(risk_score)),
                ("threshold", json!(config.high_risk_threshold)),
                ("event_id", json!(event.id)),
            ]),
        });
    }

    Evaluation {
        risk_score,
        sentiment_score,
        alerts,
    }
}

/// Case-insensitive whole-word match; `text` must already be lowercased.
/// Multi-word terms match as phrases.
fn contains_term(text: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(found) = text[start..].find(term) {
        let begin = start + found;
        let end = begin + term.len();
        let boundary_before = begin == 0 || !is_word_byte(bytes[begin - 1]);
        let boundary_after = end >= bytes.len() || !is_word_byte(bytes[end]);
        if boundary_before && boundary_after {
            return true;
        }
        start = end;
    }
    false
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn extract_dead_air_seconds(metadata: &Metadata) -> Option<f64> {
    const KEYS: [&str; 3] = ["dead_air_seconds", "silence_seconds", "silence_duration"];

    let mut sources: Vec<&Metadata> = vec![metadata];
    if let Some(Value::Object(metrics)) = metadata.get("metrics") {
        sources.push(metrics);
    }

    for source in sources {
        for key in KEYS {
            if let Some(value) = source.get(key).and_then(as_f64) {
                return Some(value.max(0.0));
            }
        }
    }
    None
}

fn extract_metric_risk(metadata: &Metadata) -> Option<f64> {
    let Some(Value::Object(metrics)) = metadata.get("metrics") else {
        return None;
    };
    metrics.get("risk").and_then(as_f64)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn alert_metadata(entries: &[(&str, Value)]) -> Metadata {
    let mut metadata = Metadata::new();
    for (key, value) in entries {
        metadata.insert((*key).to_string(), value.clone());
    }
    metadata
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CallStatus, EventType};

    fn test_config() -> RealtimeConfig {
        RealtimeConfig {
            ingest_token: String::new(),
            negative_sentiment_threshold: -0.45,
            high_risk_threshold: 0.72,
            alert_cooldown_seconds: 75,
            supervisor_keyword_triggers: vec![
                "manager".to_string(),
                "supervisor".to_string(),
                "escalate".to_string(),
                "cancel account".to_string(),
                "lawyer".to_string(),
                "legal".to_string(),
                "complaint".to_string(),
                "refund now".to_string(),
            ],
            audio_dir: std::path::PathBuf::from("/tmp/callwatch-test-audio"),
            audio_window_seconds: 300,
            audio_default_sample_rate: 16_000,
            audio_default_channels: 1,
            audio_max_chunk_bytes: 2_000_000,
        }
    }

    fn call(call_id: &str, risk: f64, sentiment: f64) -> RealtimeCall {
        RealtimeCall {
            call_id: call_id.to_string(),
            provider: "generic".to_string(),
            status: CallStatus::Active,
            risk_score: risk,
            sentiment_score: sentiment,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            agent_id: None,
            customer_id: None,
            last_speaker: None,
            last_text: String::new(),
            metadata: Metadata::new(),
        }
    }

    fn event(
        id: i64,
        text: &str,
        sentiment: Option<f64>,
        metadata: Metadata,
    ) -> RealtimeEvent {
        RealtimeEvent {
            id,
            call_id: "RT-1".to_string(),
            event_type: EventType::Transcript,
            speaker: None,
            text: text.to_string(),
            sentiment,
            confidence: None,
            occurred_at: Utc::now(),
            metadata,
        }
    }

    fn dead_air_metadata(seconds: f64) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(
            "metrics".to_string(),
            json!({ "dead_air_seconds": seconds }),
        );
        metadata
    }

    #[test]
    fn test_negative_sentiment_fires_high_alert() {
        let config = test_config();
        let result = evaluate(
            &call("RT-1", 0.0, 0.0),
            &event(1, "", Some(-0.8), Metadata::new()),
            &config,
            &[],
            Utc::now(),
        );
        assert_eq!(result.alerts.len(), 1);
        assert_eq!(result.alerts[0].alert_type, AlertType::NegativeSentiment);
        assert_eq!(result.alerts[0].severity, Severity::High);
        assert!(result.risk_score >= 0.32);
        assert!((result.sentiment_score - (-0.24)).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_suppresses_repeat() {
        let config = test_config();
        let now = Utc::now();
        let marks = [AlertMark {
            alert_type: AlertType::NegativeSentiment,
            created_at: now - Duration::seconds(10),
        }];
        let result = evaluate(
            &call("RT-1", 0.32, -0.24),
            &event(2, "", Some(-0.8), Metadata::new()),
            &config,
            &marks,
            now,
        );
        assert!(result.alerts.is_empty());
    }

    #[test]
    fn test_cooldown_expires() {
        let config = test_config();
        let now = Utc::now();
        let marks = [AlertMark {
            alert_type: AlertType::NegativeSentiment,
            created_at: now - Duration::seconds(80),
        }];
        let result = evaluate(
            &call("RT-1", 0.1, 0.0),
            &event(3, "", Some(-0.8), Metadata::new()),
            &config,
            &marks,
            now,
        );
        assert_eq!(result.alerts.len(), 1);
    }

    #[test]
    fn test_escalation_stacking_fires_three_alerts() {
        let config = test_config();
        let mut metadata = dead_air_metadata(7.0);
        metadata.insert("source".to_string(), json!("test"));
        let result = evaluate(
            &call("RT-1", 0.0, 0.0),
            &event(4, "get me your supervisor", Some(-0.9), metadata),
            &config,
            &[],
            Utc::now(),
        );
        let types: Vec<AlertType> = result.alerts.iter().map(|a| a.alert_type).collect();
        assert!(types.contains(&AlertType::EscalationKeyword));
        assert!(types.contains(&AlertType::NegativeSentiment));
        assert!(types.contains(&AlertType::DeadAir));
        assert_eq!(result.alerts.len(), 3);

        let escalation = result
            .alerts
            .iter()
            .find(|a| a.alert_type == AlertType::EscalationKeyword)
            .unwrap();
        assert_eq!(escalation.severity, Severity::Critical);
        let dead_air = result
            .alerts
            .iter()
            .find(|a| a.alert_type == AlertType::DeadAir)
            .unwrap();
        assert_eq!(dead_air.severity, Severity::Medium);

        // max(0.9 sentiment, 0.9 keyword, 0.7 dead-air) blended from zero
        assert!((result.risk_score - 0.36).abs() < 1e-9);
    }

    #[test]
    fn test_high_risk_fires_after_accumulation() {
        let config = test_config();
        let mut state = call("RT-1", 0.0, 0.0);
        let mut fired = 0;
        for index in 0..4 {
            let result = evaluate(
                &state,
                &event(10 + index, "i will escalate this", Some(-0.9), Metadata::new()),
                &config,
                &[],
                Utc::now(),
            );
            state.risk_score = result.risk_score;
            state.sentiment_score = result.sentiment_score;
            if result
                .alerts
                .iter()
                .any(|a| a.alert_type == AlertType::HighRisk)
            {
                fired += 1;
                assert!(result.risk_score >= config.high_risk_threshold);
            }
        }
        assert_eq!(fired, 1);
        assert!(state.risk_score >= 0.72);
    }

    #[test]
    fn test_metric_risk_override_triggers_high_risk_immediately() {
        let config = test_config();
        let mut metadata = Metadata::new();
        metadata.insert("metrics".to_string(), json!({ "risk": 1.9 }));
        let result = evaluate(
            &call("RT-1", 0.8, 0.0),
            &event(20, "", None, metadata),
            &config,
            &[],
            Utc::now(),
        );
        // override clamps to 1.0: 0.6*0.8 + 0.4*1.0
        assert!((result.risk_score - 0.88).abs() < 1e-9);
        assert!(result
            .alerts
            .iter()
            .any(|a| a.alert_type == AlertType::HighRisk));
    }

    #[test]
    fn test_scores_stay_clamped() {
        let config = test_config();
        let mut state = call("RT-1", 1.0, -1.0);
        for index in 0..20 {
            let result = evaluate(
                &state,
                &event(30 + index, "lawyer", Some(-1.0), dead_air_metadata(500.0)),
                &config,
                &[],
                Utc::now(),
            );
            assert!((0.0..=1.0).contains(&result.risk_score));
            assert!((-1.0..=1.0).contains(&result.sentiment_score));
            state.risk_score = result.risk_score;
            state.sentiment_score = result.sentiment_score;
        }
    }

    #[test]
    fn test_keyword_matches_on_word_boundaries() {
        assert!(contains_term("get me your supervisor", "supervisor"));
        assert!(contains_term("supervisor!", "supervisor"));
        assert!(contains_term("please cancel account now", "cancel account"));
        assert!(!contains_term("supervisory board", "supervisor"));
        assert!(!contains_term("unsupervised", "supervisor"));
    }

    #[test]
    fn test_dead_air_below_threshold_no_alert() {
        let config = test_config();
        let result = evaluate(
            &call("RT-1", 0.0, 0.0),
            &event(40, "", None, dead_air_metadata(4.0)),
            &config,
            &[],
            Utc::now(),
        );
        assert!(result.alerts.is_empty());
        // still contributes signal: 0.4 * (4/10)
        assert!((result.risk_score - 0.16).abs() < 1e-9);
    }

    #[test]
    fn test_no_sentiment_leaves_sentiment_unchanged() {
        let config = test_config();
        let result = evaluate(
            &call("RT-1", 0.2, 0.5),
            &event(50, "all good", None, Metadata::new()),
            &config,
            &[],
            Utc::now(),
        );
        assert_eq!(result.sentiment_score, 0.5);
        assert!(result.alerts.is_empty());
    }
}
