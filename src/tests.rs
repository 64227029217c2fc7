//! End-to-end scenario tests for the realtime pipeline

#[cfg(test)]
mod tests {
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use base64::Engine;
    use serde_json::{json, Value};

    use crate::config::{
        AudioHookConfig, Config, GenesysConfig, RealtimeConfig, ServerConfig,
    };
    use crate::handlers;
    use crate::ingest;
    use crate::model::{AlertType, CallStatus, Severity};
    use crate::AppState;

    fn test_config(data_dir: &std::path::Path, ingest_token: &str) -> Config {
        let runtime_dir = data_dir.join("runtime");
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8009,
                data_dir: data_dir.to_path_buf(),
                uploads_dir: data_dir.join("uploads"),
                runtime_dir: runtime_dir.clone(),
            },
            realtime: RealtimeConfig {
                ingest_token: ingest_token.to_string(),
                negative_sentiment_threshold: -0.45,
                high_risk_threshold: 0.72,
                alert_cooldown_seconds: 75,
                supervisor_keyword_triggers: vec![
                    "manager".to_string(),
                    "supervisor".to_string(),
                    "escalate".to_string(),
                    "cancel account".to_string(),
                ],
                audio_dir: runtime_dir.join("live_audio"),
                audio_window_seconds: 300,
                audio_default_sample_rate: 16_000,
                audio_default_channels: 1,
                audio_max_chunk_bytes: 2_000_000,
            },
            genesys: GenesysConfig {
                login_base_url: "https://login.example.com".to_string(),
                api_base_url: "https://api.example.com".to_string(),
                client_id: String::new(),
                client_secret: String::new(),
                subscription_topics: vec![],
                queue_ids: vec![],
                user_ids: vec![],
                target_ingest_url: String::new(),
                target_ingest_token: String::new(),
                verify_ssl: true,
                http_timeout_seconds: 20,
                retry_max_attempts: 5,
                retry_backoff_seconds: 1.5,
                reconnect_delay_seconds: 5,
                topic_builder_mode: "manual".to_string(),
                topic_builder_queue_name_filters: vec![],
                topic_builder_user_name_filters: vec![],
                topic_builder_user_email_domain_filters: vec![],
                topic_builder_max_queues: 25,
                topic_builder_max_users: 50,
                topic_builder_refresh_seconds: 900,
                connector_status_path: runtime_dir.join("genesys_connector_status.json"),
                connector_health_stale_seconds: 90,
            },
            audiohook: AudioHookConfig {
                host: "127.0.0.1".to_string(),
                port: 9011,
                path: "/audiohook/ws".to_string(),
                target_audio_ingest_url: String::new(),
                target_event_ingest_url: String::new(),
                target_ingest_token: String::new(),
                verify_ssl: true,
                http_timeout_seconds: 20,
                retry_max_attempts: 5,
                retry_backoff_seconds: 1.5,
                flush_interval_ms: 750,
                min_chunk_duration_ms: 300,
                max_chunk_duration_ms: 2000,
                status_path: runtime_dir.join("genesys_audiohook_status.json"),
                health_stale_seconds: 90,
            },
        }
    }

    fn test_state(ingest_token: &str) -> AppState {
        let dir = tempfile::tempdir().unwrap();
        AppState::new(test_config(dir.path(), ingest_token))
    }

    #[test]
    fn test_negative_sentiment_scenario() {
        let state = test_state("");
        let outcome = ingest::ingest_event(
            &state,
            &json!({"call_id": "RT-1", "event_type": "transcript", "sentiment": -0.8}),
        )
        .unwrap();

        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(outcome.alerts[0].alert_type, AlertType::NegativeSentiment);
        assert_eq!(outcome.alerts[0].severity, Severity::High);
        assert!(outcome.risk_score >= 0.32);
        assert_eq!(outcome.snapshot.status, CallStatus::Active);
        assert_eq!(outcome.snapshot.events.len(), 1);
        assert_eq!(outcome.snapshot.alerts.len(), 1);
    }

    #[test]
    fn test_cooldown_scenario() {
        let state = test_state("");
        let payload = json!({"call_id": "RT-1", "event_type": "transcript", "sentiment": -0.8});

        let first = ingest::ingest_event(&state, &payload).unwrap();
        assert_eq!(first.alerts.len(), 1);

        // Second identical payload inside the cooldown window fires nothing
        let second = ingest::ingest_event(&state, &payload).unwrap();
        assert!(second.alerts.is_empty());
        assert_eq!(state.repository.recent_alerts(Some("RT-1"), false, 10).len(), 1);
    }

    #[test]
    fn test_escalation_stacking_scenario() {
        let state = test_state("");
        let outcome = ingest::ingest_event(
            &state,
            &json!({
                "call_id": "RT-3",
                "event_type": "transcript",
                "text": "get me your supervisor",
                "sentiment": -0.9,
                "metadata": {"metrics": {"dead_air_seconds": 7}}
            }),
        )
        .unwrap();

        let types: Vec<AlertType> = outcome.alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(outcome.alerts.len(), 3);
        assert!(types.contains(&AlertType::EscalationKeyword));
        assert!(types.contains(&AlertType::NegativeSentiment));
        assert!(types.contains(&AlertType::DeadAir));

        let escalation = outcome
            .alerts
            .iter()
            .find(|a| a.alert_type == AlertType::EscalationKeyword)
            .unwrap();
        assert_eq!(escalation.severity, Severity::Critical);
    }

    #[test]
    fn test_high_risk_fires_as_risk_accumulates() {
        let state = test_state("");
        let mut high_risk_fired = 0;
        for _ in 0..4 {
            let outcome = ingest::ingest_event(
                &state,
                &json!({
                    "call_id": "RT-4",
                    "event_type": "transcript",
                    "metadata": {"metrics": {"risk": 0.9}}
                }),
            )
            .unwrap();
            high_risk_fired += outcome
                .alerts
                .iter()
                .filter(|a| a.alert_type == AlertType::HighRisk)
                .count();
        }
        assert_eq!(high_risk_fired, 1);
        let call = state.repository.get_call("RT-4").unwrap();
        assert!(call.risk_score >= 0.72);
    }

    #[tokio::test]
    async fn test_sse_ordering_scenario() {
        let state = test_state("");
        let mut first = state.bus.subscribe("RT-2");
        let mut second = state.bus.subscribe("RT-2");

        for text in ["A", "B", "C"] {
            ingest::ingest_event(
                &state,
                &json!({"call_id": "RT-2", "event_type": "transcript", "text": text}),
            )
            .unwrap();
        }

        for receiver in [&mut first, &mut second] {
            let mut event_ids = Vec::new();
            let mut texts = Vec::new();
            for _ in 0..3 {
                let payload: Value =
                    serde_json::from_str(&receiver.recv().await.unwrap()).unwrap();
                assert_eq!(payload["type"], json!("realtime_event"));
                event_ids.push(payload["event"]["id"].as_i64().unwrap());
                texts.push(payload["event"]["text"].as_str().unwrap().to_string());
            }
            assert_eq!(texts, vec!["A", "B", "C"]);
            assert!(event_ids.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[tokio::test]
    async fn test_alert_envelope_follows_event_envelope() {
        let state = test_state("");
        let mut receiver = state.bus.subscribe("RT-5");

        ingest::ingest_event(
            &state,
            &json!({"call_id": "RT-5", "event_type": "transcript", "sentiment": -0.9}),
        )
        .unwrap();

        let first: Value = serde_json::from_str(&receiver.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&receiver.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], json!("realtime_event"));
        assert_eq!(second["type"], json!("supervisor_alert"));
        assert_eq!(second["alert"]["type"], json!("negative_sentiment"));
    }

    #[tokio::test]
    async fn test_ack_idempotence_scenario() {
        let state = test_state("");
        let outcome = ingest::ingest_event(
            &state,
            &json!({"call_id": "RT-6", "event_type": "transcript", "sentiment": -0.8}),
        )
        .unwrap();
        let alert_id = outcome.alerts[0].id;

        let first = handlers::ack_alert(State(state.clone()), axum::extract::Path(alert_id))
            .await
            .unwrap();
        let first_ack_at = first.0["alert"]["acknowledged_at"].clone();
        assert_eq!(first.0["alert"]["acknowledged"], json!(true));
        assert!(!first_ack_at.is_null());

        let second = handlers::ack_alert(State(state.clone()), axum::extract::Path(alert_id))
            .await
            .unwrap();
        assert_eq!(second.0["alert"]["acknowledged"], json!(true));
        assert_eq!(second.0["alert"]["acknowledged_at"], first_ack_at);
    }

    #[test]
    fn test_idle_snapshot_for_unknown_call() {
        let state = test_state("");
        let snapshot = ingest::build_snapshot(&state, "never-seen");
        assert_eq!(snapshot.status, CallStatus::Unknown);
        assert_eq!(snapshot.risk_score, 0.0);
        assert!(snapshot.events.is_empty());
        assert!(snapshot.alerts.is_empty());
        assert!(!snapshot.live_audio.available);
    }

    #[tokio::test]
    async fn test_ingest_rejects_bad_token() {
        let state = test_state("secret-token");

        let mut wrong = HeaderMap::new();
        wrong.insert("X-Cloud-Token", "nope".parse().unwrap());
        let denied = handlers::ingest_event(
            State(state.clone()),
            wrong,
            Bytes::from(json!({"call_id": "RT-7"}).to_string()),
        )
        .await;
        assert!(denied.is_err());

        let mut bearer = HeaderMap::new();
        bearer.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer secret-token".parse().unwrap(),
        );
        let allowed = handlers::ingest_event(
            State(state.clone()),
            bearer,
            Bytes::from(json!({"call_id": "RT-7"}).to_string()),
        )
        .await;
        assert!(allowed.is_ok());
    }

    #[tokio::test]
    async fn test_ingest_event_endpoint_shape() {
        let state = test_state("");
        let response = handlers::ingest_event(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from(
                json!({"call_id": "RT-8", "event_type": "transcript", "sentiment": -0.8})
                    .to_string(),
            ),
        )
        .await
        .unwrap();

        let body = response.0;
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["call_id"], json!("RT-8"));
        assert_eq!(body["alerts"].as_array().unwrap().len(), 1);
        assert!(body["risk_score"].as_f64().unwrap() >= 0.32);
        assert_eq!(body["snapshot"]["call_id"], json!("RT-8"));
    }

    #[tokio::test]
    async fn test_invalid_json_body_is_bad_request() {
        let state = test_state("");
        let result = handlers::ingest_event(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from_static(b"{broken"),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_audio_chunk_flow_creates_transcript_events() {
        let state = test_state("");

        // 200ms of silence at 16 kHz mono, pcm_s16le
        let pcm = vec![0u8; 6400];
        let payload = json!({
            "call_id": "RT-9",
            "audio_b64": base64::engine::general_purpose::STANDARD.encode(&pcm),
            "audio_encoding": "pcm_s16le",
            "sample_rate": 16_000,
            "channels": 1,
            "transcript_segments": [
                {"text": "I want to cancel account", "speaker": "customer", "sentiment": -0.6}
            ]
        });

        let audio_state = state
            .audio
            .append(
                "RT-9",
                pcm.into(),
                16_000,
                1,
                chrono::Utc::now(),
                None,
            )
            .unwrap();
        assert!(audio_state.available);

        let events = ingest::build_audio_events(&payload, "RT-9", &audio_state);
        assert_eq!(events.len(), 1);

        let outcome = ingest::ingest_event(&state, &events[0]).unwrap();
        assert!(outcome
            .alerts
            .iter()
            .any(|a| a.alert_type == AlertType::EscalationKeyword));
        assert!(outcome
            .alerts
            .iter()
            .any(|a| a.alert_type == AlertType::NegativeSentiment));

        let wav = state.audio.render_wav("RT-9", None).unwrap();
        assert_eq!(wav.len(), 44 + 6400);
    }

    #[test]
    fn test_end_event_marks_call_ended() {
        let state = test_state("");
        ingest::ingest_event(&state, &json!({"call_id": "RT-10", "event_type": "transcript"}))
            .unwrap();
        let outcome = ingest::ingest_event(
            &state,
            &json!({"call_id": "RT-10", "event_type": "end"}),
        )
        .unwrap();
        assert_eq!(outcome.snapshot.status, CallStatus::Ended);
    }
}
