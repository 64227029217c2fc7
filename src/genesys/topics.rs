//! Subscription topic assembly
//!
//! Manual topics come straight from config; preset topics are discovered
//! from the org's queues and users, filtered and capped, then merged with
//! the manual set. The connector re-discovers on a configurable cadence.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::GenesysConfig;

/// One discovered queue or user
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Builder output surfaced in status files and the topic-builder CLI
#[derive(Debug, Clone, Serialize)]
pub struct TopicPreview {
    pub mode: String,
    pub generated_at: DateTime<Utc>,
    pub topics: Vec<String>,
    pub manual_topic_count: usize,
    pub preset_topic_count: usize,
    pub queues: Vec<DirectoryEntry>,
    pub users: Vec<DirectoryEntry>,
}

pub fn queue_topic(queue_id: &str) -> String {
    format!("v2.routing.queues.{queue_id}.conversations.calls")
}

pub fn user_topic(user_id: &str) -> String {
    format!("v2.users.{user_id}.conversations.calls")
}

/// Topics derived purely from configuration
pub fn manual_topics(config: &GenesysConfig) -> Vec<String> {
    let mut topics: Vec<String> = config
        .subscription_topics
        .iter()
        .map(|topic| topic.trim().to_string())
        .filter(|topic| !topic.is_empty())
        .collect();
    topics.extend(config.queue_ids.iter().map(|id| queue_topic(id)));
    topics.extend(config.user_ids.iter().map(|id| user_topic(id)));
    topics.sort();
    topics.dedup();
    topics
}

/// Whether the builder mode includes queue / user discovery
pub fn builder_scope(mode: &str) -> (bool, bool) {
    let mode = mode.trim().to_lowercase();
    if matches!(mode.as_str(), "manual" | "off" | "none" | "") {
        return (false, false);
    }
    let queues = matches!(
        mode.as_str(),
        "queues" | "queue" | "queues_users" | "users_queues" | "all" | "org"
    );
    let users = matches!(
        mode.as_str(),
        "users" | "user" | "queues_users" | "users_queues" | "all" | "org"
    );
    if !queues && !users {
        (true, true)
    } else {
        (queues, users)
    }
}

/// Filter one discovery page of queues; returns entries until `max` is hit
pub fn filter_queue_page(
    entities: &[Value],
    name_filters: &[String],
    selected: &mut Vec<DirectoryEntry>,
    max: usize,
) -> bool {
    let filters: Vec<String> = name_filters.iter().map(|f| f.to_lowercase()).collect();
    for entity in entities.iter().filter_map(Value::as_object) {
        let id = entity.get("id").and_then(Value::as_str).unwrap_or("").trim();
        let name = entity.get("name").and_then(Value::as_str).unwrap_or("").trim();
        if id.is_empty() || name.is_empty() {
            continue;
        }
        if !filters.is_empty() {
            let lowered = name.to_lowercase();
            if !filters.iter().any(|filter| lowered.contains(filter)) {
                continue;
            }
        }
        selected.push(DirectoryEntry {
            id: id.to_string(),
            name: name.to_string(),
            email: None,
        });
        if max > 0 && selected.len() >= max {
            return true;
        }
    }
    false
}

/// Filter one discovery page of users; returns entries until `max` is hit
pub fn filter_user_page(
    entities: &[Value],
    name_filters: &[String],
    email_domain_filters: &[String],
    selected: &mut Vec<DirectoryEntry>,
    max: usize,
) -> bool {
    let name_filters: Vec<String> = name_filters.iter().map(|f| f.to_lowercase()).collect();
    let domain_filters: Vec<String> = email_domain_filters
        .iter()
        .map(|f| f.trim_start_matches('@').to_lowercase())
        .collect();

    for entity in entities.iter().filter_map(Value::as_object) {
        let id = entity.get("id").and_then(Value::as_str).unwrap_or("").trim();
        if id.is_empty() {
            continue;
        }
        let name = entity.get("name").and_then(Value::as_str).unwrap_or("").trim();
        let email = entity
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_lowercase();

        if !name_filters.is_empty() {
            let lowered = name.to_lowercase();
            if !name_filters.iter().any(|filter| lowered.contains(filter)) {
                continue;
            }
        }
        if !domain_filters.is_empty()
            && !domain_filters
                .iter()
                .any(|domain| email.ends_with(&format!("@{domain}")))
        {
            continue;
        }

        selected.push(DirectoryEntry {
            id: id.to_string(),
            name: name.to_string(),
            email: if email.is_empty() { None } else { Some(email) },
        });
        if max > 0 && selected.len() >= max {
            return true;
        }
    }
    false
}

/// Merge manual and discovered topics into the final preview
pub fn assemble_preview(
    config: &GenesysConfig,
    queues: Vec<DirectoryEntry>,
    users: Vec<DirectoryEntry>,
    now: DateTime<Utc>,
) -> TopicPreview {
    let manual = manual_topics(config);
    let mut preset: Vec<String> = queues
        .iter()
        .map(|queue| queue_topic(&queue.id))
        .chain(users.iter().map(|user| user_topic(&user.id)))
        .collect();
    preset.sort();
    preset.dedup();

    let mut merged: Vec<String> = manual.iter().chain(preset.iter()).cloned().collect();
    merged.sort();
    merged.dedup();

    TopicPreview {
        mode: config.topic_builder_mode.clone(),
        generated_at: now,
        manual_topic_count: manual.len(),
        preset_topic_count: preset.len(),
        topics: merged,
        queues,
        users,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> GenesysConfig {
        GenesysConfig {
            login_base_url: "https://login.example.com".to_string(),
            api_base_url: "https://api.example.com".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            subscription_topics: vec!["v2.detail.events.conversation.metrics".to_string()],
            queue_ids: vec!["q-1".to_string()],
            user_ids: vec!["u-1".to_string()],
            target_ingest_url: String::new(),
            target_ingest_token: String::new(),
            verify_ssl: true,
            http_timeout_seconds: 20,
            retry_max_attempts: 5,
            retry_backoff_seconds: 1.5,
            reconnect_delay_seconds: 5,
            topic_builder_mode: "queues_users".to_string(),
            topic_builder_queue_name_filters: vec![],
            topic_builder_user_name_filters: vec![],
            topic_builder_user_email_domain_filters: vec![],
            topic_builder_max_queues: 25,
            topic_builder_max_users: 50,
            topic_builder_refresh_seconds: 900,
            connector_status_path: std::path::PathBuf::from("/tmp/test_status.json"),
            connector_health_stale_seconds: 90,
        }
    }

    #[test]
    fn test_manual_topics_union() {
        let topics = manual_topics(&test_config());
        assert!(topics.contains(&"v2.detail.events.conversation.metrics".to_string()));
        assert!(topics.contains(&"v2.routing.queues.q-1.conversations.calls".to_string()));
        assert!(topics.contains(&"v2.users.u-1.conversations.calls".to_string()));
        assert_eq!(topics.len(), 3);
    }

    #[test]
    fn test_builder_scope_modes() {
        assert_eq!(builder_scope("manual"), (false, false));
        assert_eq!(builder_scope("off"), (false, false));
        assert_eq!(builder_scope("queues"), (true, false));
        assert_eq!(builder_scope("users"), (false, true));
        assert_eq!(builder_scope("queues_users"), (true, true));
        assert_eq!(builder_scope("unrecognized"), (true, true));
    }

    #[test]
    fn test_queue_filter_and_cap() {
        let entities = vec![
            json!({"id": "a", "name": "Support Tier 1"}),
            json!({"id": "b", "name": "Sales"}),
            json!({"id": "c", "name": "Support Tier 2"}),
            json!({"id": "", "name": "orphan"}),
        ];
        let mut selected = Vec::new();
        let full = filter_queue_page(&entities, &["support".to_string()], &mut selected, 2);
        assert!(full);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].id, "a");
        assert_eq!(selected[1].id, "c");
    }

    #[test]
    fn test_user_email_domain_filter() {
        let entities = vec![
            json!({"id": "u1", "name": "A", "email": "a@Example.COM"}),
            json!({"id": "u2", "name": "B", "email": "b@other.net"}),
        ];
        let mut selected = Vec::new();
        filter_user_page(&entities, &[], &["@example.com".to_string()], &mut selected, 0);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "u1");
    }

    #[test]
    fn test_assemble_preview_merges_and_dedupes() {
        let config = test_config();
        let queues = vec![DirectoryEntry {
            id: "q-1".to_string(), // also configured manually
            name: "Support".to_string(),
            email: None,
        }];
        let preview = assemble_preview(&config, queues, Vec::new(), Utc::now());
        assert_eq!(preview.manual_topic_count, 3);
        assert_eq!(preview.preset_topic_count, 1);
        assert_eq!(preview.topics.len(), 3);
    }
}
