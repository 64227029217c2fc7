//! In-process persistence for calls, events, and alerts
//!
//! Backed by concurrent maps with globally monotonic row ids. Calls are
//! never destroyed; events and alerts are append-only. All mutation goes
//! through these operations, which serialize per call.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::model::{
    AlertType, CallStatus, Metadata, RealtimeCall, RealtimeEvent, SupervisorAlert,
};
use crate::{Error, Result};

/// Non-score fields merged into a call on ingest; `None` leaves the stored
/// value untouched.
#[derive(Debug, Default, Clone)]
pub struct CallMutation {
    pub provider: Option<String>,
    pub status: Option<CallStatus>,
    pub agent_id: Option<String>,
    pub customer_id: Option<String>,
    pub speaker: Option<crate::model::Speaker>,
    pub text: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Fields for a new event row
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub call_id: String,
    pub event_type: crate::model::EventType,
    pub speaker: Option<crate::model::Speaker>,
    pub text: String,
    pub sentiment: Option<f64>,
    pub confidence: Option<f64>,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Fields for a new alert row
#[derive(Debug, Clone)]
pub struct NewAlertRow {
    pub call_id: String,
    pub alert_type: AlertType,
    pub severity: crate::model::Severity,
    pub message: String,
    pub metadata: Metadata,
}

/// Creation stamp used by the evaluator's cooldown check
#[derive(Debug, Clone, Copy)]
pub struct AlertMark {
    pub alert_type: AlertType,
    pub created_at: DateTime<Utc>,
}

pub struct RealtimeRepository {
    calls: DashMap<String, RealtimeCall>,
    events: DashMap<String, Vec<RealtimeEvent>>,
    alerts: RwLock<Vec<SupervisorAlert>>,
    next_event_id: AtomicI64,
    next_alert_id: AtomicI64,
}

impl Default for RealtimeRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeRepository {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            events: DashMap::new(),
            alerts: RwLock::new(Vec::new()),
            next_event_id: AtomicI64::new(1),
            next_alert_id: AtomicI64::new(1),
        }
    }

    pub fn get_call(&self, call_id: &str) -> Option<RealtimeCall> {
        self.calls.get(call_id).map(|entry| entry.clone())
    }

    /// Create or merge a call row; `updated_at` is always refreshed.
    pub fn upsert_call(
        &self,
        call_id: &str,
        mutation: &CallMutation,
        now: DateTime<Utc>,
    ) -> RealtimeCall {
        let mut entry = self
            .calls
            .entry(call_id.to_string())
            .or_insert_with(|| RealtimeCall {
                call_id: call_id.to_string(),
                provider: "generic".to_string(),
                status: CallStatus::Active,
                risk_score: 0.0,
                sentiment_score: 0.0,
                created_at: now,
                updated_at: now,
                agent_id: None,
                customer_id: None,
                last_speaker: None,
                last_text: String::new(),
                metadata: Metadata::new(),
            });
        let call = entry.value_mut();

        if let Some(provider) = &mutation.provider {
            if !provider.is_empty() {
                call.provider = provider.clone();
            }
        }
        if let Some(status) = mutation.status {
            call.status = status;
        }
        if let Some(agent_id) = &mutation.agent_id {
            if !agent_id.is_empty() {
                call.agent_id = Some(agent_id.clone());
            }
        }
        if let Some(customer_id) = &mutation.customer_id {
            if !customer_id.is_empty() {
                call.customer_id = Some(customer_id.clone());
            }
        }
        if let Some(speaker) = mutation.speaker {
            call.last_speaker = Some(speaker);
        }
        if let Some(text) = &mutation.text {
            if !text.is_empty() {
                call.last_text = text.chars().take(2400).collect();
            }
        }
        if let Some(metadata) = &mutation.metadata {
            for (key, value) in metadata {
                call.metadata.insert(key.clone(), value.clone());
            }
        }
        call.updated_at = now;
        call.clone()
    }

    /// Write the evaluator's blended scores back onto the call
    pub fn set_scores(
        &self,
        call_id: &str,
        risk_score: f64,
        sentiment_score: f64,
        now: DateTime<Utc>,
    ) -> Option<RealtimeCall> {
        let mut entry = self.calls.get_mut(call_id)?;
        let call = entry.value_mut();
        call.risk_score = risk_score;
        call.sentiment_score = sentiment_score;
        call.updated_at = now;
        Some(call.clone())
    }

    pub fn append_event(&self, row: NewEvent) -> RealtimeEvent {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = RealtimeEvent {
            id,
            call_id: row.call_id.clone(),
            event_type: row.event_type,
            speaker: row.speaker,
            text: row.text,
            sentiment: row.sentiment,
            confidence: row.confidence,
            occurred_at: row.occurred_at,
            metadata: row.metadata,
        };
        self.events
            .entry(row.call_id)
            .or_default()
            .push(event.clone());
        event
    }

    pub fn append_alert(&self, row: NewAlertRow, now: DateTime<Utc>) -> SupervisorAlert {
        let id = self.next_alert_id.fetch_add(1, Ordering::SeqCst);
        let alert = SupervisorAlert {
            id,
            call_id: row.call_id,
            alert_type: row.alert_type,
            severity: row.severity,
            message: row.message,
            acknowledged: false,
            acknowledged_at: None,
            created_at: now,
            metadata: row.metadata,
        };
        self.alerts
            .write()
            .expect("alert table poisoned")
            .push(alert.clone());
        alert
    }

    /// Most recent `limit` events for a call, newest first
    pub fn recent_events(&self, call_id: &str, limit: usize) -> Vec<RealtimeEvent> {
        match self.events.get(call_id) {
            Some(entry) => entry.iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Alerts filtered by call and acknowledgement, newest first
    pub fn recent_alerts(
        &self,
        call_id: Option<&str>,
        open_only: bool,
        limit: usize,
    ) -> Vec<SupervisorAlert> {
        let alerts = self.alerts.read().expect("alert table poisoned");
        alerts
            .iter()
            .rev()
            .filter(|alert| call_id.map_or(true, |id| alert.call_id == id))
            .filter(|alert| !open_only || !alert.acknowledged)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Latest creation stamp per alert type for one call, for cooldown checks
    pub fn alert_marks(&self, call_id: &str) -> Vec<AlertMark> {
        let alerts = self.alerts.read().expect("alert table poisoned");
        let mut marks: Vec<AlertMark> = Vec::new();
        for alert in alerts.iter().rev() {
            if alert.call_id != call_id {
                continue;
            }
            if marks.iter().any(|mark| mark.alert_type == alert.alert_type) {
                continue;
            }
            marks.push(AlertMark {
                alert_type: alert.alert_type,
                created_at: alert.created_at,
            });
        }
        marks
    }

    /// Idempotent acknowledge. Returns the row and whether this call flipped
    /// it; an already-acknowledged alert keeps its original timestamp.
    pub fn ack_alert(&self, alert_id: i64, now: DateTime<Utc>) -> Result<(SupervisorAlert, bool)> {
        let mut alerts = self.alerts.write().expect("alert table poisoned");
        let alert = alerts
            .iter_mut()
            .find(|alert| alert.id == alert_id)
            .ok_or_else(|| Error::NotFound("Alert".to_string()))?;
        if alert.acknowledged {
            return Ok((alert.clone(), false));
        }
        alert.acknowledged = true;
        alert.acknowledged_at = Some(now);
        Ok((alert.clone(), true))
    }
}
