//! Persistent event bus with pattern-matched fan-out.
//!
//! Every published event is appended to the `events` table before any
//! subscriber sees it, so the log is the source of truth and delivery is
//! at-least-once on restart. Subscriber callbacks run in the publisher's
//! context; their failures are logged and never propagated.

pub mod events;

use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use apiary_db::queries::events as event_db;
use apiary_db::queries::events::EventFilter;

pub use events::{Event, task_event, types};

/// Subscriber callback. Must not block for long; failures are swallowed
/// after logging.
pub type EventCallback = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct Subscription {
    id: String,
    pattern: String,
    subscriber_name: String,
    callback: EventCallback,
}

/// Database-backed event bus.
pub struct EventBus {
    pool: SqlitePool,
    subscribers: Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Publish an event: persist it, then notify matching subscribers.
    ///
    /// Assigns an event id if the caller left it empty and overrides the
    /// correlation id when one is supplied. Returns the event id.
    pub async fn publish(
        &self,
        mut event: Event,
        correlation_id: Option<&str>,
    ) -> Result<String> {
        if event.event_id.is_empty() {
            event.event_id = Uuid::new_v4().to_string();
        }
        if let Some(cid) = correlation_id {
            event.correlation_id = Some(cid.to_owned());
        }

        event_db::insert_event(&self.pool, &event.to_record()).await?;

        // Snapshot matching subscribers under the lock, then release it
        // before invoking any callback.
        let matching: Vec<(String, EventCallback)> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers
                .iter()
                .filter(|s| matches_pattern(&event.event_type, &s.pattern))
                .map(|s| (s.subscriber_name.clone(), Arc::clone(&s.callback)))
                .collect()
        };

        for (name, callback) in matching {
            if let Err(e) = callback(&event) {
                warn!(
                    subscriber = %name,
                    event_type = %event.event_type,
                    error = %e,
                    "subscriber callback failed"
                );
            }
        }

        debug!(event_id = %event.event_id, event_type = %event.event_type, "event published");
        Ok(event.event_id)
    }

    /// Subscribe to events matching a pattern. Returns a subscription id
    /// usable with [`EventBus::unsubscribe`].
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        callback: EventCallback,
        subscriber_name: impl Into<String>,
    ) -> String {
        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            pattern: pattern.into(),
            subscriber_name: subscriber_name.into(),
            callback,
        };
        let id = subscription.id.clone();
        debug!(
            pattern = %subscription.pattern,
            subscriber = %subscription.subscriber_name,
            "subscription added"
        );
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription);
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription_id);
        subscribers.len() != before
    }

    /// Query persisted events, newest first.
    pub async fn get_events(
        &self,
        event_type: Option<&str>,
        correlation_id: Option<&str>,
        source_agent: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let records = event_db::get_events(
            &self.pool,
            &EventFilter {
                event_type,
                correlation_id,
                source_agent,
                since,
                limit,
            },
        )
        .await?;
        Ok(records.into_iter().map(Event::from).collect())
    }

    /// Full trace for one workflow, in chronological order.
    pub async fn get_event_history(
        &self,
        correlation_id: &str,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let records = event_db::get_event_history(&self.pool, correlation_id, limit).await?;
        Ok(records.into_iter().map(Event::from).collect())
    }

    /// Drop events older than `days_to_keep` days.
    pub async fn clear_old_events(&self, days_to_keep: i64) -> Result<u64> {
        Ok(event_db::clear_old_events(&self.pool, days_to_keep).await?)
    }
}

/// Pattern language: `*` matches everything, `x.y` matches exactly, and a
/// single trailing `x.*` matches any type under that prefix. No deeper
/// wildcards.
pub fn matches_pattern(event_type: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        assert!(matches_pattern("task.started", "*"));
        assert!(matches_pattern("agent.heartbeat", "*"));
    }

    #[test]
    fn exact_match() {
        assert!(matches_pattern("task.started", "task.started"));
        assert!(!matches_pattern("task.started", "task.completed"));
    }

    #[test]
    fn prefix_wildcard_matches_one_level_and_deeper() {
        assert!(matches_pattern("task.started", "task.*"));
        assert!(matches_pattern("workflow.plan_generated", "workflow.*"));
        assert!(!matches_pattern("tasks.started", "task.*"));
        assert!(!matches_pattern("task", "task.*"));
    }

    #[test]
    fn no_mid_string_wildcards() {
        assert!(!matches_pattern("task.started", "task.*.started"));
        assert!(!matches_pattern("task.started", "*.started"));
    }
}
