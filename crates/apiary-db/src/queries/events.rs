//! Query functions for the append-only `events` table.

use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::StoreResult;
use crate::models::EventRecord;

/// Append an event row.
pub async fn insert_event(pool: &SqlitePool, event: &EventRecord) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO events (event_id, event_type, timestamp, source_agent, \
                             correlation_id, payload, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.event_id)
    .bind(&event.event_type)
    .bind(event.timestamp)
    .bind(&event.source_agent)
    .bind(&event.correlation_id)
    .bind(sqlx::types::Json(event.payload.0.clone()))
    .bind(sqlx::types::Json(event.metadata.0.clone()))
    .bind(event.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Filters for [`get_events`]. Empty filter returns the most recent events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter<'a> {
    pub event_type: Option<&'a str>,
    pub correlation_id: Option<&'a str>,
    pub source_agent: Option<&'a str>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl EventFilter<'_> {
    pub const DEFAULT_LIMIT: i64 = 100;
}

/// Query events, newest first.
pub async fn get_events(
    pool: &SqlitePool,
    filter: &EventFilter<'_>,
) -> StoreResult<Vec<EventRecord>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM events WHERE 1 = 1");
    if let Some(event_type) = filter.event_type {
        qb.push(" AND event_type = ");
        qb.push_bind(event_type.to_owned());
    }
    if let Some(correlation_id) = filter.correlation_id {
        qb.push(" AND correlation_id = ");
        qb.push_bind(correlation_id.to_owned());
    }
    if let Some(source_agent) = filter.source_agent {
        qb.push(" AND source_agent = ");
        qb.push_bind(source_agent.to_owned());
    }
    if let Some(since) = filter.since {
        qb.push(" AND timestamp >= ");
        qb.push_bind(since);
    }
    qb.push(" ORDER BY timestamp DESC, created_at DESC LIMIT ");
    qb.push_bind(if filter.limit > 0 {
        filter.limit
    } else {
        EventFilter::DEFAULT_LIMIT
    });

    let events = qb.build_query_as::<EventRecord>().fetch_all(pool).await?;
    Ok(events)
}

/// Full trace for one workflow, in chronological order.
pub async fn get_event_history(
    pool: &SqlitePool,
    correlation_id: &str,
    limit: i64,
) -> StoreResult<Vec<EventRecord>> {
    let events = sqlx::query_as::<_, EventRecord>(
        "SELECT * FROM events \
         WHERE correlation_id = ? \
         ORDER BY timestamp ASC, created_at ASC \
         LIMIT ?",
    )
    .bind(correlation_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(events)
}

/// Delete events older than `days_to_keep` days. Returns the deleted count.
pub async fn clear_old_events(pool: &SqlitePool, days_to_keep: i64) -> StoreResult<u64> {
    let cutoff = Utc::now() - Duration::days(days_to_keep);
    let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    let deleted = result.rows_affected();
    tracing::info!(deleted, days_to_keep, "cleaned up old events");
    Ok(deleted)
}
