//! The append-only system event table: ingestion, queries, resolution.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{
    parse_category, parse_opt_ts, parse_severity, parse_ts, parse_uuid_or_nil, ts, Store,
    StoreError,
};
use crate::model::{EventCategory, EventSeverity, SystemEvent};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Insert payload for one event row.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub category: EventCategory,
    pub severity: EventSeverity,
    pub event_type: String,
    pub device_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub message: String,
    pub context: serde_json::Value,
}

impl NewEvent {
    pub fn new(
        category: EventCategory,
        severity: EventSeverity,
        event_type: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            event_type: event_type.to_string(),
            device_id: None,
            account_id: None,
            message: message.into(),
            context: serde_json::json!({}),
        }
    }

    pub fn scheduler_info(event_type: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventCategory::Scheduler,
            EventSeverity::Info,
            event_type,
            message,
        )
    }

    pub fn scheduler_warning(event_type: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventCategory::Scheduler,
            EventSeverity::Warning,
            event_type,
            message,
        )
    }

    pub fn scheduler_error(event_type: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventCategory::Scheduler,
            EventSeverity::Error,
            event_type,
            message,
        )
    }

    pub fn device_error(event_type: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventCategory::Device,
            EventSeverity::Error,
            event_type,
            message,
        )
    }

    pub fn account_error(event_type: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventCategory::Account,
            EventSeverity::Error,
            event_type,
            message,
        )
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_device(mut self, device_id: Uuid) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_account(mut self, account_id: Uuid) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Query filter for the event log. `after_id` turns the query into an
/// ascending cursor scan; otherwise newest rows come first.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub severity: Option<EventSeverity>,
    pub category: Option<EventCategory>,
    pub event_type: Option<String>,
    pub device_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub resolved: Option<bool>,
    pub after_id: Option<i64>,
    pub limit: Option<usize>,
}

fn event_from_row(row: &rusqlite::Row<'_>) -> Result<SystemEvent, StoreError> {
    let timestamp: String = row.get(1)?;
    let category: String = row.get(2)?;
    let severity: String = row.get(3)?;
    let device_id: Option<String> = row.get(5)?;
    let account_id: Option<String> = row.get(6)?;
    let context: String = row.get(8)?;
    let resolved: i64 = row.get(9)?;
    let resolved_at: Option<String> = row.get(11)?;

    Ok(SystemEvent {
        id: row.get(0)?,
        timestamp: parse_ts(&timestamp)?,
        category: parse_category(&category)?,
        severity: parse_severity(&severity)?,
        event_type: row.get(4)?,
        device_id: device_id.as_deref().map(parse_uuid_or_nil),
        account_id: account_id.as_deref().map(parse_uuid_or_nil),
        message: row.get(7)?,
        context: serde_json::from_str(&context).unwrap_or_else(|_| serde_json::json!({})),
        resolved: resolved != 0,
        resolved_by: row.get(10)?,
        resolved_at: parse_opt_ts(resolved_at)?,
    })
}

impl Store {
    /// Append one event; returns its monotonic id.
    pub async fn insert_event(&self, event: NewEvent) -> Result<i64, StoreError> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO system_events \
                 (timestamp, category, severity, event_type, device_id, account_id, message, context) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    ts(now),
                    event.category.as_str(),
                    event.severity.as_str(),
                    event.event_type,
                    event.device_id.map(|d| d.to_string()),
                    event.account_id.map(|a| a.to_string()),
                    event.message,
                    event.context.to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn query_events(&self, filter: EventFilter) -> Result<Vec<SystemEvent>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT id, timestamp, category, severity, event_type, device_id, account_id, \
                 message, context, resolved, resolved_by, resolved_at FROM system_events WHERE 1=1",
            );
            let mut args: Vec<String> = Vec::new();

            if let Some(s) = filter.severity {
                args.push(s.as_str().to_string());
                sql.push_str(&format!(" AND severity = ?{}", args.len()));
            }
            if let Some(c) = filter.category {
                args.push(c.as_str().to_string());
                sql.push_str(&format!(" AND category = ?{}", args.len()));
            }
            if let Some(t) = &filter.event_type {
                args.push(t.clone());
                sql.push_str(&format!(" AND event_type = ?{}", args.len()));
            }
            if let Some(d) = filter.device_id {
                args.push(d.to_string());
                sql.push_str(&format!(" AND device_id = ?{}", args.len()));
            }
            if let Some(a) = filter.account_id {
                args.push(a.to_string());
                sql.push_str(&format!(" AND account_id = ?{}", args.len()));
            }
            if let Some(r) = filter.resolved {
                args.push(if r { "1".into() } else { "0".into() });
                sql.push_str(&format!(" AND resolved = ?{}", args.len()));
            }
            if let Some(after) = filter.after_id {
                args.push(after.to_string());
                sql.push_str(&format!(" AND id > ?{}", args.len()));
                sql.push_str(" ORDER BY id ASC");
            } else {
                sql.push_str(" ORDER BY id DESC");
            }

            let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
            sql.push_str(&format!(" LIMIT {}", limit));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok(event_from_row(row))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
        .await
    }

    pub async fn unresolved_events(&self, limit: Option<usize>) -> Result<Vec<SystemEvent>, StoreError> {
        self.query_events(EventFilter {
            resolved: Some(false),
            limit,
            ..EventFilter::default()
        })
        .await
    }

    /// Mark an event resolved. Returns false when the id does not exist or
    /// was already resolved.
    pub async fn resolve_event(&self, id: i64, resolved_by: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let resolved_by = resolved_by.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE system_events SET resolved = 1, resolved_by = ?1, resolved_at = ?2 \
                 WHERE id = ?3 AND resolved = 0",
                params![resolved_by, ts(now), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Events written after `after_id`, oldest first. The SSE stream's poll.
    pub async fn events_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SystemEvent>, StoreError> {
        self.query_events(EventFilter {
            after_id: Some(after_id),
            limit: Some(limit),
            ..EventFilter::default()
        })
        .await
    }

    /// Highest event id currently in the log, 0 when empty.
    pub async fn latest_event_id(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let id: Option<i64> =
                conn.query_row("SELECT MAX(id) FROM system_events", [], |row| row.get(0))?;
            Ok(id.unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let store = Store::open_in_memory().unwrap();
        let mut last = 0;
        for i in 0..20 {
            let id = store
                .insert_event(NewEvent::scheduler_info("warming_started", format!("n{}", i)))
                .await
                .unwrap();
            assert!(id > last, "id {} not greater than {}", id, last);
            last = id;
        }
        assert_eq!(store.latest_event_id().await.unwrap(), last);
    }

    #[tokio::test]
    async fn filters_compose() {
        let store = Store::open_in_memory().unwrap();
        let device = Uuid::new_v4();
        store
            .insert_event(NewEvent::scheduler_info("warming_complete", "done").with_device(device))
            .await
            .unwrap();
        store
            .insert_event(NewEvent::device_error("install_failed", "store timeout"))
            .await
            .unwrap();
        store
            .insert_event(NewEvent::account_error("login_failed", "bad password"))
            .await
            .unwrap();

        let errors = store
            .query_events(EventFilter {
                severity: Some(EventSeverity::Error),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 2);

        let by_device = store
            .query_events(EventFilter {
                device_id: Some(device),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(by_device.len(), 1);
        assert_eq!(by_device[0].event_type, "warming_complete");

        let by_type = store
            .query_events(EventFilter {
                event_type: Some("install_failed".into()),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
    }

    #[tokio::test]
    async fn cursor_scan_is_ascending() {
        let store = Store::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                store
                    .insert_event(NewEvent::scheduler_info("warming_started", format!("{}", i)))
                    .await
                    .unwrap(),
            );
        }
        let tail = store.events_after(ids[1], 100).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(tail[0].id, ids[2]);
    }

    #[tokio::test]
    async fn resolution_is_single_shot() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_event(NewEvent::device_error("disconnected", "usb gone"))
            .await
            .unwrap();

        assert_eq!(store.unresolved_events(None).await.unwrap().len(), 1);
        assert!(store.resolve_event(id, "operator").await.unwrap());
        // Second resolve is a no-op.
        assert!(!store.resolve_event(id, "operator").await.unwrap());

        let resolved = store
            .query_events(EventFilter {
                resolved: Some(true),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolved_by.as_deref(), Some("operator"));
        assert!(resolved[0].resolved_at.is_some());
        assert!(store.unresolved_events(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn limit_is_bounded() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..10 {
            store
                .insert_event(NewEvent::scheduler_info("warming_started", format!("{}", i)))
                .await
                .unwrap();
        }
        let capped = store
            .query_events(EventFilter {
                limit: Some(3),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(capped.len(), 3);
        // Newest first without a cursor.
        assert!(capped[0].id > capped[1].id);
    }
}
