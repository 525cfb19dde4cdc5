//! Event ingestion facade.
//!
//! Two paths feed the same table: worker loops await [`EventLog::emit`],
//! web handlers fire [`EventLog::emit_detached`] without blocking the
//! response. Both produce identical rows. A failed insert is reported to
//! the tracing sink and never propagated; losing an event must not take
//! a worker down with it.

use crate::store::{NewEvent, Store};

/// Canonical event types. Call sites use these constants so the taxonomy
/// stays greppable and the dashboard filters stay stable.
pub mod event_type {
    // scheduler
    pub const SCHEDULER_STARTED: &str = "scheduler_started";
    pub const SCHEDULER_STOPPING: &str = "scheduler_stopping";
    pub const SCHEDULER_STOPPED: &str = "scheduler_stopped";
    pub const NO_DEVICES: &str = "no_devices";
    pub const WARMING_STARTED: &str = "warming_started";
    pub const WARMING_COMPLETE: &str = "warming_complete";
    pub const WARMING_FAILED: &str = "warming_failed";
    pub const INSTALL_FAILED: &str = "install_failed";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const CREATION_STARTED: &str = "creation_started";
    pub const CREATION_SKIPPED: &str = "creation_skipped";
    pub const DEVICE_LOOP_ERROR: &str = "device_loop_error";
    pub const WORKER_HUNG: &str = "worker_hung";

    // device
    pub const DEVICE_DISCONNECTED: &str = "disconnected";
    pub const APP_DELETED: &str = "app_deleted";
    pub const APP_DELETE_FAILED: &str = "app_delete_failed";
    pub const APP_INSTALLED: &str = "app_installed";

    // account
    pub const LOGIN_SUCCESS: &str = "login_success";
    pub const ACCOUNT_CREATION_STARTED: &str = "account_creation_started";
    pub const ACCOUNT_CREATED: &str = "account_created";
    pub const ACCOUNT_CREATION_FAILED: &str = "account_creation_failed";
    pub const CREDENTIALS_UNREADABLE: &str = "credentials_unreadable";

    // auth
    pub const CAPTCHA_FAILED: &str = "captcha_failed";
}

/// Cheap-to-clone handle shared by every subsystem that reports.
#[derive(Clone)]
pub struct EventLog {
    store: Store,
}

impl EventLog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append an event, awaiting the insert. Worker-loop path.
    pub async fn emit(&self, event: NewEvent) {
        let event_type = event.event_type.clone();
        if let Err(e) = self.store.insert_event(event).await {
            tracing::error!(event_type = %event_type, error = %e, "Failed to write system event");
        }
    }

    /// Append an event without awaiting it. Web-handler path; converges on
    /// the same insert as [`emit`].
    pub fn emit_detached(&self, event: NewEvent) {
        let log = self.clone();
        tokio::spawn(async move {
            log.emit(event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventCategory, EventSeverity};
    use crate::store::EventFilter;

    #[tokio::test]
    async fn both_paths_produce_identical_rows() {
        let store = Store::open_in_memory().unwrap();
        let log = EventLog::new(store.clone());

        log.emit(NewEvent::scheduler_info(
            event_type::WARMING_COMPLETE,
            "session done",
        ))
        .await;
        log.emit_detached(NewEvent::scheduler_info(
            event_type::WARMING_COMPLETE,
            "session done",
        ));
        // Drain the detached write.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let rows = store.query_events(EventFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.category, EventCategory::Scheduler);
            assert_eq!(row.severity, EventSeverity::Info);
            assert_eq!(row.event_type, event_type::WARMING_COMPLETE);
            assert_eq!(row.message, "session done");
        }
    }
}
