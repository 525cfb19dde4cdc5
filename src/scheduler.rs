//! The per-device scheduler.
//!
//! One independent worker task per active device. Workers share nothing but
//! the store and the stop signal; claims are serialized through the store's
//! locking discipline, so one worker failing or stalling never affects its
//! siblings.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::AgentClient;
use crate::config::Config;
use crate::creation::{CreationOutcome, CreationRunner, ExternalServices};
use crate::crypto::Codec;
use crate::events::{event_type, EventLog};
use crate::model::{Device, EventSeverity};
use crate::session::{SessionOutcome, SessionRunner};
use crate::store::{NewEvent, Store};
use crate::warming::sleep_or_stop;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Live view of one worker, published for the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSnapshot {
    pub device_id: Uuid,
    pub device_name: String,
    pub current_task: String,
    pub sessions_today: u64,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot returned by `GET /api/scheduler/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub workers: Vec<WorkerSnapshot>,
}

struct WorkerState {
    device_name: String,
    current_task: String,
    session_day: NaiveDate,
    sessions_today: u64,
    updated_at: DateTime<Utc>,
}

type WorkerBoard = Arc<RwLock<HashMap<Uuid, WorkerState>>>;

struct Running {
    stop_tx: watch::Sender<bool>,
    handles: Vec<(Uuid, JoinHandle<()>)>,
    started_at: DateTime<Utc>,
}

/// Process-wide scheduler: constructed once, owned by the entry point.
pub struct Scheduler {
    store: Store,
    events: EventLog,
    config: Config,
    sessions: Arc<SessionRunner>,
    creation: Arc<CreationRunner>,
    board: WorkerBoard,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(store: Store, events: EventLog, codec: Codec, config: Config) -> Self {
        let sessions = Arc::new(SessionRunner::new(
            store.clone(),
            events.clone(),
            codec.clone(),
            config.schedule.clone(),
        ));
        let creation = Arc::new(CreationRunner::new(
            store.clone(),
            events.clone(),
            codec,
            ExternalServices::from_config(&config.creation),
        ));
        Self {
            store,
            events,
            config,
            sessions,
            creation,
            board: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Spawn one worker per active device. An empty fleet is a warning, not
    /// an error: the scheduler idles and still stops cleanly.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let devices = self.store.list_active_devices().await?;
        if devices.is_empty() {
            self.events
                .emit(NewEvent::scheduler_warning(
                    event_type::NO_DEVICES,
                    "no active devices found; scheduler is idle",
                ))
                .await;
        }

        let (stop_tx, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(devices.len());
        for device in &devices {
            self.board.write().await.insert(
                device.id,
                WorkerState {
                    device_name: device.name.clone(),
                    current_task: "starting".to_string(),
                    session_day: Utc::now().date_naive(),
                    sessions_today: 0,
                    updated_at: Utc::now(),
                },
            );
            let worker = Worker {
                device: device.clone(),
                store: self.store.clone(),
                events: self.events.clone(),
                sessions: Arc::clone(&self.sessions),
                creation: Arc::clone(&self.creation),
                board: Arc::clone(&self.board),
                schedule: self.config.schedule.clone(),
                agent_host: self.config.agent_host.clone(),
            };
            let stop_rx = stop_tx.subscribe();
            handles.push((device.id, tokio::spawn(worker.run(stop_rx))));
        }

        self.events
            .emit(
                NewEvent::scheduler_info(
                    event_type::SCHEDULER_STARTED,
                    format!("scheduler started with {} device worker(s)", devices.len()),
                )
                .with_context(serde_json::json!({"devices": devices.len()})),
            )
            .await;

        let count = devices.len();
        *running = Some(Running {
            stop_tx,
            handles,
            started_at: Utc::now(),
        });
        Ok(count)
    }

    /// Cooperative shutdown: fire the stop signal, give in-flight work the
    /// grace period, report anything that refuses to die.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let state = self
            .running
            .lock()
            .await
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        self.events
            .emit(NewEvent::scheduler_info(
                event_type::SCHEDULER_STOPPING,
                "stop signal sent to all workers",
            ))
            .await;

        let _ = state.stop_tx.send(true);
        for (device_id, handle) in state.handles {
            match tokio::time::timeout(self.config.schedule.shutdown_grace, handle).await {
                Ok(_) => {}
                Err(_) => {
                    self.events
                        .emit(
                            NewEvent::scheduler_error(
                                event_type::WORKER_HUNG,
                                "worker ignored the stop signal past the grace period",
                            )
                            .with_severity(EventSeverity::Critical)
                            .with_device(device_id),
                        )
                        .await;
                }
            }
        }
        self.board.write().await.clear();

        self.events
            .emit(NewEvent::scheduler_info(
                event_type::SCHEDULER_STOPPED,
                "all workers stopped",
            ))
            .await;
        Ok(())
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self.running.lock().await;
        let board = self.board.read().await;
        let mut workers: Vec<WorkerSnapshot> = board
            .iter()
            .map(|(device_id, state)| WorkerSnapshot {
                device_id: *device_id,
                device_name: state.device_name.clone(),
                current_task: state.current_task.clone(),
                sessions_today: state.sessions_today,
                updated_at: state.updated_at,
            })
            .collect();
        workers.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        SchedulerStatus {
            running: running.is_some(),
            started_at: running.as_ref().map(|r| r.started_at),
            workers,
        }
    }
}

/// Everything one device worker needs; owned, nothing shared but the store
/// handles and the status board.
struct Worker {
    device: Device,
    store: Store,
    events: EventLog,
    sessions: Arc<SessionRunner>,
    creation: Arc<CreationRunner>,
    board: WorkerBoard,
    schedule: crate::config::ScheduleConfig,
    agent_host: String,
}

impl Worker {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let agent = AgentClient::new(&self.agent_host, self.device.automation_port);
        let mut agent_backoff = self.schedule.probe_backoff_initial;
        let mut agent_failures: u32 = 0;

        while !*stop.borrow() {
            if let Err(e) = self.iteration(&agent, &mut stop, &mut agent_backoff, &mut agent_failures).await {
                // Failure isolation: log, report, sleep, resume. Never
                // propagate out of the worker.
                tracing::error!(device = %self.device.name, error = %e, "device loop error");
                self.events
                    .emit(
                        NewEvent::scheduler_error(event_type::DEVICE_LOOP_ERROR, e.to_string())
                            .with_device(self.device.id),
                    )
                    .await;
                self.publish("recovering from loop error").await;
                if sleep_or_stop(Duration::from_secs(60), &mut stop).await {
                    break;
                }
            }
        }
        self.publish("stopped").await;
    }

    /// One pass of the worker loop. Returns Err only for unexpected store
    /// failures; expected conditions are handled inline.
    async fn iteration(
        &self,
        agent: &AgentClient,
        stop: &mut watch::Receiver<bool>,
        agent_backoff: &mut Duration,
        agent_failures: &mut u32,
    ) -> Result<(), crate::store::StoreError> {
        // 1. Heartbeat.
        self.store.touch_device(self.device.id).await?;

        // 2. Health-probe the automation endpoint; back off on failure.
        if let Err(e) = agent.status().await {
            self.note_agent_failure(
                &format!("health probe failed: {}", e),
                agent_backoff,
                agent_failures,
                stop,
            )
            .await;
            return Ok(());
        }

        // 3. Claim a task.
        let claimed = self
            .store
            .claim_next_account(self.device.id, Utc::now())
            .await?;

        match claimed {
            // 4. Warming task.
            Some(account) => {
                self.publish(&format!("warming {}", account.username)).await;
                let run = self
                    .sessions
                    .run(&self.device, &account, agent, stop.clone());
                match tokio::time::timeout(self.schedule.session_total_budget, run).await {
                    Ok(outcome) => {
                        if let SessionOutcome::Interrupted = outcome {
                            return Ok(());
                        }
                        // A mid-session timeout gets the same backoff as a
                        // failed probe; the device is the problem, not the
                        // account.
                        if outcome.is_transient_agent_failure() {
                            self.note_agent_failure(
                                "session aborted on a transient agent failure",
                                agent_backoff,
                                agent_failures,
                                stop,
                            )
                            .await;
                            return Ok(());
                        }
                        *agent_backoff = self.schedule.probe_backoff_initial;
                        *agent_failures = 0;
                    }
                    Err(_) => {
                        // Hard deadline: the dropped future can no longer
                        // write anything; surface it and free the claim.
                        self.events
                            .emit(
                                NewEvent::scheduler_error(
                                    event_type::WARMING_FAILED,
                                    format!(
                                        "session exceeded the {:?} hard budget",
                                        self.schedule.session_total_budget
                                    ),
                                )
                                .with_device(self.device.id)
                                .with_account(account.id),
                            )
                            .await;
                        self.store.release_claim(account.id).await?;
                        self.note_agent_failure(
                            "session exceeded its hard budget",
                            agent_backoff,
                            agent_failures,
                            stop,
                        )
                        .await;
                        return Ok(());
                    }
                }
                self.bump_sessions().await;
            }
            // 5. No warming task: try a creation task instead.
            None => {
                self.publish("creating account").await;
                let creation = self.creation.run(&self.device, agent);
                tokio::select! {
                    outcome = creation => {
                        match outcome {
                            CreationOutcome::Skipped => {
                                // Endpoint answered and there is nothing to
                                // do; idle instead of spinning.
                                *agent_backoff = self.schedule.probe_backoff_initial;
                                *agent_failures = 0;
                                self.publish("idle").await;
                                sleep_or_stop(self.schedule.idle_interval, stop).await;
                                return Ok(());
                            }
                            CreationOutcome::Created(_) => {
                                *agent_backoff = self.schedule.probe_backoff_initial;
                                *agent_failures = 0;
                            }
                            CreationOutcome::Failed => {}
                        }
                        self.bump_sessions().await;
                    }
                    _ = stop.changed() => return Ok(()),
                }
            }
        }

        // 6-7. Loop cooldown.
        self.publish("cooldown").await;
        sleep_or_stop(self.schedule.session_cooldown, stop).await;
        Ok(())
    }

    /// One recovery path for all transient agent trouble, whether the
    /// dedicated probe failed or a call timed out mid-session: exponential
    /// backoff per device, warning on the first consecutive failure,
    /// critical once the threshold is reached.
    async fn note_agent_failure(
        &self,
        detail: &str,
        agent_backoff: &mut Duration,
        agent_failures: &mut u32,
        stop: &mut watch::Receiver<bool>,
    ) {
        *agent_failures += 1;
        let severity = if *agent_failures >= self.schedule.probe_critical_threshold {
            EventSeverity::Critical
        } else {
            EventSeverity::Warning
        };
        if *agent_failures == 1 || severity == EventSeverity::Critical {
            self.events
                .emit(
                    NewEvent::new(
                        crate::model::EventCategory::Device,
                        severity,
                        event_type::DEVICE_DISCONNECTED,
                        format!("{} ({} consecutive)", detail, agent_failures),
                    )
                    .with_device(self.device.id),
                )
                .await;
        }
        self.publish(&format!("agent trouble, backing off {:?}", agent_backoff))
            .await;
        let backoff = *agent_backoff;
        *agent_backoff = (*agent_backoff * 2).min(self.schedule.probe_backoff_max);
        sleep_or_stop(backoff, stop).await;
    }

    async fn publish(&self, task: &str) {
        let mut board = self.board.write().await;
        if let Some(state) = board.get_mut(&self.device.id) {
            state.current_task = task.to_string();
            state.updated_at = Utc::now();
        }
    }

    async fn bump_sessions(&self) {
        let today = Utc::now().date_naive();
        let mut board = self.board.write().await;
        if let Some(state) = board.get_mut(&self.device.id) {
            if state.session_day != today {
                state.session_day = today;
                state.sessions_today = 0;
            }
            state.sessions_today += 1;
            state.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventFilter;

    fn test_scheduler(store: Store) -> Scheduler {
        let events = EventLog::new(store.clone());
        let config = Config::for_tests(std::path::PathBuf::from(":memory:"));
        Scheduler::new(store, events, Codec::new([0u8; 32]), config)
    }

    #[tokio::test]
    async fn empty_fleet_warns_and_stops_cleanly() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = test_scheduler(store.clone());

        let workers = scheduler.start().await.unwrap();
        assert_eq!(workers, 0);
        assert!(scheduler.status().await.running);

        scheduler.stop().await.unwrap();
        assert!(!scheduler.status().await.running);

        let warnings = store
            .query_events(EventFilter {
                event_type: Some(event_type::NO_DEVICES.into()),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);

        // scheduler_stopped is the terminal event.
        let all = store.query_events(EventFilter::default()).await.unwrap();
        assert_eq!(all[0].event_type, event_type::SCHEDULER_STOPPED);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = test_scheduler(store);
        scheduler.start().await.unwrap();
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::AlreadyRunning)
        ));
        scheduler.stop().await.unwrap();
        assert!(matches!(
            scheduler.stop().await,
            Err(SchedulerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn workers_publish_status_and_honor_stop() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_device("iphone-11", "00008030-STATUS", 8111)
            .await
            .unwrap();
        let scheduler = test_scheduler(store.clone());

        let workers = scheduler.start().await.unwrap();
        assert_eq!(workers, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = scheduler.status().await;
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.workers[0].device_name, "iphone-11");

        // No agent listens on the port, so the worker is in probe backoff;
        // stop must still land within the grace period.
        scheduler.stop().await.unwrap();
        let status = scheduler.status().await;
        assert!(!status.running);
        assert!(status.workers.is_empty());
    }
}
