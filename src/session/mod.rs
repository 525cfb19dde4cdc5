//! The session runner: delete → install → login → warm, with explicit
//! outcomes per step.
//!
//! Reinstalling before every login is the point, not an optimization: each
//! fresh install rotates the per-vendor installation identity, which is the
//! strongest lever against cross-account fingerprinting.

mod install;
mod login;

pub use install::{install_app, uninstall_app, InstallError};
pub use login::{login, Credentials, LoginError};

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::agent::{AgentClient, AgentError, AgentSession};
use crate::config::ScheduleConfig;
use crate::crypto::{Codec, CryptoError};
use crate::events::{event_type, EventLog};
use crate::model::{phase_for_day, Account, AccountState, Device, Phase};
use crate::store::{NewEvent, Store, StoreError};
use crate::warming::{warmer_for, WarmingOutcome, WarmingReport};

/// Narrow hook for classifying a finished session into an exception state
/// (flagged, shadowbanned, ...). The core never infers degradation from
/// side-channel signals itself; detectors plug in here.
pub type ExceptionClassifier =
    Arc<dyn Fn(&WarmingReport) -> Option<AccountState> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("automation session unavailable: {0}")]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error("credentials unreadable: {0}")]
    Credentials(#[from] CryptoError),

    #[error("{0} exceeded its time budget")]
    Budget(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Device-side transient trouble: agent transport failures and step
    /// timeouts. The worker backs off the device for these instead of
    /// blaming the account.
    pub fn is_transient_agent(&self) -> bool {
        match self {
            SessionError::Agent(e) => e.is_transient(),
            SessionError::Install(e) => e.is_transient(),
            SessionError::Login(e) => e.is_transient(),
            SessionError::Budget(_) => true,
            SessionError::Credentials(_) | SessionError::Store(_) => false,
        }
    }
}

/// How one session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Warming ran to completion and the account row was advanced.
    Completed {
        warming_day: i64,
        new_state: AccountState,
        report: WarmingReport,
    },
    /// A step before warming failed; the account was left untouched.
    Aborted(SessionError),
    /// Warming broke mid-run; partial progress was recorded, the day count
    /// was not advanced.
    WarmingFailed {
        report: WarmingReport,
        error: AgentError,
    },
    /// The stop signal preempted the session.
    Interrupted,
}

impl SessionOutcome {
    /// Whether the worker should fold this outcome into its per-device
    /// backoff: probe failures and single-call timeouts share one recovery.
    pub fn is_transient_agent_failure(&self) -> bool {
        match self {
            SessionOutcome::Aborted(e) => e.is_transient_agent(),
            SessionOutcome::WarmingFailed { error, .. } => error.is_transient(),
            _ => false,
        }
    }
}

pub struct SessionRunner {
    store: Store,
    events: EventLog,
    codec: Codec,
    schedule: ScheduleConfig,
    classifier: Option<ExceptionClassifier>,
}

impl SessionRunner {
    pub fn new(store: Store, events: EventLog, codec: Codec, schedule: ScheduleConfig) -> Self {
        Self {
            store,
            events,
            codec,
            schedule,
            classifier: None,
        }
    }

    /// Install an exception classifier (Open Question 3's hook).
    pub fn with_classifier(mut self, classifier: ExceptionClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Run one warming session for `account` on `device`.
    ///
    /// The caller enforces the overall session ceiling; this method enforces
    /// the per-step budgets (overhead ≤ 15 min, warming exactly the
    /// configured window).
    pub async fn run(
        &self,
        device: &Device,
        account: &Account,
        agent: &AgentClient,
        stop: watch::Receiver<bool>,
    ) -> SessionOutcome {
        let started_at = Utc::now();
        let overhead_deadline = Instant::now() + self.schedule.session_overhead_budget;
        let warming_day = account.warming_day_count + 1;
        let phase = phase_for_day(warming_day);

        self.events
            .emit(
                NewEvent::scheduler_info(
                    event_type::WARMING_STARTED,
                    format!("warming {} on {}", account.username, device.name),
                )
                .with_device(device.id)
                .with_account(account.id)
                .with_context(serde_json::json!({
                    "phase": phase.label(),
                    "warming_day": warming_day,
                })),
            )
            .await;

        let session = match tokio::time::timeout_at(overhead_deadline, agent.create_session()).await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.events
                    .emit(
                        NewEvent::device_error(
                            event_type::DEVICE_DISCONNECTED,
                            format!("could not open automation session: {}", e),
                        )
                        .with_device(device.id)
                        .with_account(account.id),
                    )
                    .await;
                self.abandon(account).await;
                return SessionOutcome::Aborted(e.into());
            }
            Err(_) => {
                self.events
                    .emit(
                        NewEvent::device_error(
                            event_type::DEVICE_DISCONNECTED,
                            "automation session did not open within the overhead budget",
                        )
                        .with_device(device.id)
                        .with_account(account.id),
                    )
                    .await;
                self.abandon(account).await;
                return SessionOutcome::Aborted(SessionError::Budget("session setup"));
            }
        };

        let outcome = self
            .run_steps(device, account, &session, overhead_deadline, phase, stop)
            .await;

        // Cleanup is best-effort; a wedged agent gets caught by the next
        // health probe.
        let _ = session.terminate_app(account.platform.bundle_id()).await;
        if let Err(e) = session.close().await {
            tracing::debug!(device = %device.name, error = %e, "agent session close failed");
        }

        match outcome {
            Ok(report) => self.finish(device, account, started_at, warming_day, phase, report).await,
            Err(StepFailure::Fatal(outcome)) => outcome,
            Err(StepFailure::Warming { report, error }) => {
                self.record_partial(device, account, warming_day, phase, started_at, &report)
                    .await;
                self.events
                    .emit(
                        NewEvent::scheduler_error(
                            event_type::WARMING_FAILED,
                            format!("warming broke mid-run: {}", error),
                        )
                        .with_device(device.id)
                        .with_account(account.id)
                        .with_context(serde_json::json!({
                            "phase": phase.label(),
                            "videos_watched": report.videos_watched,
                        })),
                    )
                    .await;
                self.abandon(account).await;
                SessionOutcome::WarmingFailed { report, error }
            }
            Err(StepFailure::Interrupted { report }) => {
                if let Some(report) = report {
                    self.record_partial(device, account, warming_day, phase, started_at, &report)
                        .await;
                }
                self.abandon(account).await;
                SessionOutcome::Interrupted
            }
        }
    }

    async fn run_steps(
        &self,
        device: &Device,
        account: &Account,
        session: &AgentSession,
        overhead_deadline: Instant,
        phase: Phase,
        stop: watch::Receiver<bool>,
    ) -> Result<WarmingReport, StepFailure> {
        // Step 1: make sure the app is not running. Failure is only a warn;
        // the uninstall wipes it anyway.
        if let Err(e) = session.terminate_app(account.platform.bundle_id()).await {
            tracing::warn!(device = %device.name, error = %e, "pre-session terminate failed");
        }

        // Step 2: fresh install.
        match tokio::time::timeout_at(overhead_deadline, uninstall_app(session, account.platform))
            .await
        {
            Ok(Ok(())) => {
                self.events
                    .emit(
                        NewEvent::new(
                            crate::model::EventCategory::Device,
                            crate::model::EventSeverity::Info,
                            event_type::APP_DELETED,
                            format!("{} removed", account.platform.app_store_name()),
                        )
                        .with_device(device.id),
                    )
                    .await;
            }
            Ok(Err(e)) => {
                self.events
                    .emit(
                        NewEvent::device_error(event_type::APP_DELETE_FAILED, e.to_string())
                            .with_device(device.id)
                            .with_account(account.id),
                    )
                    .await;
                return Err(self.install_failure(device, account, e.into()).await);
            }
            Err(_) => {
                return Err(self
                    .install_failure(device, account, SessionError::Budget("app removal"))
                    .await);
            }
        }

        match tokio::time::timeout_at(overhead_deadline, install_app(session, account.platform))
            .await
        {
            Ok(Ok(())) => {
                self.events
                    .emit(
                        NewEvent::new(
                            crate::model::EventCategory::Device,
                            crate::model::EventSeverity::Info,
                            event_type::APP_INSTALLED,
                            format!("{} reinstalled", account.platform.app_store_name()),
                        )
                        .with_device(device.id),
                    )
                    .await;
            }
            Ok(Err(e)) => return Err(self.install_failure(device, account, e.into()).await),
            Err(_) => {
                return Err(self
                    .install_failure(device, account, SessionError::Budget("app install"))
                    .await);
            }
        }

        // Step 3: log in.
        let creds = match self.decrypt_credentials(account) {
            Ok(creds) => creds,
            Err(e) => return Err(self.credential_failure(device, account, e).await),
        };

        match tokio::time::timeout_at(
            overhead_deadline,
            login(session, account.platform, &account.username, &creds),
        )
        .await
        {
            Ok(Ok(())) => {
                self.events
                    .emit(
                        NewEvent::new(
                            crate::model::EventCategory::Account,
                            crate::model::EventSeverity::Info,
                            event_type::LOGIN_SUCCESS,
                            format!("{} logged in", account.username),
                        )
                        .with_device(device.id)
                        .with_account(account.id),
                    )
                    .await;
            }
            Ok(Err(e)) => return Err(self.login_failure(device, account, e.into()).await),
            Err(_) => {
                return Err(self
                    .login_failure(device, account, SessionError::Budget("login"))
                    .await);
            }
        }

        // Step 4: warm, phase-selected primitive, fixed wall-clock window.
        let niche_tag = match account.niche_id {
            Some(niche_id) => self.store.get_niche(niche_id).await.ok().map(|n| n.slug),
            None => None,
        };
        let warmer = warmer_for(account.platform, niche_tag);
        let WarmingOutcome {
            report,
            error,
            interrupted,
        } = match phase {
            Phase::Passive => {
                warmer
                    .passive_consumption(session, self.schedule.warming_budget, stop)
                    .await
            }
            _ => {
                warmer
                    .light_engagement(session, phase, self.schedule.warming_budget, stop)
                    .await
            }
        };

        if interrupted {
            return Err(StepFailure::Interrupted {
                report: Some(report),
            });
        }
        if let Some(error) = error {
            return Err(StepFailure::Warming { report, error });
        }
        Ok(report)
    }

    /// Steps 5-7: advance the account, append the warming record, emit the
    /// completion event.
    async fn finish(
        &self,
        device: &Device,
        account: &Account,
        started_at: chrono::DateTime<chrono::Utc>,
        warming_day: i64,
        phase: Phase,
        report: WarmingReport,
    ) -> SessionOutcome {
        let exception = self.classifier.as_ref().and_then(|c| c(&report));
        let now = Utc::now();

        let updated = match self
            .store
            .complete_warming_session(account.id, now, exception)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                self.events
                    .emit(
                        NewEvent::scheduler_error(
                            event_type::WARMING_FAILED,
                            format!("post-session account update failed: {}", e),
                        )
                        .with_severity(crate::model::EventSeverity::Critical)
                        .with_account(account.id)
                        .with_device(device.id),
                    )
                    .await;
                self.abandon(account).await;
                return SessionOutcome::Aborted(e.into());
            }
        };

        let session_data = serde_json::to_value(&report).unwrap_or_else(|_| serde_json::json!({}));
        if let Err(e) = self
            .store
            .insert_warming_session(
                account.id,
                device.id,
                account.platform,
                phase.number(),
                warming_day,
                session_data,
                started_at,
                Some(now),
            )
            .await
        {
            tracing::error!(account = %account.username, error = %e, "warming record insert failed");
        }

        self.events
            .emit(
                NewEvent::scheduler_info(
                    event_type::WARMING_COMPLETE,
                    format!(
                        "{} warmed: {} videos, {} likes, {} follows",
                        account.username, report.videos_watched, report.likes, report.follows
                    ),
                )
                .with_device(device.id)
                .with_account(account.id)
                .with_context(serde_json::json!({
                    "phase": phase.label(),
                    "warming_day": warming_day,
                    "videos_watched": report.videos_watched,
                    "likes": report.likes,
                    "follows": report.follows,
                })),
            )
            .await;

        SessionOutcome::Completed {
            warming_day: updated.warming_day_count,
            new_state: updated.current_state,
            report,
        }
    }

    fn decrypt_credentials(&self, account: &Account) -> Result<Credentials, CryptoError> {
        let email = self
            .codec
            .decrypt_str(account.email_enc.as_deref().unwrap_or_default())?;
        let password = self
            .codec
            .decrypt_str(account.password_enc.as_deref().unwrap_or_default())?;
        let totp_seed = self
            .codec
            .decrypt_str(account.totp_secret_enc.as_deref().unwrap_or_default())?;
        Ok(Credentials {
            email,
            password,
            totp_seed,
        })
    }

    async fn install_failure(
        &self,
        device: &Device,
        account: &Account,
        error: SessionError,
    ) -> StepFailure {
        self.events
            .emit(
                NewEvent::device_error(event_type::INSTALL_FAILED, error.to_string())
                    .with_device(device.id)
                    .with_account(account.id),
            )
            .await;
        self.abandon(account).await;
        StepFailure::Fatal(SessionOutcome::Aborted(error))
    }

    async fn login_failure(
        &self,
        device: &Device,
        account: &Account,
        error: SessionError,
    ) -> StepFailure {
        self.events
            .emit(
                NewEvent::account_error(event_type::LOGIN_FAILED, error.to_string())
                    .with_device(device.id)
                    .with_account(account.id),
            )
            .await;
        self.abandon(account).await;
        StepFailure::Fatal(SessionOutcome::Aborted(error))
    }

    /// Decryption failure: critical event, mark the account when the DAG
    /// allows it, skip. Never panics the worker.
    async fn credential_failure(
        &self,
        device: &Device,
        account: &Account,
        error: CryptoError,
    ) -> StepFailure {
        self.events
            .emit(
                NewEvent::account_error(event_type::CREDENTIALS_UNREADABLE, error.to_string())
                    .with_severity(crate::model::EventSeverity::Critical)
                    .with_device(device.id)
                    .with_account(account.id),
            )
            .await;
        if account
            .current_state
            .can_transition_to(AccountState::Flagged)
        {
            if let Err(e) = self
                .store
                .transition_account(account.id, AccountState::Flagged)
                .await
            {
                tracing::error!(account = %account.username, error = %e, "could not flag account");
            }
        }
        self.abandon(account).await;
        StepFailure::Fatal(SessionOutcome::Aborted(error.into()))
    }

    /// Record a partial warming run (unfinished: no completed_at).
    async fn record_partial(
        &self,
        device: &Device,
        account: &Account,
        warming_day: i64,
        phase: Phase,
        started_at: chrono::DateTime<chrono::Utc>,
        report: &WarmingReport,
    ) {
        let session_data = serde_json::to_value(report).unwrap_or_else(|_| serde_json::json!({}));
        if let Err(e) = self
            .store
            .insert_warming_session(
                account.id,
                device.id,
                account.platform,
                phase.number(),
                warming_day,
                session_data,
                started_at,
                None,
            )
            .await
        {
            tracing::error!(account = %account.username, error = %e, "partial warming record insert failed");
        }
    }

    /// Release the claim so an aborted account stays eligible today.
    async fn abandon(&self, account: &Account) {
        if let Err(e) = self.store.release_claim(account.id).await {
            tracing::error!(account = %account.username, error = %e, "claim release failed");
        }
    }
}

enum StepFailure {
    Fatal(SessionOutcome),
    Warming {
        report: WarmingReport,
        error: AgentError,
    },
    Interrupted {
        report: Option<WarmingReport>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;

    #[test]
    fn phase_selection_matches_day() {
        assert_eq!(phase_for_day(1), Phase::Passive);
        assert_eq!(phase_for_day(4), Phase::Light);
    }

    #[test]
    fn transient_agent_failures_back_off_the_device() {
        // Step timeouts and 5xx agent answers track the device.
        assert!(SessionError::Budget("login").is_transient_agent());
        assert!(SessionError::Agent(AgentError::Status {
            status: 503,
            message: "unavailable".into(),
        })
        .is_transient_agent());

        // The platform saying no, or bad stored secrets, track the account.
        assert!(!SessionError::Login(LoginError::Rejected("bad password".into()))
            .is_transient_agent());
        assert!(!SessionError::Credentials(CryptoError::TokenEncoding).is_transient_agent());

        let flaky = SessionOutcome::WarmingFailed {
            report: WarmingReport::default(),
            error: AgentError::Status {
                status: 500,
                message: "internal".into(),
            },
        };
        assert!(flaky.is_transient_agent_failure());
        assert!(!SessionOutcome::Interrupted.is_transient_agent_failure());
    }

    #[tokio::test]
    async fn credential_failure_flags_warming_accounts() {
        let store = Store::open_in_memory().unwrap();
        let events = EventLog::new(store.clone());
        let codec = Codec::new([0u8; 32]);
        let runner = SessionRunner::new(
            store.clone(),
            events,
            codec,
            ScheduleConfig::default(),
        );

        let niche = store.insert_niche("fitness", "Fitness", 2).await.unwrap();
        let device = store
            .insert_device("iphone-09", "00008030-XYZ", 8109)
            .await
            .unwrap();
        let account = store
            .insert_account(crate::store::NewAccount {
                platform: Platform::Tiktok,
                username: "badtoken1".into(),
                email_enc: "not-a-valid-token".into(),
                password_enc: "not-a-valid-token".into(),
                totp_secret_enc: "not-a-valid-token".into(),
                proxy_credentials: None,
                niche_id: niche.id,
                device_id: None,
            })
            .await
            .unwrap();
        // Move it into a flaggable state first.
        store
            .complete_warming_session(account.id, Utc::now(), None)
            .await
            .unwrap();
        let account = store.get_account(account.id).await.unwrap();

        let failure = runner
            .credential_failure(&device, &account, CryptoError::TokenEncoding)
            .await;
        assert!(matches!(
            failure,
            StepFailure::Fatal(SessionOutcome::Aborted(SessionError::Credentials(_)))
        ));

        let after = store.get_account(account.id).await.unwrap();
        assert_eq!(after.current_state, AccountState::Flagged);
        // No day increment on failure.
        assert_eq!(after.warming_day_count, 1);
    }
}
