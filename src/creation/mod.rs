//! Account creation runner.
//!
//! Runs when a worker has no warming task. The flow mirrors a human
//! first-run: fresh install, sign-up screens, CAPTCHA, email and SMS
//! verification, then the encrypted account row in state `created`. Nothing
//! is written unless every step succeeds; a failed sign-up leaves no trace
//! but its event.

mod external;
mod username;

pub use external::{
    CaptchaClient, ExternalError, ExternalServices, MailboxClient, SmsClient, VERIFY_DEADLINE,
    VERIFY_INTERVAL,
};
pub use username::{generate_password, synthesize};

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use thiserror::Error;

use crate::agent::{AgentClient, AgentError, AgentSession, Strategy};
use crate::crypto::{Codec, CryptoError};
use crate::events::{event_type, EventLog};
use crate::model::{Account, Device, EventCategory, EventSeverity, Niche, Platform};
use crate::session::{install_app, uninstall_app, InstallError};
use crate::store::{NewAccount, NewEvent, Store, StoreError};
use crate::totp;

/// Attempts at a unique username before giving up on the niche.
const USERNAME_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum CreationError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error("sign-up UI drive failed: {0}")]
    Ui(String),

    #[error("could not synthesize an unused username for {0}")]
    UsernameExhausted(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a creation attempt ended.
#[derive(Debug)]
pub enum CreationOutcome {
    Created(Box<Account>),
    /// External collaborators absent or no active niche; warned, not failed.
    Skipped,
    Failed,
}

pub struct CreationRunner {
    store: Store,
    events: EventLog,
    codec: Codec,
    services: Option<ExternalServices>,
}

impl CreationRunner {
    pub fn new(
        store: Store,
        events: EventLog,
        codec: Codec,
        services: Option<ExternalServices>,
    ) -> Self {
        Self {
            store,
            events,
            codec,
            services,
        }
    }

    /// Create one account on the device, or skip with a warning when the
    /// required external services are not configured.
    pub async fn run(&self, device: &Device, agent: &AgentClient) -> CreationOutcome {
        let services = match &self.services {
            Some(services) => services,
            None => {
                self.events
                    .emit(
                        NewEvent::scheduler_warning(
                            event_type::CREATION_SKIPPED,
                            "creation requires CAPTCHA, SMS and IMAP credentials; none configured",
                        )
                        .with_device(device.id),
                    )
                    .await;
                return CreationOutcome::Skipped;
            }
        };

        let (platform, niche) = match self.store.creation_target().await {
            Ok(Some(target)) => target,
            Ok(None) => {
                self.events
                    .emit(
                        NewEvent::scheduler_warning(
                            event_type::CREATION_SKIPPED,
                            "no active niches to create into",
                        )
                        .with_device(device.id),
                    )
                    .await;
                return CreationOutcome::Skipped;
            }
            Err(e) => {
                self.events
                    .emit(
                        NewEvent::scheduler_error(event_type::DEVICE_LOOP_ERROR, e.to_string())
                            .with_device(device.id),
                    )
                    .await;
                return CreationOutcome::Failed;
            }
        };

        self.events
            .emit(
                NewEvent::scheduler_info(
                    event_type::CREATION_STARTED,
                    format!("creating {} account in {}", platform, niche.slug),
                )
                .with_device(device.id)
                .with_context(serde_json::json!({
                    "platform": platform.as_str(),
                    "niche": niche.slug,
                })),
            )
            .await;

        match self.create(device, agent, services, platform, &niche).await {
            Ok(account) => {
                self.events
                    .emit(
                        NewEvent::new(
                            EventCategory::Account,
                            EventSeverity::Info,
                            event_type::ACCOUNT_CREATED,
                            format!("{} created in {}", account.username, niche.slug),
                        )
                        .with_device(device.id)
                        .with_account(account.id),
                    )
                    .await;
                CreationOutcome::Created(Box::new(account))
            }
            Err(e) => {
                let event = match &e {
                    CreationError::External(ExternalError::Captcha(_)) => NewEvent::new(
                        EventCategory::Auth,
                        EventSeverity::Error,
                        event_type::CAPTCHA_FAILED,
                        e.to_string(),
                    ),
                    _ => NewEvent::account_error(
                        event_type::ACCOUNT_CREATION_FAILED,
                        e.to_string(),
                    ),
                };
                self.events.emit(event.with_device(device.id)).await;
                CreationOutcome::Failed
            }
        }
    }

    async fn create(
        &self,
        device: &Device,
        agent: &AgentClient,
        services: &ExternalServices,
        platform: Platform,
        niche: &Niche,
    ) -> Result<Account, CreationError> {
        let mut rng = StdRng::from_entropy();

        let mut username = None;
        for _ in 0..USERNAME_ATTEMPTS {
            let candidate = synthesize(&mut rng, &niche.slug);
            if !self.store.username_taken(platform, &candidate).await? {
                username = Some(candidate);
                break;
            }
        }
        let username =
            username.ok_or_else(|| CreationError::UsernameExhausted(niche.slug.clone()))?;
        let email = format!("{}@{}", username, services.mail_domain);
        let password = generate_password(&mut rng);

        let session = agent.create_session().await?;
        let result = self
            .drive_signup(&session, services, platform, &username, &email, &password)
            .await;
        let _ = session.close().await;
        result?;

        self.events
            .emit(
                NewEvent::new(
                    EventCategory::Account,
                    EventSeverity::Info,
                    event_type::ACCOUNT_CREATION_STARTED,
                    format!("{} sign-up flow finished, persisting", username),
                )
                .with_device(device.id),
            )
            .await;

        let totp_seed = totp::generate_seed();
        let account = self
            .store
            .insert_account(NewAccount {
                platform,
                username: username.clone(),
                email_enc: self.codec.encrypt_str(&email)?,
                password_enc: self.codec.encrypt_str(&password)?,
                totp_secret_enc: self.codec.encrypt_str(&totp_seed)?,
                proxy_credentials: None,
                niche_id: niche.id,
                device_id: Some(device.id),
            })
            .await?;
        Ok(account)
    }

    /// The on-device sign-up drive: reset install, walk the sign-up screens,
    /// clear the CAPTCHA and both verification challenges.
    async fn drive_signup(
        &self,
        session: &AgentSession,
        services: &ExternalServices,
        platform: Platform,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(), CreationError> {
        uninstall_app(session, platform).await?;
        install_app(session, platform).await?;

        session.activate_app(platform.bundle_id()).await?;
        tokio::time::sleep(Duration::from_secs(4)).await;
        for _ in 0..3 {
            match session.alert_text().await? {
                Some(_) => {
                    session.dismiss_alert().await?;
                    tokio::time::sleep(Duration::from_millis(700)).await;
                }
                None => break,
            }
        }

        let sign_up = session
            .find_first(&[
                (Strategy::AccessibilityId, "Sign up"),
                (Strategy::PredicateString, "label == 'Sign up'"),
                (Strategy::PredicateString, "label == 'Create new account'"),
            ])
            .await
            .map_err(|e| CreationError::Ui(e.to_string()))?;
        session.click(&sign_up).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        if let Ok(email_tab) = session
            .find_first(&[
                (Strategy::PredicateString, "label CONTAINS 'email'"),
                (Strategy::PredicateString, "label == 'Use email'"),
            ])
            .await
        {
            session.click(&email_tab).await?;
        }

        self.type_first(session, &[(Strategy::ClassChain, "**/XCUIElementTypeTextField")], email)
            .await?;
        self.tap_next(session).await?;

        // CAPTCHA gate, when the platform raises one.
        if session
            .find_first(&[
                (Strategy::PredicateString, "label CONTAINS 'Verify'"),
                (Strategy::PredicateString, "label CONTAINS 'captcha'"),
            ])
            .await
            .is_ok()
        {
            let png = session.screenshot().await?;
            let solution = services.captcha.solve(&png).await?;
            self.type_first(
                session,
                &[(Strategy::PredicateString, "type == 'XCUIElementTypeTextField'")],
                &solution,
            )
            .await?;
            self.tap_next(session).await?;
        }

        // Email verification code via the catch-all mailbox.
        let code = services.mailbox.await_code(email).await?;
        self.type_first(
            session,
            &[
                (Strategy::PredicateString, "label CONTAINS 'digit code'"),
                (Strategy::ClassChain, "**/XCUIElementTypeTextField"),
            ],
            &code,
        )
        .await?;
        self.tap_next(session).await?;

        // Phone verification when prompted.
        if session
            .find_first(&[(Strategy::PredicateString, "label CONTAINS 'phone number'")])
            .await
            .is_ok()
        {
            let (rental_id, number) = services.sms.rent_number().await?;
            let result = async {
                self.type_first(
                    session,
                    &[(Strategy::ClassChain, "**/XCUIElementTypeTextField")],
                    &number,
                )
                .await?;
                self.tap_next(session).await?;
                let sms_code = services.sms.await_code(&rental_id).await?;
                self.type_first(
                    session,
                    &[
                        (Strategy::PredicateString, "label CONTAINS 'digit code'"),
                        (Strategy::ClassChain, "**/XCUIElementTypeTextField"),
                    ],
                    &sms_code,
                )
                .await?;
                self.tap_next(session).await
            }
            .await;
            services.sms.release(&rental_id).await;
            result?;
        }

        // Password, then the handle itself.
        self.type_first(
            session,
            &[(Strategy::ClassChain, "**/XCUIElementTypeSecureTextField")],
            password,
        )
        .await?;
        self.tap_next(session).await?;

        self.type_first(
            session,
            &[
                (Strategy::PredicateString, "label CONTAINS 'Username'"),
                (Strategy::ClassChain, "**/XCUIElementTypeTextField"),
            ],
            username,
        )
        .await?;
        self.tap_next(session).await?;

        // Dismiss the interest-picker / contact-sync onboarding walk.
        for _ in 0..6 {
            match session
                .find_first(&[
                    (Strategy::PredicateString, "label == 'Skip'"),
                    (Strategy::PredicateString, "label == 'Not Now'"),
                ])
                .await
            {
                Ok(skip) => {
                    session.click(&skip).await?;
                    tokio::time::sleep(Duration::from_millis(800)).await;
                }
                Err(AgentError::ElementNotFound(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    async fn type_first(
        &self,
        session: &AgentSession,
        candidates: &[(Strategy, &str)],
        text: &str,
    ) -> Result<(), CreationError> {
        let field = session
            .find_first(candidates)
            .await
            .map_err(|e| CreationError::Ui(e.to_string()))?;
        session.click(&field).await?;
        session.set_value(&field, text).await?;
        Ok(())
    }

    async fn tap_next(&self, session: &AgentSession) -> Result<(), CreationError> {
        let next = session
            .find_first(&[
                (Strategy::PredicateString, "label == 'Next'"),
                (Strategy::PredicateString, "label == 'Continue'"),
                (Strategy::PredicateString, "label == 'Send code'"),
            ])
            .await
            .map_err(|e| CreationError::Ui(e.to_string()))?;
        session.click(&next).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventFilter;

    #[tokio::test]
    async fn unconfigured_creation_is_skipped_with_warning() {
        let store = Store::open_in_memory().unwrap();
        let events = EventLog::new(store.clone());
        let runner = CreationRunner::new(
            store.clone(),
            events,
            Codec::new([0u8; 32]),
            None,
        );
        let device = store
            .insert_device("iphone-07", "00008030-DEF", 8107)
            .await
            .unwrap();
        let agent = AgentClient::new("127.0.0.1", device.automation_port);

        let outcome = runner.run(&device, &agent).await;
        assert!(matches!(outcome, CreationOutcome::Skipped));

        let rows = store
            .query_events(EventFilter {
                event_type: Some(event_type::CREATION_SKIPPED.into()),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].severity, EventSeverity::Warning);
    }
}
