//! Platform login flows, including TOTP second factors.

use std::time::Duration;
use thiserror::Error;

use crate::agent::{AgentError, AgentSession, Strategy};
use crate::model::Platform;
use crate::totp;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("login UI drive failed: {0}")]
    Agent(#[from] AgentError),

    #[error("two-factor challenge failed: {0}")]
    TwoFactor(String),

    #[error("platform rejected the login: {0}")]
    Rejected(String),
}

impl LoginError {
    /// Device-side transient trouble, as opposed to the platform saying no.
    pub fn is_transient(&self) -> bool {
        matches!(self, LoginError::Agent(e) if e.is_transient())
    }
}

/// A missing feed after submit means the platform pushed back; anything
/// else stays an agent failure so the worker can back off the device.
fn classify_feed_check(e: AgentError) -> LoginError {
    match e {
        AgentError::ElementNotFound(_) => {
            LoginError::Rejected("feed never appeared after submit".into())
        }
        other => LoginError::Agent(other),
    }
}

/// Decrypted credentials, held only for the duration of the login step.
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub totp_seed: String,
}

/// Drive the platform's login UI for a fresh install.
pub async fn login(
    session: &AgentSession,
    platform: Platform,
    username: &str,
    creds: &Credentials,
) -> Result<(), LoginError> {
    session.activate_app(platform.bundle_id()).await?;
    tokio::time::sleep(Duration::from_secs(4)).await;
    dismiss_startup_alerts(session).await?;

    match platform {
        Platform::Tiktok => tiktok_login(session, creds).await?,
        Platform::Instagram => instagram_login(session, username, creds).await?,
    }

    // Any surviving modal at this point is the platform pushing back.
    if let Some(text) = session.alert_text().await? {
        return Err(LoginError::Rejected(text));
    }
    Ok(())
}

/// Notification/tracking prompts stack up on first launch; clear them.
async fn dismiss_startup_alerts(session: &AgentSession) -> Result<(), AgentError> {
    for _ in 0..3 {
        match session.alert_text().await? {
            Some(_) => {
                session.dismiss_alert().await?;
                tokio::time::sleep(Duration::from_millis(700)).await;
            }
            None => break,
        }
    }
    Ok(())
}

async fn type_into(
    session: &AgentSession,
    candidates: &[(Strategy, &str)],
    text: &str,
) -> Result<(), LoginError> {
    let field = session.find_first(candidates).await?;
    session.click(&field).await?;
    session.set_value(&field, text).await?;
    Ok(())
}

async fn tiktok_login(session: &AgentSession, creds: &Credentials) -> Result<(), LoginError> {
    let profile = session
        .find_first(&[
            (Strategy::AccessibilityId, "Profile"),
            (Strategy::PredicateString, "label == 'Profile' AND type == 'XCUIElementTypeButton'"),
        ])
        .await?;
    session.click(&profile).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let use_email = session
        .find_first(&[
            (Strategy::PredicateString, "label CONTAINS 'Use phone / email / username'"),
            (Strategy::PredicateString, "label CONTAINS 'email'"),
        ])
        .await?;
    session.click(&use_email).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    if let Ok(tab) = session
        .find_first(&[(Strategy::PredicateString, "label CONTAINS 'Email / Username'")])
        .await
    {
        session.click(&tab).await?;
    }

    type_into(
        session,
        &[
            (Strategy::ClassChain, "**/XCUIElementTypeTextField"),
            (Strategy::PredicateString, "type == 'XCUIElementTypeTextField'"),
        ],
        &creds.email,
    )
    .await?;
    type_into(
        session,
        &[(Strategy::ClassChain, "**/XCUIElementTypeSecureTextField")],
        &creds.password,
    )
    .await?;

    let log_in = session
        .find_first(&[
            (Strategy::AccessibilityId, "Log in"),
            (Strategy::PredicateString, "label == 'Log in' AND type == 'XCUIElementTypeButton'"),
        ])
        .await?;
    session.click(&log_in).await?;
    tokio::time::sleep(Duration::from_secs(4)).await;

    solve_totp_if_prompted(session, creds).await?;

    // Landing on the feed confirms the session.
    session
        .find_first(&[
            (Strategy::AccessibilityId, "Home"),
            (Strategy::PredicateString, "label == 'Home' AND type == 'XCUIElementTypeButton'"),
        ])
        .await
        .map_err(classify_feed_check)?;
    Ok(())
}

async fn instagram_login(
    session: &AgentSession,
    username: &str,
    creds: &Credentials,
) -> Result<(), LoginError> {
    type_into(
        session,
        &[
            (Strategy::PredicateString, "label CONTAINS 'Username, email'"),
            (Strategy::ClassChain, "**/XCUIElementTypeTextField"),
        ],
        username,
    )
    .await?;
    type_into(
        session,
        &[
            (Strategy::PredicateString, "label == 'Password'"),
            (Strategy::ClassChain, "**/XCUIElementTypeSecureTextField"),
        ],
        &creds.password,
    )
    .await?;

    let log_in = session
        .find_first(&[
            (Strategy::AccessibilityId, "Log in"),
            (Strategy::PredicateString, "label == 'Log in'"),
        ])
        .await?;
    session.click(&log_in).await?;
    tokio::time::sleep(Duration::from_secs(4)).await;

    solve_totp_if_prompted(session, creds).await?;

    if let Ok(not_now) = session
        .find_first(&[(Strategy::PredicateString, "label == 'Not Now'")])
        .await
    {
        // Skip the save-login-info interstitial.
        session.click(&not_now).await?;
    }

    session
        .find_first(&[
            (Strategy::AccessibilityId, "mainfeed-tab"),
            (Strategy::PredicateString, "label == 'Home'"),
        ])
        .await
        .map_err(classify_feed_check)?;
    Ok(())
}

/// Answer a TOTP challenge when one is on screen; absent challenge is fine.
async fn solve_totp_if_prompted(
    session: &AgentSession,
    creds: &Credentials,
) -> Result<(), LoginError> {
    let code_field = match session
        .find_first(&[
            (Strategy::PredicateString, "label CONTAINS 'digit code'"),
            (Strategy::PredicateString, "label CONTAINS 'security code'"),
            (Strategy::PredicateString, "value CONTAINS 'code' AND type == 'XCUIElementTypeTextField'"),
        ])
        .await
    {
        Ok(field) => field,
        Err(AgentError::ElementNotFound(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let code = totp::current_code(&creds.totp_seed)
        .map_err(|e| LoginError::TwoFactor(e.to_string()))?;
    session.click(&code_field).await?;
    session.set_value(&code_field, &code).await?;

    if let Ok(submit) = session
        .find_first(&[
            (Strategy::PredicateString, "label == 'Next'"),
            (Strategy::PredicateString, "label == 'Confirm'"),
            (Strategy::PredicateString, "label == 'Submit'"),
        ])
        .await
    {
        session.click(&submit).await?;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    Ok(())
}
