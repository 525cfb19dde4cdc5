//! App reset: uninstall from the home screen, reinstall from the App Store.
//!
//! Every session gets a fresh install so the per-vendor installation
//! identity rotates; reusing one identity across accounts links them. This
//! runs before every login, slow or not.

use std::time::Duration;
use thiserror::Error;

use crate::agent::{AgentError, AgentSession, HardwareButton, Strategy};
use crate::model::Platform;

const APP_STORE_BUNDLE: &str = "com.apple.AppStore";

/// How long to hold an icon before the removal menu appears.
const ICON_HOLD: Duration = Duration::from_millis(1600);

/// Poll cadence and ceiling while the store downloads the app.
const INSTALL_POLL: Duration = Duration::from_secs(10);
const INSTALL_DEADLINE: Duration = Duration::from_secs(8 * 60);

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("app removal failed: {0}")]
    Delete(AgentError),

    #[error("app install failed: {0}")]
    Install(AgentError),

    #[error("{0} did not finish downloading within {1:?}")]
    DownloadTimeout(&'static str, Duration),
}

impl InstallError {
    /// Device-side transient trouble, fed back into the worker's per-device
    /// backoff rather than blamed on the account.
    pub fn is_transient(&self) -> bool {
        match self {
            InstallError::Delete(e) | InstallError::Install(e) => e.is_transient(),
            InstallError::DownloadTimeout(..) => true,
        }
    }
}

/// Remove the app from the home screen. Already-absent apps count as
/// removed.
pub async fn uninstall_app(
    session: &AgentSession,
    platform: Platform,
) -> Result<(), InstallError> {
    session
        .press_button(HardwareButton::Home)
        .await
        .map_err(InstallError::Delete)?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let icon = match session
        .find_element(Strategy::AccessibilityId, platform.app_store_name())
        .await
    {
        Ok(icon) => icon,
        Err(AgentError::ElementNotFound(_)) => return Ok(()),
        Err(e) => return Err(InstallError::Delete(e)),
    };

    let (x, y, w, h) = session
        .element_rect(&icon)
        .await
        .map_err(InstallError::Delete)?;
    session
        .long_press(x + w / 2.0, y + h / 2.0, ICON_HOLD)
        .await
        .map_err(InstallError::Delete)?;
    tokio::time::sleep(Duration::from_millis(800)).await;

    for label in ["Remove App", "Delete App"] {
        let button = session
            .find_first(&[
                (Strategy::AccessibilityId, label),
                (Strategy::PredicateString, &format!("label == '{}'", label)),
            ])
            .await
            .map_err(InstallError::Delete)?;
        session
            .click(&button)
            .await
            .map_err(InstallError::Delete)?;
        tokio::time::sleep(Duration::from_millis(600)).await;
    }

    // Final confirmation arrives as a system alert.
    match session.alert_text().await {
        Ok(Some(_)) => session
            .accept_alert()
            .await
            .map_err(InstallError::Delete)?,
        Ok(None) => {
            // Some iOS versions confirm with an in-app "Delete" button.
            if let Ok(confirm) = session
                .find_element(Strategy::AccessibilityId, "Delete")
                .await
            {
                session
                    .click(&confirm)
                    .await
                    .map_err(InstallError::Delete)?;
            }
        }
        Err(e) => return Err(InstallError::Delete(e)),
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}

/// Reinstall from the App Store and wait for the download to finish.
pub async fn install_app(session: &AgentSession, platform: Platform) -> Result<(), InstallError> {
    session
        .activate_app(APP_STORE_BUNDLE)
        .await
        .map_err(InstallError::Install)?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let search_tab = session
        .find_first(&[
            (Strategy::AccessibilityId, "Search"),
            (Strategy::PredicateString, "label == 'Search' AND type == 'XCUIElementTypeButton'"),
        ])
        .await
        .map_err(InstallError::Install)?;
    session
        .click(&search_tab)
        .await
        .map_err(InstallError::Install)?;

    let field = session
        .find_first(&[
            (Strategy::ClassChain, "**/XCUIElementTypeSearchField"),
            (Strategy::AccessibilityId, "App Store"),
        ])
        .await
        .map_err(InstallError::Install)?;
    session.click(&field).await.map_err(InstallError::Install)?;
    session
        .set_value(&field, platform.app_store_name())
        .await
        .map_err(InstallError::Install)?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Previously-purchased apps show the re-download cloud; fresh listings
    // show GET.
    let get = session
        .find_first(&[
            (Strategy::PredicateString, "label == 're-download' AND visible == 1"),
            (Strategy::PredicateString, "label == 'GET' AND visible == 1"),
            (Strategy::AccessibilityId, "re-download"),
        ])
        .await
        .map_err(InstallError::Install)?;
    session.click(&get).await.map_err(InstallError::Install)?;

    // The install is done once the listing flips to OPEN.
    let started = std::time::Instant::now();
    loop {
        tokio::time::sleep(INSTALL_POLL).await;
        match session
            .find_element(Strategy::PredicateString, "label == 'OPEN' AND visible == 1")
            .await
        {
            Ok(_) => break,
            Err(AgentError::ElementNotFound(_)) => {
                if started.elapsed() > INSTALL_DEADLINE {
                    return Err(InstallError::DownloadTimeout(
                        platform.app_store_name(),
                        INSTALL_DEADLINE,
                    ));
                }
            }
            Err(e) => return Err(InstallError::Install(e)),
        }
    }

    session
        .press_button(HardwareButton::Home)
        .await
        .map_err(InstallError::Install)?;
    Ok(())
}
