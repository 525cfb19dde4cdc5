//! HTTP client for the per-device automation agent.
//!
//! The agent exposes a W3C-WebDriver-compatible surface on a localhost port
//! tunneled to the device. One worker owns one device's endpoint at a time,
//! so no cross-worker locking is needed here.

mod client;

pub use client::{AgentClient, AgentSession, ElementRef, ScreenSize};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("agent returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected agent payload: {0}")]
    Protocol(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),
}

impl AgentError {
    /// Whether the failure is worth a backoff-and-retry rather than an abort.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Transport(e) => e.is_timeout() || e.is_connect(),
            AgentError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Element lookup strategies in preferred order: accessibility id first,
/// xpath as the last resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    AccessibilityId,
    PredicateString,
    ClassChain,
    XPath,
}

impl Strategy {
    /// Wire name on the WebDriver surface.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Strategy::AccessibilityId => "accessibility id",
            Strategy::PredicateString => "-ios predicate string",
            Strategy::ClassChain => "-ios class chain",
            Strategy::XPath => "xpath",
        }
    }
}

/// Application run state as reported by the agent:
/// 1 = not running, 2 = background, 3 = suspended, 4 = foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppRunState {
    NotRunning,
    Background,
    Suspended,
    Foreground,
}

impl AppRunState {
    pub fn from_code(code: i64) -> Option<AppRunState> {
        Some(match code {
            1 => AppRunState::NotRunning,
            2 => AppRunState::Background,
            3 => AppRunState::Suspended,
            4 => AppRunState::Foreground,
            _ => return None,
        })
    }
}

/// Hardware buttons the agent can press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareButton {
    Home,
    VolumeUp,
    VolumeDown,
}

impl HardwareButton {
    pub fn wire_name(&self) -> &'static str {
        match self {
            HardwareButton::Home => "home",
            HardwareButton::VolumeUp => "volumeUp",
            HardwareButton::VolumeDown => "volumeDown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_codes() {
        assert_eq!(AppRunState::from_code(1), Some(AppRunState::NotRunning));
        assert_eq!(AppRunState::from_code(4), Some(AppRunState::Foreground));
        assert_eq!(AppRunState::from_code(0), None);
        assert_eq!(AppRunState::from_code(9), None);
    }

    #[test]
    fn strategy_wire_names() {
        assert_eq!(Strategy::AccessibilityId.wire_name(), "accessibility id");
        assert_eq!(Strategy::ClassChain.wire_name(), "-ios class chain");
    }

    #[test]
    fn transient_classification() {
        assert!(AgentError::Status {
            status: 500,
            message: "internal".into()
        }
        .is_transient());
        assert!(!AgentError::Status {
            status: 404,
            message: "not found".into()
        }
        .is_transient());
        assert!(!AgentError::ElementNotFound("Follow".into()).is_transient());
        assert!(!AgentError::Protocol("bad payload".into()).is_transient());
    }
}
