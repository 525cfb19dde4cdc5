//! Typed rows and domain enums for the orchestration store.
//!
//! Every table the core touches has a named value type here; the only
//! untyped payloads are the `context` / `session_data` JSON columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Social platform an account lives on.
///
/// Only TikTok and Instagram are operated by the scheduler; other platforms
/// exist solely as warming targets for future activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Tiktok,
    Instagram,
}

impl Platform {
    /// The platforms the scheduler actively operates, in selection order.
    pub const OPERATED: [Platform; 2] = [Platform::Tiktok, Platform::Instagram];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "tiktok" => Some(Platform::Tiktok),
            "instagram" => Some(Platform::Instagram),
            _ => None,
        }
    }

    /// iOS bundle identifier, used for app lifecycle calls on the agent.
    pub fn bundle_id(&self) -> &'static str {
        match self {
            Platform::Tiktok => "com.zhiliaoapp.musically",
            Platform::Instagram => "com.burbn.instagram",
        }
    }

    /// Display name as it appears on the App Store, used by the reinstall flow.
    pub fn app_store_name(&self) -> &'static str {
        match self {
            Platform::Tiktok => "TikTok",
            Platform::Instagram => "Instagram",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a managed account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Created,
    WarmingP1,
    WarmingP2,
    WarmingP3,
    Active,
    Resting,
    Cooldown,
    Flagged,
    Restricted,
    Shadowbanned,
    Suspended,
    Banned,
}

impl AccountState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountState::Created => "created",
            AccountState::WarmingP1 => "warming_p1",
            AccountState::WarmingP2 => "warming_p2",
            AccountState::WarmingP3 => "warming_p3",
            AccountState::Active => "active",
            AccountState::Resting => "resting",
            AccountState::Cooldown => "cooldown",
            AccountState::Flagged => "flagged",
            AccountState::Restricted => "restricted",
            AccountState::Shadowbanned => "shadowbanned",
            AccountState::Suspended => "suspended",
            AccountState::Banned => "banned",
        }
    }

    pub fn parse(s: &str) -> Option<AccountState> {
        Some(match s {
            "created" => AccountState::Created,
            "warming_p1" => AccountState::WarmingP1,
            "warming_p2" => AccountState::WarmingP2,
            "warming_p3" => AccountState::WarmingP3,
            "active" => AccountState::Active,
            "resting" => AccountState::Resting,
            "cooldown" => AccountState::Cooldown,
            "flagged" => AccountState::Flagged,
            "restricted" => AccountState::Restricted,
            "shadowbanned" => AccountState::Shadowbanned,
            "suspended" => AccountState::Suspended,
            "banned" => AccountState::Banned,
            _ => return None,
        })
    }

    /// Claim priority, lowest first. Only warmable states have a rank.
    pub fn claim_rank(&self) -> Option<u8> {
        match self {
            AccountState::Created => Some(0),
            AccountState::WarmingP1 => Some(1),
            AccountState::WarmingP2 => Some(2),
            AccountState::WarmingP3 => Some(3),
            AccountState::Active => Some(4),
            _ => None,
        }
    }

    /// Whether the daily warming loop should pick this account up at all.
    pub fn is_warmable(&self) -> bool {
        self.claim_rank().is_some()
    }

    /// Degradation states set by the exception classifier.
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            AccountState::Flagged
                | AccountState::Restricted
                | AccountState::Shadowbanned
                | AccountState::Suspended
                | AccountState::Banned
        )
    }

    /// Whether `self -> next` is a legal transition. Same-state writes are
    /// always permitted (idempotent no-op).
    pub fn can_transition_to(&self, next: AccountState) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (AccountState::Created, AccountState::WarmingP1) => true,
            (AccountState::WarmingP1, AccountState::WarmingP2) => true,
            (AccountState::WarmingP2, AccountState::WarmingP3) => true,
            (AccountState::WarmingP3, AccountState::Active) => true,
            (AccountState::Active, AccountState::Resting) => true,
            (AccountState::Active, AccountState::Cooldown) => true,
            (AccountState::Resting, AccountState::Active) => true,
            (AccountState::Cooldown, AccountState::Active) => true,
            (from, to) if to.is_exception() => matches!(
                from,
                AccountState::WarmingP1
                    | AccountState::WarmingP2
                    | AccountState::WarmingP3
                    | AccountState::Active
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warming ramp stage. Phase 1 is pure consumption; later phases add
/// rate-limited engagement with progressively relaxed ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Passive,
    Light,
    Moderate,
    Active,
}

impl Phase {
    pub fn number(&self) -> i64 {
        match self {
            Phase::Passive => 1,
            Phase::Light => 2,
            Phase::Moderate => 3,
            Phase::Active => 4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Passive => "PASSIVE",
            Phase::Light => "LIGHT",
            Phase::Moderate => "MODERATE",
            Phase::Active => "ACTIVE",
        }
    }
}

/// The deterministic day → phase ramp: days 1-3 passive, 4-7 light,
/// 8-14 moderate, 15 and beyond full activity.
pub fn phase_for_day(warming_day: i64) -> Phase {
    match warming_day {
        i64::MIN..=3 => Phase::Passive,
        4..=7 => Phase::Light,
        8..=14 => Phase::Moderate,
        _ => Phase::Active,
    }
}

/// The account state implied by a warming day count.
pub fn state_for_day(warming_day: i64) -> AccountState {
    match phase_for_day(warming_day) {
        Phase::Passive => AccountState::WarmingP1,
        Phase::Light => AccountState::WarmingP2,
        Phase::Moderate => AccountState::WarmingP3,
        Phase::Active => AccountState::Active,
    }
}

/// Event log category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Scheduler,
    Device,
    Account,
    Auth,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Scheduler => "scheduler",
            EventCategory::Device => "device",
            EventCategory::Account => "account",
            EventCategory::Auth => "auth",
        }
    }

    pub fn parse(s: &str) -> Option<EventCategory> {
        Some(match s {
            "scheduler" => EventCategory::Scheduler,
            "device" => EventCategory::Device,
            "account" => EventCategory::Account,
            "auth" => EventCategory::Auth,
            _ => return None,
        })
    }
}

/// Event log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Info => "info",
            EventSeverity::Warning => "warning",
            EventSeverity::Error => "error",
            EventSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<EventSeverity> {
        Some(match s {
            "info" => EventSeverity::Info,
            "warning" => EventSeverity::Warning,
            "error" => EventSeverity::Error,
            "critical" => EventSeverity::Critical,
            _ => return None,
        })
    }
}

/// A content vertical. Mutated by the external CLI only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Niche {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub tier: i64,
    pub status: String,
}

/// Device fleet status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Maintenance,
    Failed,
    Disconnected,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Maintenance => "maintenance",
            DeviceStatus::Failed => "failed",
            DeviceStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<DeviceStatus> {
        Some(match s {
            "active" => DeviceStatus::Active,
            "maintenance" => DeviceStatus::Maintenance,
            "failed" => DeviceStatus::Failed,
            "disconnected" => DeviceStatus::Disconnected,
            _ => return None,
        })
    }
}

/// A physical device with its local automation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub udid: String,
    pub automation_port: u16,
    pub status: DeviceStatus,
    pub connected_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One managed identity on one platform. Credential fields hold codec
/// tokens, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub platform: Platform,
    pub username: String,
    #[serde(skip_serializing)]
    pub email_enc: Option<String>,
    #[serde(skip_serializing)]
    pub password_enc: Option<String>,
    #[serde(skip_serializing)]
    pub totp_secret_enc: Option<String>,
    #[serde(skip_serializing)]
    pub proxy_credentials: Option<String>,
    pub niche_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub current_state: AccountState,
    pub warming_day_count: i64,
    pub followers: i64,
    pub following: i64,
    pub bio: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_warmed_at: Option<DateTime<Utc>>,
    pub last_post_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// An account is alive until soft-deleted.
    pub fn is_alive(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Append-only record of one completed (or partially completed) warming
/// cycle. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmingSession {
    pub id: Uuid,
    pub account_id: Uuid,
    pub device_id: Uuid,
    pub platform: Platform,
    pub warming_phase: i64,
    pub warming_day: i64,
    pub session_data: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A structured event row. Ids are monotonic and globally ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub severity: EventSeverity,
    pub event_type: String,
    pub device_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub message: String,
    pub context: serde_json::Value,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_ramp_table() {
        assert_eq!(phase_for_day(0), Phase::Passive);
        assert_eq!(phase_for_day(1), Phase::Passive);
        assert_eq!(phase_for_day(3), Phase::Passive);
        assert_eq!(phase_for_day(4), Phase::Light);
        assert_eq!(phase_for_day(7), Phase::Light);
        assert_eq!(phase_for_day(8), Phase::Moderate);
        assert_eq!(phase_for_day(14), Phase::Moderate);
        assert_eq!(phase_for_day(15), Phase::Active);
        assert_eq!(phase_for_day(90), Phase::Active);
    }

    #[test]
    fn state_follows_phase() {
        assert_eq!(state_for_day(1), AccountState::WarmingP1);
        assert_eq!(state_for_day(4), AccountState::WarmingP2);
        assert_eq!(state_for_day(8), AccountState::WarmingP3);
        assert_eq!(state_for_day(15), AccountState::Active);
    }

    #[test]
    fn warm_up_transitions_are_legal() {
        assert!(AccountState::Created.can_transition_to(AccountState::WarmingP1));
        assert!(AccountState::WarmingP1.can_transition_to(AccountState::WarmingP2));
        assert!(AccountState::WarmingP2.can_transition_to(AccountState::WarmingP3));
        assert!(AccountState::WarmingP3.can_transition_to(AccountState::Active));
    }

    #[test]
    fn operator_transitions() {
        assert!(AccountState::Active.can_transition_to(AccountState::Resting));
        assert!(AccountState::Active.can_transition_to(AccountState::Cooldown));
        assert!(AccountState::Resting.can_transition_to(AccountState::Active));
        assert!(AccountState::Cooldown.can_transition_to(AccountState::Active));
    }

    #[test]
    fn exception_transitions_from_warming_and_active() {
        for from in [
            AccountState::WarmingP1,
            AccountState::WarmingP2,
            AccountState::WarmingP3,
            AccountState::Active,
        ] {
            assert!(from.can_transition_to(AccountState::Flagged));
            assert!(from.can_transition_to(AccountState::Shadowbanned));
            assert!(from.can_transition_to(AccountState::Banned));
        }
        assert!(!AccountState::Created.can_transition_to(AccountState::Banned));
    }

    #[test]
    fn illegal_transitions_rejected() {
        assert!(!AccountState::Created.can_transition_to(AccountState::Active));
        assert!(!AccountState::WarmingP1.can_transition_to(AccountState::WarmingP3));
        assert!(!AccountState::Banned.can_transition_to(AccountState::Active));
        assert!(!AccountState::Active.can_transition_to(AccountState::Created));
        assert!(!AccountState::WarmingP2.can_transition_to(AccountState::WarmingP1));
    }

    #[test]
    fn same_state_is_noop() {
        assert!(AccountState::Active.can_transition_to(AccountState::Active));
        assert!(AccountState::Banned.can_transition_to(AccountState::Banned));
    }

    #[test]
    fn claim_rank_order() {
        let ranked = [
            AccountState::Created,
            AccountState::WarmingP1,
            AccountState::WarmingP2,
            AccountState::WarmingP3,
            AccountState::Active,
        ];
        for pair in ranked.windows(2) {
            assert!(pair[0].claim_rank().unwrap() < pair[1].claim_rank().unwrap());
        }
        assert_eq!(AccountState::Resting.claim_rank(), None);
        assert_eq!(AccountState::Banned.claim_rank(), None);
    }

    #[test]
    fn state_round_trip() {
        for s in [
            "created",
            "warming_p1",
            "warming_p2",
            "warming_p3",
            "active",
            "resting",
            "cooldown",
            "flagged",
            "restricted",
            "shadowbanned",
            "suspended",
            "banned",
        ] {
            assert_eq!(AccountState::parse(s).unwrap().as_str(), s);
        }
        assert!(AccountState::parse("warming_p4").is_none());
    }
}
