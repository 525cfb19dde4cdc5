//! Account rows, the task-claim protocol, and state transitions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{
    parse_opt_ts, parse_platform, parse_state, parse_ts, parse_uuid_or_nil, ts, Store, StoreError,
};
use crate::model::{state_for_day, Account, AccountState, Platform};

/// How long a claim stamp blocks re-claiming before it is considered stale.
/// Matches the hard session budget with margin; a crashed worker's claim
/// expires instead of parking the account forever.
const CLAIM_TTL_SECS: i64 = 3600;

const ACCOUNT_COLUMNS: &str = "id, platform, username, email_enc, password_enc, totp_secret_enc, \
     proxy_credentials, niche_id, device_id, current_state, warming_day_count, followers, \
     following, bio, last_activity_at, last_warmed_at, last_post_at, claimed_at, deleted_at, \
     created_at, updated_at";

/// Insert payload for a freshly created account. Credential fields are codec
/// tokens produced by the creation runner.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub platform: Platform,
    pub username: String,
    pub email_enc: String,
    pub password_enc: String,
    pub totp_secret_enc: String,
    pub proxy_credentials: Option<String>,
    pub niche_id: Uuid,
    pub device_id: Option<Uuid>,
}

fn account_from_row(row: &rusqlite::Row<'_>) -> Result<Account, StoreError> {
    let id: String = row.get(0)?;
    let platform: String = row.get(1)?;
    let niche_id: Option<String> = row.get(7)?;
    let device_id: Option<String> = row.get(8)?;
    let state: String = row.get(9)?;
    let last_activity_at: Option<String> = row.get(14)?;
    let last_warmed_at: Option<String> = row.get(15)?;
    let last_post_at: Option<String> = row.get(16)?;
    let claimed_at: Option<String> = row.get(17)?;
    let deleted_at: Option<String> = row.get(18)?;
    let created_at: String = row.get(19)?;
    let updated_at: String = row.get(20)?;

    Ok(Account {
        id: parse_uuid_or_nil(&id),
        platform: parse_platform(&platform)?,
        username: row.get(2)?,
        email_enc: row.get(3)?,
        password_enc: row.get(4)?,
        totp_secret_enc: row.get(5)?,
        proxy_credentials: row.get(6)?,
        niche_id: niche_id.as_deref().map(parse_uuid_or_nil),
        device_id: device_id.as_deref().map(parse_uuid_or_nil),
        current_state: parse_state(&state)?,
        warming_day_count: row.get(10)?,
        followers: row.get(11)?,
        following: row.get(12)?,
        bio: row.get(13)?,
        last_activity_at: parse_opt_ts(last_activity_at)?,
        last_warmed_at: parse_opt_ts(last_warmed_at)?,
        last_post_at: parse_opt_ts(last_post_at)?,
        claimed_at: parse_opt_ts(claimed_at)?,
        deleted_at: parse_opt_ts(deleted_at)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn get_account_tx(conn: &Connection, id: Uuid) -> Result<Account, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
        params![id.to_string()],
        |row| Ok(account_from_row(row)),
    )
    .optional()?
    .ok_or(StoreError::NotFound("account"))?
}

impl Store {
    pub async fn insert_account(&self, new: NewAccount) -> Result<Account, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO accounts (id, platform, username, email_enc, password_enc, \
                 totp_secret_enc, proxy_credentials, niche_id, device_id, current_state, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'created', ?10, ?10)",
                params![
                    id.to_string(),
                    new.platform.as_str(),
                    new.username,
                    new.email_enc,
                    new.password_enc,
                    new.totp_secret_enc,
                    new.proxy_credentials,
                    new.niche_id.to_string(),
                    new.device_id.map(|d| d.to_string()),
                    ts(now),
                ],
            )?;
            get_account_tx(conn, id)
        })
        .await
    }

    pub async fn get_account(&self, id: Uuid) -> Result<Account, StoreError> {
        self.with_conn(move |conn| get_account_tx(conn, id)).await
    }

    /// Whether a (platform, username) pair already exists, alive or not.
    /// Used by the creation runner to re-roll synthesized usernames.
    pub async fn username_taken(
        &self,
        platform: Platform,
        username: &str,
    ) -> Result<bool, StoreError> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM accounts WHERE platform = ?1 AND username = ?2",
                params![platform.as_str(), username],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// List accounts for the dashboard, newest first, optionally filtered.
    pub async fn list_accounts(
        &self,
        platform: Option<Platform>,
        state: Option<AccountState>,
        niche_id: Option<Uuid>,
    ) -> Result<Vec<Account>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT {} FROM accounts WHERE deleted_at IS NULL",
                ACCOUNT_COLUMNS
            );
            let mut args: Vec<String> = Vec::new();
            if let Some(p) = platform {
                args.push(p.as_str().to_string());
                sql.push_str(&format!(" AND platform = ?{}", args.len()));
            }
            if let Some(s) = state {
                args.push(s.as_str().to_string());
                sql.push_str(&format!(" AND current_state = ?{}", args.len()));
            }
            if let Some(n) = niche_id {
                args.push(n.to_string());
                sql.push_str(&format!(" AND niche_id = ?{}", args.len()));
            }
            sql.push_str(" ORDER BY created_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok(account_from_row(row))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
        .await
    }

    /// Account counts per state, for the fleet overview.
    pub async fn account_state_counts(&self) -> Result<Vec<(AccountState, i64)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT current_state, COUNT(*) FROM accounts \
                 WHERE deleted_at IS NULL GROUP BY current_state",
            )?;
            let rows = stmt.query_map([], |row| {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((state, count))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (state, count) = row?;
                out.push((parse_state(&state)?, count));
            }
            Ok(out)
        })
        .await
    }

    /// Claim the next warming task for a device.
    ///
    /// Runs as one IMMEDIATE transaction: select the highest-priority
    /// eligible account (state rank, then last_warmed_at with nulls first,
    /// then id) and stamp the claim before returning. The select and the
    /// stamp commit atomically, so no two workers can be handed the same
    /// account.
    pub async fn claim_next_account(
        &self,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Account>, StoreError> {
        let start_of_day = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();
        let stale_cutoff = now - chrono::Duration::seconds(CLAIM_TTL_SECS);

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let candidate = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM accounts \
                         WHERE deleted_at IS NULL \
                           AND platform IN ('tiktok', 'instagram') \
                           AND current_state IN ('created', 'warming_p1', 'warming_p2', 'warming_p3', 'active') \
                           AND (last_warmed_at IS NULL OR last_warmed_at < ?1) \
                           AND (claimed_at IS NULL OR claimed_at < ?2) \
                         ORDER BY CASE current_state \
                                    WHEN 'created' THEN 0 \
                                    WHEN 'warming_p1' THEN 1 \
                                    WHEN 'warming_p2' THEN 2 \
                                    WHEN 'warming_p3' THEN 3 \
                                    ELSE 4 \
                                  END, \
                                  last_warmed_at ASC NULLS FIRST, \
                                  id ASC \
                         LIMIT 1",
                        ACCOUNT_COLUMNS
                    ),
                    params![ts(start_of_day), ts(stale_cutoff)],
                    |row| Ok(account_from_row(row)),
                )
                .optional()?
                .transpose()?;

            let account = match candidate {
                Some(account) => account,
                None => {
                    tx.commit()?;
                    return Ok(None);
                }
            };

            tx.execute(
                "UPDATE accounts SET claimed_at = ?1, device_id = ?2, updated_at = ?1 \
                 WHERE id = ?3",
                params![ts(now), device_id.to_string(), account.id.to_string()],
            )?;
            let claimed = get_account_tx(&tx, account.id)?;
            tx.commit()?;
            Ok(Some(claimed))
        })
        .await
    }

    /// Atomic post-session account update.
    ///
    /// Increments the day count, stamps `last_warmed_at`, clears the claim,
    /// and moves the state to `phase_for_day(new_count)`, or to the
    /// classified exception state when one fired during the session.
    pub async fn complete_warming_session(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
        exception: Option<AccountState>,
    ) -> Result<Account, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let account = get_account_tx(&tx, account_id)?;
            let new_day = account.warming_day_count + 1;
            let target = exception.unwrap_or_else(|| state_for_day(new_day));

            if !account.current_state.can_transition_to(target) {
                return Err(StoreError::IllegalTransition {
                    from: account.current_state,
                    to: target,
                });
            }

            tx.execute(
                "UPDATE accounts SET warming_day_count = ?1, current_state = ?2, \
                 last_warmed_at = ?3, last_activity_at = ?3, claimed_at = NULL, updated_at = ?3 \
                 WHERE id = ?4",
                params![
                    new_day,
                    target.as_str(),
                    ts(now),
                    account_id.to_string()
                ],
            )?;
            let updated = get_account_tx(&tx, account_id)?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Drop a claim without touching anything else. Used when a session
    /// aborts before warming so the account stays eligible; a failed step
    /// leaves the account untouched.
    pub async fn release_claim(&self, account_id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE accounts SET claimed_at = NULL, updated_at = ?1 WHERE id = ?2",
                params![ts(now), account_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Validated state transition; the single code path for operator moves
    /// and exception classifications outside a warming session.
    pub async fn transition_account(
        &self,
        account_id: Uuid,
        to: AccountState,
    ) -> Result<Account, StoreError> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let account = get_account_tx(&tx, account_id)?;

            if !account.current_state.can_transition_to(to) {
                return Err(StoreError::IllegalTransition {
                    from: account.current_state,
                    to,
                });
            }

            tx.execute(
                "UPDATE accounts SET current_state = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), ts(now), account_id.to_string()],
            )?;
            let updated = get_account_tx(&tx, account_id)?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Phase;
    use crate::store::NewEvent;
    use crate::store::Store;

    async fn seeded_store() -> (Store, Uuid, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let niche = store.insert_niche("personal_finance", "Personal Finance", 1).await.unwrap();
        let device = store
            .insert_device("iphone-01", "00008030-000111222333", 8101)
            .await
            .unwrap();
        (store, niche.id, device.id)
    }

    fn new_account(platform: Platform, username: &str, niche_id: Uuid) -> NewAccount {
        NewAccount {
            platform,
            username: username.to_string(),
            email_enc: "enc-email".into(),
            password_enc: "enc-pass".into(),
            totp_secret_enc: "enc-totp".into(),
            proxy_credentials: None,
            niche_id,
            device_id: None,
        }
    }

    #[tokio::test]
    async fn fresh_account_is_claimed_first() {
        let (store, niche, device) = seeded_store().await;
        let fresh = store
            .insert_account(new_account(Platform::Tiktok, "money12345", niche))
            .await
            .unwrap();
        // An active account warmed long ago ranks behind a created one.
        let veteran = store
            .insert_account(new_account(Platform::Tiktok, "wealth9999", niche))
            .await
            .unwrap();
        for day in 0..15 {
            let when = Utc::now() - chrono::Duration::days(30 - day);
            store
                .complete_warming_session(veteran.id, when, None)
                .await
                .unwrap();
        }

        let claimed = store
            .claim_next_account(device, Utc::now())
            .await
            .unwrap()
            .expect("an account is eligible");
        assert_eq!(claimed.id, fresh.id);
        assert!(claimed.claimed_at.is_some());
        assert_eq!(claimed.device_id, Some(device));
    }

    #[tokio::test]
    async fn claimed_account_is_not_claimed_twice() {
        let (store, niche, device) = seeded_store().await;
        store
            .insert_account(new_account(Platform::Instagram, "cash4411", niche))
            .await
            .unwrap();

        let first = store.claim_next_account(device, Utc::now()).await.unwrap();
        assert!(first.is_some());
        // Second worker arrives: the claim stamp blocks re-assignment.
        let second = store.claim_next_account(device, Utc::now()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn warmed_today_is_ineligible_until_tomorrow() {
        let (store, niche, device) = seeded_store().await;
        let account = store
            .insert_account(new_account(Platform::Tiktok, "invest777", niche))
            .await
            .unwrap();

        let now = Utc::now();
        store
            .complete_warming_session(account.id, now, None)
            .await
            .unwrap();
        assert!(store.claim_next_account(device, now).await.unwrap().is_none());

        // Next day it becomes eligible again.
        let tomorrow = now + chrono::Duration::days(1);
        let reclaimed = store.claim_next_account(device, tomorrow).await.unwrap();
        assert!(reclaimed.is_some());
    }

    #[tokio::test]
    async fn stale_claim_is_recovered() {
        let (store, niche, device) = seeded_store().await;
        store
            .insert_account(new_account(Platform::Tiktok, "money0001", niche))
            .await
            .unwrap();

        let crash_time = Utc::now() - chrono::Duration::hours(2);
        assert!(store
            .claim_next_account(device, crash_time)
            .await
            .unwrap()
            .is_some());
        // Worker crashed; two hours later the claim has expired.
        assert!(store
            .claim_next_account(device, Utc::now())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn successful_session_advances_day_and_phase() {
        let (store, niche, _) = seeded_store().await;
        let account = store
            .insert_account(new_account(Platform::Tiktok, "fin_day3", niche))
            .await
            .unwrap();
        assert_eq!(account.current_state, AccountState::Created);

        // Day 1: created -> warming_p1.
        let after = store
            .complete_warming_session(account.id, Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(after.warming_day_count, 1);
        assert_eq!(after.current_state, AccountState::WarmingP1);
        assert_eq!(crate::model::phase_for_day(1), Phase::Passive);

        // Days 2-3 stay in p1; day 4 rolls to p2.
        for expected_day in 2..=4 {
            let after = store
                .complete_warming_session(account.id, Utc::now(), None)
                .await
                .unwrap();
            assert_eq!(after.warming_day_count, expected_day);
        }
        let account = store.get_account(account.id).await.unwrap();
        assert_eq!(account.current_state, AccountState::WarmingP2);
    }

    #[tokio::test]
    async fn day_15_reaches_active() {
        let (store, niche, _) = seeded_store().await;
        let account = store
            .insert_account(new_account(Platform::Instagram, "wealth_d15", niche))
            .await
            .unwrap();
        for _ in 0..15 {
            store
                .complete_warming_session(account.id, Utc::now(), None)
                .await
                .unwrap();
        }
        let account = store.get_account(account.id).await.unwrap();
        assert_eq!(account.warming_day_count, 15);
        assert_eq!(account.current_state, AccountState::Active);
    }

    #[tokio::test]
    async fn exception_overrides_phase_transition() {
        let (store, niche, _) = seeded_store().await;
        let account = store
            .insert_account(new_account(Platform::Tiktok, "flagged01", niche))
            .await
            .unwrap();
        store
            .complete_warming_session(account.id, Utc::now(), None)
            .await
            .unwrap();

        let after = store
            .complete_warming_session(account.id, Utc::now(), Some(AccountState::Shadowbanned))
            .await
            .unwrap();
        assert_eq!(after.current_state, AccountState::Shadowbanned);
        assert_eq!(after.warming_day_count, 2);
    }

    #[tokio::test]
    async fn release_claim_leaves_account_untouched() {
        let (store, niche, device) = seeded_store().await;
        let account = store
            .insert_account(new_account(Platform::Tiktok, "untouched1", niche))
            .await
            .unwrap();

        let claimed = store
            .claim_next_account(device, Utc::now())
            .await
            .unwrap()
            .unwrap();
        store.release_claim(claimed.id).await.unwrap();

        let after = store.get_account(account.id).await.unwrap();
        // No day increment, no state change, claim dropped.
        assert_eq!(after.warming_day_count, 0);
        assert_eq!(after.current_state, AccountState::Created);
        assert!(after.claimed_at.is_none());
        assert!(after.last_warmed_at.is_none());
    }

    #[tokio::test]
    async fn illegal_operator_transition_rejected() {
        let (store, niche, _) = seeded_store().await;
        let account = store
            .insert_account(new_account(Platform::Tiktok, "illegal01", niche))
            .await
            .unwrap();

        let err = store
            .transition_account(account.id, AccountState::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn soft_deleted_accounts_are_invisible() {
        let (store, niche, device) = seeded_store().await;
        let account = store
            .insert_account(new_account(Platform::Tiktok, "deleted01", niche))
            .await
            .unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE accounts SET deleted_at = ?1 WHERE id = ?2",
                    params![ts(Utc::now()), account.id.to_string()],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(store
            .claim_next_account(device, Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .list_accounts(None, None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn event_log_sees_claims() {
        // Sanity: claim + event append in the same store handle.
        let (store, niche, device) = seeded_store().await;
        store
            .insert_account(new_account(Platform::Tiktok, "evt0001", niche))
            .await
            .unwrap();
        store.claim_next_account(device, Utc::now()).await.unwrap();
        store
            .insert_event(NewEvent::scheduler_info("warming_started", "claimed"))
            .await
            .unwrap();
    }
}
