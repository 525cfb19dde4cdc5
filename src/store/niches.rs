//! Niche rows and creation-target selection.

use rusqlite::params;
use std::collections::HashMap;
use uuid::Uuid;

use super::{parse_uuid_or_nil, Store, StoreError};
use crate::model::{Niche, Platform};

fn niche_from_row(row: &rusqlite::Row<'_>) -> Result<Niche, StoreError> {
    let id: String = row.get(0)?;
    Ok(Niche {
        id: parse_uuid_or_nil(&id),
        slug: row.get(1)?,
        name: row.get(2)?,
        tier: row.get(3)?,
        status: row.get(4)?,
    })
}

impl Store {
    /// Register a niche. Managed by the external CLI; kept for bootstrapping
    /// and tests.
    pub async fn insert_niche(
        &self,
        slug: &str,
        name: &str,
        tier: i64,
    ) -> Result<Niche, StoreError> {
        let id = Uuid::new_v4();
        let slug = slug.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO niches (id, slug, name, tier, status) VALUES (?1, ?2, ?3, ?4, 'active')",
                params![id.to_string(), slug, name, tier],
            )?;
            conn.query_row(
                "SELECT id, slug, name, tier, status FROM niches WHERE id = ?1",
                params![id.to_string()],
                |row| Ok(niche_from_row(row)),
            )?
        })
        .await
    }

    pub async fn get_niche(&self, id: Uuid) -> Result<Niche, StoreError> {
        self.with_conn(move |conn| {
            use rusqlite::OptionalExtension;
            conn.query_row(
                "SELECT id, slug, name, tier, status FROM niches WHERE id = ?1",
                params![id.to_string()],
                |row| Ok(niche_from_row(row)),
            )
            .optional()?
            .ok_or(StoreError::NotFound("niche"))?
        })
        .await
    }

    pub async fn list_active_niches(&self) -> Result<Vec<Niche>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, slug, name, tier, status FROM niches \
                 WHERE status = 'active' ORDER BY slug ASC",
            )?;
            let rows = stmt.query_map([], |row| Ok(niche_from_row(row)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
        .await
    }

    /// Pick the (platform, niche) pair with the fewest live accounts among
    /// active niches; ties broken by niche slug, then platform (the
    /// creation fallback task). None when no niche is active.
    pub async fn creation_target(&self) -> Result<Option<(Platform, Niche)>, StoreError> {
        let niches = self.list_active_niches().await?;
        if niches.is_empty() {
            return Ok(None);
        }

        let counts: HashMap<(String, String), i64> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT platform, niche_id, COUNT(*) FROM accounts \
                     WHERE deleted_at IS NULL AND niche_id IS NOT NULL \
                     GROUP BY platform, niche_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    let platform: String = row.get(0)?;
                    let niche_id: String = row.get(1)?;
                    let count: i64 = row.get(2)?;
                    Ok(((platform, niche_id), count))
                })?;
                let mut out = HashMap::new();
                for row in rows {
                    let (key, count) = row?;
                    out.insert(key, count);
                }
                Ok(out)
            })
            .await?;

        // Lowest live count wins; ties break alphabetically by slug, then
        // by platform name.
        let counts = &counts;
        let best = niches
            .into_iter()
            .flat_map(|niche| {
                Platform::OPERATED.into_iter().map(move |platform| {
                    let count = counts
                        .get(&(platform.as_str().to_string(), niche.id.to_string()))
                        .copied()
                        .unwrap_or(0);
                    (count, niche.clone(), platform)
                })
            })
            .min_by(|a, b| {
                (a.0, &a.1.slug, a.2.as_str()).cmp(&(b.0, &b.1.slug, b.2.as_str()))
            });

        Ok(best.map(|(_, niche, platform)| (platform, niche)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewAccount, Store};

    #[tokio::test]
    async fn creation_target_picks_least_populated() {
        let store = Store::open_in_memory().unwrap();
        let finance = store
            .insert_niche("personal_finance", "Personal Finance", 1)
            .await
            .unwrap();
        let fitness = store.insert_niche("fitness", "Fitness", 2).await.unwrap();

        // fitness/tiktok gets one account; every other pair has zero.
        store
            .insert_account(NewAccount {
                platform: Platform::Tiktok,
                username: "fit001".into(),
                email_enc: "e".into(),
                password_enc: "p".into(),
                totp_secret_enc: "t".into(),
                proxy_credentials: None,
                niche_id: fitness.id,
                device_id: None,
            })
            .await
            .unwrap();

        let (platform, niche) = store.creation_target().await.unwrap().unwrap();
        // Zero-count pairs tie; "fitness" beats "personal_finance" on slug
        // and instagram is its zero-count slot.
        assert_eq!(niche.id, fitness.id);
        assert_eq!(platform, Platform::Instagram);
        let _ = finance;
    }

    #[tokio::test]
    async fn creation_target_none_without_niches() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.creation_target().await.unwrap().is_none());
    }
}
