//! Device fleet rows and heartbeats.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_opt_ts, parse_ts, parse_uuid_or_nil, ts, Store, StoreError};
use crate::model::{Device, DeviceStatus};

const DEVICE_COLUMNS: &str =
    "id, name, udid, automation_port, status, connected_since, updated_at";

fn device_from_row(row: &rusqlite::Row<'_>) -> Result<Device, StoreError> {
    let id: String = row.get(0)?;
    let port: i64 = row.get(3)?;
    let status: String = row.get(4)?;
    let connected_since: Option<String> = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(Device {
        id: parse_uuid_or_nil(&id),
        name: row.get(1)?,
        udid: row.get(2)?,
        automation_port: port as u16,
        status: DeviceStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("device status {:?}", status)))?,
        connected_since: parse_opt_ts(connected_since)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn get_device_tx(conn: &Connection, id: Uuid) -> Result<Device, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
        params![id.to_string()],
        |row| Ok(device_from_row(row)),
    )
    .optional()?
    .ok_or(StoreError::NotFound("device"))?
}

impl Store {
    /// Register a device. Normally done by the host setup tooling; kept here
    /// for bootstrapping and tests.
    pub async fn insert_device(
        &self,
        name: &str,
        udid: &str,
        automation_port: u16,
    ) -> Result<Device, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let name = name.to_string();
        let udid = udid.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO devices (id, name, udid, automation_port, status, connected_since, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
                params![id.to_string(), name, udid, automation_port, ts(now)],
            )?;
            get_device_tx(conn, id)
        })
        .await
    }

    pub async fn get_device(&self, id: Uuid) -> Result<Device, StoreError> {
        self.with_conn(move |conn| get_device_tx(conn, id)).await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM devices ORDER BY name ASC",
                DEVICE_COLUMNS
            ))?;
            let rows = stmt.query_map([], |row| Ok(device_from_row(row)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
        .await
    }

    /// The devices the scheduler spawns workers for.
    pub async fn list_active_devices(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .filter(|d| d.status == DeviceStatus::Active)
            .collect())
    }

    /// Worker heartbeat: mark the device seen and active.
    pub async fn touch_device(&self, id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE devices SET status = 'active', updated_at = ?1 WHERE id = ?2",
                params![ts(now), id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("device"));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_device_status(
        &self,
        id: Uuid,
        status: DeviceStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE devices SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(now), id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("device"));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn heartbeat_reactivates_device() {
        let store = Store::open_in_memory().unwrap();
        let device = store
            .insert_device("iphone-02", "00008030-AAA", 8102)
            .await
            .unwrap();

        store
            .set_device_status(device.id, DeviceStatus::Disconnected)
            .await
            .unwrap();
        assert!(store.list_active_devices().await.unwrap().is_empty());

        store.touch_device(device.id).await.unwrap();
        let active = store.list_active_devices().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, device.id);
    }

    #[tokio::test]
    async fn udid_and_port_are_unique() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_device("iphone-03", "00008030-BBB", 8103)
            .await
            .unwrap();
        assert!(store
            .insert_device("iphone-04", "00008030-BBB", 8104)
            .await
            .is_err());
        assert!(store
            .insert_device("iphone-05", "00008030-CCC", 8103)
            .await
            .is_err());
    }
}
