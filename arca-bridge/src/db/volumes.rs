//! Volume and volume-mount rows.

use super::{StateStore, from_json, map_sql, parse_ts, to_json, ts};
use crate::ids::ContainerId;
use arca_shared::{ArcaError, ArcaResult, ResourceKind};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use std::collections::HashMap;
use std::path::PathBuf;

/// One row of the `volumes` table.
#[derive(Debug, Clone)]
pub struct VolumeRecord {
    pub name: String,
    pub driver: String,
    pub format: String,
    pub mountpoint: PathBuf,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub options: HashMap<String, String>,
}

/// One row of the `volume_mounts` table.
#[derive(Debug, Clone)]
pub struct VolumeMountRecord {
    pub container_id: ContainerId,
    pub volume_name: String,
    pub container_path: String,
    pub is_anonymous: bool,
    pub mounted_at: DateTime<Utc>,
}

fn volume_from_row(row: &Row<'_>) -> rusqlite::Result<(VolumeRecord, String, String, String)> {
    let mountpoint: String = row.get("mountpoint")?;
    let created_at: String = row.get("created_at")?;
    let labels_json: String = row.get("labels_json")?;
    let options_json: String = row.get("options_json")?;

    Ok((
        VolumeRecord {
            name: row.get("name")?,
            driver: row.get("driver")?,
            format: row.get("format")?,
            mountpoint: PathBuf::from(mountpoint),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_default(),
            labels: HashMap::new(),
            options: HashMap::new(),
        },
        created_at,
        labels_json,
        options_json,
    ))
}

fn mount_from_row(row: &Row<'_>) -> rusqlite::Result<(VolumeMountRecord, String)> {
    let container_id: String = row.get("container_id")?;
    let mounted_at: String = row.get("mounted_at")?;

    Ok((
        VolumeMountRecord {
            container_id: ContainerId::parse(&container_id).unwrap_or_default(),
            volume_name: row.get("volume_name")?,
            container_path: row.get("container_path")?,
            is_anonymous: row.get("is_anonymous")?,
            mounted_at: DateTime::parse_from_rfc3339(&mounted_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_default(),
        },
        mounted_at,
    ))
}

impl StateStore {
    pub fn save_volume(&self, record: &VolumeRecord) -> ArcaResult<()> {
        let labels_json = to_json(&record.labels)?;
        let options_json = to_json(&record.options)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO volumes
                    (name, driver, format, mountpoint, created_at, labels_json, options_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.name,
                    record.driver,
                    record.format,
                    record.mountpoint.to_string_lossy().into_owned(),
                    ts(&record.created_at),
                    labels_json,
                    options_json,
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
    }

    pub fn load_all_volumes(&self) -> ArcaResult<Vec<VolumeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM volumes ORDER BY created_at ASC")
                .map_err(map_sql)?;
            let rows = stmt.query_map([], volume_from_row).map_err(map_sql)?;

            let mut records = Vec::new();
            for row in rows {
                let (mut record, created_at, labels_json, options_json) = row.map_err(map_sql)?;
                record.created_at = parse_ts(&created_at)?;
                record.labels = from_json(&labels_json)?;
                record.options = from_json(&options_json)?;
                records.push(record);
            }
            Ok(records)
        })
    }

    /// Delete a volume row; mounts cascade. `NotFound` when absent.
    pub fn delete_volume(&self, name: &str) -> ArcaResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM volumes WHERE name = ?1", params![name])
                .map_err(map_sql)?;
            if changed == 0 {
                return Err(ArcaError::not_found(ResourceKind::Volume, name));
            }
            Ok(())
        })
    }

    pub fn save_volume_mount(&self, record: &VolumeMountRecord) -> ArcaResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO volume_mounts
                    (container_id, volume_name, container_path, is_anonymous, mounted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.container_id,
                    record.volume_name,
                    record.container_path,
                    record.is_anonymous,
                    ts(&record.mounted_at),
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
    }

    /// Mounts of one container.
    pub fn get_volume_mounts(
        &self,
        container_id: &ContainerId,
    ) -> ArcaResult<Vec<VolumeMountRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM volume_mounts WHERE container_id = ?1 ORDER BY mounted_at ASC",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![container_id], mount_from_row)
                .map_err(map_sql)?;

            let mut records = Vec::new();
            for row in rows {
                let (mut record, mounted_at) = row.map_err(map_sql)?;
                record.mounted_at = parse_ts(&mounted_at)?;
                records.push(record);
            }
            Ok(records)
        })
    }

    /// Distinct IDs of containers mounting the named volume.
    pub fn get_volume_users(&self, volume_name: &str) -> ArcaResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT container_id FROM volume_mounts
                     WHERE volume_name = ?1 ORDER BY container_id",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![volume_name], |row| row.get::<_, String>(0))
                .map_err(map_sql)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_sql)
        })
    }

    /// Remove every mount row of a container.
    pub fn delete_volume_mounts(&self, container_id: &ContainerId) -> ArcaResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM volume_mounts WHERE container_id = ?1",
                params![container_id],
            )
            .map_err(map_sql)?;
            Ok(())
        })
    }

    /// Names of volumes with zero mounts.
    pub fn get_dangling_volumes(&self) -> ArcaResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT v.name FROM volumes v
                     LEFT JOIN volume_mounts m ON m.volume_name = v.name
                     WHERE m.id IS NULL ORDER BY v.name",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(map_sql)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_sql)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::{ContainerConfig, HostConfig};
    use crate::container::state::ContainerStatus;
    use crate::db::ContainerRecord;

    fn volume(name: &str) -> VolumeRecord {
        VolumeRecord {
            name: name.to_string(),
            driver: "local".into(),
            format: "ext4".into(),
            mountpoint: PathBuf::from(format!("/tmp/volumes/{name}/volume.img")),
            created_at: Utc::now(),
            labels: HashMap::new(),
            options: HashMap::new(),
        }
    }

    fn container(name: &str) -> ContainerRecord {
        ContainerRecord {
            id: ContainerId::new(),
            name: name.to_string(),
            image: "alpine".into(),
            image_id: "sha256:abcd".into(),
            created_at: Utc::now(),
            status: ContainerStatus::Created,
            pid: None,
            exit_code: None,
            started_at: None,
            finished_at: None,
            stopped_by_user: false,
            config: ContainerConfig::default(),
            host_config: HostConfig::default(),
        }
    }

    fn mount(c: &ContainerRecord, vol: &str, path: &str) -> VolumeMountRecord {
        VolumeMountRecord {
            container_id: c.id.clone(),
            volume_name: vol.to_string(),
            container_path: path.to_string(),
            is_anonymous: false,
            mounted_at: Utc::now(),
        }
    }

    #[test]
    fn volume_round_trip_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_volume(&volume("data")).unwrap();
        assert_eq!(store.load_all_volumes().unwrap().len(), 1);

        store.delete_volume("data").unwrap();
        assert!(store.delete_volume("data").unwrap_err().is_not_found());
    }

    #[test]
    fn volume_users_are_distinct() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_volume(&volume("data")).unwrap();
        let c = container("web");
        store.save_container(&c).unwrap();

        store.save_volume_mount(&mount(&c, "data", "/var/lib/a")).unwrap();
        store.save_volume_mount(&mount(&c, "data", "/var/lib/b")).unwrap();

        let users = store.get_volume_users("data").unwrap();
        assert_eq!(users, vec![c.id.as_str().to_string()]);
    }

    #[test]
    fn dangling_tracks_mount_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_volume(&volume("data")).unwrap();
        store.save_volume(&volume("scratch")).unwrap();

        let c = container("web");
        store.save_container(&c).unwrap();
        store.save_volume_mount(&mount(&c, "data", "/data")).unwrap();

        assert_eq!(store.get_dangling_volumes().unwrap(), vec!["scratch"]);

        // Deleting the container cascades the mount; both become dangling.
        store.delete_container(&c.id).unwrap();
        assert_eq!(store.get_dangling_volumes().unwrap(), vec!["data", "scratch"]);
    }

    #[test]
    fn delete_volume_cascades_mounts() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_volume(&volume("data")).unwrap();
        let c = container("web");
        store.save_container(&c).unwrap();
        store.save_volume_mount(&mount(&c, "data", "/data")).unwrap();

        store.delete_volume("data").unwrap();
        assert!(store.get_volume_mounts(&c.id).unwrap().is_empty());
    }
}
