//! Container rows.

use super::{StateStore, from_json, is_unique_violation, map_sql, to_json, ts};
use crate::container::config::{ContainerConfig, HostConfig};
use crate::container::state::ContainerStatus;
use crate::ids::ContainerId;
use arca_shared::{ArcaError, ArcaResult, ResourceKind};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};

/// One row of the `containers` table.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ContainerStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stopped_by_user: bool,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
}

impl ContainerRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<(Self, String, String)> {
        let id: String = row.get("id")?;
        let created_at: String = row.get("created_at")?;
        let status: String = row.get("status")?;
        let started_at: Option<String> = row.get("started_at")?;
        let finished_at: Option<String> = row.get("finished_at")?;
        let config_json: String = row.get("config_json")?;
        let host_config_json: String = row.get("host_config_json")?;

        // Second pass outside rusqlite converts the owned strings; only the
        // column access can produce a rusqlite error here.
        Ok((
            ContainerRecord {
                id: ContainerId::parse(&id).unwrap_or_default(),
                name: row.get("name")?,
                image: row.get("image")?,
                image_id: row.get("image_id")?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_default(),
                status: status.parse().unwrap_or(ContainerStatus::Dead),
                pid: row.get("pid")?,
                exit_code: row.get("exit_code")?,
                started_at: started_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc)),
                finished_at: finished_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc)),
                stopped_by_user: row.get("stopped_by_user")?,
                config: ContainerConfig::default(),
                host_config: HostConfig::default(),
            },
            config_json,
            host_config_json,
        ))
    }

    fn finish(mut parts: (Self, String, String)) -> ArcaResult<Self> {
        parts.0.config = from_json(&parts.1)?;
        parts.0.host_config = from_json(&parts.2)?;
        Ok(parts.0)
    }
}

const SELECT_COLUMNS: &str = "id, name, image, image_id, created_at, status, pid, exit_code, \
     started_at, finished_at, stopped_by_user, config_json, host_config_json";

impl StateStore {
    /// Insert or replace a full container row.
    ///
    /// Fails with `NameInUse` when the name belongs to another container.
    pub fn save_container(&self, record: &ContainerRecord) -> ArcaResult<()> {
        let config_json = to_json(&record.config)?;
        let host_config_json = to_json(&record.host_config)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO containers
                    (id, name, image, image_id, created_at, status,
                     running, paused, restarting, pid, exit_code,
                     started_at, finished_at, stopped_by_user,
                     config_json, host_config_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    record.id,
                    record.name,
                    record.image,
                    record.image_id,
                    ts(&record.created_at),
                    record.status.as_str(),
                    record.status.is_running(),
                    record.status.is_paused(),
                    record.status.is_restarting(),
                    record.pid,
                    record.exit_code,
                    record.started_at.as_ref().map(ts),
                    record.finished_at.as_ref().map(ts),
                    record.stopped_by_user,
                    config_json,
                    host_config_json,
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ArcaError::NameInUse(record.name.clone())
                } else {
                    map_sql(e)
                }
            })?;
            Ok(())
        })
    }

    /// Update status and the derived running/paused/restarting flags,
    /// optionally recording an exit code and finish time. Terminal
    /// statuses clear the pid; there is no process behind them.
    pub fn update_container_status(
        &self,
        id: &ContainerId,
        status: ContainerStatus,
        exit_code: Option<i64>,
        finished_at: Option<DateTime<Utc>>,
    ) -> ArcaResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE containers SET
                        status = ?2,
                        running = ?3,
                        paused = ?4,
                        restarting = ?5,
                        pid = CASE WHEN ?8 THEN pid ELSE NULL END,
                        exit_code = COALESCE(?6, exit_code),
                        finished_at = COALESCE(?7, finished_at)
                     WHERE id = ?1",
                    params![
                        id,
                        status.as_str(),
                        status.is_running(),
                        status.is_paused(),
                        status.is_restarting(),
                        exit_code,
                        finished_at.as_ref().map(ts),
                        status.is_active(),
                    ],
                )
                .map_err(map_sql)?;
            if changed == 0 {
                return Err(ArcaError::not_found(ResourceKind::Container, id.as_str()));
            }
            Ok(())
        })
    }

    /// Record a successful start: running status, fresh pid and start time,
    /// cleared exit state.
    pub fn mark_container_started(
        &self,
        id: &ContainerId,
        pid: u32,
        started_at: DateTime<Utc>,
    ) -> ArcaResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE containers SET
                        status = 'running', running = 1, paused = 0, restarting = 0,
                        pid = ?2, started_at = ?3, finished_at = NULL, exit_code = NULL,
                        stopped_by_user = 0
                     WHERE id = ?1",
                    params![id, pid, ts(&started_at)],
                )
                .map_err(map_sql)?;
            if changed == 0 {
                return Err(ArcaError::not_found(ResourceKind::Container, id.as_str()));
            }
            Ok(())
        })
    }

    /// Set the explicit-stop flag driving `unless-stopped`.
    pub fn set_stopped_by_user(&self, id: &ContainerId, stopped: bool) -> ArcaResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE containers SET stopped_by_user = ?2 WHERE id = ?1",
                    params![id, stopped],
                )
                .map_err(map_sql)?;
            if changed == 0 {
                return Err(ArcaError::not_found(ResourceKind::Container, id.as_str()));
            }
            Ok(())
        })
    }

    /// Rename a container, failing with `NameInUse` on a collision.
    pub fn update_container_name(&self, id: &ContainerId, new_name: &str) -> ArcaResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE containers SET name = ?2 WHERE id = ?1",
                    params![id, new_name],
                )
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        ArcaError::NameInUse(new_name.to_string())
                    } else {
                        map_sql(e)
                    }
                })?;
            if changed == 0 {
                return Err(ArcaError::not_found(ResourceKind::Container, id.as_str()));
            }
            Ok(())
        })
    }

    pub fn get_container(&self, id: &ContainerId) -> ArcaResult<Option<ContainerRecord>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM containers WHERE id = ?1"),
                params![id],
                ContainerRecord::from_row,
            );
            match result {
                Ok(parts) => Ok(Some(ContainerRecord::finish(parts)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(map_sql(e)),
            }
        })
    }

    /// All containers, oldest first.
    pub fn load_all_containers(&self) -> ArcaResult<Vec<ContainerRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM containers ORDER BY created_at ASC"
                ))
                .map_err(map_sql)?;
            let rows = stmt
                .query_map([], ContainerRecord::from_row)
                .map_err(map_sql)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(ContainerRecord::finish(row.map_err(map_sql)?)?);
            }
            Ok(records)
        })
    }

    /// Exited containers whose restart policy says they should come back,
    /// oldest first. An explicit user stop pins a container down whatever
    /// its policy; `no` and unknown policies never restart; retry limits
    /// are passed through, not enforced.
    pub fn containers_to_restart(&self) -> ArcaResult<Vec<ContainerRecord>> {
        let all = self.load_all_containers()?;
        Ok(all
            .into_iter()
            .filter(|record| {
                record.status == ContainerStatus::Exited
                    && !record.stopped_by_user
                    && record
                        .host_config
                        .restart_policy
                        .should_restart(record.exit_code.unwrap_or(0), record.stopped_by_user)
            })
            .collect())
    }

    /// IDs of containers created from the given image digest.
    pub fn get_image_users(&self, image_id: &str) -> ArcaResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM containers WHERE image_id = ?1 ORDER BY created_at ASC")
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![image_id], |row| row.get::<_, String>(0))
                .map_err(map_sql)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_sql)
        })
    }

    /// Delete a container row; attachments and volume mounts cascade.
    pub fn delete_container(&self, id: &ContainerId) -> ArcaResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM containers WHERE id = ?1", params![id])
                .map_err(map_sql)?;
            if changed == 0 {
                return Err(ArcaError::not_found(ResourceKind::Container, id.as_str()));
            }
            Ok(())
        })
    }
}
