//! Network and attachment rows.

use super::{StateStore, from_json, is_unique_violation, map_sql, parse_ts, to_json, ts};
use crate::ids::{ContainerId, NetworkId};
use arca_shared::{ArcaError, ArcaResult, ResourceKind};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Network driver selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriverKind {
    #[default]
    Bridge,
    Overlay,
    Vmnet,
    Vlan,
}

impl NetworkDriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkDriverKind::Bridge => "bridge",
            NetworkDriverKind::Overlay => "overlay",
            NetworkDriverKind::Vmnet => "vmnet",
            NetworkDriverKind::Vlan => "vlan",
        }
    }
}

impl std::str::FromStr for NetworkDriverKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bridge" => Ok(NetworkDriverKind::Bridge),
            "overlay" => Ok(NetworkDriverKind::Overlay),
            "vmnet" => Ok(NetworkDriverKind::Vmnet),
            "vlan" => Ok(NetworkDriverKind::Vlan),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for NetworkDriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `networks` table.
#[derive(Debug, Clone)]
pub struct NetworkRecord {
    pub id: NetworkId,
    pub name: String,
    pub driver: NetworkDriverKind,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub subnet: String,
    pub gateway: String,
    pub ip_range: Option<String>,
    pub options: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub is_default: bool,
}

/// One row of the `network_attachments` table.
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub container_id: ContainerId,
    pub network_id: NetworkId,
    pub ip: String,
    pub mac: String,
    pub aliases: Vec<String>,
    pub attached_at: DateTime<Utc>,
}

fn network_from_row(row: &Row<'_>) -> rusqlite::Result<(NetworkRecord, String, String, String)> {
    let id: String = row.get("id")?;
    let driver: String = row.get("driver")?;
    let created_at: String = row.get("created_at")?;
    let options_json: String = row.get("options_json")?;
    let labels_json: String = row.get("labels_json")?;

    Ok((
        NetworkRecord {
            id: NetworkId::parse(&id).unwrap_or_default(),
            name: row.get("name")?,
            driver: driver.parse().unwrap_or(NetworkDriverKind::Bridge),
            scope: row.get("scope")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_default(),
            subnet: row.get("subnet")?,
            gateway: row.get("gateway")?,
            ip_range: row.get("ip_range")?,
            options: HashMap::new(),
            labels: HashMap::new(),
            is_default: row.get("is_default")?,
        },
        created_at,
        options_json,
        labels_json,
    ))
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<(AttachmentRecord, String, String)> {
    let container_id: String = row.get("container_id")?;
    let network_id: String = row.get("network_id")?;
    let aliases_json: String = row.get("aliases_json")?;
    let attached_at: String = row.get("attached_at")?;

    Ok((
        AttachmentRecord {
            container_id: ContainerId::parse(&container_id).unwrap_or_default(),
            network_id: NetworkId::parse(&network_id).unwrap_or_default(),
            ip: row.get("ip")?,
            mac: row.get("mac")?,
            aliases: Vec::new(),
            attached_at: DateTime::parse_from_rfc3339(&attached_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_default(),
        },
        aliases_json,
        attached_at,
    ))
}

impl StateStore {
    /// Insert or replace a network row; fails with `NameInUse` when the
    /// name belongs to another network.
    pub fn save_network(&self, record: &NetworkRecord) -> ArcaResult<()> {
        let options_json = to_json(&record.options)?;
        let labels_json = to_json(&record.labels)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO networks
                    (id, name, driver, scope, created_at, subnet, gateway,
                     ip_range, options_json, labels_json, is_default)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.name,
                    record.driver.as_str(),
                    record.scope,
                    ts(&record.created_at),
                    record.subnet,
                    record.gateway,
                    record.ip_range,
                    options_json,
                    labels_json,
                    record.is_default,
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

    pub fn load_all_networks(&self) -> ArcaResult<Vec<NetworkRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM networks ORDER BY created_at ASC")
                .map_err(map_sql)?;
            let rows = stmt.query_map([], network_from_row).map_err(map_sql)?;

            let mut records = Vec::new();
            for row in rows {
                let (mut record, created_at, options_json, labels_json) = row.map_err(map_sql)?;
                record.created_at = parse_ts(&created_at)?;
                record.options = from_json(&options_json)?;
                record.labels = from_json(&labels_json)?;
                records.push(record);
            }
            Ok(records)
        })
    }

    /// Delete a network row; attachments cascade.
    pub fn delete_network(&self, id: &NetworkId) -> ArcaResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM networks WHERE id = ?1", params![id])
                .map_err(map_sql)?;
            if changed == 0 {
                return Err(ArcaError::not_found(ResourceKind::Network, id.as_str()));
            }
            Ok(())
        })
    }

    /// Upsert an attachment; unique per (container, network).
    pub fn save_network_attachment(&self, record: &AttachmentRecord) -> ArcaResult<()> {
        let aliases_json = to_json(&record.aliases)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO network_attachments
                    (container_id, network_id, ip, mac, aliases_json, attached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.container_id,
                    record.network_id,
                    record.ip,
                    record.mac,
                    aliases_json,
                    ts(&record.attached_at),
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
    }

    pub fn load_network_attachments(
        &self,
        container_id: &ContainerId,
    ) -> ArcaResult<Vec<AttachmentRecord>> {
        self.load_attachments_where(
            "SELECT * FROM network_attachments WHERE container_id = ?1 ORDER BY attached_at ASC",
            params![container_id],
        )
    }

    /// Every attachment in the store, for startup reconciliation.
    pub fn load_all_network_attachments(&self) -> ArcaResult<Vec<AttachmentRecord>> {
        self.load_attachments_where(
            "SELECT * FROM network_attachments ORDER BY attached_at ASC",
            params![],
        )
    }

    fn load_attachments_where(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> ArcaResult<Vec<AttachmentRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).map_err(map_sql)?;
            let rows = stmt.query_map(args, attachment_from_row).map_err(map_sql)?;

            let mut records = Vec::new();
            for row in rows {
                let (mut record, aliases_json, attached_at) = row.map_err(map_sql)?;
                record.aliases = from_json(&aliases_json)?;
                record.attached_at = parse_ts(&attached_at)?;
                records.push(record);
            }
            Ok(records)
        })
    }

    pub fn delete_network_attachment(
        &self,
        container_id: &ContainerId,
        network_id: &NetworkId,
    ) -> ArcaResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "DELETE FROM network_attachments
                     WHERE container_id = ?1 AND network_id = ?2",
                    params![container_id, network_id],
                )
                .map_err(map_sql)?;
            if changed == 0 {
                return Err(ArcaError::not_found(
                    ResourceKind::Attachment,
                    format!("{} on {}", container_id.short(), network_id.short()),
                ));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::{ContainerConfig, HostConfig};
    use crate::container::state::ContainerStatus;
    use crate::db::ContainerRecord;

    fn network(name: &str, subnet: &str) -> NetworkRecord {
        NetworkRecord {
            id: NetworkId::new(),
            name: name.to_string(),
            driver: NetworkDriverKind::Bridge,
            scope: "local".into(),
            created_at: Utc::now(),
            subnet: subnet.to_string(),
            gateway: subnet.replace(".0.0/16", ".0.1"),
            ip_range: None,
            options: HashMap::new(),
            labels: HashMap::new(),
            is_default: false,
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

    fn attachment(c: &ContainerRecord, n: &NetworkRecord, ip: &str) -> AttachmentRecord {
        AttachmentRecord {
            container_id: c.id.clone(),
            network_id: n.id.clone(),
            ip: ip.to_string(),
            mac: "02:42:ac:12:00:02".into(),
            aliases: vec![c.name.clone()],
            attached_at: Utc::now(),
        }
    }

    #[test]
    fn network_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let mut net = network("net1", "172.18.0.0/16");
        net.labels.insert("team".into(), "infra".into());
        store.save_network(&net).unwrap();

        let loaded = store.load_all_networks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "net1");
        assert_eq!(loaded[0].subnet, "172.18.0.0/16");
        assert_eq!(loaded[0].labels.get("team").unwrap(), "infra");
    }

    #[test]
    fn deleting_container_cascades_attachments() {
        let store = StateStore::open_in_memory().unwrap();
        let net = network("net1", "172.18.0.0/16");
        let c = container("web");
        store.save_network(&net).unwrap();
        store.save_container(&c).unwrap();
        store
            .save_network_attachment(&attachment(&c, &net, "172.18.0.2"))
            .unwrap();

        assert_eq!(store.load_network_attachments(&c.id).unwrap().len(), 1);
        store.delete_container(&c.id).unwrap();
        assert!(store.load_all_network_attachments().unwrap().is_empty());
    }

    #[test]
    fn deleting_network_cascades_attachments() {
        let store = StateStore::open_in_memory().unwrap();
        let net = network("net1", "172.18.0.0/16");
        let c = container("web");
        store.save_network(&net).unwrap();
        store.save_container(&c).unwrap();
        store
            .save_network_attachment(&attachment(&c, &net, "172.18.0.2"))
            .unwrap();

        store.delete_network(&net.id).unwrap();
        assert!(store.load_network_attachments(&c.id).unwrap().is_empty());
    }

    #[test]
    fn attachment_is_unique_per_pair() {
        let store = StateStore::open_in_memory().unwrap();
        let net = network("net1", "172.18.0.0/16");
        let c = container("web");
        store.save_network(&net).unwrap();
        store.save_container(&c).unwrap();

        store
            .save_network_attachment(&attachment(&c, &net, "172.18.0.2"))
            .unwrap();
        // Re-attach replaces rather than duplicating.
        store
            .save_network_attachment(&attachment(&c, &net, "172.18.0.3"))
            .unwrap();

        let rows = store.load_network_attachments(&c.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip, "172.18.0.3");
    }

    #[test]
    fn delete_attachment() {
        let store = StateStore::open_in_memory().unwrap();
        let net = network("net1", "172.18.0.0/16");
        let c = container("web");
        store.save_network(&net).unwrap();
        store.save_container(&c).unwrap();
        store
            .save_network_attachment(&attachment(&c, &net, "172.18.0.2"))
            .unwrap();

        store.delete_network_attachment(&c.id, &net.id).unwrap();
        assert!(
            store
                .delete_network_attachment(&c.id, &net.id)
                .unwrap_err()
                .is_not_found()
        );
    }
}
