//! Pluggable network backends.
//!
//! Three drivers share one narrow contract: provision/unprovision a
//! network's control-plane resources, attach/detach containers, and
//! reconcile persisted state on startup. The bridge (TAP-relay + logical
//! switch) driver is the primary one; vmnet rides the macOS shared
//! network and cannot attach dynamically; vlan provisions VLAN interfaces
//! through the helper VM.

pub mod bridge;
pub mod ipam;
pub mod relay;
pub mod vlan;
pub mod vmnet;

pub use bridge::BridgeDriver;
pub use vlan::VlanDriver;
pub use vmnet::VmnetDriver;

use crate::db::{AttachmentRecord, NetworkDriverKind, NetworkRecord, StateStore};
use crate::ids::{ContainerId, NetworkId};
use crate::vmm::VmHandle;
use arca_shared::{ArcaError, ArcaResult, ResourceKind};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Looks up the live VM handle of a container, if any. Implemented by the
/// container manager; drivers use it to reach peer containers (DNS
/// pushes) without holding container state.
pub trait VmRegistry: Send + Sync {
    fn vm_for(&self, container: &ContainerId) -> Option<Arc<dyn VmHandle>>;
}

/// Options for creating a network.
#[derive(Debug, Clone, Default)]
pub struct CreateNetworkOptions {
    pub name: String,
    pub driver: NetworkDriverKind,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub ip_range: Option<String>,
    pub options: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub is_default: bool,
}

impl CreateNetworkOptions {
    pub fn bridge(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: NetworkDriverKind::Bridge,
            ..Default::default()
        }
    }
}

/// Caller-supplied attach parameters.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub ip: Option<Ipv4Addr>,
    pub aliases: Vec<String>,
}

/// What a successful attach produced.
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    pub ip: String,
    pub mac: String,
    pub gateway: String,
    pub subnet: String,
}

/// Everything a driver needs to attach one container.
pub struct AttachContext<'a> {
    pub container_id: &'a ContainerId,
    pub container_name: &'a str,
    pub vm: Arc<dyn VmHandle>,
    pub network: &'a NetworkRecord,
    pub requested_ip: Option<Ipv4Addr>,
    pub aliases: &'a [String],
}

/// The backend contract.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    fn kind(&self) -> NetworkDriverKind;

    /// Provision control-plane resources; fills in an auto-allocated
    /// subnet/gateway when the record carries none.
    async fn provision_network(&self, record: &mut NetworkRecord) -> ArcaResult<()>;

    /// Tear down control-plane resources. Best-effort on cleanup paths.
    async fn unprovision_network(&self, record: &NetworkRecord) -> ArcaResult<()>;

    /// Attach a container. May run while the container is running; a
    /// driver that cannot do that returns `DynamicAttachUnsupported`.
    async fn attach_container(&self, ctx: &AttachContext<'_>) -> ArcaResult<AttachOutcome>;

    /// Detach a container and release its addresses. RPC failures are
    /// logged, never fatal; local state is always cleared.
    async fn detach_container(
        &self,
        container_id: &ContainerId,
        network: &NetworkRecord,
    ) -> ArcaResult<()>;

    /// Rebuild in-memory topology from persisted state on startup.
    async fn reconcile(
        &self,
        networks: &[NetworkRecord],
        attachments: &[AttachmentRecord],
    ) -> ArcaResult<()>;
}

/// Owns the driver set and the persisted network catalog.
pub struct NetworkManager {
    store: Arc<StateStore>,
    drivers: HashMap<NetworkDriverKind, Arc<dyn NetworkDriver>>,
}

impl NetworkManager {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            drivers: HashMap::new(),
        }
    }

    pub fn register_driver(&mut self, driver: Arc<dyn NetworkDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    fn driver(&self, kind: NetworkDriverKind) -> ArcaResult<Arc<dyn NetworkDriver>> {
        self.drivers.get(&kind).cloned().ok_or_else(|| {
            ArcaError::Unsupported(format!("network driver {kind} is not available"))
        })
    }

    /// Create a network: validate, let the driver provision (and
    /// auto-allocate a subnet if needed), persist.
    pub async fn create_network(
        &self,
        options: CreateNetworkOptions,
    ) -> ArcaResult<NetworkRecord> {
        if options.name.is_empty() {
            return Err(ArcaError::InvalidArgument("network name is empty".into()));
        }

        let existing = self.store.load_all_networks()?;
        if existing.iter().any(|n| n.name == options.name) {
            return Err(ArcaError::NameInUse(options.name));
        }
        if options.is_default && existing.iter().any(|n| n.is_default) {
            return Err(ArcaError::StateConflict(
                "a default network already exists".into(),
            ));
        }

        if let Some(subnet) = &options.subnet {
            ipam::parse_cidr(subnet)?;
            for other in &existing {
                if !other.subnet.is_empty() && ipam::subnets_overlap(subnet, &other.subnet)? {
                    return Err(ArcaError::InvalidArgument(format!(
                        "subnet {subnet} overlaps network {} ({})",
                        other.name, other.subnet
                    )));
                }
            }
        }

        let driver = self.driver(options.driver)?;
        let mut record = NetworkRecord {
            id: NetworkId::new(),
            name: options.name,
            driver: options.driver,
            scope: "local".to_string(),
            created_at: Utc::now(),
            subnet: options.subnet.unwrap_or_default(),
            gateway: options.gateway.unwrap_or_default(),
            ip_range: options.ip_range,
            options: options.options,
            labels: options.labels,
            is_default: options.is_default,
        };

        driver.provision_network(&mut record).await?;

        if let Err(e) = self.store.save_network(&record) {
            // Roll the control plane back; the row never landed.
            if let Err(undo) = driver.unprovision_network(&record).await {
                tracing::warn!(network = %record.name, error = %undo, "rollback failed");
            }
            return Err(e);
        }

        tracing::info!(
            network = %record.name,
            id = %record.id.short(),
            driver = %record.driver,
            subnet = %record.subnet,
            "created network"
        );
        Ok(record)
    }

    /// Delete a network. The default network is undeletable; so is one
    /// with attached endpoints.
    pub async fn delete_network(&self, name_or_id: &str) -> ArcaResult<()> {
        let record = self.inspect(name_or_id)?;

        if record.is_default {
            return Err(ArcaError::StateConflict(format!(
                "{} is the default network and cannot be removed",
                record.name
            )));
        }

        let endpoints: Vec<_> = self
            .store
            .load_all_network_attachments()?
            .into_iter()
            .filter(|a| a.network_id == record.id)
            .collect();
        if !endpoints.is_empty() {
            return Err(ArcaError::StateConflict(format!(
                "network {} has {} active endpoint(s)",
                record.name,
                endpoints.len()
            )));
        }

        let driver = self.driver(record.driver)?;
        driver.unprovision_network(&record).await?;
        self.store.delete_network(&record.id)?;

        tracing::info!(network = %record.name, "deleted network");
        Ok(())
    }

    pub fn list(&self) -> ArcaResult<Vec<NetworkRecord>> {
        self.store.load_all_networks()
    }

    /// Resolve by name, full ID, or ID prefix.
    pub fn inspect(&self, name_or_id: &str) -> ArcaResult<NetworkRecord> {
        let networks = self.store.load_all_networks()?;
        networks
            .iter()
            .find(|n| n.name == name_or_id)
            .or_else(|| networks.iter().find(|n| n.id.as_str() == name_or_id))
            .or_else(|| {
                (name_or_id.len() >= 12)
                    .then(|| networks.iter().find(|n| n.id.starts_with(name_or_id)))
                    .flatten()
            })
            .cloned()
            .ok_or_else(|| ArcaError::not_found(ResourceKind::Network, name_or_id))
    }

    /// The default network, if one is configured.
    pub fn default_network(&self) -> ArcaResult<Option<NetworkRecord>> {
        Ok(self
            .store
            .load_all_networks()?
            .into_iter()
            .find(|n| n.is_default))
    }

    /// Attach a container and persist the attachment row.
    pub async fn connect(
        &self,
        container_id: &ContainerId,
        container_name: &str,
        vm: Arc<dyn VmHandle>,
        name_or_id: &str,
        options: AttachOptions,
    ) -> ArcaResult<AttachOutcome> {
        let network = self.inspect(name_or_id)?;

        let already = self
            .store
            .load_network_attachments(container_id)?
            .into_iter()
            .any(|a| a.network_id == network.id);
        if already {
            return Err(ArcaError::AlreadyConnected {
                container: container_id.short().to_string(),
                network: network.name.clone(),
            });
        }

        let mut aliases = options.aliases.clone();
        if !aliases.contains(&container_name.to_string()) {
            aliases.push(container_name.to_string());
        }

        let driver = self.driver(network.driver)?;
        let outcome = driver
            .attach_container(&AttachContext {
                container_id,
                container_name,
                vm,
                network: &network,
                requested_ip: options.ip,
                aliases: &aliases,
            })
            .await?;

        let row = AttachmentRecord {
            container_id: container_id.clone(),
            network_id: network.id.clone(),
            ip: outcome.ip.clone(),
            mac: outcome.mac.clone(),
            aliases,
            attached_at: Utc::now(),
        };
        if let Err(e) = self.store.save_network_attachment(&row) {
            if let Err(undo) = driver.detach_container(container_id, &network).await {
                tracing::warn!(error = %undo, "attach rollback failed");
            }
            return Err(e);
        }

        tracing::info!(
            container = %container_id.short(),
            network = %network.name,
            ip = %outcome.ip,
            "connected container to network"
        );
        Ok(outcome)
    }

    /// Detach a container and drop the attachment row. Cleanup is
    /// tolerant: remote failures are logged, local state always goes.
    pub async fn disconnect(
        &self,
        container_id: &ContainerId,
        name_or_id: &str,
    ) -> ArcaResult<()> {
        let network = self.inspect(name_or_id)?;

        let attached = self
            .store
            .load_network_attachments(container_id)?
            .into_iter()
            .any(|a| a.network_id == network.id);
        if !attached {
            return Err(ArcaError::not_found(
                ResourceKind::Attachment,
                format!("{} on {}", container_id.short(), network.name),
            ));
        }

        let driver = self.driver(network.driver)?;
        if let Err(e) = driver.detach_container(container_id, &network).await {
            tracing::warn!(
                container = %container_id.short(),
                network = %network.name,
                error = %e,
                "driver detach reported errors; continuing cleanup"
            );
        }
        self.store.delete_network_attachment(container_id, &network.id)?;

        tracing::info!(
            container = %container_id.short(),
            network = %network.name,
            "disconnected container from network"
        );
        Ok(())
    }

    /// Detach from everything, for container removal.
    pub async fn disconnect_all(&self, container_id: &ContainerId) -> ArcaResult<()> {
        let networks: Vec<_> = {
            let attachments = self.store.load_network_attachments(container_id)?;
            let all = self.store.load_all_networks()?;
            attachments
                .into_iter()
                .filter_map(|a| all.iter().find(|n| n.id == a.network_id).cloned())
                .collect()
        };
        for network in networks {
            if let Err(e) = self.disconnect(container_id, network.id.as_str()).await {
                tracing::warn!(
                    container = %container_id.short(),
                    network = %network.name,
                    error = %e,
                    "disconnect during teardown failed"
                );
            }
        }
        Ok(())
    }

    /// Startup pass: re-provision control planes and rebuild driver
    /// topology from persisted rows.
    pub async fn reconcile(&self) -> ArcaResult<()> {
        let networks = self.store.load_all_networks()?;
        let attachments = self.store.load_all_network_attachments()?;

        for driver in self.drivers.values() {
            let kind = driver.kind();
            let owned: Vec<_> = networks
                .iter()
                .filter(|n| n.driver == kind)
                .cloned()
                .collect();
            let owned_ids: Vec<&NetworkId> = owned.iter().map(|n| &n.id).collect();
            let owned_attachments: Vec<_> = attachments
                .iter()
                .filter(|a| owned_ids.contains(&&a.network_id))
                .cloned()
                .collect();
            driver.reconcile(&owned, &owned_attachments).await?;
        }
        Ok(())
    }
}
