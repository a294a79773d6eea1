//! Vmnet driver: the macOS shared/NAT network.
//!
//! The OS owns the subnet and DHCP; the bridge only records the network.
//! Exactly one vmnet network may exist, its interface is configured into
//! the VM before start, and dynamic attach is structurally impossible.

use super::{AttachContext, AttachOutcome, NetworkDriver};
use crate::db::{AttachmentRecord, NetworkDriverKind, NetworkRecord};
use crate::ids::ContainerId;
use arca_shared::{ArcaError, ArcaResult};
use async_trait::async_trait;
use parking_lot::Mutex;

pub struct VmnetDriver {
    /// ID of the one vmnet network, once provisioned.
    existing: Mutex<Option<String>>,
}

impl VmnetDriver {
    pub fn new() -> Self {
        Self {
            existing: Mutex::new(None),
        }
    }
}

impl Default for VmnetDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkDriver for VmnetDriver {
    fn kind(&self) -> NetworkDriverKind {
        NetworkDriverKind::Vmnet
    }

    async fn provision_network(&self, record: &mut NetworkRecord) -> ArcaResult<()> {
        let mut existing = self.existing.lock();
        if existing.is_some() {
            return Err(ArcaError::StateConflict(
                "a vmnet network already exists; only one is supported".into(),
            ));
        }
        // The OS picks the subnet at VM start; nothing to record yet.
        record.subnet.clear();
        record.gateway.clear();
        *existing = Some(record.id.as_str().to_string());
        Ok(())
    }

    async fn unprovision_network(&self, record: &NetworkRecord) -> ArcaResult<()> {
        let mut existing = self.existing.lock();
        if existing.as_deref() == Some(record.id.as_str()) {
            *existing = None;
        }
        Ok(())
    }

    async fn attach_container(&self, _ctx: &AttachContext<'_>) -> ArcaResult<AttachOutcome> {
        Err(ArcaError::DynamicAttachUnsupported {
            driver: "vmnet".into(),
        })
    }

    async fn detach_container(
        &self,
        _container_id: &ContainerId,
        _network: &NetworkRecord,
    ) -> ArcaResult<()> {
        Err(ArcaError::DynamicAttachUnsupported {
            driver: "vmnet".into(),
        })
    }

    async fn reconcile(
        &self,
        networks: &[NetworkRecord],
        _attachments: &[AttachmentRecord],
    ) -> ArcaResult<()> {
        let mut existing = self.existing.lock();
        *existing = networks.first().map(|n| n.id.as_str().to_string());
        if networks.len() > 1 {
            tracing::warn!(
                count = networks.len(),
                "multiple vmnet networks persisted; only the first is honored"
            );
        }
        Ok(())
    }
}
