//! Hosting systems: utility VMs shared by several workloads.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use strata_common::{HostingSystemId, StrataResult};

use super::attachment::{AttachmentAllocator, AttachmentTable};
use super::share::{ShareEntry, ShareRegistry};
use super::utility_vm::UtilityVmSpec;
use crate::config::GuestLayout;
use crate::control::{AttachmentLocation, ControlPlane};

/// A running VM that workloads' layers are mounted into.
///
/// Owns the share registry and attachment allocator every workload in the VM
/// shares. Both become meaningless once the VM is torn down. Clones are
/// handles onto the same tables.
#[derive(Debug, Clone)]
pub struct HostingSystem {
    id: HostingSystemId,
    control: Arc<dyn ControlPlane>,
    layout: GuestLayout,
    shares: Arc<ShareRegistry>,
    attachments: Arc<AttachmentAllocator>,
}

impl HostingSystem {
    /// Wrap a running VM with empty share and attachment tables.
    pub fn new(id: HostingSystemId, control: Arc<dyn ControlPlane>, layout: GuestLayout) -> Self {
        Self::with_attachments(id, control, layout, AttachmentTable::default())
    }

    /// Wrap a VM created from `spec`, whose own scratch disk sits at slot 0:0.
    ///
    /// # Errors
    ///
    /// Returns an error if the VM settings are invalid.
    pub fn from_utility_vm(
        spec: &UtilityVmSpec,
        control: Arc<dyn ControlPlane>,
        layout: GuestLayout,
        scratch_disk_name: &str,
    ) -> StrataResult<Self> {
        spec.validate()?;

        let mut table = AttachmentTable::default();
        table.mark(
            AttachmentLocation::new(0, 0),
            &spec.scratch_disk(scratch_disk_name),
        )?;

        Ok(Self::with_attachments(spec.id.clone(), control, layout, table))
    }

    fn with_attachments(
        id: HostingSystemId,
        control: Arc<dyn ControlPlane>,
        layout: GuestLayout,
        table: AttachmentTable,
    ) -> Self {
        Self {
            shares: Arc::new(ShareRegistry::new(id.clone(), control.clone())),
            attachments: Arc::new(AttachmentAllocator::new(id.clone(), control.clone(), table)),
            id,
            control,
            layout,
        }
    }

    /// The hosting system ID.
    #[must_use]
    pub const fn id(&self) -> &HostingSystemId {
        &self.id
    }

    /// Control plane for this VM.
    #[must_use]
    pub fn control(&self) -> &dyn ControlPlane {
        self.control.as_ref()
    }

    /// Guest naming.
    #[must_use]
    pub const fn layout(&self) -> &GuestLayout {
        &self.layout
    }

    /// Remote shares of read-only layers.
    #[must_use]
    pub fn shares(&self) -> &ShareRegistry {
        &self.shares
    }

    /// Scratch disk attachments.
    #[must_use]
    pub fn attachments(&self) -> &AttachmentAllocator {
        &self.attachments
    }

    /// Current shares and attachments.
    pub async fn snapshot(&self) -> StorageSnapshot {
        let shares = self
            .shares
            .table()
            .await
            .into_iter()
            .map(|(id, entry)| (id.to_string(), entry))
            .collect();

        let attachments = self
            .attachments
            .table()
            .await
            .occupied()
            .map(|(location, path)| AttachmentRecord {
                controller: location.controller,
                slot: location.slot,
                host_path: path.to_path_buf(),
            })
            .collect();

        StorageSnapshot {
            hosting_system: self.id.to_string(),
            shares,
            attachments,
        }
    }
}

/// Point-in-time view of a hosting system's storage tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageSnapshot {
    /// Hosting system ID.
    pub hosting_system: String,
    /// Share identifier to entry.
    pub shares: BTreeMap<String, ShareEntry>,
    /// Occupied attachment slots, ascending.
    pub attachments: Vec<AttachmentRecord>,
}

/// An occupied attachment slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRecord {
    /// Controller index.
    pub controller: usize,
    /// Slot on the controller.
    pub slot: usize,
    /// Host path of the disk.
    pub host_path: PathBuf,
}
