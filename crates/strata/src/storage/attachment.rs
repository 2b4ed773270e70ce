//! Block attachment slots of a hosting system.
//!
//! Scratch disks are hot-added to a (controller, slot) address. The table maps
//! every occupied slot to the host path of its disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_common::{HostingSystemId, StrataError, StrataResult};
use tokio::sync::{Mutex, MutexGuard};

use crate::control::{AttachmentLocation, ControlPlane, MappedDirectory, ModifyRequest};

/// Controllers exposed by a hosting system.
pub const CONTROLLER_COUNT: usize = 4;

/// Slots on each controller.
pub const SLOTS_PER_CONTROLLER: usize = 64;

/// Controllers the guest can currently map attachments from.
///
/// The guest agent only understands slots on controller 0, so allocation never
/// spills onto another controller.
pub const USABLE_CONTROLLERS: usize = 1;

/// Occupancy of every (controller, slot) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentTable {
    host_paths: [[Option<PathBuf>; SLOTS_PER_CONTROLLER]; CONTROLLER_COUNT],
}

impl Default for AttachmentTable {
    fn default() -> Self {
        Self {
            host_paths: std::array::from_fn(|_| std::array::from_fn(|_| None)),
        }
    }
}

impl AttachmentTable {
    /// First free slot in ascending (controller, slot) order.
    #[must_use]
    pub fn next_free(&self) -> Option<AttachmentLocation> {
        self.host_paths
            .iter()
            .enumerate()
            .find_map(|(controller, slots)| {
                slots
                    .iter()
                    .position(Option::is_none)
                    .map(|slot| AttachmentLocation::new(controller, slot))
            })
    }

    /// Where `host_path` is attached.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] if the path is not attached.
    pub fn find(&self, host_path: &Path) -> StrataResult<AttachmentLocation> {
        self.occupied()
            .find(|(_, path)| *path == host_path)
            .map(|(location, _)| location)
            .ok_or_else(|| StrataError::NotFound {
                resource: format!("attachment for {}", host_path.display()),
            })
    }

    /// Host path attached at `location`, if any.
    #[must_use]
    pub fn host_path(&self, location: AttachmentLocation) -> Option<&Path> {
        self.host_paths
            .get(location.controller)
            .and_then(|slots| slots.get(location.slot))
            .and_then(Option::as_deref)
    }

    /// Every occupied slot with its host path, in ascending order.
    pub fn occupied(&self) -> impl Iterator<Item = (AttachmentLocation, &Path)> {
        self.host_paths
            .iter()
            .enumerate()
            .flat_map(|(controller, slots)| {
                slots.iter().enumerate().filter_map(move |(slot, path)| {
                    path.as_deref()
                        .map(|path| (AttachmentLocation::new(controller, slot), path))
                })
            })
    }

    /// Reserve the first free slot for `host_path`.
    ///
    /// # Errors
    ///
    /// Fails with [`StrataError::TooManyAttachments`] if the first free slot is on a
    /// controller the guest cannot use, [`StrataError::ResourceExhausted`] if no slot
    /// is free, and a validation error if the path is already attached.
    pub fn reserve(
        &mut self,
        hosting_system: &HostingSystemId,
        host_path: &Path,
    ) -> StrataResult<AttachmentLocation> {
        if let Ok(existing) = self.find(host_path) {
            return Err(StrataError::validation(format!(
                "{} is already attached at {existing}",
                host_path.display()
            )));
        }

        let location = self
            .next_free()
            .ok_or_else(|| StrataError::ResourceExhausted {
                resource: "attachment slot".to_string(),
                hosting_system: hosting_system.to_string(),
            })?;

        if location.controller >= USABLE_CONTROLLERS {
            return Err(StrataError::TooManyAttachments {
                controller: location.controller,
            });
        }

        self.mark(location, host_path)?;
        Ok(location)
    }

    /// Record `host_path` at `location`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `location` is outside the table.
    pub fn mark(&mut self, location: AttachmentLocation, host_path: &Path) -> StrataResult<()> {
        let slot = self
            .host_paths
            .get_mut(location.controller)
            .and_then(|slots| slots.get_mut(location.slot))
            .ok_or_else(|| {
                StrataError::validation(format!(
                    "attachment location {location} is outside {CONTROLLER_COUNT}x{SLOTS_PER_CONTROLLER}"
                ))
            })?;
        *slot = Some(host_path.to_path_buf());
        Ok(())
    }

    /// Free `location`.
    pub fn clear(&mut self, location: AttachmentLocation) {
        if let Some(slot) = self
            .host_paths
            .get_mut(location.controller)
            .and_then(|slots| slots.get_mut(location.slot))
        {
            *slot = None;
        }
    }
}

/// Allocates block attachment slots in one hosting system.
#[derive(Debug)]
pub struct AttachmentAllocator {
    hosting_system: HostingSystemId,
    control: Arc<dyn ControlPlane>,
    table: Mutex<AttachmentTable>,
}

impl AttachmentAllocator {
    /// Create an allocator over `table`.
    pub fn new(
        hosting_system: HostingSystemId,
        control: Arc<dyn ControlPlane>,
        table: AttachmentTable,
    ) -> Self {
        Self {
            hosting_system,
            control,
            table: Mutex::new(table),
        }
    }

    /// Lock the table for a sequence of operations.
    pub async fn lock(&self) -> LockedAttachments<'_> {
        LockedAttachments {
            allocator: self,
            table: self.table.lock().await,
        }
    }

    /// Attach `host_path` at the first free slot and map it at `container_path`.
    ///
    /// # Errors
    ///
    /// - [`StrataError::TooManyAttachments`] when controller 0 is full, even if
    ///   a later controller still has free slots. The guest cannot map those.
    /// - [`StrataError::ResourceExhausted`] when every slot on every controller
    ///   is taken.
    /// - The control plane's error if the add fails. The slot is free again.
    /// - A validation error if `host_path` is already attached.
    pub async fn allocate(
        &self,
        host_path: &Path,
        container_path: &str,
    ) -> StrataResult<AttachmentLocation> {
        self.lock().await.allocate(host_path, container_path).await
    }

    /// Detach the disk at `location`.
    ///
    /// # Errors
    ///
    /// See [`LockedAttachments::release`].
    pub async fn release(
        &self,
        location: AttachmentLocation,
        container_path: Option<&str>,
    ) -> StrataResult<()> {
        self.lock().await.release(location, container_path).await
    }

    /// Where `host_path` is attached.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] if it is not attached.
    pub async fn find_by_path(&self, host_path: &Path) -> StrataResult<AttachmentLocation> {
        self.table.lock().await.find(host_path)
    }

    /// Roll back an attachment made earlier in a failing operation.
    ///
    /// Takes the lock itself, so it must not be called while a
    /// [`LockedAttachments`] from this allocator is alive.
    pub async fn release_on_failure(
        &self,
        location: AttachmentLocation,
        container_path: Option<&str>,
    ) {
        if let Err(e) = self.release(location, container_path).await {
            tracing::warn!(
                hosting_system = %self.hosting_system,
                %location,
                error = %e,
                "Possibly leaked attachment on error removal path"
            );
        }
    }

    /// Copy of the current table.
    pub async fn table(&self) -> AttachmentTable {
        self.table.lock().await.clone()
    }
}

/// Exclusive access to an [`AttachmentAllocator`]'s table.
///
/// Every method here runs with the table lock already held.
#[derive(Debug)]
pub struct LockedAttachments<'a> {
    allocator: &'a AttachmentAllocator,
    table: MutexGuard<'a, AttachmentTable>,
}

impl LockedAttachments<'_> {
    /// Reserve a slot for `host_path` and hot-add it, mapped at `container_path`.
    ///
    /// The reservation is undone if the environment rejects the add.
    ///
    /// # Errors
    ///
    /// Fails with [`StrataError::TooManyAttachments`] when controller 0 has no
    /// free slot but a later controller does, with
    /// [`StrataError::ResourceExhausted`] when no slot is free anywhere, or with
    /// the control plane's error if the add fails.
    pub async fn allocate(
        &mut self,
        host_path: &Path,
        container_path: &str,
    ) -> StrataResult<AttachmentLocation> {
        let location = self
            .table
            .reserve(&self.allocator.hosting_system, host_path)?;

        let request = ModifyRequest::AddAttachment {
            location,
            disk_path: host_path.to_path_buf(),
            mapped: mapped_directory(location, container_path),
        };

        if let Err(e) = self.allocator.control.modify(&request).await {
            self.table.clear(location);
            return Err(e);
        }

        tracing::debug!(
            hosting_system = %self.allocator.hosting_system,
            %location,
            disk = %host_path.display(),
            container_path,
            "Attached scratch disk"
        );
        Ok(location)
    }

    /// Hot-remove the disk at `location`, unmapping `container_path` in the guest
    /// if given.
    ///
    /// The slot is freed whether or not the environment accepts the removal.
    ///
    /// # Errors
    ///
    /// Returns the control plane's error if the removal fails.
    pub async fn release(
        &mut self,
        location: AttachmentLocation,
        container_path: Option<&str>,
    ) -> StrataResult<()> {
        let request = ModifyRequest::RemoveAttachment {
            location,
            mapped: container_path.map(|path| mapped_directory(location, path)),
        };

        let result = self.allocator.control.modify(&request).await;
        self.table.clear(location);

        tracing::debug!(
            hosting_system = %self.allocator.hosting_system,
            %location,
            removed = result.is_ok(),
            "Released attachment slot"
        );
        result
    }

    /// Where `host_path` is attached.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] if it is not attached.
    pub fn find_by_path(&self, host_path: &Path) -> StrataResult<AttachmentLocation> {
        self.table.find(host_path)
    }
}

fn mapped_directory(location: AttachmentLocation, container_path: &str) -> MappedDirectory {
    MappedDirectory {
        container_path: container_path.to_string(),
        lun: u8::try_from(location.slot).unwrap_or(u8::MAX),
    }
}
