//! Mounting layer stacks on the host or into a hosting system.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use strata_common::{LayerGuid, StrataError, StrataResult};
use tokio::sync::oneshot;

use super::driver::LayerDriver;
use super::hosting::HostingSystem;
use super::layer::LayerStack;
use super::share::ShareRegistry;
use super::unmount::UnmountScope;
use crate::config::StorageConfig;
use crate::control::{CombinedLayers, LayerReference, ModifyRequest};

/// Where a mounted layer stack can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountedLayers {
    /// Merged view on the host.
    Host(PathBuf),
    /// Union filesystem inside a hosting system.
    Hosted(CombinedLayers),
}

impl MountedLayers {
    /// Host mount path, for direct mounts.
    #[must_use]
    pub fn host_path(&self) -> Option<&Path> {
        match self {
            Self::Host(path) => Some(path),
            Self::Hosted(_) => None,
        }
    }

    /// Guest union description, for hosted mounts.
    #[must_use]
    pub const fn combined_layers(&self) -> Option<&CombinedLayers> {
        match self {
            Self::Host(_) => None,
            Self::Hosted(combined) => Some(combined),
        }
    }
}

/// Drives mount and unmount of layer stacks.
///
/// Direct mounts go through the [`LayerDriver`]. Hosted mounts go through the
/// hosting system's share registry, attachment allocator and control plane.
#[derive(Debug, Clone)]
pub struct LayerMounter {
    pub(super) driver: Arc<dyn LayerDriver>,
    pub(super) scratch_disk_name: String,
}

impl LayerMounter {
    /// Create a mounter using `driver` for direct mounts.
    pub fn new(driver: Arc<dyn LayerDriver>, scratch_disk_name: impl Into<String>) -> Self {
        Self {
            driver,
            scratch_disk_name: scratch_disk_name.into(),
        }
    }

    /// Create a mounter with the configured scratch disk name.
    pub fn from_config(config: &StorageConfig, driver: Arc<dyn LayerDriver>) -> Self {
        Self::new(driver, config.scratch_disk_name.clone())
    }

    /// Mount `stack` on the host, or into `hosting` when given.
    ///
    /// Everything this call provisioned is rolled back before an error is
    /// returned. A hosted mount whose future is dropped before it resolves is
    /// rolled back in the background.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a stack shorter than two layers, and
    /// otherwise the first failure of the layer driver or control plane.
    pub async fn mount(
        &self,
        stack: &LayerStack,
        hosting: Option<&HostingSystem>,
    ) -> StrataResult<MountedLayers> {
        match hosting {
            None => self.mount_direct(stack).map(MountedLayers::Host),
            Some(hosting) => self
                .mount_hosted(stack, hosting)
                .await
                .map(MountedLayers::Hosted),
        }
    }

    fn mount_direct(&self, stack: &LayerStack) -> StrataResult<PathBuf> {
        stack.require(2, "mounting on the host")?;
        let scratch = stack.scratch();

        tracing::debug!(layer = %scratch.display(), layers = stack.len(), "Mounting on host");

        self.driver.activate(scratch)?;

        if let Err(e) = self.driver.prepare(scratch, stack.read_only()) {
            if let Err(cleanup) = self.driver.deactivate(scratch) {
                tracing::warn!(layer = %scratch.display(), error = %cleanup, "Failed to deactivate layer");
            }
            return Err(e);
        }

        let mount_path = match self.driver.mount_path(scratch) {
            Ok(path) => path,
            Err(e) => {
                if let Err(cleanup) = self.driver.unprepare(scratch) {
                    tracing::warn!(layer = %scratch.display(), error = %cleanup, "Failed to unprepare layer");
                }
                if let Err(cleanup) = self.driver.deactivate(scratch) {
                    tracing::warn!(layer = %scratch.display(), error = %cleanup, "Failed to deactivate layer");
                }
                return Err(e);
            }
        };

        tracing::info!(
            layer = %scratch.display(),
            mount_path = %mount_path.display(),
            "Mounted layers on host"
        );
        Ok(mount_path)
    }

    /// Provisioning runs on its own task so that it always finishes or rolls
    /// back, whatever happens to the caller. A mount that succeeds after the
    /// caller has gone is torn down again.
    async fn mount_hosted(
        &self,
        stack: &LayerStack,
        hosting: &HostingSystem,
    ) -> StrataResult<CombinedLayers> {
        let (tx, rx) = oneshot::channel();
        let mounter = self.clone();
        let stack = stack.clone();
        let hosting = hosting.clone();

        tokio::spawn(async move {
            let result = mounter.provision_hosted(&stack, &hosting).await;
            if let Err(Ok(combined)) = tx.send(result) {
                tracing::warn!(
                    hosting_system = %hosting.id(),
                    container_root = %combined.container_root_path,
                    "Mount was abandoned by its caller, unmounting"
                );
                if let Err(e) = mounter
                    .unmount(&stack, Some(&hosting), UnmountScope::ALL)
                    .await
                {
                    tracing::warn!(
                        hosting_system = %hosting.id(),
                        container_root = %combined.container_root_path,
                        error = %e,
                        "Possibly leaked resources of an abandoned mount"
                    );
                }
            }
        });

        rx.await.map_err(|_| StrataError::Internal {
            message: "hosted mount task ended without a result".to_string(),
        })?
    }

    async fn provision_hosted(
        &self,
        stack: &LayerStack,
        hosting: &HostingSystem,
    ) -> StrataResult<CombinedLayers> {
        stack.require(2, "mounting into a hosting system")?;

        let read_only = stack
            .read_only()
            .iter()
            .map(|layer| LayerGuid::from_folder(layer).map(|guid| (guid, layer.as_path())))
            .collect::<StrataResult<Vec<_>>>()?;
        let scratch_guid = stack.scratch_guid()?;

        tracing::debug!(
            hosting_system = %hosting.id(),
            scratch = %stack.scratch().display(),
            layers = stack.len(),
            "Mounting into hosting system"
        );

        let mut acquired = Vec::with_capacity(read_only.len());
        if let Err(e) = acquire_shares(hosting.shares(), &read_only, &mut acquired).await {
            hosting.shares().release_on_failure(&acquired).await;
            return Err(e);
        }

        let container_root = hosting.layout().container_root(&scratch_guid);
        let scratch_disk = stack.scratch_disk(&self.scratch_disk_name);
        let location = match hosting
            .attachments()
            .allocate(&scratch_disk, &container_root)
            .await
        {
            Ok(location) => location,
            Err(e) => {
                hosting.shares().release_on_failure(&acquired).await;
                return Err(e);
            }
        };

        let combined = CombinedLayers {
            container_root_path: container_root,
            layers: read_only
                .iter()
                .map(|(guid, _)| LayerReference {
                    id: *guid,
                    path: hosting.layout().share_path(guid),
                })
                .collect(),
        };

        if let Err(e) = hosting
            .control()
            .modify(&ModifyRequest::AddUnion(combined.clone()))
            .await
        {
            hosting.shares().release_on_failure(&acquired).await;
            hosting
                .attachments()
                .release_on_failure(location, Some(combined.container_root_path.as_str()))
                .await;
            return Err(e);
        }

        tracing::info!(
            hosting_system = %hosting.id(),
            container_root = %combined.container_root_path,
            %location,
            shares = acquired.len(),
            "Mounted layers into hosting system"
        );
        Ok(combined)
    }
}

/// Take a share reference on every read-only layer under one registry lock.
///
/// `acquired` receives each layer as it succeeds, so that a caller can undo
/// exactly those once the lock is released.
async fn acquire_shares(
    shares: &ShareRegistry,
    layers: &[(LayerGuid, &Path)],
    acquired: &mut Vec<LayerGuid>,
) -> StrataResult<()> {
    let mut locked = shares.lock().await;
    for (guid, path) in layers {
        let ref_count = locked.acquire(*guid, path).await?;
        acquired.push(*guid);
        tracing::debug!(layer = %path.display(), share = %guid, ref_count, "Share acquired");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuestLayout;
    use crate::control::{RecordingControlPlane, RequestType, ResourceKind};
    use crate::storage::attachment::SLOTS_PER_CONTROLLER;
    use crate::storage::testing::ScriptedDriver;
    use strata_common::{HostingSystemId, StrataError};

    fn stack() -> LayerStack {
        LayerStack::new(["/l/base", "/l/ro1", "/l/scratch"]).unwrap()
    }

    fn hosting() -> (Arc<RecordingControlPlane>, HostingSystem) {
        let control = Arc::new(RecordingControlPlane::new("uvm"));
        let hosting = HostingSystem::new(
            HostingSystemId::new("uvm").unwrap(),
            control.clone(),
            GuestLayout::default(),
        );
        (control, hosting)
    }

    fn mounter(driver: Arc<ScriptedDriver>) -> LayerMounter {
        LayerMounter::new(driver, "sandbox.vhdx")
    }

    #[tokio::test]
    async fn direct_mount_returns_driver_path() {
        let driver = Arc::new(ScriptedDriver::default());
        let mounted = mounter(driver.clone()).mount(&stack(), None).await.unwrap();

        assert_eq!(mounted.host_path(), Some(Path::new("/l/scratch/rootfs")));
        assert_eq!(driver.calls(), ["activate", "prepare", "mount_path"]);
    }

    #[tokio::test]
    async fn direct_mount_deactivates_after_failed_prepare() {
        let driver = Arc::new(ScriptedDriver::failing(&["prepare"]));
        let err = mounter(driver.clone()).mount(&stack(), None).await.unwrap_err();

        assert!(matches!(err, StrataError::LayerDriver { ref operation, .. } if operation == "prepare"));
        assert_eq!(driver.calls(), ["activate", "prepare", "deactivate"]);
    }

    #[tokio::test]
    async fn direct_mount_unwinds_after_failed_mount_path() {
        let driver = Arc::new(ScriptedDriver::failing(&["mount_path"]));
        let err = mounter(driver.clone()).mount(&stack(), None).await.unwrap_err();

        assert!(matches!(err, StrataError::LayerDriver { ref operation, .. } if operation == "mount_path"));
        assert_eq!(
            driver.calls(),
            ["activate", "prepare", "mount_path", "unprepare", "deactivate"]
        );
    }

    #[tokio::test]
    async fn single_layer_is_rejected() {
        let driver = Arc::new(ScriptedDriver::default());
        let (control, hosting) = hosting();
        let stack = LayerStack::new(["/l/scratch"]).unwrap();

        let direct = mounter(driver.clone()).mount(&stack, None).await;
        assert!(matches!(direct, Err(StrataError::Validation { .. })));
        let hosted = mounter(driver.clone()).mount(&stack, Some(&hosting)).await;
        assert!(matches!(hosted, Err(StrataError::Validation { .. })));

        assert!(driver.calls().is_empty());
        assert!(control.attempts().is_empty());
    }

    #[tokio::test]
    async fn hosted_mount_assembles_union() {
        let (control, hosting) = hosting();
        let mounted = mounter(Arc::new(ScriptedDriver::default()))
            .mount(&stack(), Some(&hosting))
            .await
            .unwrap();

        let combined = mounted.combined_layers().unwrap();
        let scratch = LayerGuid::derive("scratch");
        let base = LayerGuid::derive("base");
        assert_eq!(combined.container_root_path, format!(r"C:\{scratch}"));
        assert_eq!(combined.layers.len(), 2);
        assert_eq!(combined.layers[0].id, base);
        assert!(combined.layers[0].path.ends_with(&base.to_string()));

        let kinds: Vec<_> = control
            .applied()
            .iter()
            .map(ModifyRequest::resource_kind)
            .collect();
        assert_eq!(
            kinds,
            [
                ResourceKind::RemoteShare,
                ResourceKind::RemoteShare,
                ResourceKind::BlockAttachment,
                ResourceKind::UnionFilesystem,
            ]
        );

        let attachments = hosting.attachments().table().await;
        assert_eq!(
            attachments.host_path(crate::control::AttachmentLocation::new(0, 0)),
            Some(Path::new("/l/scratch/sandbox.vhdx"))
        );
    }

    #[tokio::test]
    async fn failed_share_add_releases_earlier_shares() {
        let (control, hosting) = hosting();
        let ro1 = LayerGuid::derive("ro1");
        control.fail_when(move |request| {
            matches!(request, ModifyRequest::AddShare(settings) if settings.name == ro1)
        });

        let err = mounter(Arc::new(ScriptedDriver::default()))
            .mount(&stack(), Some(&hosting))
            .await
            .unwrap_err();

        assert!(matches!(err, StrataError::ControlPlane { .. }));
        assert!(hosting.shares().table().await.is_empty());
        assert_eq!(control.count(ResourceKind::RemoteShare, RequestType::Remove), 1);
        assert_eq!(control.count(ResourceKind::BlockAttachment, RequestType::Add), 0);
    }

    #[tokio::test]
    async fn failed_attachment_releases_shares() {
        let (control, hosting) = hosting();
        control.fail_on(ResourceKind::BlockAttachment, RequestType::Add);

        let before = hosting.snapshot().await;
        let err = mounter(Arc::new(ScriptedDriver::default()))
            .mount(&stack(), Some(&hosting))
            .await
            .unwrap_err();

        assert!(matches!(err, StrataError::ControlPlane { .. }));
        assert_eq!(hosting.snapshot().await, before);
        assert_eq!(control.count(ResourceKind::RemoteShare, RequestType::Remove), 2);
    }

    #[tokio::test]
    async fn full_controller_reports_too_many_attachments() {
        let (control, hosting) = hosting();
        {
            let mut attachments = hosting.attachments().lock().await;
            for slot in 0..SLOTS_PER_CONTROLLER {
                attachments
                    .allocate(&PathBuf::from(format!("/other/{slot}.vhdx")), "guest")
                    .await
                    .unwrap();
            }
        }
        let adds_before = control.count(ResourceKind::BlockAttachment, RequestType::Add);

        let err = mounter(Arc::new(ScriptedDriver::default()))
            .mount(&stack(), Some(&hosting))
            .await
            .unwrap_err();

        assert!(matches!(err, StrataError::TooManyAttachments { controller: 1 }));
        assert_eq!(
            control.count(ResourceKind::BlockAttachment, RequestType::Add),
            adds_before
        );
        assert!(hosting.shares().table().await.is_empty());
    }
}
