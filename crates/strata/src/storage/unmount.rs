//! Unmounting layer stacks.
//!
//! Teardown is best effort: every requested step runs even when an earlier one
//! fails, and the failures come back together.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use strata_common::{CleanupErrors, LayerGuid, StrataError, StrataResult};

use super::hosting::HostingSystem;
use super::layer::LayerStack;
use super::mount::LayerMounter;
use crate::control::ModifyRequest;

bitflags! {
    /// Which parts of a hosted mount to tear down.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UnmountScope: u32 {
        /// Tear down the guest union and detach the scratch disk.
        const DETACH_SCRATCH = 0x1;
        /// Drop this workload's references on the read-only layer shares.
        const RELEASE_SHARES = 0x2;
        /// Everything.
        const ALL = Self::DETACH_SCRATCH.bits() | Self::RELEASE_SHARES.bits();
    }
}

impl Default for UnmountScope {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for UnmountScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if *self == Self::ALL {
            "all"
        } else if *self == Self::DETACH_SCRATCH {
            "scratch"
        } else if *self == Self::RELEASE_SHARES {
            "shares"
        } else {
            "none"
        };
        f.write_str(name)
    }
}

impl FromStr for UnmountScope {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scratch" => Ok(Self::DETACH_SCRATCH),
            "shares" => Ok(Self::RELEASE_SHARES),
            "all" => Ok(Self::ALL),
            other => Err(StrataError::validation(format!(
                "unknown unmount scope '{other}', expected scratch, shares or all"
            ))),
        }
    }
}

impl LayerMounter {
    /// Unmount `stack` from the host, or from `hosting` when given.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unusable stack or scope. Otherwise
    /// every step in `scope` is attempted and the failures are returned
    /// together as [`StrataError::Cleanup`]. The caller may treat the
    /// resources as released either way.
    pub async fn unmount(
        &self,
        stack: &LayerStack,
        hosting: Option<&HostingSystem>,
        scope: UnmountScope,
    ) -> StrataResult<()> {
        match hosting {
            None => self.unmount_direct(stack, scope),
            Some(hosting) => self.unmount_hosted(stack, hosting, scope).await,
        }
    }

    fn unmount_direct(&self, stack: &LayerStack, scope: UnmountScope) -> StrataResult<()> {
        if scope != UnmountScope::ALL {
            return Err(StrataError::validation(format!(
                "host unmount only supports the full scope, got '{scope}'"
            )));
        }
        let scratch = stack.scratch();

        let unprepared = self.driver.unprepare(scratch);
        let deactivated = self.driver.deactivate(scratch);
        if let (Err(_), Err(e)) = (&unprepared, &deactivated) {
            tracing::warn!(layer = %scratch.display(), error = %e, "Failed to deactivate layer");
        }
        unprepared.and(deactivated)?;

        tracing::info!(layer = %scratch.display(), "Unmounted layers from host");
        Ok(())
    }

    async fn unmount_hosted(
        &self,
        stack: &LayerStack,
        hosting: &HostingSystem,
        scope: UnmountScope,
    ) -> StrataResult<()> {
        stack.require(2, "unmounting from a hosting system")?;

        let mut errors = CleanupErrors::new(format!("unmount from {}", hosting.id()));

        if scope.contains(UnmountScope::DETACH_SCRATCH) {
            self.detach_scratch(stack, hosting, &mut errors).await;
        }
        if scope.contains(UnmountScope::RELEASE_SHARES) {
            release_shares(stack, hosting, &mut errors).await;
        }

        tracing::info!(
            hosting_system = %hosting.id(),
            scratch = %stack.scratch().display(),
            %scope,
            failures = errors.len(),
            "Unmounted layers from hosting system"
        );
        errors.into_result()
    }

    async fn detach_scratch(
        &self,
        stack: &LayerStack,
        hosting: &HostingSystem,
        errors: &mut CleanupErrors,
    ) {
        let container_root = errors
            .record(stack.scratch_guid().inspect_err(|e| {
                tracing::warn!(
                    scratch = %stack.scratch().display(),
                    error = %e,
                    "May leak a scratch union, no identifier for the scratch folder"
                );
            }))
            .map(|guid| hosting.layout().container_root(&guid));

        if let Some(root) = &container_root {
            let request = ModifyRequest::RemoveUnion {
                container_root_path: root.clone(),
            };
            if let Err(e) = hosting.control().modify(&request).await {
                tracing::error!(
                    hosting_system = %hosting.id(),
                    container_root = %root,
                    error = %e,
                    "Failed to tear down union filesystem"
                );
            }
        }

        let scratch_disk = stack.scratch_disk(&self.scratch_disk_name);
        let mut attachments = hosting.attachments().lock().await;
        match attachments.find_by_path(&scratch_disk) {
            Ok(location) => {
                let released = attachments
                    .release(location, container_root.as_deref())
                    .await
                    .inspect_err(|e| {
                        tracing::warn!(
                            hosting_system = %hosting.id(),
                            disk = %scratch_disk.display(),
                            %location,
                            error = %e,
                            "Failed to detach scratch disk"
                        );
                    });
                errors.record(released);
            }
            Err(_) => {
                tracing::warn!(
                    hosting_system = %hosting.id(),
                    disk = %scratch_disk.display(),
                    "Scratch disk is not attached, likely already removed"
                );
            }
        }
    }
}

async fn release_shares(stack: &LayerStack, hosting: &HostingSystem, errors: &mut CleanupErrors) {
    let mut shares = hosting.shares().lock().await;
    for layer in stack.read_only() {
        let Some(guid) = errors.record(LayerGuid::from_folder(layer).inspect_err(|e| {
            tracing::warn!(layer = %layer.display(), error = %e, "May have leaked a share");
        })) else {
            continue;
        };

        let released = shares.release(guid).await.inspect_err(|e| {
            tracing::warn!(
                hosting_system = %hosting.id(),
                layer = %layer.display(),
                share = %guid,
                error = %e,
                "Failed to release share"
            );
        });
        if let Some(ref_count) = errors.record(released) {
            tracing::debug!(layer = %layer.display(), share = %guid, ref_count, "Share released");
        }
    }
}
