//! OverlayFS layer driver for direct host mounts.

use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};

use super::driver::LayerDriver;

/// OverlayFS configuration for one scratch layer.
#[derive(Debug, Clone)]
pub struct OverlayMount {
    /// Lower directories (read-only layers), topmost first.
    pub lower_dirs: Vec<PathBuf>,
    /// Upper directory (writable layer).
    pub upper_dir: PathBuf,
    /// Work directory (required by overlayfs).
    pub work_dir: PathBuf,
    /// Merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayMount {
    /// Layout inside a scratch folder, stacking `parents` (base first).
    #[must_use]
    pub fn for_scratch(scratch: &Path, parents: &[PathBuf]) -> Self {
        Self {
            lower_dirs: parents.iter().rev().cloned().collect(),
            upper_dir: scratch.join("upper"),
            work_dir: scratch.join("work"),
            merged_dir: scratch.join("rootfs"),
        }
    }

    /// Create necessary directories.
    pub fn create_dirs(&self) -> StrataResult<()> {
        std::fs::create_dir_all(&self.upper_dir)?;
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::create_dir_all(&self.merged_dir)?;
        Ok(())
    }

    /// Get the mount options string.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower,
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }

    /// Mount the overlay filesystem.
    #[cfg(target_os = "linux")]
    pub fn mount(&self) -> StrataResult<()> {
        use rustix::mount::{MountFlags, mount};
        use std::ffi::CString;

        if self.lower_dirs.is_empty() {
            return Err(StrataError::validation(
                "overlay mount needs at least one lower layer",
            ));
        }

        let options = self.mount_options();

        tracing::debug!(
            merged = %self.merged_dir.display(),
            options = %options,
            "Mounting overlayfs"
        );

        let fstype = c"overlay";
        let options_c = CString::new(options.as_str()).map_err(|_| StrataError::Config {
            message: "Invalid overlay options (contains null byte)".to_string(),
        })?;

        mount(
            "overlay",
            &self.merged_dir,
            fstype,
            MountFlags::empty(),
            options_c.as_c_str(),
        )
        .map_err(|e| driver_error("prepare", &self.merged_dir, &e))?;

        tracing::info!(merged = %self.merged_dir.display(), "OverlayFS mounted successfully");
        Ok(())
    }

    /// Mount the overlay filesystem.
    #[cfg(not(target_os = "linux"))]
    pub fn mount(&self) -> StrataResult<()> {
        Err(StrataError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }

    /// Unmount the overlay filesystem.
    #[cfg(target_os = "linux")]
    pub fn unmount(&self) -> StrataResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(merged = %self.merged_dir.display(), "Unmounting overlayfs");

        unmount(&self.merged_dir, UnmountFlags::DETACH)
            .map_err(|e| driver_error("unprepare", &self.merged_dir, &e))?;

        tracing::info!(merged = %self.merged_dir.display(), "OverlayFS unmounted successfully");
        Ok(())
    }

    /// Unmount the overlay filesystem.
    #[cfg(not(target_os = "linux"))]
    pub fn unmount(&self) -> StrataResult<()> {
        Err(StrataError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }
}

/// Mounts layer stacks on the host with OverlayFS.
///
/// The scratch folder holds `upper`, `work` and the merged `rootfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayLayerDriver;

impl OverlayLayerDriver {
    /// Create the driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LayerDriver for OverlayLayerDriver {
    fn activate(&self, layer: &Path) -> StrataResult<()> {
        OverlayMount::for_scratch(layer, &[])
            .create_dirs()
            .map_err(|e| driver_error("activate", layer, &e))?;
        tracing::debug!(layer = %layer.display(), "Activated scratch layer");
        Ok(())
    }

    fn prepare(&self, layer: &Path, parents: &[PathBuf]) -> StrataResult<()> {
        OverlayMount::for_scratch(layer, parents).mount()
    }

    fn mount_path(&self, layer: &Path) -> StrataResult<PathBuf> {
        let merged = OverlayMount::for_scratch(layer, &[]).merged_dir;
        if !merged.is_dir() {
            return Err(StrataError::NotFound {
                resource: format!("mount path {}", merged.display()),
            });
        }
        Ok(merged)
    }

    fn unprepare(&self, layer: &Path) -> StrataResult<()> {
        OverlayMount::for_scratch(layer, &[]).unmount()
    }

    fn deactivate(&self, layer: &Path) -> StrataResult<()> {
        let work = OverlayMount::for_scratch(layer, &[]).work_dir;
        match std::fs::remove_dir_all(&work) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(driver_error("deactivate", layer, &e)),
        }
        tracing::debug!(layer = %layer.display(), "Deactivated scratch layer");
        Ok(())
    }
}

fn driver_error(operation: &str, layer: &Path, err: &dyn std::fmt::Display) -> StrataError {
    StrataError::LayerDriver {
        operation: operation.to_string(),
        layer: layer.display().to_string(),
        message: err.to_string(),
    }
}
