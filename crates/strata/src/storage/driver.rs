//! Host layer driver seam.

use std::fmt;
use std::path::{Path, PathBuf};

use strata_common::StrataResult;

/// Per-layer primitives used to mount a layer stack directly on the host.
///
/// `layer` is always the scratch layer folder; `parents` are the read-only
/// layers beneath it, base first.
pub trait LayerDriver: Send + Sync + fmt::Debug {
    /// Make the scratch layer usable.
    fn activate(&self, layer: &Path) -> StrataResult<()>;

    /// Stack `parents` beneath the scratch layer.
    fn prepare(&self, layer: &Path, parents: &[PathBuf]) -> StrataResult<()>;

    /// Host path of the merged view.
    fn mount_path(&self, layer: &Path) -> StrataResult<PathBuf>;

    /// Undo [`Self::prepare`].
    fn unprepare(&self, layer: &Path) -> StrataResult<()>;

    /// Undo [`Self::activate`].
    fn deactivate(&self, layer: &Path) -> StrataResult<()>;
}
