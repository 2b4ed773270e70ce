//! Ordered layer stacks.

use std::path::{Path, PathBuf};

use strata_common::{LayerGuid, StrataError, StrataResult};

/// Folder inside a layer that holds a utility VM image.
pub const UTILITY_VM_FOLDER: &str = "UtilityVM";

/// An ordered stack of layer folders: base first, scratch last.
///
/// Every entry but the last is read-only. The last entry is the workload's
/// mutable scratch layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStack {
    layers: Vec<PathBuf>,
}

impl LayerStack {
    /// Create a stack from folders ordered base to scratch.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack is empty.
    pub fn new<I, P>(layers: I) -> StrataResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let layers: Vec<PathBuf> = layers.into_iter().map(Into::into).collect();
        if layers.is_empty() {
            return Err(StrataError::validation("layer stack is empty"));
        }
        Ok(Self { layers })
    }

    /// Number of layers including scratch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Always false; a stack holds at least the scratch layer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// All layers, base first.
    #[must_use]
    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// The read-only layers, base first.
    #[must_use]
    pub fn read_only(&self) -> &[PathBuf] {
        &self.layers[..self.layers.len() - 1]
    }

    /// The scratch layer.
    #[must_use]
    pub fn scratch(&self) -> &Path {
        &self.layers[self.layers.len() - 1]
    }

    /// Identifier of the scratch layer folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the scratch folder has no usable leaf name.
    pub fn scratch_guid(&self) -> StrataResult<LayerGuid> {
        LayerGuid::from_folder(self.scratch())
    }

    /// Host path of the scratch disk inside the scratch folder.
    #[must_use]
    pub fn scratch_disk(&self, disk_name: &str) -> PathBuf {
        self.scratch().join(disk_name)
    }

    /// Fail unless the stack holds at least `min` layers.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming `purpose` when the stack is too short.
    pub fn require(&self, min: usize, purpose: &str) -> StrataResult<()> {
        if self.layers.len() < min {
            return Err(StrataError::validation(format!(
                "{purpose} needs at least {min} layers, got {}",
                self.layers.len()
            )));
        }
        Ok(())
    }

    /// The base-most layer that carries a utility VM image.
    ///
    /// # Errors
    ///
    /// Returns an error if no layer has one, or a layer cannot be inspected.
    pub fn utility_vm_folder(&self) -> StrataResult<&Path> {
        for layer in &self.layers {
            match std::fs::metadata(layer.join(UTILITY_VM_FOLDER)) {
                Ok(_) => {
                    tracing::debug!(layer = %layer.display(), "Found utility VM folder");
                    return Ok(layer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(StrataError::validation(
            "utility VM folder could not be found in layers",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_read_only_and_scratch() {
        let stack = LayerStack::new(["/l/base", "/l/ro1", "/l/scratch"]).unwrap();
        assert_eq!(stack.len(), 3);
        assert_eq!(
            stack.read_only(),
            &[PathBuf::from("/l/base"), PathBuf::from("/l/ro1")]
        );
        assert_eq!(stack.scratch(), Path::new("/l/scratch"));
        assert_eq!(stack.scratch_guid().unwrap(), LayerGuid::derive("scratch"));
        assert_eq!(
            stack.scratch_disk("sandbox.vhdx"),
            PathBuf::from("/l/scratch/sandbox.vhdx")
        );
    }

    #[test]
    fn single_layer_is_only_scratch() {
        let stack = LayerStack::new(["/l/scratch"]).unwrap();
        assert!(stack.read_only().is_empty());
        assert!(stack.require(1, "unmount").is_ok());
        assert!(stack.require(2, "mount").is_err());
    }

    #[test]
    fn empty_stack_is_rejected() {
        let err = LayerStack::new(Vec::<PathBuf>::new()).unwrap_err();
        assert!(matches!(err, StrataError::Validation { .. }));
    }

    #[test]
    fn finds_base_most_utility_vm_folder() {
        let temp = tempfile::tempdir().unwrap();
        let base = temp.path().join("base");
        let ro1 = temp.path().join("ro1");
        let scratch = temp.path().join("scratch");
        std::fs::create_dir_all(base.join(UTILITY_VM_FOLDER)).unwrap();
        std::fs::create_dir_all(ro1.join(UTILITY_VM_FOLDER)).unwrap();
        std::fs::create_dir_all(&scratch).unwrap();

        let stack = LayerStack::new([base.clone(), ro1, scratch]).unwrap();
        assert_eq!(stack.utility_vm_folder().unwrap(), base.as_path());
    }

    #[test]
    fn missing_utility_vm_folder() {
        let temp = tempfile::tempdir().unwrap();
        let stack = LayerStack::new([temp.path().join("base"), temp.path().join("scratch")])
            .unwrap();
        assert!(stack.utility_vm_folder().is_err());
    }
}
