//! Utility VM creation documents.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;
use strata_common::{HostingSystemId, StrataError, StrataResult};

use crate::config::UtilityVmDefaults;
use crate::control::ShareFlags;

/// UEFI boot loader inside the utility VM image.
const BOOT_DEVICE_PATH: &str = r"\EFI\Microsoft\Boot\bootmgfw.efi";

/// What a utility VM is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilityVmSpec {
    /// Hosting system ID.
    pub id: HostingSystemId,
    /// Owner recorded on the VM.
    pub owner: String,
    /// Folder holding the VM's own scratch disk. Exactly one is allowed.
    pub layer_folders: Vec<PathBuf>,
    /// Utility VM image folder shared into the VM as its OS.
    pub image_path: PathBuf,
    /// Startup memory in MB, or the configured default.
    pub memory_mb: Option<u64>,
    /// Virtual processors, or the configured default.
    pub processors: Option<u32>,
}

impl UtilityVmSpec {
    /// Spec for a VM with its scratch disk in `layer_folder` booting `image_path`.
    pub fn new(
        id: HostingSystemId,
        layer_folder: impl Into<PathBuf>,
        image_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            owner: "strata".to_string(),
            id,
            layer_folders: vec![layer_folder.into()],
            image_path: image_path.into(),
            memory_mb: None,
            processors: None,
        }
    }

    /// Check the settings describe a creatable VM.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first problem found.
    pub fn validate(&self) -> StrataResult<()> {
        if self.layer_folders.len() != 1 {
            return Err(StrataError::validation(
                "a hosting system needs exactly one layer folder, holding its scratch disk",
            ));
        }
        if self.image_path.as_os_str().is_empty() {
            return Err(StrataError::validation(
                "a hosting system needs a utility VM image path",
            ));
        }
        if self.memory_mb == Some(0) {
            return Err(StrataError::validation("memory must be non-zero"));
        }
        if self.processors == Some(0) {
            return Err(StrataError::validation("processor count must be non-zero"));
        }
        Ok(())
    }

    /// Host path of the VM's scratch disk.
    #[must_use]
    pub fn scratch_disk(&self, disk_name: &str) -> PathBuf {
        self.layer_folders
            .first()
            .map(|folder| folder.join(disk_name))
            .unwrap_or_default()
    }

    /// Render the VM creation document.
    ///
    /// # Errors
    ///
    /// Returns an error if the VM settings are invalid.
    pub fn document(
        &self,
        defaults: &UtilityVmDefaults,
        scratch_disk_name: &str,
    ) -> StrataResult<serde_json::Value> {
        self.validate()?;

        let host_cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let processors = self.processors.unwrap_or(if host_cpus == 1 {
            1
        } else {
            defaults.processors
        });
        let memory = self.memory_mb.unwrap_or(defaults.memory_mb);

        tracing::debug!(
            hosting_system = %self.id,
            memory_mb = memory,
            processors,
            "Rendering utility VM document"
        );

        Ok(json!({
            "Owner": self.owner,
            "SchemaVersion": { "Major": 2, "Minor": 0 },
            "VirtualMachine": {
                "Chipset": {
                    "Uefi": {
                        "BootThis": {
                            "DevicePath": BOOT_DEVICE_PATH,
                            "DiskNumber": 0,
                            "UefiDevice": "VMBFS",
                        },
                    },
                },
                "ComputeTopology": {
                    "Memory": {
                        "Backing": "Virtual",
                        "Startup": memory,
                        "DirectFileMappingMB": defaults.direct_file_mapping_mb,
                    },
                    "Processor": { "Count": processors },
                },
                "Devices": {
                    "Scsi": {
                        "0": {
                            "Attachments": {
                                "0": {
                                    "Path": self.scratch_disk(scratch_disk_name),
                                    "Type": "VirtualDisk",
                                },
                            },
                        },
                    },
                    "VirtualSmbShares": [{
                        "Name": "os",
                        "Path": self.image_path,
                        "Flags": ShareFlags::read_only_layer().bits(),
                    }],
                    "GuestInterface": { "ConnectToBridge": true },
                },
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> UtilityVmSpec {
        UtilityVmSpec::new(
            HostingSystemId::new("uvm1").unwrap(),
            "/hosting/uvm1",
            "/layers/base/UtilityVM",
        )
    }

    #[test]
    fn document_attaches_own_scratch_disk() {
        let document = spec()
            .document(&UtilityVmDefaults::default(), "sandbox.vhdx")
            .unwrap();

        let devices = &document["VirtualMachine"]["Devices"];
        assert_eq!(
            devices["Scsi"]["0"]["Attachments"]["0"]["Path"],
            "/hosting/uvm1/sandbox.vhdx"
        );
        assert_eq!(devices["VirtualSmbShares"][0]["Name"], "os");
        assert_eq!(
            devices["VirtualSmbShares"][0]["Path"],
            "/layers/base/UtilityVM"
        );
        assert_eq!(
            document["VirtualMachine"]["ComputeTopology"]["Memory"]["Startup"],
            1024
        );
    }

    #[test]
    fn explicit_resources_override_defaults() {
        let mut spec = spec();
        spec.memory_mb = Some(4096);
        spec.processors = Some(8);

        let document = spec
            .document(&UtilityVmDefaults::default(), "sandbox.vhdx")
            .unwrap();
        let topology = &document["VirtualMachine"]["ComputeTopology"];
        assert_eq!(topology["Memory"]["Startup"], 4096);
        assert_eq!(topology["Processor"]["Count"], 8);
    }

    #[test]
    fn rejects_multiple_layer_folders() {
        let mut spec = spec();
        spec.layer_folders.push(PathBuf::from("/another"));
        assert!(matches!(
            spec.validate(),
            Err(StrataError::Validation { .. })
        ));
    }

    #[test]
    fn rejects_missing_image_and_zero_resources() {
        let mut spec = spec();
        spec.image_path = PathBuf::new();
        assert!(spec.validate().is_err());

        let mut spec = self::spec();
        spec.processors = Some(0);
        assert!(spec.validate().is_err());
    }
}
