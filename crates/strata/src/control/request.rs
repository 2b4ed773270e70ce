//! Modify requests sent to a running environment.
//!
//! Each request variant carries exactly the addressing and payload its resource
//! kind needs, so a share removal can never be built with attachment settings.

use std::fmt;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strata_common::{LayerGuid, StrataError};

/// Whether a request adds or removes a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    /// Add a resource to the environment.
    Add,
    /// Remove a resource from the environment.
    Remove,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "Add"),
            Self::Remove => write!(f, "Remove"),
        }
    }
}

/// The kind of resource a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Read-only directory shared from the host into the VM.
    #[serde(rename = "VSmbShare")]
    RemoteShare,
    /// Virtual disk attached to a controller slot.
    #[serde(rename = "MappedVirtualDisk")]
    BlockAttachment,
    /// Guest-side union of shares and a writable attachment.
    #[serde(rename = "CombinedLayers")]
    UnionFilesystem,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteShare => write!(f, "VSmbShare"),
            Self::BlockAttachment => write!(f, "MappedVirtualDisk"),
            Self::UnionFilesystem => write!(f, "CombinedLayers"),
        }
    }
}

bitflags! {
    /// Options applied to a remote share.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShareFlags: u32 {
        /// Guest may not write.
        const READ_ONLY = 0x0000_0001;
        /// Fake oplocks for guest caching.
        const PSEUDO_OPLOCKS = 0x0000_0002;
        /// Allow other readers of the host files.
        const SHARE_READ = 0x0000_0004;
        /// Cache file I/O in the guest.
        const CACHE_IO = 0x0000_0008;
        /// Disable oplocks entirely.
        const NO_OPLOCKS = 0x0000_0010;
        /// Open host files with backup privilege.
        const TAKE_BACKUP_PRIVILEGE = 0x0000_0020;
    }
}

impl Serialize for ShareFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for ShareFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits_retain)
    }
}

impl ShareFlags {
    /// Flags used for every read-only layer share.
    #[must_use]
    pub const fn read_only_layer() -> Self {
        Self::READ_ONLY
            .union(Self::PSEUDO_OPLOCKS)
            .union(Self::TAKE_BACKUP_PRIVILEGE)
            .union(Self::CACHE_IO)
            .union(Self::SHARE_READ)
    }
}

/// Address of a block attachment: controller number and slot on that controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentLocation {
    /// Controller index.
    pub controller: usize,
    /// Slot (LUN) on the controller.
    pub slot: usize,
}

impl AttachmentLocation {
    /// Create a location.
    #[must_use]
    pub const fn new(controller: usize, slot: usize) -> Self {
        Self { controller, slot }
    }
}

impl fmt::Display for AttachmentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.controller, self.slot)
    }
}

/// Settings for exposing a read-only layer as a remote share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShareSettings {
    /// Share name, the layer's derived identifier.
    pub name: LayerGuid,
    /// Host folder being shared.
    pub path: PathBuf,
    /// Share options.
    pub flags: ShareFlags,
}

/// Guest directory a block attachment is mapped onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedDirectory {
    /// Guest-visible path.
    pub container_path: String,
    /// Slot the disk sits in.
    pub lun: u8,
}

/// A read-only layer as seen from inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerReference {
    /// The layer's share identifier.
    pub id: LayerGuid,
    /// Guest path the share is reachable at.
    pub path: String,
}

/// The guest union filesystem: shares stacked under the scratch attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CombinedLayers {
    /// Guest-visible root of the merged view.
    pub container_root_path: String,
    /// Read-only layers, base first.
    pub layers: Vec<LayerReference>,
}

/// A single add/remove request against a running environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifyRequest {
    /// Expose a read-only folder to the VM.
    AddShare(ShareSettings),
    /// Withdraw a previously exposed folder.
    RemoveShare {
        /// Share name.
        name: LayerGuid,
    },
    /// Hot-add a disk and map it into the guest.
    AddAttachment {
        /// Controller slot to attach at.
        location: AttachmentLocation,
        /// Host path of the disk.
        disk_path: PathBuf,
        /// Guest directory mapping.
        mapped: MappedDirectory,
    },
    /// Hot-remove a disk, unmapping its guest directory if given.
    RemoveAttachment {
        /// Controller slot to detach.
        location: AttachmentLocation,
        /// Guest directory mapping to tear down first.
        mapped: Option<MappedDirectory>,
    },
    /// Assemble a union filesystem in the guest.
    AddUnion(CombinedLayers),
    /// Tear down the union filesystem rooted at the given path.
    RemoveUnion {
        /// Guest-visible root of the union.
        container_root_path: String,
    },
}

impl ModifyRequest {
    /// The resource kind addressed.
    #[must_use]
    pub const fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::AddShare(_) | Self::RemoveShare { .. } => ResourceKind::RemoteShare,
            Self::AddAttachment { .. } | Self::RemoveAttachment { .. } => {
                ResourceKind::BlockAttachment
            }
            Self::AddUnion(_) | Self::RemoveUnion { .. } => ResourceKind::UnionFilesystem,
        }
    }

    /// Add or remove.
    #[must_use]
    pub const fn request_type(&self) -> RequestType {
        match self {
            Self::AddShare(_) | Self::AddAttachment { .. } | Self::AddUnion(_) => RequestType::Add,
            Self::RemoveShare { .. } | Self::RemoveAttachment { .. } | Self::RemoveUnion { .. } => {
                RequestType::Remove
            }
        }
    }

    /// The VM resource URI, for requests addressed to a VM device.
    ///
    /// Union requests are handled by the guest and carry no URI.
    #[must_use]
    pub fn resource_uri(&self) -> Option<String> {
        match self {
            Self::AddShare(ShareSettings { name, .. }) | Self::RemoveShare { name } => {
                Some(format!("virtualmachine/devices/virtualsmbshares/{name}"))
            }
            Self::AddAttachment { location, .. } | Self::RemoveAttachment { location, .. } => {
                Some(format!(
                    "VirtualMachine/Devices/SCSI/{}/{}",
                    location.controller, location.slot
                ))
            }
            Self::AddUnion(_) | Self::RemoveUnion { .. } => None,
        }
    }

    /// Short description of the addressed resource, for logs and errors.
    #[must_use]
    pub fn target(&self) -> String {
        match self {
            Self::AddShare(ShareSettings { name, .. }) | Self::RemoveShare { name } => {
                format!("share {name}")
            }
            Self::AddAttachment { location, .. } | Self::RemoveAttachment { location, .. } => {
                format!("attachment {location}")
            }
            Self::AddUnion(CombinedLayers {
                container_root_path,
                ..
            })
            | Self::RemoveUnion {
                container_root_path,
            } => format!("union filesystem at {container_root_path}"),
        }
    }

    /// Build the [`StrataError::ControlPlane`] for this request failing.
    pub fn failed(&self, message: impl Into<String>) -> StrataError {
        StrataError::ControlPlane {
            operation: self.request_type().to_string(),
            resource: self.target(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ModifyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.request_type(), self.target())
    }
}
