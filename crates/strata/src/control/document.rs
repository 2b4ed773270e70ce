//! JSON modify-settings documents.

use std::path::PathBuf;

use serde::Serialize;
use strata_common::{LayerGuid, StrataResult};

use super::request::{
    CombinedLayers, MappedDirectory, ModifyRequest, RequestType, ResourceKind, ShareSettings,
};

/// Wire form of a [`ModifyRequest`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingsDocument {
    /// Kind of resource addressed.
    pub resource_type: ResourceKind,
    /// Add or remove.
    pub request_type: RequestType,
    /// VM device URI, absent for guest-only requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_uri: Option<String>,
    /// Host-side settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
    /// Settings forwarded to the guest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_settings: Option<HostedSettings>,
}

/// Host-side payload of a modify request.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Settings {
    Share(ShareSettings),
    ShareName(ShareName),
    Disk(DiskAttachment),
}

/// Settings for a share removal, which only names the share.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShareName {
    /// Share name.
    pub name: LayerGuid,
}

/// A virtual disk attachment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiskAttachment {
    /// Host path of the disk.
    pub path: PathBuf,
    /// Attachment type, always `VirtualDisk`.
    #[serde(rename = "Type")]
    pub kind: &'static str,
}

/// Guest-side payload of a modify request.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum HostedSettings {
    Mapped(MappedDirectory),
    Combined(CombinedLayers),
    Root(CombinedRoot),
}

/// Union teardown only needs the root.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CombinedRoot {
    /// Guest-visible root of the union.
    pub container_root_path: String,
}

impl From<&ModifyRequest> for ModifySettingsDocument {
    fn from(request: &ModifyRequest) -> Self {
        let (settings, hosted_settings) = match request {
            ModifyRequest::AddShare(share) => (Some(Settings::Share(share.clone())), None),
            ModifyRequest::RemoveShare { name } => {
                (Some(Settings::ShareName(ShareName { name: *name })), None)
            }
            ModifyRequest::AddAttachment {
                disk_path, mapped, ..
            } => (
                Some(Settings::Disk(DiskAttachment {
                    path: disk_path.clone(),
                    kind: "VirtualDisk",
                })),
                Some(HostedSettings::Mapped(mapped.clone())),
            ),
            ModifyRequest::RemoveAttachment { mapped, .. } => {
                (None, mapped.clone().map(HostedSettings::Mapped))
            }
            ModifyRequest::AddUnion(combined) => {
                (None, Some(HostedSettings::Combined(combined.clone())))
            }
            ModifyRequest::RemoveUnion {
                container_root_path,
            } => (
                None,
                Some(HostedSettings::Root(CombinedRoot {
                    container_root_path: container_root_path.clone(),
                })),
            ),
        };

        Self {
            resource_type: request.resource_kind(),
            request_type: request.request_type(),
            resource_uri: request.resource_uri(),
            settings,
            hosted_settings,
        }
    }
}

impl ModifyRequest {
    /// Render the request as its JSON wire document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_document(&self) -> StrataResult<serde_json::Value> {
        Ok(serde_json::to_value(ModifySettingsDocument::from(self))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AttachmentLocation, LayerReference, ShareFlags};
    use serde_json::json;

    #[test]
    fn share_add_document() {
        let name = LayerGuid::derive("base");
        let request = ModifyRequest::AddShare(ShareSettings {
            name,
            path: PathBuf::from("/layers/base"),
            flags: ShareFlags::read_only_layer(),
        });

        assert_eq!(
            request.to_document().unwrap(),
            json!({
                "ResourceType": "VSmbShare",
                "RequestType": "Add",
                "ResourceUri": format!("virtualmachine/devices/virtualsmbshares/{name}"),
                "Settings": {
                    "Name": name.to_string(),
                    "Path": "/layers/base",
                    "Flags": 0x2f,
                },
            })
        );
    }

    #[test]
    fn share_remove_document_only_names_share() {
        let name = LayerGuid::derive("ro1");
        let document = ModifyRequest::RemoveShare { name }.to_document().unwrap();
        assert_eq!(document["Settings"], json!({ "Name": name.to_string() }));
        assert!(document.get("HostedSettings").is_none());
    }

    #[test]
    fn attachment_add_document_maps_guest_directory() {
        let request = ModifyRequest::AddAttachment {
            location: AttachmentLocation::new(0, 2),
            disk_path: PathBuf::from("/layers/scratch/sandbox.vhdx"),
            mapped: MappedDirectory {
                container_path: r"C:\guid".to_string(),
                lun: 2,
            },
        };

        assert_eq!(
            request.to_document().unwrap(),
            json!({
                "ResourceType": "MappedVirtualDisk",
                "RequestType": "Add",
                "ResourceUri": "VirtualMachine/Devices/SCSI/0/2",
                "Settings": { "Path": "/layers/scratch/sandbox.vhdx", "Type": "VirtualDisk" },
                "HostedSettings": { "ContainerPath": r"C:\guid", "Lun": 2 },
            })
        );
    }

    #[test]
    fn attachment_remove_without_mapping() {
        let document = ModifyRequest::RemoveAttachment {
            location: AttachmentLocation::new(0, 1),
            mapped: None,
        }
        .to_document()
        .unwrap();
        assert!(document.get("Settings").is_none());
        assert!(document.get("HostedSettings").is_none());
    }

    #[test]
    fn union_documents() {
        let id = LayerGuid::derive("base");
        let add = ModifyRequest::AddUnion(CombinedLayers {
            container_root_path: r"C:\root".to_string(),
            layers: vec![LayerReference {
                id,
                path: format!(r"\\share\{id}"),
            }],
        })
        .to_document()
        .unwrap();
        assert!(add.get("ResourceUri").is_none());
        assert_eq!(add["HostedSettings"]["ContainerRootPath"], r"C:\root");
        assert_eq!(add["HostedSettings"]["Layers"][0]["Id"], id.to_string());

        let remove = ModifyRequest::RemoveUnion {
            container_root_path: r"C:\root".to_string(),
        }
        .to_document()
        .unwrap();
        assert_eq!(
            remove["HostedSettings"],
            json!({ "ContainerRootPath": r"C:\root" })
        );
    }
}
