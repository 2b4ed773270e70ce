//! Control plane requests against running environments.
//!
//! This module handles:
//! - Typed modify requests and their JSON wire documents
//! - The `ControlPlane` transport seam
//! - A recording control plane for dry runs

mod client;
mod document;
mod recording;
mod request;

pub use client::ControlPlane;
pub use document::ModifySettingsDocument;
pub use recording::{RecordedRequest, RecordingControlPlane};
pub use request::{
    AttachmentLocation, CombinedLayers, LayerReference, MappedDirectory, ModifyRequest,
    RequestType, ResourceKind, ShareFlags, ShareSettings,
};
