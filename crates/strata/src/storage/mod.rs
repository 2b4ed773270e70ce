//! Layer storage: shares, attachments, hosting systems and the mount/unmount
//! orchestrators built on them.

pub mod attachment;
pub mod driver;
pub mod hosting;
pub mod layer;
pub mod mount;
pub mod overlay;
pub mod share;
#[cfg(test)]
pub(crate) mod testing;
pub mod unmount;
pub mod utility_vm;

pub use attachment::{AttachmentAllocator, AttachmentTable, LockedAttachments};
pub use driver::LayerDriver;
pub use hosting::{AttachmentRecord, HostingSystem, StorageSnapshot};
pub use layer::LayerStack;
pub use mount::{LayerMounter, MountedLayers};
pub use overlay::{OverlayLayerDriver, OverlayMount};
pub use share::{LockedShares, ShareEntry, ShareRegistry, ShareTable};
pub use unmount::UnmountScope;
pub use utility_vm::UtilityVmSpec;
