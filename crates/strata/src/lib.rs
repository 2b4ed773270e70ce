//! # Strata
//!
//! Mounts stacks of filesystem layers either directly on the host or into a
//! hosting utility VM shared by several workloads.
//!
//! Inside a hosting system, read-only layers are exposed as ref-counted remote
//! shares and each workload's scratch disk takes a block attachment slot. The
//! guest then assembles both into one union filesystem.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use strata::config::GuestLayout;
//! use strata::control::RecordingControlPlane;
//! use strata::storage::{HostingSystem, LayerMounter, LayerStack, OverlayLayerDriver, UnmountScope};
//! use strata_common::HostingSystemId;
//!
//! # async fn example() -> strata_common::StrataResult<()> {
//! let hosting = HostingSystem::new(
//!     HostingSystemId::new("uvm")?,
//!     Arc::new(RecordingControlPlane::new("uvm")),
//!     GuestLayout::default(),
//! );
//! let mounter = LayerMounter::new(Arc::new(OverlayLayerDriver::new()), "sandbox.vhdx");
//! let stack = LayerStack::new(["/layers/base", "/layers/w1-scratch"])?;
//!
//! let mounted = mounter.mount(&stack, Some(&hosting)).await?;
//! println!("{:?}", mounted.combined_layers());
//! mounter.unmount(&stack, Some(&hosting), UnmountScope::ALL).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod control;
pub mod storage;

pub use storage::{HostingSystem, LayerMounter, LayerStack, MountedLayers, UnmountScope};
