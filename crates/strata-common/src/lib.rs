//! # strata-common
//!
//! Shared utilities and types for the Strata storage layer runtime.
//!
//! This crate provides common functionality used across all Strata crates:
//! - Layer identifier derivation
//! - Hosting system ID validation
//! - Standard filesystem paths
//! - Common error types and cleanup error aggregation

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{CleanupErrors, StrataError, StrataResult};
pub use id::{HostingSystemId, LayerGuid};
pub use paths::StrataPaths;
