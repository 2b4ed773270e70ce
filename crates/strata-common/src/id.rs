//! Layer identifier derivation and hosting system ID validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{StrataError, StrataResult};

/// Namespace all layer identifiers are derived in.
const LAYER_NAMESPACE: Uuid = Uuid::from_u128(0x9d3f_6a2e_41c7_5b08_8e1d_7c4a_02f6_b913);

/// A stable identifier derived from a layer folder name.
///
/// The same name always yields the same identifier, so a layer re-mounted after a
/// crash finds the share that was exposed for it earlier. The identifier is both
/// the remote share name and the share registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerGuid(Uuid);

impl LayerGuid {
    /// Derive the identifier for a layer folder name.
    #[must_use]
    pub fn derive(name: &str) -> Self {
        Self(Uuid::new_v5(&LAYER_NAMESPACE, name.as_bytes()))
    }

    /// Derive the identifier from the leaf name of a layer folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no UTF-8 leaf name.
    pub fn from_folder(folder: &Path) -> StrataResult<Self> {
        folder
            .file_name()
            .and_then(|name| name.to_str())
            .map(Self::derive)
            .ok_or_else(|| {
                StrataError::validation(format!(
                    "layer folder {} has no usable leaf name",
                    folder.display()
                ))
            })
    }
}

impl fmt::Display for LayerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for LayerGuid {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StrataError::validation(format!("invalid layer GUID {s}: {e}")))
    }
}

/// A validated hosting system ID.
///
/// Hosting system IDs must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostingSystemId(String);

impl HostingSystemId {
    /// Maximum length of a hosting system ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new hosting system ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> StrataResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> StrataResult<()> {
        let invalid = || StrataError::validation(format!("invalid hosting system ID: {id:?}"));

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        let mut chars = id.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if chars.any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_') {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for HostingSystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HostingSystemId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for HostingSystemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
