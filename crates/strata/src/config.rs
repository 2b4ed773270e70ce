//! Storage configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::{LayerGuid, StrataError, StrataPaths, StrataResult};

/// Default guest directory prefix for scratch roots.
pub const DEFAULT_GUEST_ROOT_PREFIX: &str = r"C:\";

/// Default guest path prefix under which remote shares appear.
pub const DEFAULT_SHARE_PATH_PREFIX: &str =
    r"\\?\VMSMB\VSMB-{dcc079ae-60ba-4d07-847c-3493609c0870}\";

/// Default file name of the scratch disk inside a scratch layer folder.
pub const DEFAULT_SCRATCH_DISK_NAME: &str = "sandbox.vhdx";

/// How layers are named inside a hosting system's guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestLayout {
    /// Prefix of the guest directory a workload's union is rooted at.
    pub root_prefix: String,
    /// Prefix of the guest path a remote share is reachable at.
    pub share_path_prefix: String,
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            root_prefix: DEFAULT_GUEST_ROOT_PREFIX.to_string(),
            share_path_prefix: DEFAULT_SHARE_PATH_PREFIX.to_string(),
        }
    }
}

impl GuestLayout {
    /// Guest root for a scratch layer with the given identifier.
    #[must_use]
    pub fn container_root(&self, scratch: &LayerGuid) -> String {
        format!("{}{}", self.root_prefix, scratch)
    }

    /// Guest path of the share exposing the given layer.
    #[must_use]
    pub fn share_path(&self, layer: &LayerGuid) -> String {
        format!("{}{}", self.share_path_prefix, layer)
    }
}

/// Defaults for utility VM creation documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtilityVmDefaults {
    /// Startup memory in MB.
    pub memory_mb: u64,
    /// Virtual processor count.
    pub processors: u32,
    /// Direct file mapping window in MB.
    pub direct_file_mapping_mb: u64,
}

impl Default for UtilityVmDefaults {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            processors: 2,
            direct_file_mapping_mb: 1024,
        }
    }
}

/// Storage configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Paths for runtime data.
    #[serde(skip)]
    pub paths: StrataPaths,
    /// Guest naming.
    pub guest: GuestLayout,
    /// File name of the scratch disk inside a scratch layer folder.
    pub scratch_disk_name: String,
    /// Utility VM creation defaults.
    pub utility_vm: UtilityVmDefaults,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            paths: StrataPaths::new(),
            guest: GuestLayout::default(),
            scratch_disk_name: DEFAULT_SCRATCH_DISK_NAME.to_string(),
            utility_vm: UtilityVmDefaults::default(),
        }
    }
}

impl StorageConfig {
    /// Parse from a `.toml` or `.json` file, picked by extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> StrataResult<Self> {
        let content = fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

        let config = match ext.to_lowercase().as_str() {
            "json" => Self::from_json(&content)?,
            _ => Self::from_toml(&content)?,
        };

        tracing::debug!(path = %path.display(), "Loaded storage configuration");
        Ok(config)
    }

    /// Load the config file under `paths`, or defaults if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(paths: StrataPaths) -> StrataResult<Self> {
        let file = paths.config_file();
        let config = if file.exists() {
            Self::from_file(&file)?
        } else {
            Self::default()
        };
        Ok(Self { paths, ..config })
    }

    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a valid configuration.
    pub fn from_toml(content: &str) -> StrataResult<Self> {
        toml::from_str(content).map_err(|e| StrataError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a valid configuration.
    pub fn from_json(content: &str) -> StrataResult<Self> {
        serde_json::from_str(content).map_err(|e| StrataError::Config {
            message: format!("Failed to parse JSON: {e}"),
        })
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = StrataPaths::with_root(root);
        self
    }

    /// Set the guest root prefix.
    #[must_use]
    pub fn with_guest_root_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.guest.root_prefix = prefix.into();
        self
    }

    /// Set the scratch disk file name.
    #[must_use]
    pub fn with_scratch_disk_name(mut self, name: impl Into<String>) -> Self {
        self.scratch_disk_name = name.into();
        self
    }
}
