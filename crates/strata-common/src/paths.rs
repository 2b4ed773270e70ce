//! Standard filesystem paths for Strata.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Strata data.
pub static STRATA_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STRATA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/strata"))
});

/// Standard paths used by Strata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrataPaths {
    /// Root data directory (default: /var/lib/strata).
    pub root: PathBuf,
}

impl StrataPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding layer folders referenced by relative path.
    #[must_use]
    pub fn layers(&self) -> PathBuf {
        self.root.join("layers")
    }

    /// Directory for hosting system data.
    #[must_use]
    pub fn hosting_systems(&self) -> PathBuf {
        self.root.join("hosting")
    }

    /// Directory for a specific hosting system.
    #[must_use]
    pub fn hosting_system(&self, id: &str) -> PathBuf {
        self.hosting_systems().join(id)
    }

    /// Default configuration file.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}

impl Default for StrataPaths {
    fn default() -> Self {
        Self {
            root: STRATA_ROOT.clone(),
        }
    }
}
