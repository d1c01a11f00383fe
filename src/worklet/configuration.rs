//! Worklet resource configuration.
//!
//! # Example
//!
//! ```
//! use worklet_host::Configuration;
//!
//! let configuration = Configuration::new()
//!     .with_memory_limit(64 * 1024 * 1024)
//!     .with_assets("/var/lib/app/assets");
//!
//! assert!(!configuration.is_unlimited());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

/// Resource limits and asset location handed to the engine.
///
/// The host keeps its own copy; later changes to the caller's value have no
/// effect on a running worklet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Memory limit in bytes. `0` means unlimited.
    pub memory_limit: u64,

    /// Root directory for assets the script may load.
    pub assets: Option<PathBuf>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Configuration {
    /// Creates an unlimited configuration without assets.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory_limit: 0,
            assets: None,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl Configuration {
    /// Sets the memory limit in bytes.
    #[inline]
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Sets the asset root.
    #[inline]
    #[must_use]
    pub fn with_assets(mut self, path: impl Into<PathBuf>) -> Self {
        self.assets = Some(path.into());
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Configuration {
    /// Returns `true` if no memory limit is set.
    #[inline]
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.memory_limit == 0
    }

    /// Returns the asset root, if any.
    #[inline]
    #[must_use]
    pub fn assets(&self) -> Option<&Path> {
        self.assets.as_deref()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_matches_default() {
        assert_eq!(Configuration::new(), Configuration::default());
        assert!(Configuration::new().is_unlimited());
    }

    #[test]
    fn test_builder_methods() {
        let configuration = Configuration::new()
            .with_memory_limit(1024)
            .with_assets("assets");
        assert_eq!(configuration.memory_limit, 1024);
        assert_eq!(configuration.assets(), Some(Path::new("assets")));
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(Configuration::new().with_memory_limit(8)).unwrap();
        assert_eq!(json["memoryLimit"], 8);
        assert!(json["assets"].is_null());
    }
}
