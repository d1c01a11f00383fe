//! Script sources and their resolution.
//!
//! A worklet's script can be provided in three forms:
//!
//! | Form | Description |
//! |------|-------------|
//! | Inline bytes | Source already in memory, passed through as is |
//! | Inline text | Encoded text, decoded with a stated [`TextEncoding`] |
//! | Resource | File looked up by name and kind under a search root |
//!
//! Inline text is normalized to UTF-8; bytes and resources are opaque and
//! reach the engine unchanged.
//!
//! # Example
//!
//! ```
//! use worklet_host::{ResourceLocator, ScriptSource, TextEncoding};
//!
//! let inline = ScriptSource::bytes("app.js", b"console.log(1)".to_vec());
//! let text = ScriptSource::text("app.js", vec![0x41, 0x00], TextEncoding::Utf16Le);
//! let resource = ScriptSource::resource(ResourceLocator::new("app", "bundle").directory("dist"));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::encoding::TextEncoding;
use crate::error::{Error, Result};

use super::Configuration;

// ============================================================================
// ResourceLocator
// ============================================================================

/// Names a script file as `{directory}/{name}.{kind}` under a search root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceLocator {
    /// File stem.
    pub name: String,
    /// File extension, without the dot.
    pub kind: String,
    /// Subdirectory under the root.
    pub directory: Option<PathBuf>,
    /// Explicit root. When unset the builder's search paths are used.
    pub bundle: Option<PathBuf>,
}

impl ResourceLocator {
    /// Creates a locator for `{name}.{kind}`.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            directory: None,
            bundle: None,
        }
    }

    /// Looks the file up in a subdirectory of the root.
    #[inline]
    #[must_use]
    pub fn directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.directory = Some(path.into());
        self
    }

    /// Looks the file up only under `root`.
    #[inline]
    #[must_use]
    pub fn bundle(mut self, root: impl Into<PathBuf>) -> Self {
        self.bundle = Some(root.into());
        self
    }

    /// Returns the file name, `{name}.{kind}`.
    #[must_use]
    pub fn file_name(&self) -> String {
        if self.kind.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.kind)
        }
    }

    /// Returns the candidate path under `root`.
    fn candidate(&self, root: &Path) -> PathBuf {
        let base = match &self.directory {
            Some(directory) => root.join(directory),
            None => root.to_path_buf(),
        };
        base.join(self.file_name())
    }

    /// Finds the first existing file.
    ///
    /// Searches the bundle if set, otherwise each of `search_paths` in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if no candidate is a file.
    pub fn resolve(&self, search_paths: &[PathBuf]) -> Result<PathBuf> {
        let roots: Vec<PathBuf> = match &self.bundle {
            Some(bundle) => vec![bundle.clone()],
            None => search_paths.to_vec(),
        };

        for root in &roots {
            let path = self.candidate(root);
            if path.is_file() {
                debug!(path = %path.display(), "Resolved script resource");
                return Ok(path);
            }
        }

        Err(Error::resource_not_found(self.file_name(), roots))
    }
}

// ============================================================================
// ScriptSource
// ============================================================================

/// Where a worklet's script comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// Opaque source bytes.
    InlineBytes {
        /// Name reported to the engine.
        filename: String,
        /// Source code.
        bytes: Vec<u8>,
    },

    /// Encoded source text.
    InlineText {
        /// Name reported to the engine.
        filename: String,
        /// Encoded source code.
        text: Vec<u8>,
        /// Encoding of `text`.
        encoding: TextEncoding,
    },

    /// A file found through a [`ResourceLocator`], read as bytes.
    Resource(ResourceLocator),
}

// ============================================================================
// ScriptSource - Constructors
// ============================================================================

impl ScriptSource {
    /// Creates an inline source from raw bytes.
    #[inline]
    #[must_use]
    pub fn bytes(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::InlineBytes {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// Creates an inline source from encoded text.
    #[inline]
    #[must_use]
    pub fn text(
        filename: impl Into<String>,
        text: impl Into<Vec<u8>>,
        encoding: TextEncoding,
    ) -> Self {
        Self::InlineText {
            filename: filename.into(),
            text: text.into(),
            encoding,
        }
    }

    /// Creates an inline source from a Rust string.
    #[inline]
    #[must_use]
    pub fn code(filename: impl Into<String>, code: &str) -> Self {
        Self::bytes(filename, code.as_bytes().to_vec())
    }

    /// Creates a resource source.
    #[inline]
    #[must_use]
    pub fn resource(locator: ResourceLocator) -> Self {
        Self::Resource(locator)
    }
}

// ============================================================================
// ScriptSource - Resolution
// ============================================================================

impl ScriptSource {
    /// Returns the filename, or the resource's file name.
    #[must_use]
    pub fn filename(&self) -> String {
        match self {
            Self::InlineBytes { filename, .. } | Self::InlineText { filename, .. } => {
                filename.clone()
            }
            Self::Resource(locator) => locator.file_name(),
        }
    }

    /// Loads the source. Only inline text is decoded, into UTF-8.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceNotFound`] if a resource cannot be found
    /// - [`Error::Decode`] if inline text is not valid in its encoding
    /// - [`Error::Construction`] if a resource cannot be read
    pub fn load(&self, search_paths: &[PathBuf]) -> Result<(String, Vec<u8>)> {
        match self {
            Self::InlineBytes { filename, bytes } => Ok((filename.clone(), bytes.clone())),
            Self::InlineText {
                filename,
                text,
                encoding,
            } => {
                let decoded = encoding.decode(text)?;
                Ok((filename.clone(), decoded.into_bytes()))
            }
            Self::Resource(locator) => {
                let path = locator.resolve(search_paths)?;
                let bytes = fs::read(&path).map_err(|e| {
                    Error::construction(format!("Cannot read {}: {e}", path.display()))
                })?;
                Ok((locator.file_name(), bytes))
            }
        }
    }
}

// ============================================================================
// Script
// ============================================================================

/// A resolved script, as handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Name of the script.
    pub filename: String,
    /// Source as loaded; UTF-8 when it came from inline text.
    pub source: Vec<u8>,
    /// Arguments passed at construction.
    pub arguments: Vec<String>,
    /// The host's copy of the configuration.
    pub configuration: Configuration,
}

impl Script {
    /// Returns the source as text.
    ///
    /// Invalid UTF-8 sequences in binary sources are replaced.
    #[must_use]
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.source)
    }
}

// ============================================================================
// Tests
// ============================================================================
