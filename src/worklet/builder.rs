//! Builder pattern for worklet construction.
//!
//! Provides a fluent API for configuring and creating [`WorkletHost`]
//! instances.
//!
//! # Example
//!
//! ```no_run
//! use worklet_host::{ResourceLocator, Script, WorkletEnv, WorkletHost};
//!
//! # async fn example() -> worklet_host::Result<()> {
//! let host = WorkletHost::builder()
//!     .engine(|_: Script, _: WorkletEnv| async { Ok::<(), String>(()) })
//!     .resource(ResourceLocator::new("app", "bundle").directory("dist"))
//!     .search_path("/opt/app")
//!     .argument("--verbose")
//!     .memory_limit(32 * 1024 * 1024)
//!     .create()
//!     .await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::encoding::TextEncoding;
use crate::error::{Error, Result};

use super::host::WorkletHost;
use super::runtime::Engine;
use super::{Configuration, ResourceLocator, ScriptSource};

// ============================================================================
// WorkletBuilder
// ============================================================================

/// Builder for configuring a [`WorkletHost`].
///
/// Use [`WorkletHost::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct WorkletBuilder {
    /// Script engine.
    engine: Option<Arc<dyn Engine>>,
    /// Script source.
    source: Option<ScriptSource>,
    /// Script arguments.
    arguments: Vec<String>,
    /// Resource limits.
    configuration: Configuration,
    /// Roots for resource locators without a bundle.
    search_paths: Vec<PathBuf>,
}

impl fmt::Debug for WorkletBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkletBuilder")
            .field("has_engine", &self.engine.is_some())
            .field("source", &self.source)
            .field("arguments", &self.arguments)
            .field("configuration", &self.configuration)
            .field("search_paths", &self.search_paths)
            .finish()
    }
}

// ============================================================================
// WorkletBuilder Implementation
// ============================================================================

impl WorkletBuilder {
    /// Creates an empty builder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the script engine.
    #[inline]
    #[must_use]
    pub fn engine(mut self, engine: impl Engine) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// Sets a shared script engine.
    #[inline]
    #[must_use]
    pub fn shared_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Sets the script source.
    #[inline]
    #[must_use]
    pub fn source(mut self, source: ScriptSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Uses inline source code.
    #[inline]
    #[must_use]
    pub fn code(self, filename: impl Into<String>, code: &str) -> Self {
        self.source(ScriptSource::code(filename, code))
    }

    /// Uses encoded source text.
    #[inline]
    #[must_use]
    pub fn text(
        self,
        filename: impl Into<String>,
        text: impl Into<Vec<u8>>,
        encoding: TextEncoding,
    ) -> Self {
        self.source(ScriptSource::text(filename, text, encoding))
    }

    /// Loads the script from a resource.
    #[inline]
    #[must_use]
    pub fn resource(self, locator: ResourceLocator) -> Self {
        self.source(ScriptSource::resource(locator))
    }

    /// Adds a script argument.
    #[inline]
    #[must_use]
    pub fn argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Adds multiple script arguments.
    #[inline]
    #[must_use]
    pub fn arguments(mut self, arguments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    /// Sets the configuration.
    #[inline]
    #[must_use]
    pub fn configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Sets the memory limit in bytes.
    #[inline]
    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.configuration.memory_limit = bytes;
        self
    }

    /// Sets the asset root.
    #[inline]
    #[must_use]
    pub fn assets(mut self, path: impl Into<PathBuf>) -> Self {
        self.configuration.assets = Some(path.into());
        self
    }

    /// Adds a root for resolving resources without a bundle.
    ///
    /// Roots are searched in the order added. Without any, the current
    /// directory is used.
    #[inline]
    #[must_use]
    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Creates the worklet with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Construction`] if engine or source is not set
    /// - Any error of [`WorkletHost::create`]
    pub async fn create(self) -> Result<WorkletHost> {
        let engine = self.validate_engine()?;
        let source = self.validate_source()?;
        let search_paths = self.resolved_search_paths();

        WorkletHost::launch(
            engine,
            source,
            self.arguments,
            self.configuration,
            &search_paths,
        )
        .await
    }
}

// ============================================================================
// Validation
// ============================================================================

impl WorkletBuilder {
    fn validate_engine(&self) -> Result<Arc<dyn Engine>> {
        self.engine.clone().ok_or_else(|| {
            Error::construction(
                "Engine is required. Use .engine() to set it.\n\
                 Example: WorkletHost::builder().engine(my_engine)",
            )
        })
    }

    fn validate_source(&self) -> Result<ScriptSource> {
        self.source.clone().ok_or_else(|| {
            Error::construction(
                "Script source is required. Use .code(), .text(), .resource() or .source().\n\
                 Example: WorkletHost::builder().code(\"app.js\", \"...\")",
            )
        })
    }

    fn resolved_search_paths(&self) -> Vec<PathBuf> {
        if self.search_paths.is_empty() {
            std::env::current_dir().into_iter().collect()
        } else {
            self.search_paths.clone()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
