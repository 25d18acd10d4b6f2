//! Error types for the SSR host.
//!
//! - [`RenderError`]: everything that can go wrong while loading the guest
//!   application or serving a visit
//! - [`ManifestError`]: construction-time configuration failures
//!
//! Per-request failures (`UnrecognizedUrl`, `RenderFailure`) are recovered at
//! the request boundary and never take the process down; startup failures
//! (`ApplicationFactoryMissing`, `ManifestError`) are fatal.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading the application or rendering a visit.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Guest code requested a module outside the configured whitelist.
    #[error("unable to load module '{module}' because it is not in the module whitelist")]
    ModuleNotWhitelisted {
        /// The module name the guest asked for.
        module: String,
    },

    /// Both bundles evaluated but no usable application factory was found.
    #[error(
        "failed to load the application from {bundle}: no callable application \
         factory was defined"
    )]
    ApplicationFactoryMissing {
        /// Path of the application bundle that was expected to define it.
        bundle: PathBuf,
    },

    /// The visited path has no matching route inside the guest application.
    ///
    /// Expected during normal operation; the embedding host maps it to a
    /// "not found" response.
    #[error("no guest route matched '{path}'")]
    UnrecognizedUrl {
        /// The path that was visited.
        path: String,
    },

    /// Any other failure during boot or visit (guest defect, unexpected
    /// exception, broken render worker).
    #[error("render failed: {cause}")]
    RenderFailure {
        /// The underlying cause, with guest source attribution where
        /// available.
        cause: anyhow::Error,
    },
}

impl RenderError {
    /// Create a new `ModuleNotWhitelisted` error.
    pub fn module_not_whitelisted(module: impl Into<String>) -> Self {
        Self::ModuleNotWhitelisted {
            module: module.into(),
        }
    }

    /// Create a new `UnrecognizedUrl` error.
    pub fn unrecognized_url(path: impl Into<String>) -> Self {
        Self::UnrecognizedUrl { path: path.into() }
    }

    /// Create a new `RenderFailure` from any underlying cause.
    pub fn render_failure(cause: impl Into<anyhow::Error>) -> Self {
        Self::RenderFailure {
            cause: cause.into(),
        }
    }

    /// Returns `true` if this error is an expected route miss rather than a
    /// defect. The embedding host uses this for 404-vs-500 mapping and for
    /// logging severity.
    pub fn is_unrecognized_url(&self) -> bool {
        matches!(self, Self::UnrecognizedUrl { .. })
    }

    /// Returns `true` if this error makes the server unable to serve any
    /// request at all.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::ApplicationFactoryMissing { .. })
    }
}

/// Errors raised while reading the packaging manifest from a dist directory.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The manifest file could not be read at all.
    #[error("couldn't read {path}: {source}")]
    Unreadable {
        /// Path of the manifest file.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The manifest file was not valid JSON.
    #[error("{path} was malformed: {source}")]
    Malformed {
        /// Path of the manifest file.
        path: PathBuf,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// The manifest file parsed but did not contain an `ssr` section.
    #[error("{path} did not contain an `ssr` section; ensure the dist directory was built for server-side rendering")]
    MissingSection {
        /// Path of the manifest file.
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::module_not_whitelisted("left-pad");
        assert_eq!(
            err.to_string(),
            "unable to load module 'left-pad' because it is not in the module whitelist"
        );

        let err = RenderError::unrecognized_url("/missing");
        assert_eq!(err.to_string(), "no guest route matched '/missing'");
    }

    #[test]
    fn test_is_unrecognized_url() {
        assert!(RenderError::unrecognized_url("/x").is_unrecognized_url());
        assert!(!RenderError::module_not_whitelisted("x").is_unrecognized_url());
        assert!(!RenderError::render_failure(anyhow::anyhow!("boom")).is_unrecognized_url());
    }

    #[test]
    fn test_fatal_classification() {
        let err = RenderError::ApplicationFactoryMissing {
            bundle: PathBuf::from("dist/app.js"),
        };
        assert!(err.is_fatal_at_startup());
        assert!(!RenderError::unrecognized_url("/x").is_fatal_at_startup());
    }

    #[test]
    fn test_render_failure_carries_cause() {
        let err = RenderError::render_failure(anyhow::anyhow!("guest threw"));
        assert!(err.to_string().contains("guest threw"));
    }
}
