//! Application loading and the per-request render lifecycle.
//!
//! [`Application::load`] runs the one-time bootstrap: construct the sandbox,
//! evaluate the vendor bundle then the application bundle, look up the
//! application factory under its well-known name, and invoke it exactly once.
//! The resulting root application lives inside the sandbox for the rest of
//! the process.
//!
//! [`Application::visit`] drives one request: create a fresh instance from
//! the root application, register the request context, boot, visit the path,
//! and compose the output. The instance is destroyed - and the request's
//! discovery buffer discarded - on every exit path, so a later request never
//! observes a partially cleaned-up instance.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Error};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::compose::{compose, RenderResult, VisitOutcome};
use crate::error::RenderError;
use crate::manifest::Manifest;
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::sanitize::sanitize_context;

/// The well-known global the application bundle must define: either a
/// function, or an object with a callable `default`.
pub const APP_FACTORY_BINDING: &str = "__app_factory__";

/// An immutable guest bundle: source text plus its identifying path.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub path: PathBuf,
    pub source: String,
}

impl Bundle {
    /// Read a bundle from disk.
    pub fn load(path: &Path) -> Result<Self, RenderError> {
        let source = fs::read_to_string(path).map_err(|e| {
            RenderError::render_failure(anyhow!("couldn't read bundle {}: {e}", path.display()))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Everything needed to construct an [`Application`], typically derived from
/// a dist manifest.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub dist_root: PathBuf,
    pub vendor_file: PathBuf,
    pub app_file: PathBuf,
    pub module_whitelist: Vec<String>,
    pub host_whitelist: Vec<String>,
    pub resource_discovery: bool,
}

impl AppConfig {
    pub fn from_manifest(manifest: &Manifest, resource_discovery: bool) -> Self {
        Self {
            dist_root: manifest.dist_path.clone(),
            vendor_file: manifest.vendor_file.clone(),
            app_file: manifest.app_file.clone(),
            module_whitelist: manifest.module_whitelist.clone(),
            host_whitelist: manifest.host_whitelist.clone(),
            resource_discovery,
        }
    }
}

/// The inbound request as guest code is allowed to see it.
///
/// Guest code receives this (plus a request-scoped fetch) through the
/// context facade registered on its instance; it never sees raw host
/// request/response objects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: HashMap::new(),
        }
    }
}

#[derive(Serialize)]
struct ContextPayload<'a> {
    request: &'a RequestContext,
}

/// A loaded guest application: the sandbox plus the root application living
/// inside it.
pub struct Application {
    sandbox: Sandbox,
    resource_discovery: bool,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("resource_discovery", &self.resource_discovery)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Run the one-time bootstrap sequence.
    ///
    /// Fails with [`RenderError::ApplicationFactoryMissing`] when the
    /// bundles evaluate but never define a usable factory; such a failure is
    /// fatal, since no request can be served without a root application.
    pub async fn load(config: &AppConfig) -> Result<Self, RenderError> {
        debug!(
            app = %config.app_file.display(),
            vendor = %config.vendor_file.display(),
            "loading application"
        );
        for module in &config.module_whitelist {
            debug!(module = %module, "module whitelisted");
        }

        let mut sandbox = Sandbox::new(&SandboxConfig {
            dist_root: config.dist_root.clone(),
            module_whitelist: config.module_whitelist.clone(),
            host_whitelist: config.host_whitelist.clone(),
        })
        .map_err(RenderError::render_failure)?;

        let vendor = Bundle::load(&config.vendor_file)?;
        let app = Bundle::load(&config.app_file)?;

        // Order is load-bearing: the application bundle assumes the vendor
        // bundle has already populated the namespace.
        sandbox
            .evaluate(&vendor.source, &vendor.path.to_string_lossy())
            .map_err(RenderError::render_failure)?;
        debug!("vendor bundle evaluated");

        sandbox
            .evaluate(&app.source, &app.path.to_string_lossy())
            .map_err(RenderError::render_failure)?;
        debug!("application bundle evaluated");

        sandbox.settle().await.map_err(RenderError::render_failure)?;

        let factory = sandbox
            .lookup(APP_FACTORY_BINDING)
            .map_err(RenderError::render_failure)?;
        match factory {
            Some(factory) if sandbox.is_invocable(&factory) => {}
            _ => {
                return Err(RenderError::ApplicationFactoryMissing {
                    bundle: config.app_file.clone(),
                })
            }
        }

        sandbox
            .call(
                "<create-application>",
                "globalThis.__create_application__()".to_string(),
            )
            .await
            .map_err(|e| {
                RenderError::render_failure(e.context("invoking the application factory"))
            })?;
        debug!("root application created");

        Ok(Self {
            sandbox,
            resource_discovery: config.resource_discovery,
        })
    }

    /// Render the application at `path` for one request.
    ///
    /// Asynchronous: suspends while guest code performs its own async work
    /// (booting, rendering, fetching). An unmatched guest route surfaces as
    /// [`RenderError::UnrecognizedUrl`]; anything else as
    /// [`RenderError::RenderFailure`].
    #[instrument(skip_all, fields(path = %path))]
    pub async fn visit(
        &mut self,
        path: &str,
        context: &RequestContext,
    ) -> Result<RenderResult, RenderError> {
        let request_id = Uuid::new_v4().to_string();
        // Uuids contain no characters needing JSON escaping.
        let id_json = format!("\"{request_id}\"");

        debug!(request_id = %request_id, "visit started");
        if self.resource_discovery {
            self.sandbox.open_discovery(&request_id);
        }

        let outcome = self.run_request(&id_json, path, context).await;

        // Destroy and buffer discard run on every exit path, including
        // unrecognized-path and unexpected failures above.
        let destroyed = self
            .sandbox
            .call(
                "<destroy-instance>",
                format!("globalThis.__instance_destroy__({id_json})"),
            )
            .await;
        let events = self.sandbox.take_discovery(&request_id);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(destroy_err) = destroyed {
                    warn!(
                        request_id = %request_id,
                        error = %destroy_err,
                        "instance destruction failed after a failed visit"
                    );
                }
                return Err(err);
            }
        };

        if let Err(destroy_err) = destroyed {
            return Err(RenderError::render_failure(
                destroy_err.context("destroying request instance"),
            ));
        }

        debug!(request_id = %request_id, discovered = events.len(), "visit rendered");
        Ok(compose(outcome, &events))
    }

    async fn run_request(
        &mut self,
        id_json: &str,
        path: &str,
        context: &RequestContext,
    ) -> Result<VisitOutcome, RenderError> {
        self.sandbox
            .call(
                "<create-instance>",
                format!("globalThis.__instance_create__({id_json})"),
            )
            .await
            .map_err(|e| RenderError::render_failure(e.context("creating request instance")))?;

        let payload = serde_json::to_value(ContextPayload { request: context })
            .map_err(|e| RenderError::render_failure(Error::from(e)))?;
        let payload = sanitize_context(payload).map_err(RenderError::render_failure)?;
        self.sandbox
            .call(
                "<register-context>",
                format!(
                    "globalThis.__instance_register_context__({id_json}, {})",
                    payload
                ),
            )
            .await
            .map_err(|e| RenderError::render_failure(e.context("registering request context")))?;

        self.sandbox
            .call(
                "<boot-instance>",
                format!("globalThis.__instance_boot__({id_json})"),
            )
            .await
            .map_err(|e| RenderError::render_failure(e.context("booting request instance")))?;

        let path_json = serde_json::to_string(path)
            .map_err(|e| RenderError::render_failure(Error::from(e)))?;
        let snapshot = self
            .sandbox
            .call(
                "<visit>",
                format!("globalThis.__instance_visit__({id_json}, {path_json})"),
            )
            .await
            .map_err(|e| classify_visit_error(path, e))?;

        let snapshot: String = self
            .sandbox
            .from_value(&snapshot)
            .map_err(RenderError::render_failure)?;
        serde_json::from_str(&snapshot).map_err(|e| {
            RenderError::render_failure(anyhow!("invalid document snapshot: {e}"))
        })
    }
}

/// Route misses are an expected outcome, not a defect. Guest applications
/// signal them by rejecting with an error named `UnrecognizedURLError`.
fn classify_visit_error(path: &str, error: Error) -> RenderError {
    if error.to_string().contains("UnrecognizedURLError") {
        RenderError::unrecognized_url(path)
    } else {
        RenderError::render_failure(error.context(format!("visiting '{path}'")))
    }
}
