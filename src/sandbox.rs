//! Execution sandbox - runs guest bundles in an isolated V8 isolate.
//!
//! Provides only the minimal bindings the guest environment needs:
//! - console.log/warn/error (forwarded to the host log channel; errors are
//!   emitted at error level so ANSI terminals render them red)
//! - setTimeout/clearTimeout
//! - URL parsing
//! - Whitelisted module loading rooted at the dist directory
//! - fetch restricted to the host whitelist
//! - No fs, net, env, or other system access
//!
//! The sandbox owns one shared global namespace for the lifetime of the
//! process. Evaluations mutate that namespace; no per-call isolation is
//! provided here. Isolation of per-request data is the responsibility of the
//! request-instance layer above, which keeps all mutable request state inside
//! harness registry entries keyed by request id.

use crate::discovery::{DiscoveryBuffers, DiscoveryEvent};
use crate::fetch::{op_fetch, HostWhitelist};
use crate::loader::WhitelistLoader;
use anyhow::{anyhow, Context, Error};
use deno_core::{op2, v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{error, info, warn};
use url::Url;

// ============================================================================
// Console Ops
// ============================================================================

#[op2(fast)]
fn op_console_log(#[string] message: &str) {
    info!(target: "guest", "{message}");
}

#[op2(fast)]
fn op_console_warn(#[string] message: &str) {
    warn!(target: "guest", "{message}");
}

#[op2(fast)]
fn op_console_error(#[string] message: &str) {
    error!(target: "guest", "{message}");
}

// ============================================================================
// Timer Op
// ============================================================================

#[op2(async)]
async fn op_timer_sleep(#[number] ms: u64) {
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
}

// ============================================================================
// URL Op
// ============================================================================

/// Parsed URL components handed back to the guest `URL` class.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UrlParts {
    href: String,
    protocol: String,
    host: String,
    hostname: String,
    port: String,
    pathname: String,
    search: String,
    hash: String,
    origin: String,
}

#[op2]
#[serde]
fn op_url_parse(#[string] input: &str, #[string] base: &str) -> Result<UrlParts, Error> {
    let url = if base.is_empty() {
        Url::parse(input).map_err(|e| anyhow!("Invalid URL '{}': {}", input, e))?
    } else {
        Url::parse(base)
            .and_then(|b| b.join(input))
            .map_err(|e| anyhow!("Invalid URL '{}' against base '{}': {}", input, base, e))?
    };

    let search = url.query().map(|q| format!("?{q}")).unwrap_or_default();
    let hash = url.fragment().map(|f| format!("#{f}")).unwrap_or_default();

    Ok(UrlParts {
        href: url.to_string(),
        protocol: format!("{}:", url.scheme()),
        host: url.host_str().map(|h| match url.port() {
            Some(port) => format!("{h}:{port}"),
            None => h.to_string(),
        }).unwrap_or_default(),
        hostname: url.host_str().unwrap_or_default().to_string(),
        port: url.port().map(|p| p.to_string()).unwrap_or_default(),
        pathname: url.path().to_string(),
        search,
        hash,
        origin: url.origin().ascii_serialization(),
    })
}

deno_core::extension!(
    sandbox_env,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_timer_sleep,
        op_url_parse,
        op_fetch,
    ],
    esm_entry_point = "ext:sandbox_env/bootstrap.js",
    esm = ["ext:sandbox_env/bootstrap.js" = "src/bootstrap.js"],
);

/// Configuration for the execution sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Dist directory containing the bundles and whitelisted `node_modules`.
    pub dist_root: PathBuf,
    /// Module names guest code may resolve; fixed for the sandbox lifetime.
    pub module_whitelist: Vec<String>,
    /// Origins guest code may fetch from.
    pub host_whitelist: Vec<String>,
}

/// The single isolated execution context shared by all requests.
///
/// Construction is a one-time operation: build the namespace, inject the
/// host bindings, install the guest-side harness. All later evaluations run
/// against the same namespace.
pub struct Sandbox {
    runtime: JsRuntime,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Result<Self, Error> {
        let loader = WhitelistLoader::new(&config.dist_root, config.module_whitelist.clone())?;

        let mut runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(loader)),
            extensions: vec![sandbox_env::init_ops_and_esm()],
            ..Default::default()
        });

        runtime.op_state().borrow_mut().put(HostWhitelist {
            origins: config.host_whitelist.clone(),
        });
        runtime
            .op_state()
            .borrow_mut()
            .put(DiscoveryBuffers::default());

        Ok(Self { runtime })
    }

    /// Run guest source text against the shared namespace.
    ///
    /// Any thrown error carries `source_name` in its stack so failures can
    /// be attributed to the bundle that raised them.
    pub fn evaluate(&mut self, source_text: &str, source_name: &str) -> Result<(), Error> {
        // execute_script wants a 'static name; bundles are evaluated once
        // per process, so leaking the path here is bounded.
        let name: &'static str = Box::leak(source_name.to_string().into_boxed_str());
        self.runtime
            .execute_script(name, source_text.to_string())
            .map(|_| ())
            .with_context(|| format!("error evaluating {source_name}"))
    }

    /// Drive pending guest work (module loads, timers, fetches) to
    /// completion.
    pub async fn settle(&mut self) -> Result<(), Error> {
        self.runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
    }

    /// Retrieve a named global previously defined by evaluated guest code.
    ///
    /// Returns `None` when the binding is absent (or `undefined`/`null`).
    pub fn lookup(&mut self, binding: &str) -> Result<Option<v8::Global<v8::Value>>, Error> {
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);
        let key = v8::String::new(scope, binding)
            .ok_or_else(|| anyhow!("invalid binding name: {binding}"))?;

        match global.get(scope, key.into()) {
            Some(value) if !value.is_undefined() && !value.is_null() => {
                Ok(Some(v8::Global::new(scope, value)))
            }
            _ => Ok(None),
        }
    }

    /// Whether a looked-up binding can serve as an application factory:
    /// either a function, or an object carrying a callable `default` (the
    /// shape of a transpiled default export).
    pub fn is_invocable(&mut self, value: &v8::Global<v8::Value>) -> bool {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        if local.is_function() {
            return true;
        }
        if let Ok(object) = v8::Local::<v8::Object>::try_from(local) {
            if let Some(key) = v8::String::new(scope, "default") {
                if let Some(default) = object.get(scope, key.into()) {
                    return default.is_function();
                }
            }
        }
        false
    }

    /// Execute a harness expression and resolve its result, driving the
    /// event loop until the guest settles.
    ///
    /// The expression may produce a plain value or a promise; a rejected
    /// promise surfaces as an error carrying the guest exception's string
    /// form (including the error name).
    pub async fn call(
        &mut self,
        label: &'static str,
        code: String,
    ) -> Result<v8::Global<v8::Value>, Error> {
        let result = self.runtime.execute_script(label, code)?;

        self.runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await?;

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &result);

        if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
            match promise.state() {
                v8::PromiseState::Fulfilled => {
                    let value = promise.result(scope);
                    Ok(v8::Global::new(scope, value))
                }
                v8::PromiseState::Rejected => {
                    let exception = promise.result(scope);
                    Err(anyhow!("{}", exception.to_rust_string_lossy(scope)))
                }
                v8::PromiseState::Pending => {
                    Err(anyhow!("guest promise never settled in {label}"))
                }
            }
        } else {
            Ok(v8::Global::new(scope, local))
        }
    }

    /// Convert a guest value into a Rust value.
    pub fn from_value<T: DeserializeOwned>(
        &mut self,
        value: &v8::Global<v8::Value>,
    ) -> Result<T, Error> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        deno_core::serde_v8::from_v8(scope, local)
            .map_err(|e| anyhow!("failed to convert guest value: {e}"))
    }

    /// Open the discovery buffer for one request id.
    pub fn open_discovery(&mut self, request_id: &str) {
        self.runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<DiscoveryBuffers>()
            .open(request_id);
    }

    /// Remove and return the discovery buffer for one request id.
    pub fn take_discovery(&mut self, request_id: &str) -> Vec<DiscoveryEvent> {
        self.runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<DiscoveryBuffers>()
            .take(request_id)
    }
}
