//! # SSR Host
//!
//! A sandboxed server-side rendering host for prebuilt application bundles,
//! using deno_core.
//!
//! A dist directory produced by the application build supplies two bundles -
//! "vendor" and "application" - which are evaluated, in that order, into one
//! long-lived isolated execution context. The application bundle defines a
//! factory under a well-known global; invoking it once yields the root
//! application. Each request then derives a short-lived instance from the
//! root application, boots it, visits the requested path, serializes the
//! resulting virtual document to HTML, and destroys the instance - on every
//! exit path, so one request's failures never leak into the next.
//!
//! ## Security Guarantees
//!
//! - **Capability-gated imports**: guest code may only load modules named in
//!   the manifest's module whitelist, resolved under the dist directory
//! - **No filesystem escape**: module loads are confined to the dist root
//! - **Constrained fetch**: only origins in the host whitelist are reachable
//! - **No environment or shell access**: the sandbox exposes nothing beyond
//!   console, timers, URL, fetch, and the whitelisted resolver
//!
//! ## Resource discovery
//!
//! With discovery mode on, data fetches issued by guest code during a visit
//! are captured in call order and inlined ahead of the body markup as
//! `<script class="resource-discovery-response">` blocks, so the client-side
//! application can reuse them without refetching.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ssr_host::{AppConfig, Manifest, RequestContext};
//!
//! let manifest = Manifest::load("path/to/dist")?;
//! let renderer = ssr_host::spawn(AppConfig::from_manifest(&manifest, false))?;
//!
//! let result = renderer.visit("/posts", RequestContext::new("/posts")).await?;
//! println!("{}", result.body_html);
//! ```

mod app;
mod compose;
mod discovery;
mod error;
mod fetch;
mod loader;
mod manifest;
mod sandbox;
mod sanitize;
mod service;

pub use app::{AppConfig, Application, Bundle, RequestContext, APP_FACTORY_BINDING};
pub use compose::{compose, Node, RenderResult, VisitOutcome};
pub use discovery::{DiscoveryBuffers, DiscoveryEvent};
pub use error::{ManifestError, RenderError};
pub use fetch::HostWhitelist;
pub use loader::WhitelistLoader;
pub use manifest::Manifest;
pub use sandbox::{Sandbox, SandboxConfig};
pub use service::{spawn, RenderHandle};
