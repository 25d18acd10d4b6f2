//! SSR host server.
//!
//! Serves a dist directory produced by the application build:
//!
//!   ssr-host <dist-path> [--port 3000] [--resource-discovery]
//!
//! Every path is rendered through the sandboxed guest application and
//! substituted into the base HTML template's markers:
//!
//!   <!-- SSR_HEAD -->   serialized document head
//!   <!-- SSR_TITLE -->  document title
//!   <!-- SSR_BODY -->   discovery blocks + serialized body
//!
//! An unrecognized guest route maps to 404, any other render failure to 500;
//! neither response carries internal error detail.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssr_host::{AppConfig, Manifest, RenderHandle, RenderResult, RequestContext};

const HEAD_MARKER: &str = "<!-- SSR_HEAD -->";
const TITLE_MARKER: &str = "<!-- SSR_TITLE -->";
const BODY_MARKER: &str = "<!-- SSR_BODY -->";

#[derive(Parser, Debug)]
#[command(
    name = "ssr-host",
    about = "Sandboxed server-side rendering host for prebuilt application bundles"
)]
struct Args {
    /// Dist directory produced by the application build
    dist_path: PathBuf,

    /// Port to listen on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Capture guest data fetches and inline them into the response
    #[arg(long)]
    resource_discovery: bool,
}

#[derive(Clone)]
struct AppState {
    renderer: RenderHandle,
    template: Arc<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ssr_host=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let manifest = Manifest::load(&args.dist_path).with_context(|| {
        format!(
            "failed to load the manifest from {}",
            args.dist_path.display()
        )
    })?;

    let template = std::fs::read_to_string(&manifest.html_file).with_context(|| {
        format!(
            "couldn't read base template {}",
            manifest.html_file.display()
        )
    })?;

    let renderer = ssr_host::spawn(AppConfig::from_manifest(&manifest, args.resource_discovery))
        .context("failed to start the render worker")?;

    let state = AppState {
        renderer,
        template: Arc::new(template),
    };
    let app = Router::new().fallback(render).with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("couldn't bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn render(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let started = Instant::now();

    let mut context = RequestContext::new(&path);
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            context
                .headers
                .insert(name.as_str().to_string(), value.to_string());
        }
    }

    match state.renderer.visit(&path, context).await {
        Ok(result) => {
            info!(
                status = 200,
                path = %path,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "OK"
            );
            Html(insert_into_index_html(&state.template, &result)).into_response()
        }
        Err(err) if err.is_unrecognized_url() => {
            info!(
                status = 404,
                path = %path,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Not Found"
            );
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            // Full detail goes to the log channel only; the client gets a
            // bare 500.
            error!(
                status = 500,
                path = %path,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = format!("{err:#}"),
                "Unknown Error"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn insert_into_index_html(template: &str, result: &RenderResult) -> String {
    let mut html = template.replace(BODY_MARKER, &result.body_html);

    if !result.title.is_empty() {
        html = html.replace(TITLE_MARKER, &format!("<title>{}</title>", result.title));
    }
    if !result.head_html.is_empty() {
        html = html.replace(HEAD_MARKER, &result.head_html);
    }

    html
}
