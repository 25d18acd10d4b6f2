//! The render worker.
//!
//! A `JsRuntime` is `!Send`, so the sandbox and the application living in it
//! are owned by one dedicated thread running a current-thread async runtime.
//! Concurrent callers submit visits through the cloneable [`RenderHandle`];
//! the worker processes them one at a time, completing each visit's destroy
//! step before picking up the next, which keeps request-scoped state strictly
//! confined even under concurrent callers.

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::app::{AppConfig, Application, RequestContext};
use crate::compose::RenderResult;
use crate::error::RenderError;

struct VisitRequest {
    path: String,
    context: RequestContext,
    reply: oneshot::Sender<Result<RenderResult, RenderError>>,
}

/// A `Send + Clone` facade over the render worker.
#[derive(Clone)]
pub struct RenderHandle {
    tx: mpsc::Sender<VisitRequest>,
}

impl RenderHandle {
    /// Render `path` for one request.
    pub async fn visit(
        &self,
        path: &str,
        context: RequestContext,
    ) -> Result<RenderResult, RenderError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(VisitRequest {
                path: path.to_string(),
                context,
                reply,
            })
            .await
            .map_err(|_| RenderError::render_failure(anyhow!("render worker is gone")))?;

        response
            .await
            .map_err(|_| RenderError::render_failure(anyhow!("render worker dropped the request")))?
    }
}

/// Start the render worker: spawn its thread, load the application, and
/// return a handle once the application is ready.
///
/// Startup failures (unreadable bundles, missing application factory) are
/// returned here and are fatal - without a root application no request can
/// be served.
pub fn spawn(config: AppConfig) -> Result<RenderHandle, RenderError> {
    let (tx, mut rx) = mpsc::channel::<VisitRequest>(64);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), RenderError>>();

    let builder = std::thread::Builder::new().name("render-worker".to_string());
    builder
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(RenderError::render_failure(anyhow!(
                        "failed to build worker runtime: {e}"
                    ))));
                    return;
                }
            };

            let local = tokio::task::LocalSet::new();
            runtime.block_on(local.run_until(async move {
                let mut app = match Application::load(&config).await {
                    Ok(app) => {
                        let _ = ready_tx.send(Ok(()));
                        app
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                info!("render worker ready");

                while let Some(request) = rx.recv().await {
                    let result = app.visit(&request.path, &request.context).await;
                    if request.reply.send(result).is_err() {
                        // The caller went away; the visit still ran to
                        // completion, destroy included.
                        debug!(path = %request.path, "caller abandoned visit");
                    }
                }
                info!("render worker shutting down");
            }));
        })
        .map_err(|e| RenderError::render_failure(anyhow!("failed to spawn render worker: {e}")))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(RenderHandle { tx }),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            error!("render worker exited before signalling readiness");
            Err(RenderError::render_failure(anyhow!(
                "render worker exited before signalling readiness"
            )))
        }
    }
}
