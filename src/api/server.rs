//! Server lifecycle: bind loopback, serve, drain on shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::oneshot;

use super::router::api_router;
use super::types::ApiContext;

/// Bounded drain period for running inferences at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(20);

/// Margin on top of the drain window before giving up on the serve task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle to a running API server.
pub struct ApiServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    drained_rx: Option<oneshot::Receiver<()>>,
    ctx: ApiContext,
}

impl ApiServer {
    /// Signal the server to stop accepting connections and drain.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tracing::info!("API server shutdown signal sent");
        }
    }

    /// Signal shutdown, then wait for the listener to close and the
    /// scheduler to finish its bounded drain. Returns once running work
    /// completed or the drain window (plus a small margin) elapsed.
    pub async fn shutdown_and_drain(&mut self) {
        self.shutdown();
        if let Some(drained) = self.drained_rx.take() {
            if tokio::time::timeout(SHUTDOWN_DRAIN + SHUTDOWN_GRACE, drained)
                .await
                .is_err()
            {
                tracing::warn!("Shutdown drain did not finish within its window");
            }
        }
    }
}

/// Bind the configured loopback address and serve in a background task.
///
/// Returns a handle carrying the bound address (useful with port 0), a
/// shutdown channel, and a completion channel that fires after the listener
/// closes and the scheduler drains.
pub async fn start(ctx: ApiContext) -> Result<ApiServer, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(ctx.config.bind_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "API server binding");

    let app = api_router(ctx.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (drained_tx, drained_rx) = oneshot::channel::<()>();

    let serve_ctx = ctx.clone();
    tokio::spawn(async move {
        let shutdown_signal = async move {
            let _ = shutdown_rx.await;
            tracing::info!("API server received shutdown signal");
        };

        tracing::info!(%addr, "API server started");

        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal)
        .await
        {
            tracing::error!(error = %e, "API server error");
        }

        serve_ctx.scheduler.shutdown(SHUTDOWN_DRAIN).await;
        tracing::info!("API server stopped");
        let _ = drained_tx.send(());
    });

    Ok(ApiServer {
        addr,
        shutdown_tx: Some(shutdown_tx),
        drained_rx: Some(drained_rx),
        ctx,
    })
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.shutdown();
        // Queues refuse intake immediately even if the drain task is still
        // finishing behind us.
        self.ctx.scheduler.generate.close();
        self.ctx.scheduler.speech.close();
        self.ctx.scheduler.embed.close();
    }
}
