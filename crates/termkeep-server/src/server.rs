use std::future::{Future, IntoFuture};

use anyhow::Context;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use libtermkeep::SessionManager;
use termkeep_protocol::SessionInfo;

use crate::config::ServerConfig;
use crate::ws::ws_handler;

/// Shared application state. The manager is internally reference counted.
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/sessions", get(list_sessions))
        .with_state(state)
}

/// GET /api/sessions - Snapshot of every session, oldest first.
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.manager.get_active_sessions())
}

/// Serve on `listener` until `shutdown` resolves, then terminate every
/// session the manager still holds.
pub async fn serve<F>(listener: TcpListener, manager: SessionManager, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let app = router(AppState {
        manager: manager.clone(),
    });

    let result = tokio::select! {
        res = axum::serve(listener, app).into_future() => {
            if let Err(e) = &res {
                error!("http server error: {e}");
            }
            res.context("http server failed")
        }
        _ = shutdown => {
            info!("shutting down...");
            Ok(())
        }
    };

    let terminated = manager.shutdown();
    info!(terminated, "termkeep server stopped");
    result
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let manager = SessionManager::new(config.manager_config());
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;

    info!(
        listen = %config.listen,
        shell = %config.shell,
        grace_secs = config.orphan_grace_period_secs,
        buffer_bytes = config.output_buffer_size,
        pid = std::process::id(),
        "termkeep server started"
    );

    serve(listener, manager, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await
}
