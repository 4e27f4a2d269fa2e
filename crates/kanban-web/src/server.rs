use axum::serve;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::WebError;
use crate::routes::router;
use crate::state::WebState;

/// Serves until ctrl-c, then cancels live runs before returning.
pub async fn run_web_server(bind_addr: &str, state: WebState) -> Result<(), WebError> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(bind = %listener.local_addr()?, "kanband listening");
    let registry = state.registry.clone();
    serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    registry.cancel_all();
    Ok(())
}
