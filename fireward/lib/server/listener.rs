use std::{future::Future, net::SocketAddr};

use tokio::net::TcpListener;

use crate::{management::VmmManager, FirewardResult};

use super::{create_router, ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Serves the API on `addr` until `shutdown` resolves, then stops every instance still running.
pub async fn serve(
    manager: VmmManager,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> FirewardResult<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("server listening on {}", listener.local_addr()?);

    let app = create_router(ServerState::new(manager.clone()));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("server stopped, shutting down running vms");
    manager.shutdown().await;
    Ok(())
}

/// Resolves on `SIGINT` or `SIGTERM`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
