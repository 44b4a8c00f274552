//! Router assembly and the listening loop.

use axum::{routing::get, Router};
use snapferry_storage::{
    dataset::{join_parent, strip_parent, validate_name},
    Dataset, StorageDriver,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::HttpConfig;
use crate::error::ApiError;
use crate::gate::ReceiveGate;
use crate::handlers;
use crate::security::{auth_middleware, security_headers_middleware, Authenticator};
use crate::throttle::Throttle;

/// Everything a request handler needs.
pub struct TransportState {
    pub(crate) driver: Arc<dyn StorageDriver>,
    pub(crate) config: HttpConfig,
    pub(crate) gate: ReceiveGate,
    pub(crate) throttle: Arc<Throttle>,
}

impl TransportState {
    /// Builds the state from configuration.
    pub fn new(driver: Arc<dyn StorageDriver>, config: HttpConfig) -> Self {
        Self {
            gate: ReceiveGate::new(config.max_concurrent_receives),
            throttle: Arc::new(Throttle::new(config.max_bytes_per_second)),
            driver,
            config,
        }
    }

    /// The receive admission gate.
    pub fn gate(&self) -> &ReceiveGate {
        &self.gate
    }

    /// Full dataset name of a wire filesystem name.
    pub(crate) fn filesystem(&self, fs: &str) -> Result<String, ApiError> {
        if fs.contains('@') {
            return Err(ApiError::BadRequest(format!("not a filesystem name: {}", fs)));
        }
        let name = join_parent(&self.config.parent_dataset, fs);
        validate_name(&name)?;
        Ok(name)
    }

    /// Full dataset name of a wire snapshot name.
    pub(crate) fn snapshot(&self, fs: &str, snap: &str) -> Result<String, ApiError> {
        let name = format!("{}@{}", self.filesystem(fs)?, snap);
        validate_name(&name)?;
        Ok(name)
    }

    /// Rewrites a dataset for the wire: names relative to the parent.
    pub(crate) fn to_wire(&self, mut ds: Dataset) -> Dataset {
        ds.name = strip_parent(&self.config.parent_dataset, &ds.name).to_string();
        ds
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.config.request_timeout().map(|t| Instant::now() + t)
    }
}

/// Builds the authenticated router.
pub fn router(state: Arc<TransportState>) -> Router {
    let auth = Arc::new(Authenticator::new(state.config.auth_tokens.clone()));
    let prefix = state.config.normalized_prefix();

    let api = Router::new()
        .route("/filesystems", get(handlers::list_filesystems))
        .route(
            "/filesystems/:fs",
            get(handlers::get_filesystem)
                .patch(handlers::patch_filesystem)
                .delete(handlers::destroy_filesystem),
        )
        .route("/filesystems/:fs/resume-token", get(handlers::resume_token))
        .route(
            "/filesystems/:fs/snapshots",
            get(handlers::list_snapshots).put(handlers::receive_filesystem),
        )
        .route(
            "/filesystems/:fs/snapshots/:snap",
            get(handlers::send_snapshot)
                .post(handlers::create_snapshot)
                .put(handlers::receive_snapshot)
                .patch(handlers::patch_snapshot)
                .delete(handlers::destroy_snapshot),
        )
        .route(
            "/filesystems/:fs/snapshots/:snap/incremental/:base",
            get(handlers::send_incremental),
        )
        .route("/snapshot/resume/:token", get(handlers::resume_send))
        .layer(axum::middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(state);

    let app = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(&prefix, api)
    };

    app.layer(axum::middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Serves the router until `shutdown` fires, then drains open connections.
pub async fn serve(
    listener: TcpListener,
    state: Arc<TransportState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, parent = %state.config.parent_dataset, "replication API listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("replication API closed");
    Ok(())
}
