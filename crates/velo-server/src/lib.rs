mod error;
mod handlers;
mod middleware;
mod write;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;

use velo_consensus::Cluster;
use velo_storage::BikeStore;

pub use error::ApiError;

/// Everything a request handler needs.
pub struct AppState<C, B> {
    pub cluster: Arc<C>,
    pub bikes: Arc<B>,
    /// Bounded client for follower→leader forwarding.
    pub http: reqwest::Client,
    /// How long a proposer waits for its apply outcome; zero waits forever.
    pub apply_timeout: Duration,
}

impl<C, B> Clone for AppState<C, B> {
    fn clone(&self) -> Self {
        AppState {
            cluster: self.cluster.clone(),
            bikes: self.bikes.clone(),
            http: self.http.clone(),
            apply_timeout: self.apply_timeout,
        }
    }
}

impl<C, B> AppState<C, B> {
    pub fn new(cluster: Arc<C>, bikes: Arc<B>, apply_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build forwarding client");
        AppState { cluster, bikes, http, apply_timeout }
    }
}

/// Build the client-facing router: JSON API, HTML index, CORS and request
/// logging.
pub fn router<C: Cluster, B: BikeStore>(state: AppState<C, B>) -> Router {
    Router::new()
        .route("/", get(handlers::index::<C, B>))
        .route("/bikes", get(handlers::get_bikes::<C, B>).post(write::post_bike::<C, B>))
        .route("/bikes/{id}", get(handlers::get_bike::<C, B>))
        .layer(axum::middleware::from_fn(middleware::cors))
        .layer(axum::middleware::from_fn(middleware::log_request))
        .with_state(state)
}

/// Serve the client API until `shutdown` resolves, then drain in-flight
/// requests.
pub async fn serve<C: Cluster, B: BikeStore>(
    addr: SocketAddr,
    state: AppState<C, B>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "client API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Into::into)
}
