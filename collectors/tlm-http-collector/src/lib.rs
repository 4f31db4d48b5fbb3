use std::future::Future;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tlm_core::Ingestor;
use tokio::net::TcpListener;
use tracing::info;

mod error;
mod handlers;

pub use error::{ApiError, Error};
use handlers::AppState;

/// JSON-over-HTTP ingestion: `POST /events`, `GET /health` and
/// `GET /stats`.
#[derive(Deserialize, Debug, Clone)]
pub struct HttpCollector {
    pub id: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
}

pub fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

pub fn default_max_body_bytes() -> usize {
    1024 * 1024
}

pub fn default_retry_after_secs() -> u64 {
    1
}

impl HttpCollector {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            max_body_bytes: default_max_body_bytes(),
            retry_after_secs: default_retry_after_secs(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn router(&self, ingestor: Ingestor) -> Router {
        let state = AppState {
            ingestor,
            retry_after_secs: self.retry_after_secs,
        };
        Router::new()
            .route("/events", post(handlers::post_events))
            .route("/health", get(handlers::health))
            .route("/stats", get(handlers::stats))
            .layer(DefaultBodyLimit::max(self.max_body_bytes))
            .with_state(state)
    }

    pub async fn run(
        &self,
        ingestor: Ingestor,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.address).await?;
        self.serve(listener, ingestor, shutdown).await
    }

    /// Serves on `listener` until `shutdown` resolves and in-flight requests
    /// are answered.
    pub async fn serve(
        &self,
        listener: TcpListener,
        ingestor: Ingestor,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Error> {
        info!("{} listening on {}", self.id, listener.local_addr()?);
        axum::serve(listener, self.router(ingestor))
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("{} stopped", self.id);
        Ok(())
    }
}
