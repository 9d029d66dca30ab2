use crate::{
    config::Config, model_service::ModelService, routes::api_routes, state::ServiceState,
    telemetry::Metrics, uploads::UploadStore,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::{services::ServeDir, trace::TraceLayer};

#[derive(Clone)]
pub struct SharedState {
    pub model_service: Arc<dyn ModelService>,
    pub service_state: Arc<ServiceState>,
    pub upload_store: Arc<UploadStore>,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: SharedState, max_upload_bytes: usize) -> Router {
    let uploads = ServeDir::new(state.upload_store.upload_dir());
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes())
        .nest_service("/uploads", uploads)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let router = build_router(state, config.uploads.max_upload_bytes);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}
