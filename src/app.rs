use crate::{
    config::{Config, Validatable},
    model_fetch::ensure_model,
    ort_service::OrtModelService,
    server::{HttpServer, SharedState},
    state::ServiceState,
    telemetry::Metrics,
    uploads::UploadStore,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    if let Err(e) = ensure_model(&config.model).await {
        tracing::error!("Failed to fetch model: {:?}", e);
        return Err(Box::new(e));
    }
    if let Err(e) = config.model.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let service_state = ServiceState::new(&config.labels);

    let model_service =
        match OrtModelService::new(&config.model, service_state.get_labels().clone()) {
            Ok(service) => service,
            Err(e) => {
                tracing::error!("Failed to initialize model service: {:?}", e);
                return Err(Box::new(e));
            }
        };

    let state = SharedState {
        model_service: Arc::new(model_service),
        service_state: Arc::new(service_state),
        upload_store: Arc::new(UploadStore::new(&config.uploads)),
        metrics: Arc::new(Metrics::new()?),
    };

    let server = HttpServer::new(state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server stopped with error: {:?}", e),
        Err(e) => tracing::error!("Server task failed: {:?}", e),
        Ok(Ok(())) => tracing::info!("Server stopped"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
