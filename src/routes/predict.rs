use crate::{
    model_service::{Prediction, PredictionError},
    server::SharedState,
    state::{class_info, ClassInfo},
    uploads::{is_allowed, StoredUpload, UploadError},
    views::{index_page, result_page},
};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

const UPLOAD_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum PredictImageError {
    #[error("No file selected")]
    NoFile,
    #[error("Invalid upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

impl PredictImageError {
    fn status_code(&self) -> StatusCode {
        match self {
            PredictImageError::NoFile => StatusCode::BAD_REQUEST,
            PredictImageError::Multipart(e) => e.status(),
            PredictImageError::Upload(UploadError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            PredictImageError::Upload(_) => StatusCode::BAD_REQUEST,
            PredictImageError::Prediction(PredictionError::InvalidImage(_)) => {
                StatusCode::BAD_REQUEST
            }
            PredictImageError::Prediction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for PredictImageError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    #[serde(flatten)]
    prediction: Prediction,
    info: ClassInfo,
}

struct UploadedFile {
    filename: String,
    data: Bytes,
}

async fn read_upload(multipart: &mut Multipart) -> Result<UploadedFile, PredictImageError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return Err(PredictImageError::NoFile);
        }
        let data = field.bytes().await?;

        return Ok(UploadedFile { filename, data });
    }

    Err(PredictImageError::NoFile)
}

async fn run_prediction(
    state: &SharedState,
    data: &Bytes,
    route: &str,
) -> Result<Prediction, PredictionError> {
    let start = Instant::now();
    let prediction = state.model_service.predict(data.to_vec()).await?;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    state
        .metrics
        .record_prediction(&prediction.label, elapsed_ms, route);
    tracing::info!(
        label = %prediction.label,
        confidence = prediction.confidence,
        elapsed_ms,
        "Prediction complete"
    );

    Ok(prediction)
}

/// Stores the upload, predicts, and trims the upload directory.
/// The stored file is removed again when the prediction fails.
async fn classify_upload(
    state: &SharedState,
    multipart: &mut Multipart,
) -> Result<(Prediction, StoredUpload), PredictImageError> {
    let upload = read_upload(multipart).await?;
    let stored = state
        .upload_store
        .save(&upload.filename, &upload.data)
        .await?;

    match run_prediction(state, &upload.data, "/predict").await {
        Ok(prediction) => {
            if let Err(e) = state.upload_store.clean_uploads().await {
                tracing::warn!("Failed to clean uploads: {}", e);
            }
            Ok((prediction, stored))
        }
        Err(e) => {
            state.upload_store.remove(&stored).await;
            Err(e.into())
        }
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict_page(State(state): State<SharedState>, mut multipart: Multipart) -> Response {
    state.metrics.record_request("/predict");

    match classify_upload(&state, &mut multipart).await {
        Ok((prediction, stored)) => {
            let info = class_info(&prediction.label);
            let image_url = format!("/uploads/{}", stored.filename);
            Html(result_page(&prediction, &info, &image_url)).into_response()
        }
        Err(e) => {
            tracing::warn!("Prediction request failed: {}", e);
            (e.status_code(), Html(index_page(Some(&e.to_string())))).into_response()
        }
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict_api(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResponse>, PredictImageError> {
    state.metrics.record_request("/api/predict");

    let upload = read_upload(&mut multipart).await?;
    if !is_allowed(&upload.filename) {
        return Err(UploadError::NotAllowed(upload.filename).into());
    }

    let prediction = run_prediction(&state, &upload.data, "/api/predict").await?;
    let info = class_info(&prediction.label);

    Ok(Json(PredictionResponse { prediction, info }))
}
