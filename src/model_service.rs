use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub class_index: usize,
    /// Percentage in `[1, 100]`, rounded to two decimals.
    pub confidence: f32,
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Unexpected model output: {0}")]
    InvalidOutput(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

#[async_trait]
pub trait ModelService: Send + Sync + 'static {
    async fn predict(&self, image_data: Vec<u8>) -> Result<Prediction, PredictionError>;
}
