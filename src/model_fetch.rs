use crate::config::{ModelConfig, Validatable};
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Error, Debug)]
pub enum ModelFetchError {
    #[error("Model download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Model download returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("Failed to write model file: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads the model when it is missing locally and a download URL is set.
pub async fn ensure_model(model_config: &ModelConfig) -> Result<(), ModelFetchError> {
    let path = model_config.get_path();
    if path.exists() {
        return Ok(());
    }

    match &model_config.download_url {
        Some(url) => download(url, &path).await,
        None => Ok(()),
    }
}

async fn download(url: &str, path: &Path) -> Result<(), ModelFetchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    tracing::info!("Downloading model from {} to {:?}", url, path);
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(ModelFetchError::Status(response.status()));
    }

    let partial = partial_path(path);
    let written = write_partial(&partial, response.bytes_stream()).await?;
    if let Err(e) = fs::rename(&partial, path).await {
        let _ = fs::remove_file(&partial).await;
        return Err(e.into());
    }
    tracing::info!("Downloaded {} bytes to {:?}", written, path);

    Ok(())
}

/// Streams the body into `partial`, removing it again if any chunk fails to arrive or write.
async fn write_partial<S, B, E>(partial: &Path, stream: S) -> Result<u64, ModelFetchError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<ModelFetchError>,
{
    let mut file = fs::File::create(partial).await?;
    let result = write_chunks(&mut file, stream).await;
    drop(file);

    if result.is_err() {
        let _ = fs::remove_file(partial).await;
    }
    result
}

async fn write_chunks<S, B, E>(file: &mut fs::File, stream: S) -> Result<u64, ModelFetchError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<ModelFetchError>,
{
    let mut stream = std::pin::pin!(stream);
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(Into::<ModelFetchError>::into)?;
        file.write_all(chunk.as_ref()).await?;
        written += chunk.as_ref().len() as u64;
    }
    file.flush().await?;

    Ok(written)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    PathBuf::from(partial)
}
