use crate::config::UploadConfig;
use image::ImageFormat;
use std::{
    borrow::Cow,
    io::{self, Cursor},
    path::{Path, PathBuf},
    time::SystemTime,
};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

pub const ALLOWED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "tif", "tiff"];

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid file name: {0:?}")]
    InvalidFilename(String),
    #[error("File type not allowed: {0:?}. Use one of png, jpg, jpeg, tif, tiff")]
    NotAllowed(String),
    #[error("Upload storage error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    upload_dir: PathBuf,
    max_files: usize,
}

pub fn is_allowed(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_tiff(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| matches!(ext.to_lowercase().as_str(), "tif" | "tiff"))
        .unwrap_or(false)
}

/// Browsers cannot render TIFF, so those uploads are kept as PNG for the result view.
fn tiff_to_png(data: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory_with_format(data, ImageFormat::Tiff)?;
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(cursor.into_inner())
}

/// Reduces a client supplied name to a flat ASCII file name.
pub fn secure_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']);

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

impl UploadStore {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            max_files: config.max_files,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub async fn save(&self, filename: &str, data: &[u8]) -> Result<StoredUpload, UploadError> {
        if !is_allowed(filename) {
            return Err(UploadError::NotAllowed(filename.to_string()));
        }
        let secure = secure_filename(filename)
            .filter(|name| is_allowed(name))
            .ok_or_else(|| UploadError::InvalidFilename(filename.to_string()))?;

        let (secure, data) = if is_tiff(&secure) {
            let raw = data.to_vec();
            match tokio::task::spawn_blocking(move || tiff_to_png(&raw)).await {
                Ok(Ok(png)) => {
                    let stem = secure.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&secure);
                    (format!("{}.png", stem), Cow::Owned(png))
                }
                Ok(Err(e)) => {
                    tracing::debug!("Keeping {:?} as TIFF, PNG conversion failed: {}", filename, e);
                    (secure, Cow::Borrowed(data))
                }
                Err(e) => {
                    tracing::warn!("TIFF conversion task failed: {}", e);
                    (secure, Cow::Borrowed(data))
                }
            }
        } else {
            (secure, Cow::Borrowed(data))
        };

        fs::create_dir_all(&self.upload_dir).await?;

        let stored_name = format!("{}_{}", Uuid::new_v4().simple(), secure);
        let path = self.upload_dir.join(&stored_name);
        fs::write(&path, data.as_ref()).await?;

        tracing::debug!("Stored upload {:?} as {:?}", filename, path);
        Ok(StoredUpload {
            filename: stored_name,
            path,
        })
    }

    pub async fn remove(&self, upload: &StoredUpload) {
        if let Err(e) = fs::remove_file(&upload.path).await {
            tracing::warn!("Failed to remove upload {:?}: {}", upload.path, e);
        }
    }

    /// Deletes the oldest files until at most `max_files` remain.
    /// Returns the number of files removed.
    pub async fn clean_uploads(&self) -> Result<usize, UploadError> {
        let mut entries = fs::read_dir(&self.upload_dir).await?;
        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();

        // Concurrent passes may delete entries between listing and stat.
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Stopped listing {:?}: {}", self.upload_dir, e);
                    break;
                }
            };
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::debug!("Skipping upload {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, entry.path()));
        }

        if files.len() <= self.max_files {
            return Ok(0);
        }

        files.sort();
        let excess = files.len() - self.max_files;
        let mut removed = 0;
        for (_, path) in files.into_iter().take(excess) {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!("Old upload {:?} already removed", path)
                }
                Err(e) => tracing::warn!("Failed to remove old upload {:?}: {}", path, e),
            }
        }

        tracing::info!("Removed {} old uploads", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;

    fn store(dir: &TempDir, max_files: usize) -> UploadStore {
        UploadStore::new(&UploadConfig {
            upload_dir: dir.path().join("uploads"),
            max_files,
            max_upload_bytes: 1024,
        })
    }

    #[test]
    fn test_is_allowed() {
        assert!(is_allowed("slide.TIF"));
        assert!(is_allowed("a.b.jpeg"));
        assert!(!is_allowed("slide.gif"));
        assert!(!is_allowed("png"));
    }

    #[test]
    fn test_secure_filename() {
        assert_eq!(
            secure_filename("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            secure_filename("C:\\scans\\my slide (1).tiff").as_deref(),
            Some("my_slide_1.tiff")
        );
        assert_eq!(secure_filename("..."), None);
        assert_eq!(secure_filename("ééé"), None);
    }

    #[tokio::test]
    async fn test_save_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);

        let upload = store.save("cells.png", b"data").await.unwrap();
        assert!(upload.filename.ends_with("_cells.png"));
        assert_eq!(std::fs::read(&upload.path).unwrap(), b"data");

        store.remove(&upload).await;
        assert!(!upload.path.exists());
    }

    #[tokio::test]
    async fn test_save_rejects_disallowed_type() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir, 10).save("notes.txt", b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::NotAllowed(_)));

        let err = store(&dir, 10).save("ééé.png", b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidFilename(_)));
    }

    #[tokio::test]
    async fn test_clean_uploads_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);

        let mut uploads = Vec::new();
        for i in 0..4 {
            uploads.push(store.save(&format!("{}.png", i), b"x").await.unwrap());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let removed = store.clean_uploads().await.unwrap();

        assert_eq!(removed, 2);
        assert!(!uploads[0].path.exists());
        assert!(!uploads[1].path.exists());
        assert!(uploads[2].path.exists());
        assert!(uploads[3].path.exists());
        assert_eq!(store.clean_uploads().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tiff_upload_is_stored_as_png() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);

        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(8, 8, Rgb([10, 20, 30]));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageFormat::Tiff).unwrap();

        let upload = store.save("slide 1.TIFF", &cursor.into_inner()).await.unwrap();
        assert!(upload.filename.ends_with("_slide_1.png"));
        let stored = std::fs::read(&upload.path).unwrap();
        assert_eq!(
            image::guess_format(&stored).unwrap(),
            ImageFormat::Png
        );

        let upload = store.save("broken.tif", b"not-a-tiff").await.unwrap();
        assert!(upload.filename.ends_with("_broken.tif"));
        assert_eq!(std::fs::read(&upload.path).unwrap(), b"not-a-tiff");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clean_uploads_all_complete() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir, 10));
        std::fs::create_dir_all(store.upload_dir()).unwrap();
        for i in 0..500 {
            std::fs::write(store.upload_dir().join(format!("{:04}.png", i)), b"x").unwrap();
        }

        let passes: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.clean_uploads().await })
            })
            .collect();

        let mut removed = 0;
        for pass in passes {
            removed += pass.await.unwrap().unwrap();
        }

        assert_eq!(removed, 490);
        assert_eq!(std::fs::read_dir(store.upload_dir()).unwrap().count(), 10);
    }
}
