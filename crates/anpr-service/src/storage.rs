//! Plate image persistence.

use async_trait::async_trait;
use common::plates::SavedImages;
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persists the images of one saved plate.
///
/// Called once per saved candidate.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// `sequence` disambiguates saves of the same text within one second
    async fn save_images(
        &self,
        plate: &RgbImage,
        full_frame: Option<&RgbImage>,
        text: &str,
        sequence: u64,
    ) -> Result<SavedImages, StorageError>;
}

/// Upper-case the text and keep only `[A-Z0-9-]`
pub fn safe_plate_text(text: &str) -> String {
    let safe: String = text
        .chars()
        .flat_map(char::to_uppercase)
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    if safe.is_empty() {
        "UNKNOWN".to_string()
    } else {
        safe
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, StorageError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(image)?;
    Ok(buffer)
}

/// Writes JPEGs into a flat directory
#[derive(Debug, Clone)]
pub struct FsImageStore {
    dir: PathBuf,
    quality: u8,
}

impl FsImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quality: 90,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write(&self, filename: &str, image: &RgbImage) -> Result<PathBuf, StorageError> {
        let bytes = encode_jpeg(image, self.quality)?;
        let path = self.dir.join(filename);

        let io_err = |source| StorageError::Io {
            path: path.clone(),
            source,
        };
        let mut file = fs::File::create(&path).await.map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        debug!(path = %path.display(), bytes = bytes.len(), "wrote plate image");
        Ok(path)
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn save_images(
        &self,
        plate: &RgbImage,
        full_frame: Option<&RgbImage>,
        text: &str,
        sequence: u64,
    ) -> Result<SavedImages, StorageError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let stem = format!(
            "plate_{}_{}_{:04}",
            safe_plate_text(text),
            chrono::Local::now().format("%Y%m%d_%H%M%S_%6f"),
            sequence
        );

        let plate_filename = format!("{}.jpg", stem);
        let plate_path = self.write(&plate_filename, plate).await?;

        let mut saved = SavedImages {
            plate_filename,
            plate_path,
            full_frame_filename: None,
            full_frame_path: None,
        };

        if let Some(frame) = full_frame {
            let filename = format!("{}_full.jpg", stem);
            match self.write(&filename, frame).await {
                Ok(path) => {
                    saved.full_frame_filename = Some(filename);
                    saved.full_frame_path = Some(path);
                }
                Err(e) => warn!(file = %filename, error = %e, "failed to save full frame"),
            }
        }

        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_plate_text() {
        assert_eq!(safe_plate_text("wp cab-1234"), "WPCAB-1234");
        assert_eq!(safe_plate_text("KA01/AB.1234"), "KA01AB1234");
        assert_eq!(safe_plate_text(""), "UNKNOWN");
        assert_eq!(safe_plate_text("?? !"), "UNKNOWN");
    }

    #[test]
    fn test_encode_jpeg() {
        let bytes = encode_jpeg(&RgbImage::new(32, 16), 80).expect("encodes");
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_save_plate_and_full_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsImageStore::new(dir.path().join("detected"));

        let saved = store
            .save_images(
                &RgbImage::new(120, 30),
                Some(&RgbImage::new(640, 480)),
                "ab 123",
                7,
            )
            .await
            .expect("saved");

        assert!(saved.plate_filename.starts_with("plate_AB123_"));
        assert!(saved.plate_filename.ends_with("_0007.jpg"));
        assert!(saved.plate_path.exists());

        let full = saved.full_frame_filename.expect("full frame saved");
        assert_eq!(full, saved.plate_filename.replace(".jpg", "_full.jpg"));
        assert!(saved.full_frame_path.expect("path").exists());
    }

    #[tokio::test]
    async fn test_save_without_full_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsImageStore::new(dir.path());

        let saved = store
            .save_images(&RgbImage::new(120, 30), None, "", 1)
            .await
            .expect("saved");

        assert!(saved.plate_filename.starts_with("plate_UNKNOWN_"));
        assert!(saved.full_frame_path.is_none());
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").expect("write");

        let result = FsImageStore::new(&blocker)
            .save_images(&RgbImage::new(120, 30), None, "ABC123", 1)
            .await;
        assert!(matches!(result, Err(StorageError::Io { .. })));
    }
}
