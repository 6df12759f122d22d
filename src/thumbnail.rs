//! Thumbnail generation for uploaded images.
//!
//! Each image gets one artifact per width in [`THUMBNAIL_WIDTHS`], written next
//! to the original as `<path>_<width>`. Paths are deterministic, so a
//! redelivered job overwrites whatever a previous attempt left behind.

use crate::gateway::DataGateway;
use crate::payload::ThumbnailJobPayload;
use crate::processor::JobProcessor;
use crate::{Job, JobError};
use async_trait::async_trait;
use futures::future::join_all;
use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{ImageFormat, ImageOutputFormat};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::*;
use uuid::Uuid;

pub const THUMBNAIL_WIDTHS: [u32; 3] = [500, 250, 100];

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognized image format in {}", .0.display())]
    UnknownFormat(PathBuf),

    #[error("failed to decode or encode image")]
    Image(#[from] image::ImageError),

    #[error("thumbnail width must be positive")]
    ZeroWidth,

    #[error("resize task aborted")]
    Join(#[from] tokio::task::JoinError),
}

pub fn thumbnail_path(path: &Path, width: u32) -> PathBuf {
    let mut derived = path.as_os_str().to_owned();
    derived.push(format!("_{width}"));
    PathBuf::from(derived)
}

#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// Returns the encoded image scaled to `width` pixels wide.
    async fn resize(&self, source: &Path, width: u32) -> Result<Vec<u8>, ThumbnailError>;
}

/// Decodes with the `image` crate, keeps the aspect ratio and re-encodes in
/// the source format, falling back to PNG for formats without an encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageThumbnailer;

impl ImageThumbnailer {
    fn resize_blocking(source: &Path, width: u32) -> Result<Vec<u8>, ThumbnailError> {
        if width == 0 {
            return Err(ThumbnailError::ZeroWidth);
        }
        let reader = ImageReader::open(source)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|err| ThumbnailError::Read {
                path: source.to_path_buf(),
                source: err,
            })?;
        let format = reader
            .format()
            .ok_or_else(|| ThumbnailError::UnknownFormat(source.to_path_buf()))?;
        let image = reader.decode()?;

        let height = scaled_height(image.width(), image.height(), width);
        let resized = image.resize_exact(width, height, FilterType::Lanczos3);

        let output = match format {
            ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Gif | ImageFormat::Bmp => format,
            _ => ImageFormat::Png,
        };
        let mut buffer = Cursor::new(Vec::new());
        resized.write_to(&mut buffer, ImageOutputFormat::from(output))?;
        Ok(buffer.into_inner())
    }
}

fn scaled_height(src_width: u32, src_height: u32, width: u32) -> u32 {
    if src_width == 0 {
        return 1;
    }
    let height = (src_height as f64 * width as f64 / src_width as f64).round() as u32;
    height.max(1)
}

#[async_trait]
impl ThumbnailGenerator for ImageThumbnailer {
    async fn resize(&self, source: &Path, width: u32) -> Result<Vec<u8>, ThumbnailError> {
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || Self::resize_blocking(&source, width)).await?
    }
}

/// Writes through a uniquely named sibling so readers never observe a
/// half-written thumbnail, even when duplicate deliveries race.
async fn write_artifact(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut partial = target.as_os_str().to_owned();
    partial.push(format!(".{}.partial", Uuid::new_v4().simple()));
    let partial = PathBuf::from(partial);

    fs::write(&partial, bytes).await?;
    if let Err(err) = fs::rename(&partial, target).await {
        let _ = fs::remove_file(&partial).await;
        return Err(err);
    }
    Ok(())
}

pub struct ThumbnailProcessor {
    gateway: Arc<dyn DataGateway>,
    generator: Arc<dyn ThumbnailGenerator>,
}

impl ThumbnailProcessor {
    pub fn new(gateway: Arc<dyn DataGateway>, generator: Arc<dyn ThumbnailGenerator>) -> Self {
        ThumbnailProcessor { gateway, generator }
    }

    async fn generate(&self, source: &Path, width: u32) -> Result<PathBuf, JobError> {
        let target = thumbnail_path(source, width);
        debug!(message = "Generating thumbnail", source = %source.display(), width);

        let bytes = self
            .generator
            .resize(source, width)
            .await
            .map_err(|err| JobError::processing(format!("resizing to {width}px"), err))?;
        write_artifact(&target, &bytes)
            .await
            .map_err(|err| JobError::processing(format!("writing {}", target.display()), err))?;
        Ok(target)
    }
}

#[async_trait]
impl JobProcessor for ThumbnailProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload = ThumbnailJobPayload::from_payload(&job.payload)?;

        let file = self
            .gateway
            .find_file_by_id(&payload.file_id, &payload.user_id)
            .await
            .map_err(|err| JobError::processing("looking up file", err))?
            .ok_or_else(|| JobError::not_found("file", payload.file_id.as_str()))?;
        info!(message = "Processing", file_id = %file.id, name = %file.name);

        // Every width runs to completion before the outcome is decided
        let results = join_all(
            THUMBNAIL_WIDTHS
                .iter()
                .map(|&width| self.generate(&file.local_path, width)),
        )
        .await;

        let mut first_error = None;
        for (width, result) in THUMBNAIL_WIDTHS.iter().zip(results) {
            if let Err(err) = result {
                warn!(message = "Thumbnail failed", width, error = %err.report());
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        info!(message = "Thumbnails generated", file_id = %file.id, widths = ?THUMBNAIL_WIDTHS);
        Ok(())
    }
}
