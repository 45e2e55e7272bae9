//! The [`ImageTransform`] producing the web assets with the `image` crate.
//!
//! For each job three renditions of the upload are produced:
//!
//! - `{output_dir}/{id}.webp`: the full size image as lossless WebP,
//! - `{output_dir}/{id}-mobile.jpg`: an 800 pixel wide JPEG at quality 80,
//! - a 10 pixel wide PNG returned inline as a `data:` URI.
//!
//! The two files are written concurrently. Both writes are awaited even when one of them fails,
//! so the files written so far can be removed before the error is reported.
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{
    codecs::{jpeg::JpegEncoder, webp::WebPEncoder},
    imageops::FilterType,
    DynamicImage, ImageError, ImageFormat, ImageReader,
};
use imagequeue::prelude::*;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
enum ProcessingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("Image processing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct ImageProcessor {
    output_dir: PathBuf,
}

impl ImageProcessor {
    pub const MOBILE_WIDTH: u32 = 800;
    pub const MOBILE_QUALITY: u8 = 80;
    pub const PLACEHOLDER_WIDTH: u32 = 10;

    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn webp_path(&self, id: &JobId) -> PathBuf {
        self.output_dir.join(format!("{id}.webp"))
    }

    fn mobile_path(&self, id: &JobId) -> PathBuf {
        self.output_dir.join(format!("{id}-mobile.jpg"))
    }

    async fn process(
        &self,
        input: &TransformInput,
        webp: &Path,
        mobile: &Path,
    ) -> Result<TransformOutput, ProcessingError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let image = Arc::new(blocking({
            let path = input.path.clone();
            move || decode(&path)
        })
        .await?);

        let (webp_written, mobile_written) = tokio::join!(
            blocking({
                let image = image.clone();
                let path = webp.to_owned();
                move || write_webp(&image, &path)
            }),
            blocking({
                let image = image.clone();
                let path = mobile.to_owned();
                move || write_mobile(&image, &path)
            }),
        );
        webp_written?;
        mobile_written?;

        let placeholder = blocking(move || placeholder(&image)).await?;

        Ok(TransformOutput::new(ImageAssets {
            webp: webp.to_owned(),
            mobile: mobile.to_owned(),
            placeholder,
        }))
    }
}

#[async_trait]
impl ImageTransform for ImageProcessor {
    #[instrument(skip_all, fields(job_id = %input.id))]
    async fn transform(&self, input: TransformInput) -> Result<TransformOutput, TransformError> {
        let webp = self.webp_path(&input.id);
        let mobile = self.mobile_path(&input.id);

        match self.process(&input, &webp, &mobile).await {
            Ok(output) => {
                tracing::debug!(webp = %webp.display(), mobile = %mobile.display(), "Processed image");
                Ok(output)
            }
            Err(error) => {
                tracing::warn!(?error, path = %input.path.display(), "Failed to process image: {error}");
                remove_partial_outputs([&webp, &mobile]).await;
                Err(TransformError::new(error))
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ProcessingError>
where
    F: FnOnce() -> Result<T, ProcessingError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

async fn remove_partial_outputs(paths: [&Path; 2]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed partial output"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(?error, path = %path.display(), "Failed to remove partial output")
            }
        }
    }
}

// Uploads are stored without an extension so the format is sniffed from the content.
fn decode(path: &Path) -> Result<DynamicImage, ProcessingError> {
    Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?)
}

fn write_webp(image: &DynamicImage, path: &Path) -> Result<(), ProcessingError> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgba8(image.to_rgba8())
        .write_with_encoder(WebPEncoder::new_lossless(&mut buffer))?;
    std::fs::write(path, buffer)?;
    Ok(())
}

fn write_mobile(image: &DynamicImage, path: &Path) -> Result<(), ProcessingError> {
    let resized = resize_to_width(image, ImageProcessor::MOBILE_WIDTH);
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(resized.to_rgb8()).write_with_encoder(
        JpegEncoder::new_with_quality(&mut buffer, ImageProcessor::MOBILE_QUALITY),
    )?;
    std::fs::write(path, buffer)?;
    Ok(())
}

fn placeholder(image: &DynamicImage) -> Result<String, ProcessingError> {
    let resized = resize_to_width(image, ImageProcessor::PLACEHOLDER_WIDTH);
    let mut buffer = Cursor::new(Vec::new());
    resized.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(buffer.into_inner())
    ))
}

fn resize_to_width(image: &DynamicImage, width: u32) -> DynamicImage {
    let source_width = u64::from(image.width().max(1));
    let height = ((u64::from(image.height()) * u64::from(width) + source_width / 2) / source_width)
        .clamp(1, u64::from(u32::MAX));
    image.resize_exact(width, height as u32, FilterType::Lanczos3)
}
