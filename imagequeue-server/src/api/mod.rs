//! HTTP routes: `POST /upload`, `GET /status/{id}` and `GET /health`.
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use imagequeue::prelude::*;
use serde_json::json;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

mod error;

pub use error::ApiError;

/// Name of the multipart field carrying the upload.
pub const IMAGE_FIELD: &str = "image";

/// Services shared by the handlers.
pub struct AppState<B> {
    submission: SubmissionService<B>,
    status: StatusService<B>,
    storage: Arc<dyn FileStorage>,
}

impl<B: Clone> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            submission: self.submission.clone(),
            status: self.status.clone(),
            storage: self.storage.clone(),
        }
    }
}

impl<B> AppState<B>
where
    B: Backend + Clone,
{
    pub fn new(backend: B, storage: Arc<dyn FileStorage>) -> Self {
        Self {
            submission: SubmissionService::new(backend.clone()),
            status: StatusService::new(backend),
            storage,
        }
    }

    pub fn with_job_options(self, options: JobOptions) -> Self {
        Self {
            submission: self.submission.with_job_options(options),
            ..self
        }
    }
}

pub fn router<B>(state: AppState<B>, max_upload_bytes: usize) -> Router
where
    B: Backend + Clone + 'static,
{
    Router::new()
        .route("/upload", post(upload::<B>))
        .route("/status/{id}", get(status::<B>))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upload<B>(
    State(state): State<AppState<B>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, ApiError>
where
    B: Backend + Clone + 'static,
{
    // A request that is not multipart at all carries no image either.
    let payload = match multipart {
        Ok(multipart) => read_image(multipart, state.storage.as_ref()).await?,
        Err(rejection) => {
            tracing::debug!(%rejection, "Upload is not a multipart request");
            None
        }
    };
    let stored = payload.as_ref().map(|payload| payload.path.clone());

    match state.submission.submit(payload).await {
        Ok(job_id) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "message": "Image uploaded", "jobId": job_id })),
        )),
        Err(error) => {
            if let Some(path) = stored {
                let _ = state
                    .storage
                    .remove_upload(&path)
                    .await
                    .inspect_err(|error| {
                        tracing::warn!(?error, path = %path.display(), "Failed to remove upload")
                    });
            }
            Err(error.into())
        }
    }
}

/// Stores the first file sent in the [`IMAGE_FIELD`] field, ignoring every other field.
async fn read_image(
    mut multipart: Multipart,
    storage: &dyn FileStorage,
) -> Result<Option<ImagePayload>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let Some(original_name) = field.file_name().map(ToOwned::to_owned) else {
            continue;
        };
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_owned();
        let bytes = field.bytes().await?;
        let path = storage.store_upload(&bytes).await?;
        return Ok(Some(ImagePayload {
            path,
            original_name,
            mime_type,
        }));
    }
    Ok(None)
}

async fn status<B>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusReport>, ApiError>
where
    B: Backend + Clone + 'static,
{
    let report = state.status.get_status(&JobId::from(id)).await?;
    Ok(Json(report))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "message": "Server is running" }))
}
