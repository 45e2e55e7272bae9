use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use imagequeue::prelude::*;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Submission(SubmissionError::MissingPayload) => {
                json_message(StatusCode::BAD_REQUEST, self.to_string())
            }
            Self::Status(StatusError::NotFound(_)) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            Self::Multipart(error) => json_message(error.status(), error.body_text()),
            Self::Submission(_) | Self::Status(_) | Self::Storage(_) => {
                tracing::error!(error = ?self, "Request failed: {self}");
                json_message(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

fn json_message(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "message": message.into() }))).into_response()
}

#[cfg(test)]
mod test {
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;

    async fn render(error: ApiError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn missing_payload() {
        let (status, body) = render(SubmissionError::MissingPayload.into()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "message": "No image provided" }));
    }

    #[tokio::test]
    async fn not_found() {
        let (status, body) = render(StatusError::NotFound("nonexistent-123".into()).into()).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Job not found in the system." }));
    }

    #[tokio::test]
    async fn internal_errors_are_not_leaked() {
        let (status, body) = render(SubmissionError::Backend(BackendError::BadState).into()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "message": "Internal server error" }));
    }
}
