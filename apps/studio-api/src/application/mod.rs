use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use serde_json::json;
use studio_core::CoreError;
use tracing::{error, warn};

pub mod authz;
pub mod commands;
pub mod middleware;
pub mod query;

/// Error returned by every handler. Rendered as `{"error": "<message>"}`.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Missing or invalid bearer token")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// `Json` body extractor whose rejections render like every other `ApiError`.
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(JsonBody(value))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Core(err) => map_core_error(err),
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Driver errors stay in the logs.
            ApiError::Core(CoreError::Infrastructure(e)) => {
                error!("Dependency failure: {}", e);
                "A backing service is unavailable".to_string()
            }
            ApiError::Core(CoreError::Internal(_) | CoreError::Configuration(_)) => {
                error!("Internal error: {}", self);
                "Internal server error".to_string()
            }
            other => {
                warn!(status = %status, "Request failed: {}", other);
                other.to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn map_core_error(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        CoreError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Configuration(_) | CoreError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
