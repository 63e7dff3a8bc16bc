use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use velo_types::VeloError;

/// Maps core errors onto HTTP statuses.
///
/// Not-found reads are 404; a missing leader is 503 so clients know to
/// retry with backoff; everything operational is 500.
pub struct ApiError(pub VeloError);

impl From<VeloError> for ApiError {
    fn from(e: VeloError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            VeloError::NotFound => StatusCode::NOT_FOUND,
            VeloError::NotLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
            VeloError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            VeloError::Conflict(_) => StatusCode::CONFLICT,
            VeloError::Timeout | VeloError::Storage(_) | VeloError::Codec(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.0.to_string()).into_response()
    }
}
