use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::proxy::SchemeError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    Scheme(#[from] SchemeError),

    #[error("Application failed to load: {0}")]
    Load(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Scheme(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            _ => {
                tracing::error!("Internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, message).into_response()
    }
}
