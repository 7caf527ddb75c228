// Mapping of store errors onto HTTP responses

use autotest_common::error::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Store(StoreError::Validation(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(StoreError::Unauthorized) => StatusCode::UNAUTHORIZED,
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Store(StoreError::UserExists(_)) | ApiError::Store(StoreError::AlreadyQueued(_)) => {
                StatusCode::CONFLICT
            }
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            "server error".to_string()
        } else {
            capitalise(&self.to_string())
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

fn capitalise(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::from(StoreError::Unauthorized).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::from(StoreError::NotFound("settings")).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::validation("bad").status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ApiError::from(StoreError::UserExists("bob".into())).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(StoreError::AlreadyQueued("4".into())).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::Internal("boom".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_response_status() {
        let response = ApiError::from(StoreError::NotFound("test result")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_capitalise() {
        assert_eq!(capitalise("settings not found"), "Settings not found");
        assert_eq!(capitalise(""), "");
    }
}
