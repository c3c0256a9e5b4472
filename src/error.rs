//! 统一的 WebDAV 错误类型与 HTTP 状态映射。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("locked: {0}")]
    Locked(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("unsupported media type")]
    UnsupportedMediaType,
    #[error("range not satisfiable (size {0})")]
    RangeNotSatisfiable(u64),
    #[error("backend failure: {0}")]
    Backend(StoreError),
    #[error("backend consistency violation: {0}")]
    Consistency(String),
    #[error("unauthorized")]
    Unauthorized(HeaderMap),
    #[error("too many requests")]
    TooManyRequests(u64),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DavError {
    pub fn status(&self) -> StatusCode {
        match self {
            DavError::NotFound(_) => StatusCode::NOT_FOUND,
            DavError::Locked(_) => StatusCode::LOCKED,
            DavError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            DavError::Forbidden(_) => StatusCode::FORBIDDEN,
            DavError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DavError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            DavError::Conflict(_) => StatusCode::CONFLICT,
            DavError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            DavError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            DavError::Backend(_) => StatusCode::BAD_GATEWAY,
            DavError::Consistency(_) | DavError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DavError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for DavError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            DavError::NotFound(msg)
            | DavError::Locked(msg)
            | DavError::PreconditionFailed(msg)
            | DavError::Forbidden(msg)
            | DavError::InvalidRequest(msg)
            | DavError::Unsupported(msg)
            | DavError::Conflict(msg)
            | DavError::MethodNotAllowed(msg) => (status, msg).into_response(),
            DavError::UnsupportedMediaType => {
                (status, "request body not supported").into_response()
            }
            DavError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (status, headers, "range not satisfiable").into_response()
            }
            DavError::Backend(err) => {
                error!(error = %err, "backend operation failed");
                (status, "backend error").into_response()
            }
            DavError::Consistency(msg) => {
                error!(detail = %msg, "backend consistency violation");
                (status, "inconsistent backend state").into_response()
            }
            DavError::Internal(msg) => {
                error!(detail = %msg, "internal error");
                (status, "internal error").into_response()
            }
            DavError::Unauthorized(headers) => (status, headers, "unauthorized").into_response(),
            DavError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (status, headers, "too many requests").into_response()
            }
        }
    }
}

impl From<StoreError> for DavError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => DavError::NotFound(what),
            StoreError::AlreadyExists(what) => DavError::Conflict(format!("{what} already exists")),
            other => DavError::Backend(other),
        }
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(error: xml::writer::Error) -> Self {
        DavError::Internal(format!("xml output: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_details_are_not_echoed() {
        let response =
            DavError::Backend(StoreError::Transfer("token=abc123 expired".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn store_not_found_maps_to_404() {
        let err: DavError = StoreError::NotFound("uid-1".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn range_error_carries_content_range() {
        let response = DavError::RangeNotSatisfiable(36).into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */36"
        );
    }
}
