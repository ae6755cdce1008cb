//! JSON response envelope and plain-text errors.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `{"meta": {...}, "data": ...}` response body.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub meta: Meta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            meta: Meta {
                status: Status::Success,
                message: None,
            },
            data: Some(data),
        }
    }
}

impl Envelope<()> {
    pub fn success_message(message: impl Into<String>) -> Self {
        Self {
            meta: Meta {
                status: Status::Success,
                message: Some(message.into()),
            },
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            meta: Meta {
                status: Status::Error,
                message: Some(message.into()),
            },
            data: None,
        }
    }
}

/// Plain-text error body, newline terminated.
pub fn plain_error(status: StatusCode, message: &str) -> Response {
    let mut response = (status, format!("{}\n", message)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}
