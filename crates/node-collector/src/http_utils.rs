// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{
    header,
    http::{self, HeaderMap, HeaderValue},
    Response, StatusCode,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

pub type HttpResponse = Response<Full<Bytes>>;

/// Why a request body was not read.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("missing Content-Length and Transfer-Encoding headers")]
    LengthRequired,
    #[error("invalid Content-Length header")]
    InvalidLength,
    #[error("body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("failed to read body: {0}")]
    Read(String),
}

impl BodyError {
    pub fn status(&self) -> StatusCode {
        match self {
            BodyError::LengthRequired => StatusCode::LENGTH_REQUIRED,
            BodyError::InvalidLength | BodyError::Read(_) => StatusCode::BAD_REQUEST,
            BodyError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Serializes `body` as the JSON payload of a response with the given status.
pub fn create_json_response<T: Serialize>(
    body: &T,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    let (status, body) = match serde_json::to_vec(body) {
        Ok(body) => (status, body),
        Err(e) => {
            warn!("HTTP | Failed to serialize response: {e}");
            let body = json!({ "message": "failed to serialize response" }).to_string();
            (StatusCode::INTERNAL_SERVER_ERROR, body.into_bytes())
        }
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

/// Answers a request whose body could not be read. These are never worth retrying.
pub fn body_error_response(error: &BodyError) -> http::Result<HttpResponse> {
    debug!("HTTP | Refusing request body: {error}");
    create_json_response(
        &json!({ "message": error.to_string(), "retryable": false }),
        error.status(),
    )
}

/// Adds a `Retry-After` header, in seconds, to a response.
pub fn with_retry_after(mut response: HttpResponse, seconds: u64) -> HttpResponse {
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    response
}

/// Collects a request body of at most `limit` bytes.
///
/// A declared `Content-Length` is checked before anything is read. Chunked bodies
/// are accepted without one and cut off once they pass the limit.
pub async fn read_body<B>(headers: &HeaderMap, body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    match headers.get(header::CONTENT_LENGTH) {
        Some(value) => {
            let declared = value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .ok_or(BodyError::InvalidLength)?;
            if declared > limit {
                return Err(BodyError::TooLarge(limit));
            }
        }
        None if headers.contains_key(header::TRANSFER_ENCODING) => {}
        None => return Err(BodyError::LengthRequired),
    }

    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(BodyError::TooLarge(limit))
        }
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}
