//! Error types.
//!
//! Client input problems are [`RelayError`]s and render as
//! `{"error": "<message>"}` with a 400 status, or 413 for an oversized body.
//! Upstream failures never reach this module: once streaming has begun they
//! travel in-band as [`Fragment::Error`](crate::relay::Fragment::Error).

use axum::{
    Json,
    extract::rejection::BytesRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request rejected before the session registry was consulted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Missing, empty, or whitespace-only `message`.
    #[error("message is required")]
    MessageRequired,

    /// `sessionId` cannot be echoed back in a response header.
    #[error("sessionId contains characters that are not allowed in a header")]
    InvalidSessionId,

    /// Body is not a JSON object of the expected shape.
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    /// Body exceeds the configured size limit.
    #[error("request body too large")]
    BodyTooLarge,
}

impl RelayError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<BytesRejection> for RelayError {
    fn from(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::BodyTooLarge
        } else {
            Self::InvalidBody(rejection.body_text())
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidBody(err.to_string())
    }
}

/// JSON error payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self, "Rejected chat request");
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Fatal startup configuration problems.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// Neither `GEMINI_API_KEY` nor `GOOGLE_API_KEY` is set.
    #[error("missing GEMINI_API_KEY (or GOOGLE_API_KEY)")]
    MissingApiKey,
}
