// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! The error taxonomy exposed by [`crate::service::KeyService`].
//!
//! Every variant maps to exactly one HTTP status in the handlers crate;
//! none of them are retried by the core itself.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeyServerError>;

/// Domain-level error taxonomy for the key-lifecycle control plane.
///
/// Handlers translate each variant to a status code; the message carried
/// here is user-safe and may be shown to API callers. Anything more
/// detailed goes to `tracing` logs at the call site, not into this type.
#[derive(Error, Debug)]
pub enum KeyServerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("rate limit exceeded")]
    TooManyRequests,

    #[error("not implemented")]
    NotImplemented,

    #[error("internal error: {0}")]
    Internal(String),
}

impl KeyServerError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        KeyServerError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        KeyServerError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        KeyServerError::Internal(msg.into())
    }
}

/// Store and OpenPGP-library failures are infrastructure errors by
/// default; callers that need BadRequest semantics for a parse failure
/// map it explicitly instead of relying on this conversion.
impl From<anyhow::Error> for KeyServerError {
    fn from(e: anyhow::Error) -> Self {
        KeyServerError::Internal(e.to_string())
    }
}

impl From<mongodb::error::Error> for KeyServerError {
    fn from(e: mongodb::error::Error) -> Self {
        KeyServerError::Internal(format!("store error: {e}"))
    }
}
