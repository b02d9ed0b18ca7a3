// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Maps `keyserver_core::KeyServerError` onto HTTP status codes. Every
//! REST/HKP handler returns `ApiResult<T>` instead of threading status
//! codes through by hand.

use keyserver_core::KeyServerError;
use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::Request;

use crate::json::ErrorResponse;

pub type ApiResult<T> = Result<T, ApiError>;

pub struct ApiError(pub KeyServerError);

impl From<KeyServerError> for ApiError {
    fn from(e: KeyServerError) -> Self {
        ApiError(e)
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let status = match &self.0 {
            KeyServerError::BadRequest(_) => Status::BadRequest,
            KeyServerError::NotFound(_) => Status::NotFound,
            KeyServerError::TooManyRequests => Status::TooManyRequests,
            KeyServerError::NotImplemented => Status::NotImplemented,
            KeyServerError::Internal(_) => Status::InternalServerError,
        };

        if matches!(status, Status::InternalServerError) {
            tracing::error!(error = %self.0, "internal error");
        }

        let body = Json(ErrorResponse::new(self.0.to_string()));
        response::Response::build_from(body.respond_to(request)?)
            .status(status)
            .ok()
    }
}
