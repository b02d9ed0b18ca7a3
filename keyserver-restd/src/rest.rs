// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! RestHandler: `POST`/`GET`/`DELETE /api/v1/key`. Every syntactic
//! check on `keyId`/`fingerprint`/`nonce`/`email` lives here, before
//! anything touches `KeyService` — the core crate only ever sees
//! values already known to be well-formed.

use std::sync::Arc;

use keyserver_core::KeyService;
use rocket::serde::json::Json;
use rocket::State;

use crate::error::{ApiError, ApiResult};
use crate::json::{KeyResponse, RemoveRequest, UploadRequest};

fn is_hex_id(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn valid_key_id(s: &str) -> bool {
    is_hex_id(s, 16) || is_hex_id(s, 40)
}

fn valid_nonce(s: &str) -> bool {
    is_hex_id(s, 32)
}

#[post("/api/v1/key", format = "json", data = "<body>")]
pub async fn upload(
    service: &State<Arc<KeyService>>,
    body: Json<UploadRequest>,
) -> ApiResult<Json<KeyResponse>> {
    let record = service.put(&body.emails, &body.public_key_armored).await?;
    Ok(Json(record.into()))
}

#[get("/api/v1/key?<identifier>")]
pub async fn lookup(
    service: &State<Arc<KeyService>>,
    identifier: &str,
) -> ApiResult<Json<KeyResponse>> {
    let record = service.get(identifier).await?;
    Ok(Json(record.into()))
}

#[get("/api/v1/key/armored?<identifier>")]
pub async fn lookup_armored(
    service: &State<Arc<KeyService>>,
    identifier: &str,
) -> ApiResult<String> {
    Ok(service.get_verified(identifier).await?)
}

/// Confirmation link target mailed by `KeyService::dispatch_notices`:
/// `GET /api/v1/key?op=verify&keyId=...&nonce=...`.
#[get("/api/v1/key?op=verify&keyId=<key_id>&nonce=<nonce>")]
pub async fn verify(
    service: &State<Arc<KeyService>>,
    key_id: &str,
    nonce: &str,
) -> ApiResult<String> {
    if !valid_key_id(key_id) {
        return Err(ApiError(keyserver_core::KeyServerError::bad_request(
            "keyId must be a 16 or 40 character hex string",
        )));
    }
    if !valid_nonce(nonce) {
        return Err(ApiError(keyserver_core::KeyServerError::bad_request(
            "nonce must be a 32 character hex string",
        )));
    }

    let (_, email) = service.verify(key_id, nonce).await?;
    Ok(format!(
        "Verified {email}. The key is now available at /api/v1/key?identifier={email}\n"
    ))
}

#[delete("/api/v1/key", format = "json", data = "<body>")]
pub async fn request_remove(
    service: &State<Arc<KeyService>>,
    body: Json<RemoveRequest>,
) -> ApiResult<()> {
    if !valid_key_id(&body.key_id) {
        return Err(ApiError(keyserver_core::KeyServerError::bad_request(
            "keyId must be a 16 or 40 character hex string",
        )));
    }
    service.request_remove(&body.key_id, &body.email).await?;
    Ok(())
}

/// Confirmation link target mailed by `KeyService::request_remove`:
/// `GET /api/v1/key?op=verifyRemove&keyId=...&nonce=...`.
#[get("/api/v1/key?op=verifyRemove&keyId=<key_id>&nonce=<nonce>")]
pub async fn verify_remove(
    service: &State<Arc<KeyService>>,
    key_id: &str,
    nonce: &str,
) -> ApiResult<&'static str> {
    if !valid_key_id(key_id) {
        return Err(ApiError(keyserver_core::KeyServerError::bad_request(
            "keyId must be a 16 or 40 character hex string",
        )));
    }
    if !valid_nonce(nonce) {
        return Err(ApiError(keyserver_core::KeyServerError::bad_request(
            "nonce must be a 32 character hex string",
        )));
    }
    service.verify_remove(key_id, nonce).await?;
    Ok("Removal confirmed.\n")
}
