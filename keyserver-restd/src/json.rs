// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire-level request/response DTOs for the REST surface. Kept
//! separate from `keyserver_core::model` so the core crate's persisted
//! shapes never leak transport-specific serde attributes.

use keyserver_core::SanitizedKeyRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    #[serde(rename = "publicKeyArmored")]
    pub public_key_armored: String,
    /// Restricts ingestion to these emails (and fails if any doesn't
    /// match a user ID on the key). Empty means "all user IDs".
    #[serde(default)]
    pub emails: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    #[serde(rename = "keyId")]
    pub key_id: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct KeyResponse {
    #[serde(flatten)]
    pub record: SanitizedKeyRecord,
}

impl From<SanitizedKeyRecord> for KeyResponse {
    fn from(record: SanitizedKeyRecord) -> Self {
        KeyResponse { record }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorResponse {
            error: message.into(),
        }
    }
}
