// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persistent and transient data types.
//!
//! `UserIdRecord` deliberately has no `status`/`notify` fields: those are
//! transient, parse-time-only attributes and are modeled as a
//! separate [`ParsedUserId`] type instead of optional fields on the
//! persisted record, so a stray `Some(status)` sneaking into storage is
//! a type error rather than a runtime bug to guard against.

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One user-ID binding inside a [`KeyRecord`], as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdRecord {
    pub name: Option<String>,
    pub email: String,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_armored: Option<String>,
}

impl UserIdRecord {
    /// A freshly-parsed, not-yet-verified pending UID with a per-UID
    /// filtered key attached (the usual shape handed to `Mailer`).
    pub fn pending(name: Option<String>, email: String, public_key_armored: String) -> Self {
        UserIdRecord {
            name,
            email,
            verified: false,
            nonce: None,
            public_key_armored: Some(public_key_armored),
        }
    }
}

/// One record in the `publickey` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub key_id: String,
    pub fingerprint: String,
    pub created: DateTime<Utc>,
    pub uploaded: DateTime<Utc>,
    pub algorithm: String,
    pub key_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_armored: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_until: Option<DateTime<Utc>>,
    pub user_ids: Vec<UserIdRecord>,
}

impl KeyRecord {
    /// Does any UID carry a verified binding?
    pub fn has_verified_uid(&self) -> bool {
        self.user_ids.iter().any(|u| u.verified)
    }

    /// Sanitized view returned by lookups: drops `_id`, nonces and
    /// per-UID armored caches.
    pub fn sanitized(&self) -> SanitizedKeyRecord {
        SanitizedKeyRecord {
            key_id: self.key_id.clone(),
            fingerprint: self.fingerprint.clone(),
            created: self.created,
            uploaded: self.uploaded,
            algorithm: self.algorithm.clone(),
            key_size: self.key_size,
            public_key_armored: self.public_key_armored.clone(),
            user_ids: self
                .user_ids
                .iter()
                .map(|u| SanitizedUserId {
                    name: u.name.clone(),
                    email: u.email.clone(),
                    verified: u.verified,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedUserId {
    pub name: Option<String>,
    pub email: String,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedKeyRecord {
    pub key_id: String,
    pub fingerprint: String,
    pub created: DateTime<Utc>,
    pub uploaded: DateTime<Utc>,
    pub algorithm: String,
    pub key_size: u32,
    pub public_key_armored: Option<String>,
    pub user_ids: Vec<SanitizedUserId>,
}

/// Outcome of verifying a self-certification or a whole key, at a given
/// point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Valid,
    Revoked,
    Expired,
    NoSelfCert,
    Invalid,
}

/// One user ID as produced by `KeyCodec::parse_user_ids`, before it is
/// known whether it should be merged in as pending, dropped, or used to
/// refresh an already-verified binding. `status` and `notify` never
/// leave this type alive past the merge step.
#[derive(Debug, Clone)]
pub struct ParsedUserId {
    pub name: Option<String>,
    pub email: String,
    pub status: CertStatus,
}

/// A fully parsed (and purified) incoming key, prior to merge with any
/// existing record.
#[derive(Debug, Clone)]
pub struct ParsedKey {
    pub key_id: String,
    pub fingerprint: String,
    pub created: DateTime<Utc>,
    pub uploaded: DateTime<Utc>,
    pub algorithm: String,
    pub key_size: u32,
    pub public_key_armored: String,
    pub user_ids: Vec<ParsedUserId>,
    /// Fingerprints of every subkey, lowercase hex. Used for the Key ID
    /// collision check: a subkey fingerprint or key ID already bound to
    /// a different primary key is rejected before any merge is
    /// attempted.
    pub subkey_fingerprints: Vec<String>,
    pub subkey_key_ids: Vec<String>,
}

impl ParsedKey {
    pub fn valid_user_ids(&self) -> impl Iterator<Item = &ParsedUserId> {
        self.user_ids.iter().filter(|u| u.status == CertStatus::Valid)
    }
}

/// One user ID slated for insertion into `userIds`, paired with whether
/// a verification mail must be dispatched for it. This is the boundary
/// where `notify` disappears: the bool lives here, never on
/// `UserIdRecord` itself.
#[derive(Debug, Clone)]
pub struct MergedUserId {
    pub record: UserIdRecord,
    pub notify: bool,
}
