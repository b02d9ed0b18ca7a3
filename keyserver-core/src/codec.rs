// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! KeyCodec: parse armored OpenPGP material, enumerate User IDs with
//! status, re-armor, filter/remove a User ID, merge two keys.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use sequoia_openpgp::cert::amalgamation::{ValidAmalgamation, ValidateAmalgamation};
use sequoia_openpgp::packet::UserID;
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::serialize::SerializeInto;
use sequoia_openpgp::types::RevocationStatus;
use sequoia_openpgp::Cert;

use crate::error::{KeyServerError, Result};
use crate::model::{CertStatus, ParsedKey, ParsedUserId};
use crate::purify::KeyPurifier;

pub(crate) static POLICY: StandardPolicy<'static> = StandardPolicy::new();

/// Parses, purifies and validates untrusted armored key material. This
/// is the sole entry point through which bytes from the network
/// become a [`ParsedKey`].
pub struct KeyCodec<'p> {
    purifier: &'p KeyPurifier,
}

impl<'p> KeyCodec<'p> {
    pub fn new(purifier: &'p KeyPurifier) -> Self {
        KeyCodec { purifier }
    }

    /// Parse an armored key, purify it, and build the ingestion-ready
    /// record. Rejects private-key material and non-v4 primary keys.
    pub fn parse(&self, armored: &str) -> Result<ParsedKey> {
        let cert = Cert::from_bytes(armored.as_bytes())
            .map_err(|e| KeyServerError::bad_request(format!("could not parse key: {e}")))?;

        if cert.is_tsk() {
            return Err(KeyServerError::bad_request(
                "secret key material is not accepted",
            ));
        }

        if cert.primary_key().key().version() != 4 {
            return Err(KeyServerError::bad_request(
                "only v4 OpenPGP keys are supported",
            ));
        }

        let cert = self
            .purifier
            .purify(cert)
            .map_err(|e| KeyServerError::bad_request(e.to_string()))?;

        // Tolerate self-signatures that are slightly in the future.
        let at = SystemTime::now() + Duration::from_secs(24 * 60 * 60);
        match Self::verify_key(&cert, at) {
            CertStatus::Invalid => {
                return Err(KeyServerError::bad_request("key does not verify"))
            }
            _ => {}
        }

        let created: DateTime<Utc> = cert.primary_key().key().creation_time().into();
        let (algorithm, key_size) = Self::algo_and_size(&cert);

        let user_ids = Self::parse_user_ids(&cert, at);
        if !user_ids.iter().any(|u| u.status != CertStatus::Invalid) {
            return Err(KeyServerError::bad_request(
                "key has no usable user ID with an email address",
            ));
        }

        let public_key_armored = Self::cert_to_armored(&cert)?;

        let subkey_fingerprints: Vec<String> = cert
            .keys()
            .subkeys()
            .map(|ka| ka.key().fingerprint().to_hex().to_lowercase())
            .collect();
        let subkey_key_ids: Vec<String> = subkey_fingerprints
            .iter()
            .map(|fp| fp[fp.len() - 16..].to_string())
            .collect();

        Ok(ParsedKey {
            key_id: cert.fingerprint().to_hex().to_lowercase()[24..].to_string(),
            fingerprint: cert.fingerprint().to_hex().to_lowercase(),
            created,
            uploaded: Utc::now(),
            algorithm,
            key_size,
            public_key_armored,
            user_ids,
            subkey_fingerprints,
            subkey_key_ids,
        })
    }

    fn algo_and_size(cert: &Cert) -> (String, u32) {
        let key = cert.primary_key().key();
        let algo = key.pk_algo();
        let size = key.mpis().bits().unwrap_or(0) as u32;
        (format!("{algo}"), size)
    }

    /// Overall key status at time `at`.
    pub fn verify_key(cert: &Cert, at: SystemTime) -> CertStatus {
        let valid = match cert.clone().with_policy(&POLICY, at) {
            Ok(v) => v,
            Err(_) => return CertStatus::Invalid,
        };

        if !matches!(valid.revocation_status(), RevocationStatus::NotAsFarAsWeKnow) {
            return CertStatus::Revoked;
        }

        if valid.alive().is_err() {
            return CertStatus::Expired;
        }

        let has_capable_key = valid
            .keys()
            .alive()
            .revoked(false)
            .for_signing()
            .chain(valid.keys().alive().revoked(false).for_storage_encryption())
            .chain(valid.keys().alive().revoked(false).for_transport_encryption())
            .next()
            .is_some();

        if has_capable_key {
            CertStatus::Valid
        } else {
            CertStatus::Invalid
        }
    }

    /// Enumerate user IDs with per-UID status. UIDs without an email
    /// address are dropped entirely.
    pub fn parse_user_ids(cert: &Cert, at: SystemTime) -> Vec<ParsedUserId> {
        let mut out = Vec::new();

        for ua in cert.userids() {
            // A successful `with_policy` already implies the binding's
            // self-signature is alive at `at`; expiry shows up as an
            // `Err` here, not as a separate case to re-check.
            let status = match ua.clone().with_policy(&POLICY, at) {
                Ok(valid_ua) => {
                    if !matches!(valid_ua.revocation_status(), RevocationStatus::NotAsFarAsWeKnow) {
                        CertStatus::Revoked
                    } else {
                        CertStatus::Valid
                    }
                }
                Err(_) => {
                    if ua.self_signatures().next().is_none() {
                        CertStatus::NoSelfCert
                    } else {
                        CertStatus::Expired
                    }
                }
            };

            let (name, email) = Self::name_and_email(ua.userid());
            let Some(email) = email else { continue };

            out.push(ParsedUserId { name, email, status });
        }

        out
    }

    /// Pull `name`/`email` out of a UserID packet, re-parsing the
    /// combined `Name <email>` string when the structured accessors
    /// come back empty.
    fn name_and_email(uid: &UserID) -> (Option<String>, Option<String>) {
        let name = uid.name().ok().flatten();
        let email = uid.email_normalized().ok().flatten();

        if email.is_some() {
            return (name, email);
        }

        // Structured accessors gave up (e.g. odd punctuation); fall back
        // to a permissive "Name <email>" split on the raw UID string.
        let raw = String::from_utf8_lossy(uid.value());
        if let (Some(start), Some(end)) = (raw.find('<'), raw.find('>')) {
            if end > start {
                let email_part = raw[start + 1..end].trim();
                let name_part = raw[..start].trim();
                if crate::email::is_email(email_part) {
                    let name = if name_part.is_empty() {
                        name
                    } else {
                        Some(name_part.to_string())
                    };
                    return (name, Some(email_part.to_lowercase()));
                }
            }
        } else if crate::email::is_email(raw.trim()) {
            return (name, Some(raw.trim().to_lowercase()));
        }

        (name, None)
    }

    /// Armor a key, restricted to the user IDs in `emails`. When
    /// `require_encryption` is set, the result must still carry a valid
    /// encryption-capable subkey, else BadRequest.
    pub fn filter_key_by_user_ids(
        cert: &Cert,
        emails: &[String],
        require_encryption: bool,
    ) -> Result<String> {
        let filtered = cert
            .clone()
            .retain_userids(|ua| {
                ua.userid()
                    .email_normalized()
                    .ok()
                    .flatten()
                    .map(|e| emails.contains(&e))
                    .unwrap_or(false)
            })
            .retain_user_attributes(|_| false);

        if require_encryption {
            let has_enc = filtered
                .with_policy(&POLICY, None)
                .ok()
                .map(|v| {
                    v.keys()
                        .alive()
                        .revoked(false)
                        .for_storage_encryption()
                        .chain(v.keys().alive().revoked(false).for_transport_encryption())
                        .next()
                        .is_some()
                })
                .unwrap_or(false);

            if !has_enc {
                return Err(KeyServerError::bad_request(
                    "key has no usable encryption-capable subkey",
                ));
            }
        }

        Self::cert_to_armored(&filtered)
    }

    /// Inverse of `filter_key_by_user_ids` for a single email.
    pub fn remove_user_id(email: &str, armored: &str) -> Result<String> {
        let cert = Self::armored_to_cert(armored)?;
        let email = email.to_string();
        let reduced = cert.retain_userids(move |ua| {
            ua.userid().email_normalized().ok().flatten().as_deref() != Some(email.as_str())
        });
        Self::cert_to_armored(&reduced)
    }

    /// Merge `src` into `dst` using the library's standard key-update
    /// semantics: new signatures, subkeys and self-certifications from
    /// `src` are absorbed; conflicting material loses to `dst`.
    pub fn update_key(dst: &str, src: &str) -> Result<String> {
        let dst_cert = Self::armored_to_cert(dst)?;
        let src_cert = Self::armored_to_cert(src)?;

        let merged = dst_cert
            .merge_public(src_cert)
            .map_err(|e| KeyServerError::internal(format!("key merge failed: {e}")))?;

        Self::cert_to_armored(&merged)
    }

    pub fn armored_to_cert(armored: &str) -> Result<Cert> {
        Cert::from_bytes(armored.as_bytes())
            .map_err(|e| KeyServerError::bad_request(format!("could not parse key: {e}")))
    }

    pub fn cert_to_armored(cert: &Cert) -> Result<String> {
        let bytes = cert
            .armored()
            .to_vec()
            .map_err(|e| KeyServerError::internal(format!("could not armor key: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| KeyServerError::internal(format!("armored key was not utf-8: {e}")))
    }
}
