// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! HkpHandler: the HTTP Keyserver Protocol surface. `POST /pks/add`
//! ingests an armored key exactly like the REST upload; `GET
//! /pks/lookup` serves verified-only key material in either
//! human-readable or machine-readable (`options=mr`) form.

use std::sync::Arc;

use keyserver_core::{KeyService, SanitizedKeyRecord};
use rocket::form::{Form, FromForm};
use rocket::http::{Header, Status};
use rocket::response::{self, Responder};
use rocket::{Request, State};

use crate::error::{ApiError, ApiResult};

#[derive(FromForm)]
pub struct AddForm {
    keytext: String,
}

#[post("/pks/add", data = "<form>")]
pub async fn add(service: &State<Arc<KeyService>>, form: Form<AddForm>) -> ApiResult<Status> {
    service.put(&[], &form.keytext).await?;
    Ok(Status::Created)
}

#[derive(FromForm)]
pub struct LookupQuery<'a> {
    op: &'a str,
    search: &'a str,
    options: Option<&'a str>,
}

/// Classification of an HKP `search` term: a bare key ID or
/// fingerprint is looked up directly; anything else is treated as an
/// email address.
fn is_key_reference(search: &str) -> bool {
    let s = search.strip_prefix("0x").unwrap_or(search);
    !s.is_empty() && s.len() <= 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// `<...>`-wrapped search terms (RFC 2822 angle-addr style) are
/// unwrapped before classification; HKP clients send email searches
/// this way.
fn normalize_search(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
}

/// Response carrying either HKP-armored key material (with the
/// `application/pgp-keys` content type and an attachment disposition
/// the `mr` flag requires) or a plain-text/HTML body.
pub enum HkpResponse {
    Armored(String),
    Text(String),
}

impl<'r> Responder<'r, 'static> for HkpResponse {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        match self {
            HkpResponse::Armored(body) => response::Response::build_from(body.respond_to(request)?)
                .header(Header::new("Content-Type", "application/pgp-keys; charset=utf-8"))
                .header(Header::new(
                    "Content-Disposition",
                    "attachment; filename=openpgp-key.asc",
                ))
                .ok(),
            HkpResponse::Text(body) => body.respond_to(request),
        }
    }
}

/// HKP numeric algorithm ID, best-effort: `1` (RSA) when the algorithm
/// name looks like RSA, empty otherwise. Machine-readable clients treat
/// an empty field as "unknown", which is the only honest answer we have
/// without a full numeric-ID table.
fn hkp_algorithm_id(algorithm: &str) -> &'static str {
    if algorithm.to_lowercase().contains("rsa") {
        "1"
    } else {
        ""
    }
}

fn render_listing(record: &SanitizedKeyRecord) -> String {
    let mut out = String::from("info:1:1\n");
    out.push_str(&format!(
        "pub:{}:{}:{}:{}::\n",
        record.fingerprint.to_uppercase(),
        hkp_algorithm_id(&record.algorithm),
        record.key_size,
        record.created.timestamp(),
    ));
    for uid in &record.user_ids {
        let name_email = match &uid.name {
            Some(name) => format!("{name} <{}>", uid.email),
            None => uid.email.clone(),
        };
        out.push_str(&format!("uid:{}:::\n", urlencoding::encode(&name_email)));
    }
    out
}

#[get("/pks/lookup?<query..>")]
pub async fn lookup(
    service: &State<Arc<KeyService>>,
    query: LookupQuery<'_>,
) -> ApiResult<HkpResponse> {
    let search = normalize_search(query.search);
    let search = search.strip_prefix("0x").unwrap_or(search);
    let identifier = if is_key_reference(search) {
        search.to_lowercase()
    } else if keyserver_core::email::is_email(search) {
        search.to_lowercase()
    } else {
        return Err(ApiError(keyserver_core::KeyServerError::bad_request(
            "search must be a key ID, fingerprint, or email address",
        )));
    };

    match query.op {
        "get" => {
            let armored = service.get_verified(&identifier).await?;
            let machine_readable = query.options.map(|o| o.contains("mr")).unwrap_or(false);
            if machine_readable {
                Ok(HkpResponse::Armored(armored))
            } else {
                Ok(HkpResponse::Text(format!(
                    "<html><body><pre>\n{armored}\n</pre></body></html>\n"
                )))
            }
        }
        "index" | "vindex" => {
            let record = service.get_verified_listing(&identifier).await?;
            Ok(HkpResponse::Text(render_listing(&record)))
        }
        _ => Err(ApiError(keyserver_core::KeyServerError::NotImplemented)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_reference_classification() {
        assert!(is_key_reference("0xdeadbeefdeadbeef"));
        assert!(is_key_reference("deadbeefdeadbeef"));
        assert!(!is_key_reference("alice@example.org"));
    }

    #[test]
    fn angle_wrapped_search_is_unwrapped() {
        assert_eq!(normalize_search("<alice@example.org>"), "alice@example.org");
        assert_eq!(normalize_search("alice@example.org"), "alice@example.org");
    }

    #[test]
    fn algorithm_id_falls_back_to_rsa_heuristic() {
        assert_eq!(hkp_algorithm_id("RSA"), "1");
        assert_eq!(hkp_algorithm_id("EdDSA"), "");
    }
}
