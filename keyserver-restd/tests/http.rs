// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Exercises the mounted HTTP surface end to end with
//! `rocket::local::asynchronous::Client`, against the in-process
//! `keyserver_core` fakes rather than a real database or SMTP relay.

use std::sync::Arc;

use keyserver_core::config::{PublicKeyConfig, PurifyConfig};
use keyserver_core::mailer::fake::RecordingMailer;
use keyserver_core::store::fake::InMemoryKeyRepository;
use keyserver_core::{KeyService, KeyServiceConfig};
use rocket::http::{ContentType, Status};
use rocket::local::asynchronous::Client;
use sequoia_openpgp::cert::CertBuilder;
use sequoia_openpgp::serialize::SerializeInto;

async fn test_client() -> (Client, Arc<RecordingMailer>) {
    let repo = Arc::new(InMemoryKeyRepository::new());
    let mailer = Arc::new(RecordingMailer::new());
    let cfg = KeyServiceConfig {
        public_key: PublicKeyConfig {
            purge_time_in_days: 14,
            upload_rate_limit: 10,
        },
        purify: PurifyConfig::default(),
        key_link_base: "https://keys.example.org/api/v1/key".to_string(),
        require_encryption: false,
    };
    let service = Arc::new(KeyService::new(repo, mailer.clone(), cfg));
    let rocket = keyserver_restd::build_rocket(service);
    let client = Client::tracked(rocket).await.expect("valid rocket instance");
    (client, mailer)
}

fn armored_cert(uid: &str) -> String {
    let (cert, _rev) = CertBuilder::new().add_userid(uid).generate().unwrap();
    String::from_utf8(cert.armored().to_vec().unwrap()).unwrap()
}

#[rocket::async_test]
async fn upload_then_lookup_returns_unverified_binding() {
    let (client, _mailer) = test_client().await;
    let armored = armored_cert("Alice <alice@example.org>");

    let response = client
        .post("/api/v1/key")
        .header(ContentType::JSON)
        .body(format!(r#"{{"publicKeyArmored":{armored:?}}}"#))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let body = response.into_string().await.expect("response body");
    assert!(body.contains("alice@example.org"));
    assert!(body.contains("\"verified\":false"));
}

#[rocket::async_test]
async fn lookup_armored_rejects_before_verification() {
    let (client, _mailer) = test_client().await;
    let armored = armored_cert("Bob <bob@example.org>");

    client
        .post("/api/v1/key")
        .header(ContentType::JSON)
        .body(format!(r#"{{"publicKeyArmored":{armored:?}}}"#))
        .dispatch()
        .await;

    let response = client
        .get("/api/v1/key/armored?identifier=bob@example.org")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::NotFound);
}

#[rocket::async_test]
async fn verify_rejects_malformed_key_id() {
    let (client, _mailer) = test_client().await;

    let response = client
        .get("/api/v1/key?op=verify&keyId=not-hex&nonce=0123456789abcdef0123456789abcdef")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);
}

#[rocket::async_test]
async fn mailed_verify_link_completes_verification() {
    let (client, mailer) = test_client().await;
    let armored = armored_cert("Dana <dana@example.org>");

    let response = client
        .post("/api/v1/key")
        .header(ContentType::JSON)
        .body(format!(r#"{{"publicKeyArmored":{armored:?}}}"#))
        .dispatch()
        .await;
    let body: serde_json::Value = response.into_json().await.expect("json body");
    let key_id = body["keyId"].as_str().unwrap().to_string();
    let nonce = mailer.last_nonce().expect("a verification notice was sent");

    let response = client
        .get(format!("/api/v1/key?op=verify&keyId={key_id}&nonce={nonce}"))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let response = client
        .get("/api/v1/key/armored?identifier=dana@example.org")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
}

#[rocket::async_test]
async fn pks_add_accepts_form_upload() {
    let (client, _mailer) = test_client().await;
    let armored = armored_cert("Carol <carol@example.org>");

    let response = client
        .post("/pks/add")
        .header(ContentType::Form)
        .body(format!("keytext={}", urlencoding::encode(&armored)))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Created);
}

#[rocket::async_test]
async fn hkp_get_mr_sets_armored_content_type() {
    let (client, mailer) = test_client().await;
    let armored = armored_cert("Erin <erin@example.org>");

    let response = client
        .post("/api/v1/key")
        .header(ContentType::JSON)
        .body(format!(r#"{{"publicKeyArmored":{armored:?}}}"#))
        .dispatch()
        .await;
    let body: serde_json::Value = response.into_json().await.expect("json body");
    let key_id = body["keyId"].as_str().unwrap().to_string();
    let nonce = mailer.last_nonce().expect("a verification notice was sent");

    client
        .get(format!("/api/v1/key?op=verify&keyId={key_id}&nonce={nonce}"))
        .dispatch()
        .await;

    let response = client
        .get("/pks/lookup?op=get&options=mr&search=erin@example.org")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(
        response.headers().get_one("Content-Type"),
        Some("application/pgp-keys; charset=utf-8")
    );
    assert_eq!(
        response.headers().get_one("Content-Disposition"),
        Some("attachment; filename=openpgp-key.asc")
    );
}
