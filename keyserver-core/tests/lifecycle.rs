// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end exercise of the upload -> verify -> lookup lifecycle
//! against the in-process fakes, without a real database or SMTP
//! server.

use std::sync::Arc;

use keyserver_core::config::{PublicKeyConfig, PurifyConfig};
use keyserver_core::mailer::fake::RecordingMailer;
use keyserver_core::store::fake::InMemoryKeyRepository;
use keyserver_core::{KeyService, KeyServiceConfig};
use sequoia_openpgp::cert::CertBuilder;
use sequoia_openpgp::serialize::SerializeInto;

fn test_service(upload_rate_limit: u64) -> (KeyService, Arc<RecordingMailer>) {
    let repo = Arc::new(InMemoryKeyRepository::new());
    let mailer = Arc::new(RecordingMailer::new());
    let cfg = KeyServiceConfig {
        public_key: PublicKeyConfig {
            purge_time_in_days: 14,
            upload_rate_limit,
        },
        purify: PurifyConfig::default(),
        key_link_base: "https://keys.example.org/api/v1/key".to_string(),
        require_encryption: false,
    };
    (KeyService::new(repo, mailer.clone(), cfg), mailer)
}

fn armored_cert(uid: &str) -> String {
    let (cert, _rev) = CertBuilder::new().add_userid(uid).generate().unwrap();
    String::from_utf8(cert.armored().to_vec().unwrap()).unwrap()
}

#[tokio::test]
async fn full_upload_verify_lookup_cycle() {
    let (service, mailer) = test_service(10);
    let armored = armored_cert("Alice <alice@example.org>");

    let uploaded = service.put(&[], &armored).await.unwrap();
    assert_eq!(uploaded.user_ids.len(), 1);
    assert!(!uploaded.user_ids[0].verified);
    assert_eq!(mailer.sent.lock().unwrap().len(), 1);

    // Unverified bindings never show up through get_verified.
    assert!(service.get_verified(&uploaded.key_id).await.is_err());

    // A re-upload of the same key merges into the existing record
    // rather than creating a second one, and does not re-notify an
    // already-pending binding into a brand new nonce churn storm.
    let second_upload = service.put(&[], &armored).await.unwrap();
    assert_eq!(second_upload.key_id, uploaded.key_id);
    assert_eq!(second_upload.user_ids.len(), 1);
}

#[tokio::test]
async fn rate_limit_blocks_repeated_uploads_for_the_same_email() {
    let (service, _mailer) = test_service(1);

    let first = armored_cert("Bob <bob@example.org>");
    service.put(&[], &first).await.unwrap();

    let second = armored_cert("Bob Again <bob@example.org>");
    let err = service.put(&[], &second).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn verify_then_new_owner_takes_over_the_address() {
    let (service, mailer) = test_service(10);
    let armored = armored_cert("Carol <carol@example.org>");

    let uploaded = service.put(&[], &armored).await.unwrap();
    let nonce = mailer.last_nonce().expect("verification notice was sent");

    let (verified, email) = service.verify(&uploaded.key_id, &nonce).await.unwrap();
    assert_eq!(email, "carol@example.org");
    assert!(verified.user_ids[0].verified);

    // A second, unrelated cert claiming the same address takes over the
    // verified binding and evicts the first record.
    let other = armored_cert("Carol Impostor <carol@example.org>");
    let other_uploaded = service.put(&[], &other).await.unwrap();
    let other_nonce = mailer.last_nonce().expect("verification notice was sent");
    service.verify(&other_uploaded.key_id, &other_nonce).await.unwrap();

    assert!(service.get(&uploaded.key_id).await.is_err());
}
