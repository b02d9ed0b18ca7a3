// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! KeyStore: persistence for `KeyRecord`s behind a narrow, mockable
//! trait, with a `mongodb`-backed implementation as the production
//! store and an in-process fake for tests — a `CaStorage`/
//! `CaStorageWrite`/`DbCa`-style split, generalized from a relational
//! schema to a document one.

use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Duration, Utc};
use mongodb::options::{IndexOptions, ReplaceOptions};
use mongodb::{Collection, Database, IndexModel};

use crate::config::MongoConfig;
use crate::error::{KeyServerError, Result};
use crate::model::KeyRecord;

const COLLECTION: &str = "publickey";

/// Everything `KeyService` needs from persistence. Kept narrow and
/// synchronous-in-spirit (one call per logical step) so a test double
/// can implement it without a real database.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    async fn find_by_key_id(&self, key_id: &str) -> Result<Option<KeyRecord>>;
    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<KeyRecord>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<KeyRecord>>;

    /// Count of records with an unverified binding for `email`
    /// uploaded within the last `since` interval (rate limiting).
    async fn count_recent_uploads_for_email(&self, email: &str, since: Duration) -> Result<u64>;

    async fn insert(&self, record: &KeyRecord) -> Result<KeyRecord>;

    /// Replace the whole document — used after a merge or a User-ID
    /// level mutation (verify / flag-for-remove / remove), since the
    /// `user_ids` array is rewritten wholesale rather than patched in
    /// place from the service layer.
    async fn replace(&self, record: &KeyRecord) -> Result<()>;

    /// Drop a single User-ID binding by email; deletes the whole
    /// document if no bindings remain afterwards. Returns `true` if
    /// the document was deleted outright.
    async fn remove_user_id(&self, key_id: &str, email: &str) -> Result<bool>;

    async fn delete_by_key_id(&self, key_id: &str) -> Result<()>;

    /// Delete every record other than `key_id` that carries a verified
    /// binding for `email` (owner takeover: the newly-verified key
    /// supersedes any stale verified binding for the same address).
    /// Returns the number of documents removed.
    async fn delete_other_verified_with_email(&self, key_id: &str, email: &str) -> Result<u64>;

    /// Sweep records whose every binding is unverified and past
    /// `purge_time_in_days` (TTL fallback for stores without a native
    /// TTL index, and for the in-memory test double).
    async fn delete_expired_unverified(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// `mongodb`-backed implementation: positional array updates for
/// per-UID mutation, and a TTL index on `verify_until` that expires
/// keys which never pick up a verified binding. A verified record has
/// `verify_until: None`, which a TTL index simply never matches.
pub struct MongoKeyRepository {
    collection: Collection<KeyRecord>,
}

impl MongoKeyRepository {
    pub fn new(db: &Database) -> Self {
        MongoKeyRepository {
            collection: db.collection(COLLECTION),
        }
    }

    pub async fn connect(cfg: &MongoConfig) -> Result<Self> {
        let mut client_opts = mongodb::options::ClientOptions::parse(&cfg.uri)
            .await
            .map_err(|e| KeyServerError::internal(format!("invalid mongo uri: {e}")))?;
        if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
            client_opts.credential = Some(
                mongodb::options::Credential::builder()
                    .username(user.clone())
                    .password(pass.clone())
                    .build(),
            );
        }
        let client = mongodb::Client::with_options(client_opts)
            .map_err(|e| KeyServerError::internal(format!("could not build mongo client: {e}")))?;
        let db = client.database(&cfg.database);
        let repo = MongoKeyRepository::new(&db);
        repo.create_indexes().await?;
        Ok(repo)
    }

    /// Unique indexes on `key_id`/`fingerprint`, a lookup index on
    /// `user_ids.email`, and the TTL index on `verify_until` that
    /// expires never-verified records once their grace period runs
    /// out. Verified records have `verify_until: null` and a TTL index
    /// never expires a document whose indexed field is absent, so they
    /// are excluded without a partial filter.
    async fn create_indexes(&self) -> Result<()> {
        let key_id_idx = IndexModel::builder()
            .keys(doc! { "key_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let fp_idx = IndexModel::builder()
            .keys(doc! { "fingerprint": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let email_idx = IndexModel::builder()
            .keys(doc! { "user_ids.email": 1 })
            .build();
        let ttl_idx = IndexModel::builder()
            .keys(doc! { "verify_until": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Some(std::time::Duration::from_secs(1)))
                    .build(),
            )
            .build();

        self.collection
            .create_indexes(vec![key_id_idx, fp_idx, email_idx, ttl_idx])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyRepository for MongoKeyRepository {
    async fn find_by_key_id(&self, key_id: &str) -> Result<Option<KeyRecord>> {
        Ok(self
            .collection
            .find_one(doc! { "key_id": key_id })
            .await?)
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<KeyRecord>> {
        Ok(self
            .collection
            .find_one(doc! { "fingerprint": fingerprint })
            .await?)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<KeyRecord>> {
        Ok(self
            .collection
            .find_one(doc! { "user_ids.email": email })
            .await?)
    }

    async fn count_recent_uploads_for_email(&self, email: &str, since: Duration) -> Result<u64> {
        let cutoff = Utc::now() - since;
        let filter = doc! {
            "user_ids.email": email,
            "uploaded": { "$gte": bson::DateTime::from_chrono(cutoff) },
        };
        Ok(self.collection.count_documents(filter).await?)
    }

    async fn insert(&self, record: &KeyRecord) -> Result<KeyRecord> {
        let result = self.collection.insert_one(record).await?;
        let mut inserted = record.clone();
        inserted.id = result.inserted_id.as_object_id();
        Ok(inserted)
    }

    async fn replace(&self, record: &KeyRecord) -> Result<()> {
        let id = record
            .id
            .ok_or_else(|| KeyServerError::internal("cannot replace a record without an _id"))?;
        self.collection
            .replace_one(doc! { "_id": id }, record)
            .with_options(ReplaceOptions::builder().upsert(false).build())
            .await?;
        Ok(())
    }

    async fn remove_user_id(&self, key_id: &str, email: &str) -> Result<bool> {
        let Some(mut record) = self.find_by_key_id(key_id).await? else {
            return Ok(false);
        };
        record.user_ids.retain(|u| u.email != email);

        if record.user_ids.is_empty() {
            self.delete_by_key_id(key_id).await?;
            Ok(true)
        } else {
            self.replace(&record).await?;
            Ok(false)
        }
    }

    async fn delete_by_key_id(&self, key_id: &str) -> Result<()> {
        self.collection
            .delete_one(doc! { "key_id": key_id })
            .await?;
        Ok(())
    }

    async fn delete_other_verified_with_email(&self, key_id: &str, email: &str) -> Result<u64> {
        let filter = doc! {
            "key_id": { "$ne": key_id },
            "user_ids": { "$elemMatch": { "email": email, "verified": true } },
        };
        let result = self.collection.delete_many(filter).await?;
        Ok(result.deleted_count)
    }

    async fn delete_expired_unverified(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let filter = doc! {
            "uploaded": { "$lt": bson::DateTime::from_chrono(older_than) },
            "user_ids": { "$not": { "$elemMatch": { "verified": true } } },
        };
        let result = self.collection.delete_many(filter).await?;
        Ok(result.deleted_count)
    }
}

/// In-process fake used by `KeyService` unit tests: same trait, no
/// network, behaviorally equivalent for the query shapes the service
/// relies on.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryKeyRepository {
        records: Mutex<Vec<KeyRecord>>,
        next_id: Mutex<u32>,
    }

    impl InMemoryKeyRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl KeyRepository for InMemoryKeyRepository {
        async fn find_by_key_id(&self, key_id: &str) -> Result<Option<KeyRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.key_id == key_id)
                .cloned())
        }

        async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<KeyRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.fingerprint == fingerprint)
                .cloned())
        }

        async fn find_by_email(&self, email: &str) -> Result<Option<KeyRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.user_ids.iter().any(|u| u.email == email))
                .cloned())
        }

        async fn count_recent_uploads_for_email(
            &self,
            email: &str,
            since: Duration,
        ) -> Result<u64> {
            let cutoff = Utc::now() - since;
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.user_ids.iter().any(|u| u.email == email) && r.uploaded >= cutoff)
                .count() as u64)
        }

        async fn insert(&self, record: &KeyRecord) -> Result<KeyRecord> {
            let mut records = self.records.lock().unwrap();
            let mut next_id = self.next_id.lock().unwrap();
            let mut inserted = record.clone();
            inserted.id = Some(bson::oid::ObjectId::from_bytes({
                let mut bytes = [0u8; 12];
                bytes[..4].copy_from_slice(&next_id.to_be_bytes());
                bytes
            }));
            *next_id += 1;
            records.push(inserted.clone());
            Ok(inserted)
        }

        async fn replace(&self, record: &KeyRecord) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            if let Some(slot) = records.iter_mut().find(|r| r.id == record.id) {
                *slot = record.clone();
                Ok(())
            } else {
                Err(KeyServerError::internal("no record with that _id"))
            }
        }

        async fn remove_user_id(&self, key_id: &str, email: &str) -> Result<bool> {
            let mut records = self.records.lock().unwrap();
            if let Some(pos) = records.iter().position(|r| r.key_id == key_id) {
                records[pos].user_ids.retain(|u| u.email != email);
                if records[pos].user_ids.is_empty() {
                    records.remove(pos);
                    return Ok(true);
                }
            }
            Ok(false)
        }

        async fn delete_by_key_id(&self, key_id: &str) -> Result<()> {
            self.records.lock().unwrap().retain(|r| r.key_id != key_id);
            Ok(())
        }

        async fn delete_other_verified_with_email(&self, key_id: &str, email: &str) -> Result<u64> {
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|r| {
                r.key_id == key_id
                    || !r.user_ids.iter().any(|u| u.email == email && u.verified)
            });
            Ok((before - records.len()) as u64)
        }

        async fn delete_expired_unverified(&self, older_than: DateTime<Utc>) -> Result<u64> {
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|r| r.has_verified_uid() || r.uploaded >= older_than);
            Ok((before - records.len()) as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::InMemoryKeyRepository;
    use super::*;
    use crate::model::UserIdRecord;

    fn sample_record(key_id: &str, email: &str, verified: bool) -> KeyRecord {
        KeyRecord {
            id: None,
            key_id: key_id.to_string(),
            fingerprint: format!("fp-{key_id}"),
            created: Utc::now(),
            uploaded: Utc::now(),
            algorithm: "EdDSA".to_string(),
            key_size: 256,
            public_key_armored: Some("armored".to_string()),
            verify_until: None,
            user_ids: vec![UserIdRecord {
                name: None,
                email: email.to_string(),
                verified,
                nonce: None,
                public_key_armored: None,
            }],
        }
    }

    #[tokio::test]
    async fn insert_and_find_round_trip() {
        let repo = InMemoryKeyRepository::new();
        let record = sample_record("abcd1234", "alice@example.org", false);
        let inserted = repo.insert(&record).await.unwrap();
        assert!(inserted.id.is_some());

        let found = repo.find_by_key_id("abcd1234").await.unwrap().unwrap();
        assert_eq!(found.user_ids[0].email, "alice@example.org");
    }

    #[tokio::test]
    async fn removing_last_user_id_deletes_the_record() {
        let repo = InMemoryKeyRepository::new();
        repo.insert(&sample_record("abcd1234", "alice@example.org", true))
            .await
            .unwrap();

        let deleted = repo
            .remove_user_id("abcd1234", "alice@example.org")
            .await
            .unwrap();
        assert!(deleted);
        assert!(repo.find_by_key_id("abcd1234").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_unverified_records_are_swept() {
        let repo = InMemoryKeyRepository::new();
        let mut stale = sample_record("abcd1234", "alice@example.org", false);
        stale.uploaded = Utc::now() - Duration::days(30);
        repo.insert(&stale).await.unwrap();
        repo.insert(&sample_record("ffff0000", "bob@example.org", true))
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::days(14);
        let swept = repo.delete_expired_unverified(cutoff).await.unwrap();
        assert_eq!(swept, 1);
        assert!(repo.find_by_key_id("ffff0000").await.unwrap().is_some());
    }
}
