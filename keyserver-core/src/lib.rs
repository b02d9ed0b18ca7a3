// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! `keyserver-core` implements the key-lifecycle control plane of an
//! OpenPGP public-key server: parsing and abuse-resistant purification
//! of uploaded keys, persistence, the email-verification state
//! machine, and notice dispatch. `keyserver-restd` exposes it over HKP
//! and a REST API; this crate has no knowledge of either transport.

pub mod codec;
pub mod config;
pub mod email;
pub mod error;
pub mod mailer;
pub mod model;
pub mod purify;
pub mod service;
pub mod store;

pub use codec::KeyCodec;
pub use config::Settings;
pub use error::{KeyServerError, Result};
pub use mailer::{Mailer, SmtpMailer};
pub use model::{KeyRecord, SanitizedKeyRecord, UserIdRecord};
pub use purify::KeyPurifier;
pub use service::{KeyService, KeyServiceConfig};
pub use store::{KeyRepository, MongoKeyRepository};
