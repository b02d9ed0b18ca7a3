// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mailer: renders a verification or removal notice, optionally
//! PGP-encrypts it to the recipient's own uploaded key, and submits it
//! over SMTP.

use std::io::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as SmtpMessage, Tokio1Executor};
use sequoia_openpgp::cert::amalgamation::ValidateAmalgamation;
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::serialize::stream::{Armorer, Encryptor, LiteralWriter, Message, Recipient};
use sequoia_openpgp::Cert;

use crate::config::EmailConfig;

static POLICY: StandardPolicy<'static> = StandardPolicy::new();

/// A notice to dispatch to a single User ID. `link` is the fully
/// formed HTTPS verify/remove URL; `armored_key` is the per-UID
/// filtered key to encrypt against, when the deployment has PGP
/// notices enabled.
pub struct MailNotice<'a> {
    pub to_name: Option<&'a str>,
    pub to_email: &'a str,
    pub subject: &'a str,
    pub body: String,
    pub armored_key: Option<&'a str>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, notice: MailNotice<'_>) -> Result<()>;
}

/// Production mailer: SMTP via `lettre`, optional OpenPGP encryption of
/// the body via `sequoia-openpgp`.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    pgp: bool,
}

impl SmtpMailer {
    pub fn new(cfg: &EmailConfig) -> Result<Self> {
        let mut builder = if cfg.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
                .context("could not configure SMTP relay (TLS)")?
        } else if cfg.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
                .context("could not configure SMTP relay (STARTTLS)")?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host)
        }
        .port(cfg.port);

        if let Some(auth) = &cfg.auth {
            builder = builder.credentials(Credentials::new(auth.user.clone(), auth.pass.clone()));
        }

        let sender: Mailbox = cfg
            .sender
            .parse()
            .with_context(|| format!("invalid sender address: {}", cfg.sender))?;

        Ok(SmtpMailer {
            transport: builder.build(),
            sender,
            pgp: cfg.pgp,
        })
    }

    /// Encrypt `body` to every usable encryption subkey of `armored`,
    /// returning an ASCII-armored OpenPGP message.
    fn encrypt(armored: &str, body: &str) -> Result<String> {
        let cert = Cert::from_bytes(armored.as_bytes()).context("could not parse recipient key")?;
        let valid = cert
            .with_policy(&POLICY, None)
            .context("recipient key does not validate")?;

        let recipients: Vec<Recipient> = valid
            .keys()
            .alive()
            .revoked(false)
            .for_storage_encryption()
            .chain(valid.keys().alive().revoked(false).for_transport_encryption())
            .map(|ka| ka.key().into())
            .collect();

        if recipients.is_empty() {
            anyhow::bail!("recipient key has no usable encryption-capable subkey");
        }

        let mut sink = Vec::new();
        {
            let message = Message::new(&mut sink);
            let message = Armorer::new(message).build()?;
            let message = Encryptor::for_recipients(message, recipients).build()?;
            let mut message = LiteralWriter::new(message).build()?;
            message.write_all(body.as_bytes())?;
            message.finalize()?;
        }

        Ok(String::from_utf8(sink)?)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, notice: MailNotice<'_>) -> Result<()> {
        let to: Mailbox = if let Some(name) = notice.to_name {
            format!("{name} <{}>", notice.to_email)
                .parse()
                .with_context(|| format!("invalid recipient address: {}", notice.to_email))?
        } else {
            notice
                .to_email
                .parse()
                .with_context(|| format!("invalid recipient address: {}", notice.to_email))?
        };

        let body = match (self.pgp, notice.armored_key) {
            (true, Some(key)) => match Self::encrypt(key, &notice.body) {
                Ok(encrypted) => encrypted,
                Err(e) => {
                    tracing::warn!(error = %e, "falling back to plaintext notice");
                    notice.body.clone()
                }
            },
            _ => notice.body.clone(),
        };

        let message = SmtpMessage::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(notice.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .context("could not build message")?;

        match self.transport.send(message).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // A failed notice never unwinds the calling ingestion
                // request: the key is still persisted, the recipient
                // can always re-trigger the same notice.
                tracing::warn!(error = %e, email = notice.to_email, "notice delivery failed");
                Err(e).context("SMTP submission failed")
            }
        }
    }
}

/// No-op mailer for tests: records every notice it was asked to send.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<(String, String)>>,
        pub bodies: Mutex<Vec<String>>,
    }

    impl RecordingMailer {
        pub fn new() -> Self {
            Self::default()
        }

        /// The nonce embedded in the most recently sent notice's link
        /// (`...&nonce=<hex>`), for tests that need to drive
        /// `verify`/`verify_remove` without reaching into storage.
        pub fn last_nonce(&self) -> Option<String> {
            let bodies = self.bodies.lock().unwrap();
            let body = bodies.last()?;
            let start = body.find("nonce=")? + "nonce=".len();
            let rest = &body[start..];
            let end = rest.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(rest.len());
            Some(rest[..end].to_string())
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, notice: MailNotice<'_>) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((notice.to_email.to_string(), notice.subject.to_string()));
            self.bodies.lock().unwrap().push(notice.body.clone());
            Ok(())
        }
    }
}
