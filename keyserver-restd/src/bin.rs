// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! HKP + REST daemon for an email-verifying OpenPGP key server.

use std::sync::Arc;

use keyserver_core::{KeyService, KeyServiceConfig, MongoKeyRepository, Settings, SmtpMailer};
use keyserver_restd::build_rocket;
use rocket::{launch, Build, Rocket};

async fn build_service(settings: &Settings) -> anyhow::Result<Arc<KeyService>> {
    let repo = MongoKeyRepository::connect(&settings.mongo).await?;
    let mailer = SmtpMailer::new(&settings.email)?;

    let cfg = KeyServiceConfig {
        public_key: settings.public_key.clone(),
        purify: settings.purify.clone(),
        key_link_base: format!(
            "{}://{}/api/v1/key",
            if settings.server.security { "https" } else { "http" },
            settings.server.host
        ),
        require_encryption: settings.email.pgp,
    };

    Ok(Arc::new(KeyService::new(
        Arc::new(repo),
        Arc::new(mailer),
        cfg,
    )))
}

#[launch]
async fn rocket() -> Rocket<Build> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::load().expect("failed to load configuration");

    let service = build_service(&settings)
        .await
        .expect("failed to initialize key service");

    build_rocket(service)
}
