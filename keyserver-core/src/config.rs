// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Configuration.
//!
//! Layered the way `config`-crate services usually are: a base
//! `config/default.toml` (optional), overridden by `KEYSERVER__*`
//! environment variables using `__` as the nesting separator (so
//! `KEYSERVER__EMAIL__PGP=true` sets `email.pgp`).

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cors: bool,
    #[serde(default)]
    pub security: bool,
    #[serde(default)]
    pub csp: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: Option<EmailAuth>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default)]
    pub pgp: bool,
    pub sender: String,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAuth {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicKeyConfig {
    #[serde(default = "default_purge_time")]
    pub purge_time_in_days: i64,
    #[serde(default = "default_upload_rate_limit")]
    pub upload_rate_limit: u64,
}

fn default_purge_time() -> i64 {
    14
}

fn default_upload_rate_limit() -> u64 {
    10
}

impl Default for PublicKeyConfig {
    fn default() -> Self {
        PublicKeyConfig {
            purge_time_in_days: default_purge_time(),
            upload_rate_limit: default_upload_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurifyConfig {
    #[serde(default = "default_true")]
    pub purify_key: bool,
    #[serde(default = "default_max_num_user_email")]
    pub max_num_user_email: usize,
    #[serde(default = "default_max_num_subkey")]
    pub max_num_subkey: usize,
    #[serde(default = "default_max_num_cert")]
    pub max_num_cert: usize,
    #[serde(default = "default_max_size_userid")]
    pub max_size_userid: usize,
    #[serde(default = "default_max_size_packet")]
    pub max_size_packet: usize,
    #[serde(default = "default_max_size_key")]
    pub max_size_key: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_num_user_email() -> usize {
    20
}
fn default_max_num_subkey() -> usize {
    20
}
fn default_max_num_cert() -> usize {
    5
}
fn default_max_size_userid() -> usize {
    2_210
}
fn default_max_size_packet() -> usize {
    8_192
}
fn default_max_size_key() -> usize {
    1_024 * 1_024
}

impl Default for PurifyConfig {
    fn default() -> Self {
        PurifyConfig {
            purify_key: true,
            max_num_user_email: default_max_num_user_email(),
            max_num_subkey: default_max_num_subkey(),
            max_num_cert: default_max_num_cert(),
            max_size_userid: default_max_size_userid(),
            max_size_packet: default_max_size_packet(),
            max_size_key: default_max_size_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SyslogConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub mongo: MongoConfig,
    pub email: EmailConfig,
    #[serde(default)]
    pub public_key: PublicKeyConfig,
    #[serde(default)]
    pub purify: PurifyConfig,
    #[serde(default)]
    pub syslog: SyslogConfig,
}

impl Settings {
    /// Load settings from `config/default.toml` (if present), then
    /// overlay `KEYSERVER__*` environment variables.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("KEYSERVER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("failed to parse configuration")
    }
}
