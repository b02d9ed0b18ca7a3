// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Library surface for the HKP + REST daemon, split out from `bin.rs`
//! so the route handlers can be exercised with `rocket::local` against
//! an injected `KeyService` instead of a real database and SMTP relay.

#[macro_use]
extern crate rocket;

pub mod error;
pub mod hkp;
pub mod json;
pub mod rest;

use std::sync::Arc;

use keyserver_core::KeyService;
use rocket::{Build, Rocket};

pub fn build_rocket(service: Arc<KeyService>) -> Rocket<Build> {
    rocket::build()
        .manage(service)
        .mount("/", routes![hkp::add, hkp::lookup])
        .mount(
            "/",
            routes![
                rest::upload,
                rest::lookup,
                rest::lookup_armored,
                rest::verify,
                rest::request_remove,
                rest::verify_remove,
            ],
        )
}
