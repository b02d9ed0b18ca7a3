// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! KeyPurifier: abuse-resistance policy applied to every
//! key before it is trusted with anything else. Oversized or
//! over-populated keys are rejected outright; signatures are stripped
//! of the unhashed-subpacket payloads abusers use to bloat a cert
//! without changing what it cryptographically asserts.

use anyhow::{anyhow, Result};
use sequoia_openpgp::cert::amalgamation::ValidateAmalgamation;
use sequoia_openpgp::packet::signature::subpacket::SubpacketTag;
use sequoia_openpgp::packet::{Packet, Signature};
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::serialize::SerializeInto;
use sequoia_openpgp::Cert;

use crate::codec::POLICY;
use crate::config::PurifyConfig;

/// Tags an abuser gains nothing legitimate from keeping in the
/// unhashed area: they're either third-party bookkeeping (`Issuer`,
/// `IssuerFingerprint`) or can smuggle arbitrary extra packets
/// (`EmbeddedSignature`).
const STRIPPED_UNHASHED_TAGS: &[SubpacketTag] = &[
    SubpacketTag::Issuer,
    SubpacketTag::IssuerFingerprint,
    SubpacketTag::EmbeddedSignature,
];

/// Applies size and population caps, then strips unhashed-subpacket
/// padding from every signature on a cert.
pub struct KeyPurifier {
    cfg: PurifyConfig,
}

impl KeyPurifier {
    pub fn new(cfg: PurifyConfig) -> Self {
        KeyPurifier { cfg }
    }

    /// Run the full policy over `cert`, returning the cleaned-up cert
    /// or the first violation encountered. A no-op when
    /// `purify_key` is disabled, except for the hard size cap, which
    /// always applies (it guards memory, not just abuse).
    pub fn purify(&self, cert: Cert) -> Result<Cert> {
        self.check_max_key_size(&cert)?;

        if !self.cfg.purify_key {
            return Ok(cert);
        }

        self.check_key_packet(&cert)?;
        self.check_users(&cert)?;
        self.check_subkeys(&cert)?;

        let cert = self.limit_num_of_certificates(cert)?;
        let cert = Self::strip_unhashed_subpackets(cert)?;

        self.check_key_signatures(&cert)?;

        Ok(cert)
    }

    /// Overall armored size, before any other check runs.
    fn check_max_key_size(&self, cert: &Cert) -> Result<()> {
        let armored = cert
            .armored()
            .to_vec()
            .map_err(|e| anyhow!("could not armor key for size check: {e}"))?;
        if armored.len() > self.cfg.max_size_key {
            return Err(anyhow!(
                "key exceeds maximum size of {} bytes",
                self.cfg.max_size_key
            ));
        }
        Ok(())
    }

    /// The primary key packet itself must not be abnormally large.
    fn check_key_packet(&self, cert: &Cert) -> Result<()> {
        let packet = Packet::from(cert.primary_key().key().clone());
        let size = packet
            .to_vec()
            .map_err(|e| anyhow!("could not serialize primary key: {e}"))?
            .len();
        if size > self.cfg.max_size_packet {
            return Err(anyhow!(
                "primary key packet exceeds maximum size of {} bytes",
                self.cfg.max_size_packet
            ));
        }
        Ok(())
    }

    /// Caps on the number of User IDs and on each UID packet's size.
    fn check_users(&self, cert: &Cert) -> Result<()> {
        let count = cert.userids().count();
        if count > self.cfg.max_num_user_email {
            return Err(anyhow!(
                "key carries {count} user IDs, more than the maximum of {}",
                self.cfg.max_num_user_email
            ));
        }

        for ua in cert.userids() {
            let packet = Packet::from(ua.userid().clone());
            let size = packet
                .to_vec()
                .map_err(|e| anyhow!("could not serialize user ID: {e}"))?
                .len();
            if size > self.cfg.max_size_userid {
                return Err(anyhow!(
                    "a user ID packet exceeds the maximum size of {} bytes",
                    self.cfg.max_size_userid
                ));
            }
        }

        Ok(())
    }

    /// Cap on the number of subkeys.
    fn check_subkeys(&self, cert: &Cert) -> Result<()> {
        let count = cert.keys().subkeys().count();
        if count > self.cfg.max_num_subkey {
            return Err(anyhow!(
                "key carries {count} subkeys, more than the maximum of {}",
                self.cfg.max_num_subkey
            ));
        }
        Ok(())
    }

    /// Culls self-certifications down to the newest `max_num_cert` per
    /// User ID / User Attribute / subkey binding, the classic DoS
    /// vector of a key with thousands of otherwise-valid self-sigs.
    fn limit_num_of_certificates(&self, cert: Cert) -> Result<Cert> {
        let max = self.cfg.max_num_cert;

        let mut excess_over_cap: Vec<(sequoia_openpgp::packet::UserID, Signature)> = Vec::new();
        for ua in cert.userids() {
            let mut sigs: Vec<_> = ua.self_signatures().cloned().collect();
            if sigs.len() > max {
                sigs.sort_by_key(|s| std::cmp::Reverse(s.signature_creation_time()));
                for sig in sigs.into_iter().skip(max) {
                    excess_over_cap.push((ua.userid().clone(), sig));
                }
            }
        }

        if excess_over_cap.is_empty() {
            return Ok(cert);
        }

        // Rebuild from every packet except the culled excess signatures.
        let packets: Vec<Packet> = cert
            .clone()
            .into_packets()
            .filter(|p| {
                if let Packet::Signature(sig) = p {
                    !excess_over_cap
                        .iter()
                        .any(|(_, culled)| culled.digest_prefix() == sig.digest_prefix())
                } else {
                    true
                }
            })
            .collect();

        Cert::from_packets(packets.into_iter())
            .map_err(|e| anyhow!("could not cull excess certifications: {e}"))
    }

    /// Every signature on the cert has its unhashed area scrubbed of
    /// the tags in [`STRIPPED_UNHASHED_TAGS`]. The hashed area (and
    /// thus signature validity) is untouched.
    fn strip_unhashed_subpackets(cert: Cert) -> Result<Cert> {
        let packets: Vec<Packet> = cert
            .clone()
            .into_packets()
            .map(|p| match p {
                Packet::Signature(sig) => Packet::Signature(Self::scrub_signature(sig)),
                other => other,
            })
            .collect();

        Cert::from_packets(packets.into_iter())
            .map_err(|e| anyhow!("could not rebuild cert after stripping subpackets: {e}"))
    }

    fn scrub_signature(mut sig: Signature) -> Signature {
        for tag in STRIPPED_UNHASHED_TAGS {
            sig.unhashed_area_mut().remove_all(*tag);
        }
        sig
    }

    /// After purification the cert must still validate under the
    /// standard policy — stripping subpackets or culling certifications
    /// must never turn a valid key into an invalid one.
    fn check_key_signatures(&self, cert: &Cert) -> Result<()> {
        cert.clone()
            .with_policy(&POLICY, None)
            .map_err(|e| anyhow!("key does not validate after purification: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequoia_openpgp::cert::CertBuilder;

    #[test]
    fn strips_issuer_fingerprint_from_unhashed_area() {
        let (cert, _rev) = CertBuilder::new()
            .add_userid("Test User <test@example.org>")
            .generate()
            .unwrap();

        let purifier = KeyPurifier::new(PurifyConfig::default());
        let cleaned = purifier.purify(cert).expect("purify should succeed");

        for sig in cleaned.clone().into_packets().filter_map(|p| match p {
            Packet::Signature(s) => Some(s),
            _ => None,
        }) {
            assert!(sig
                .unhashed_area()
                .iter()
                .all(|sp| sp.tag() != SubpacketTag::IssuerFingerprint));
        }
    }

    #[test]
    fn rejects_too_many_user_ids() {
        let mut builder = CertBuilder::new();
        for i in 0..25 {
            builder = builder.add_userid(format!("user{i} <user{i}@example.org>"));
        }
        let (cert, _rev) = builder.generate().unwrap();

        let mut cfg = PurifyConfig::default();
        cfg.max_num_user_email = 20;
        let purifier = KeyPurifier::new(cfg);

        assert!(purifier.purify(cert).is_err());
    }
}
