// SPDX-FileCopyrightText: 2019-2022 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Email syntax validation and normalization.

use once_cell::sync::Lazy;
use regex::Regex;

// local@domain.tld, TLD at least 2 characters. Deliberately conservative:
// this gate gets run on untrusted input from key User IDs and the REST
// API before anything is ever compared or persisted.
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)*\.[a-z]{2,}$")
        .expect("static email regex is valid")
});

/// Is `s` a syntactically valid `local@domain.tld` address?
pub fn is_email(s: &str) -> bool {
    EMAIL_RE.is_match(s)
}

/// Normalize an email address for comparison/storage: lowercase, no
/// surrounding whitespace. Returns `None` if the result isn't a valid
/// address (every stored email must pass this rule).
pub fn normalize(s: &str) -> Option<String> {
    let lower = s.trim().to_lowercase();
    if is_email(&lower) {
        Some(lower)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_addresses() {
        assert!(is_email("alice@example.org"));
        assert!(is_email("a.b+tag@sub.example.io"));
    }

    #[test]
    fn rejects_short_tld_and_missing_at() {
        assert!(!is_email("alice@example.c"));
        assert!(!is_email("alice.example.org"));
        assert!(!is_email(""));
    }

    #[test]
    fn normalize_lowercases() {
        assert_eq!(normalize(" Alice@Example.ORG ").as_deref(), Some("alice@example.org"));
        assert_eq!(normalize("not-an-email"), None);
    }
}
