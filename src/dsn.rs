//! PostgreSQL DSN handling for the connection guard.
//!
//! Every DSN that qpg stores or connects with carries the three read-only
//! session options in its `options` query parameter. Passwords are handled
//! out-of-band: they can be injected for a live connection but are stripped
//! before a DSN is persisted or displayed.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

/// Session options merged into every source DSN.
pub const GUARD_OPTIONS: &[(&str, &str)] = &[
    ("default_transaction_read_only", "on"),
    ("statement_timeout", "5s"),
    ("idle_in_transaction_session_timeout", "10s"),
];

const SENSITIVE_KEYS: &[&str] = &["password", "passwd", "pwd", "token", "secret", "apikey", "api_key"];

const QUERY_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'=')
    .add(b'>');

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ENCODE).to_string()
}

fn is_postgres_url(url: &Url) -> bool {
    matches!(url.scheme(), "postgres" | "postgresql") && url.host().is_some()
}

/// True when `options` already sets `key` via a `-c key=value` flag.
fn has_option(options: &str, key: &str) -> bool {
    let mut expect_value = false;
    for token in options.split_whitespace() {
        if expect_value {
            expect_value = false;
            if token.starts_with(key) && token[key.len()..].starts_with('=') {
                return true;
            }
            continue;
        }
        if token == "-c" {
            expect_value = true;
        } else if let Some(rest) = token.strip_prefix("-c") {
            if rest.starts_with(key) && rest[key.len()..].starts_with('=') {
                return true;
            }
        }
    }
    false
}

fn merge_guard_options(existing: &[String]) -> String {
    let mut merged = existing
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    for (key, value) in GUARD_OPTIONS {
        if !has_option(&merged, key) {
            if !merged.is_empty() {
                merged.push(' ');
            }
            merged.push_str(&format!("-c {key}={value}"));
        }
    }
    merged
}

/// Merge the read-only guard options into a PostgreSQL DSN.
///
/// Non-PostgreSQL strings are returned unchanged. Idempotent: options
/// already present are not duplicated.
pub fn enforce_readonly_dsn(dsn: &str) -> String {
    let mut url = match Url::parse(dsn) {
        Ok(url) => url,
        Err(_) => return dsn.to_string(),
    };
    if !is_postgres_url(&url) {
        return dsn.to_string();
    }

    let mut options_values: Vec<String> = Vec::new();
    let mut passthrough: Vec<(String, String)> = Vec::new();
    for (key, value) in url.query_pairs() {
        if key.eq_ignore_ascii_case("options") {
            options_values.push(value.into_owned());
        } else {
            passthrough.push((key.into_owned(), value.into_owned()));
        }
    }
    passthrough.push(("options".to_string(), merge_guard_options(&options_values)));

    let query = passthrough
        .iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&");
    url.set_query(Some(&query));
    url.to_string()
}

/// True when the DSN embeds a non-empty password.
pub fn dsn_has_password(dsn: &str) -> bool {
    match Url::parse(dsn) {
        Ok(url) if is_postgres_url(&url) => url.password().is_some_and(|p| !p.is_empty()),
        _ => false,
    }
}

/// Return the DSN with `password` injected into the userinfo section.
pub fn dsn_with_password(dsn: &str, password: &str) -> String {
    let mut url = match Url::parse(dsn) {
        Ok(url) => url,
        Err(_) => return dsn.to_string(),
    };
    if !is_postgres_url(&url) || url.username().is_empty() {
        return dsn.to_string();
    }
    if url.set_password(Some(password)).is_err() {
        return dsn.to_string();
    }
    url.to_string()
}

/// Return the DSN with any embedded password removed.
pub fn dsn_without_password(dsn: &str) -> String {
    let mut url = match Url::parse(dsn) {
        Ok(url) => url,
        Err(_) => return dsn.to_string(),
    };
    if !is_postgres_url(&url) {
        return dsn.to_string();
    }
    let _ = url.set_password(None);
    url.to_string()
}

/// Redact the password and any sensitive query values for display.
pub fn redact_dsn(dsn: &str) -> String {
    let mut url = match Url::parse(dsn) {
        Ok(url) => url,
        Err(_) => return dsn.to_string(),
    };
    if url.host().is_none() {
        return dsn.to_string();
    }
    if url.password().is_some_and(|p| !p.is_empty()) {
        let _ = url.set_password(Some("***"));
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if SENSITIVE_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                (k.into_owned(), "***".to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    if !pairs.is_empty() {
        let query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }
    url.to_string()
}

/// Redact a secret for display, keeping a short prefix and suffix.
pub fn redact_secret(secret: &str) -> String {
    const KEEP_PREFIX: usize = 3;
    const KEEP_SUFFIX: usize = 2;
    if secret.len() <= KEEP_PREFIX + KEEP_SUFFIX {
        return "*".repeat(secret.len());
    }
    format!(
        "{}...{}",
        &secret[..KEEP_PREFIX],
        &secret[secret.len() - KEEP_SUFFIX..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforce_adds_all_guard_options() {
        let dsn = enforce_readonly_dsn("postgresql://ro@db.example.com:5432/app");
        assert!(dsn.contains("default_transaction_read_only%3Don"));
        assert!(dsn.contains("statement_timeout%3D5s"));
        assert!(dsn.contains("idle_in_transaction_session_timeout%3D10s"));
    }

    #[test]
    fn enforce_is_idempotent() {
        let once = enforce_readonly_dsn("postgresql://ro@h/db");
        let twice = enforce_readonly_dsn(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn enforce_preserves_existing_options() {
        let dsn = enforce_readonly_dsn("postgresql://ro@h/db?options=-c%20search_path%3Dapp");
        assert!(dsn.contains("search_path%3Dapp"));
        assert!(dsn.contains("default_transaction_read_only%3Don"));
    }

    #[test]
    fn enforce_ignores_non_postgres() {
        assert_eq!(enforce_readonly_dsn("mysql://u@h/db"), "mysql://u@h/db");
        assert_eq!(enforce_readonly_dsn("not a url"), "not a url");
    }

    #[test]
    fn password_helpers_round_trip() {
        let dsn = "postgresql://ro@h:5432/db";
        assert!(!dsn_has_password(dsn));
        let with = dsn_with_password(dsn, "s3cret");
        assert!(dsn_has_password(&with));
        let without = dsn_without_password(&with);
        assert!(!dsn_has_password(&without));
        assert_eq!(without, dsn);
    }

    #[test]
    fn redact_hides_password_and_query_secrets() {
        let redacted = redact_dsn("postgresql://ro:hunter2@h/db?sslmode=require&password=abc");
        assert!(!redacted.contains("hunter2"));
        assert!(!redacted.contains("abc"));
        assert!(redacted.contains("ro:***@"));
        assert!(redacted.contains("sslmode=require"));
    }

    #[test]
    fn redact_secret_keeps_edges() {
        assert_eq!(redact_secret("sk-abcdef123456"), "sk-...56");
        assert_eq!(redact_secret("abc"), "***");
        assert_eq!(redact_secret(""), "");
    }
}
