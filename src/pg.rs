//! Guarded connections to source databases.
//!
//! Every connection to a source goes through here: the DSN gets the
//! read-only options merged in, the session variables are applied and then
//! asserted post-connect, and a rejected guard fails the connection with
//! `GuardViolation`. Even a role with write grants cannot write through a
//! connection produced by this module.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::dsn::{enforce_readonly_dsn, redact_dsn, GUARD_OPTIONS};
use crate::error::{Error, Result};

/// Transient connection failures are retried this many times.
const CONNECT_ATTEMPTS: u32 = 3;

fn is_network_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut
    )
}

/// Connect to a source database with the read-only guard enforced.
///
/// `password` is the out-of-band secret (stdin or `PGPASSWORD`); it is used
/// for the live connection only and never appears in stored state or errors.
pub async fn connect_source(dsn: &str, password: Option<&str>) -> Result<PgPool> {
    let enforced = enforce_readonly_dsn(dsn);
    let mut options = PgConnectOptions::from_str(&enforced)
        .map_err(|e| Error::Connection(format!("invalid DSN {}: {e}", redact_dsn(dsn))))?;
    if let Some(password) = password {
        options = options.password(password);
    }

    let mut last_err: Option<sqlx::Error> = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1));
            debug!(attempt, "retrying source connection after {:?}", delay);
            tokio::time::sleep(delay).await;
        }

        match PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => {
                apply_session_guards(&pool).await?;
                assert_session_guards(&pool).await?;
                return Ok(pool);
            }
            Err(err) if is_network_error(&err) => {
                warn!("source connection attempt failed: {err}");
                last_err = Some(err);
            }
            Err(err) => {
                return Err(Error::Connection(format!(
                    "{}: {err}",
                    redact_dsn(dsn)
                )));
            }
        }
    }

    Err(Error::Connection(format!(
        "{}: {}",
        redact_dsn(dsn),
        last_err.map(|e| e.to_string()).unwrap_or_else(|| "connect failed".into())
    )))
}

/// Apply the read-only session settings. The DSN options already request
/// them; setting them again covers servers that ignore startup options.
async fn apply_session_guards(pool: &PgPool) -> Result<()> {
    for (key, value) in GUARD_OPTIONS {
        sqlx::query("SELECT set_config($1, $2, false)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await
            .map_err(|e| Error::GuardViolation(format!("cannot set {key}={value}: {e}")))?;
    }
    Ok(())
}

/// Assert that every guard setting is live in the session.
async fn assert_session_guards(pool: &PgPool) -> Result<()> {
    for (key, expected) in GUARD_OPTIONS {
        let actual: String = sqlx::query_scalar("SELECT current_setting($1)")
            .bind(key)
            .fetch_one(pool)
            .await
            .map_err(|e| Error::GuardViolation(format!("cannot read {key}: {e}")))?;
        if !guard_value_matches(key, expected, &actual) {
            return Err(Error::GuardViolation(format!(
                "{key} is '{actual}', expected '{expected}'"
            )));
        }
    }
    Ok(())
}

/// The server may report timeouts in milliseconds ('5s' -> '5000ms').
fn guard_value_matches(key: &str, expected: &str, actual: &str) -> bool {
    if expected == actual {
        return true;
    }
    if key.ends_with("timeout") {
        let normalize = |v: &str| -> Option<u64> {
            if let Some(ms) = v.strip_suffix("ms") {
                ms.parse().ok()
            } else if let Some(s) = v.strip_suffix('s') {
                s.parse::<u64>().ok().map(|s| s * 1000)
            } else {
                v.parse().ok()
            }
        };
        return normalize(expected).is_some() && normalize(expected) == normalize(actual);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_values_match_across_units() {
        assert!(guard_value_matches("statement_timeout", "5s", "5s"));
        assert!(guard_value_matches("statement_timeout", "5s", "5000ms"));
        assert!(guard_value_matches("statement_timeout", "5s", "5000"));
        assert!(!guard_value_matches("statement_timeout", "5s", "10s"));
    }

    #[test]
    fn read_only_flag_must_match_exactly() {
        assert!(guard_value_matches("default_transaction_read_only", "on", "on"));
        assert!(!guard_value_matches("default_transaction_read_only", "on", "off"));
    }

    #[test]
    fn network_errors_are_classified() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(is_network_error(&io));
        assert!(is_network_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_network_error(&sqlx::Error::RowNotFound));
    }
}
