// ABOUTME: Utility functions for identifiers, URLs, and retry logic
// ABOUTME: Shared by the database backends, the state store, and the CLI

use std::time::Duration;
use url::Url;

use crate::error::{Result, SyncError};

/// Quote an ANSI SQL identifier (PostgreSQL, SQLite)
///
/// Escapes embedded quotes and wraps the identifier in double quotes.
///
/// # Examples
///
/// ```
/// use tablesync::utils::quote_ident;
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a MySQL identifier (table, column)
///
/// MySQL uses backticks for identifier quoting. Escapes embedded backticks
/// by doubling them.
///
/// # Examples
///
/// ```
/// use tablesync::utils::quote_mysql_ident;
/// assert_eq!(quote_mysql_ident("users"), "`users`");
/// assert_eq!(quote_mysql_ident("user`name"), "`user``name`");
/// ```
pub fn quote_mysql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        if ch == '`' {
            quoted.push('`');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

/// Sanitize a database URL by masking the password component
///
/// Values that do not parse as URLs (SQLite file paths) are returned as-is.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}

/// Reject a MySQL URL that points at port 5432 unless explicitly allowed.
///
/// 5432 is the PostgreSQL default, so a `mysql://` URL on that port is
/// almost always a copy-paste mistake.
pub fn check_mysql_port(url: &str, allow_port_5432: bool) -> Result<()> {
    let Ok(parsed) = Url::parse(url) else {
        return Ok(());
    };
    if parsed.scheme().starts_with("mysql") && parsed.port() == Some(5432) && !allow_port_5432 {
        return Err(SyncError::Config(format!(
            "{} uses port 5432 (typical for PostgreSQL). If your MySQL server \
             really listens on 5432, pass --allow-mysql-port-5432.",
            sanitize_url(url)
        )));
    }
    Ok(())
}

/// Validate that source and target are different databases
///
/// URLs are compared on scheme, user, host (case-insensitive), port (with the
/// scheme's default filled in) and database path. Passwords and query
/// parameters are ignored since they do not change database identity.
pub fn validate_source_target_different(source: &str, target: &str) -> Result<()> {
    if normalize_identity(source) == normalize_identity(target) {
        return Err(SyncError::Config(format!(
            "Source and target point to the same database: {}",
            sanitize_url(source)
        )));
    }
    Ok(())
}

fn normalize_identity(value: &str) -> String {
    match Url::parse(value) {
        Ok(parsed) if parsed.has_host() => format!(
            "{}://{}@{}:{}{}",
            parsed.scheme(),
            parsed.username(),
            parsed.host_str().unwrap_or_default().to_lowercase(),
            parsed.port().or_else(|| default_port(parsed.scheme())).unwrap_or(0),
            parsed.path()
        ),
        _ => value.to_string(),
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "mysql" => Some(3306),
        "postgres" | "postgresql" => Some(5432),
        _ => None,
    }
}

/// Retry an async operation with exponential backoff
///
/// Each retry doubles the delay. Only errors for which `retryable` returns
/// true are retried; anything else is returned immediately.
///
/// # Arguments
///
/// * `operation` - Async function to retry
/// * `max_retries` - Maximum number of retry attempts (0 = no retries, just initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
/// * `retryable` - Predicate deciding whether an error is worth another attempt
pub async fn retry_with_backoff<F, Fut, T, R>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
    retryable: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    R: Fn(&SyncError) -> bool,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && retryable(&e) => {
                attempt += 1;
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}; retrying in {:?}...",
                    attempt,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
