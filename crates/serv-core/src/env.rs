//! Environment variable utilities
//!
//! Used by `ServerConfig::from_env` and the logging setup.
//!
//! ```ignore
//! use serv_core::env::{env_get, env_get_opt};
//!
//! let backlog: i32 = env_get("SERV_BACKLOG", 1);
//! let host: Option<String> = env_get_opt("SERV_HOST");
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// A set-but-unparseable value also yields the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as optional value
///
/// `None` when unset, empty, or unparseable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
