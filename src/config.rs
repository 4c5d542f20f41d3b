use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/booking-sync.db";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CHANGE_PAGE_SIZE: i64 = 200;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub retry: RetryPolicy,
    pub change_page_size: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            port: DEFAULT_PORT,
            retry: RetryPolicy::default(),
            change_page_size: DEFAULT_CHANGE_PAGE_SIZE,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; malformed values fall back to
    /// their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let parsed = |key: &str, fallback| read(&lookup, key, fallback);

        let retry = RetryPolicy {
            max_attempts: parsed("RETRY_MAX_ATTEMPTS", u64::from(defaults.retry.max_attempts))
                .try_into()
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: Duration::from_millis(parsed(
                "RETRY_BASE_DELAY_MS",
                millis(defaults.retry.base_delay),
            )),
            max_delay: Duration::from_millis(parsed(
                "RETRY_MAX_DELAY_MS",
                millis(defaults.retry.max_delay),
            )),
        };

        Config {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            port: read(&lookup, "PORT", defaults.port),
            retry,
            change_page_size: read(&lookup, "CHANGE_PAGE_SIZE", defaults.change_page_size).max(1),
        }
    }
}

fn read<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, fallback: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return fallback;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            log::warn!("Ignoring malformed {key}={raw:?}; using {fallback}");
            fallback
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
