use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_STATE_DIR: &str = ".khadamati";
/// Upper bound for `KHADAMATI_RECENT_HOURS` (ten years)
pub const MAX_RECENT_HOURS: u64 = 24 * 365 * 10;

/// Runtime configuration, read from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project URL of the hosted backend, e.g. `https://xyz.supabase.co`
    pub supabase_url: String,
    pub anon_key: String,
    /// Session token of the signed-in user; the anon key is used when absent
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    pub state_dir: PathBuf,
    pub log_level: String,
    pub search_debounce_ms: u64,
    pub recent_hours: i64,
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            anon_key: String::new(),
            access_token: None,
            user_id: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            log_level: "info".to_string(),
            search_debounce_ms: 300,
            recent_hours: 12,
            http_timeout_secs: 30,
        }
    }
}

fn recent_hours(hours: u64) -> Result<i64> {
    if !(1..=MAX_RECENT_HOURS).contains(&hours) {
        return Err(Error::Config(format!(
            "KHADAMATI_RECENT_HOURS must be between 1 and {}, got {}",
            MAX_RECENT_HOURS, hours
        )));
    }
    Ok(hours as i64)
}

impl Config {
    /// Load from the process environment (and a `.env` file when present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("{} is not set", key)))
        };
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", key, raw))),
                None => Ok(default),
            }
        };

        Ok(Self {
            supabase_url: required("SUPABASE_URL")?.trim_end_matches('/').to_string(),
            anon_key: required("SUPABASE_ANON_KEY")?,
            access_token: lookup("SUPABASE_ACCESS_TOKEN").filter(|v| !v.is_empty()),
            user_id: lookup("KHADAMATI_USER_ID").filter(|v| !v.is_empty()),
            state_dir: lookup("KHADAMATI_STATE_DIR").map(PathBuf::from).unwrap_or(defaults.state_dir),
            log_level: lookup("KHADAMATI_LOG").unwrap_or(defaults.log_level),
            search_debounce_ms: number("KHADAMATI_SEARCH_DEBOUNCE_MS", defaults.search_debounce_ms)?,
            recent_hours: recent_hours(number("KHADAMATI_RECENT_HOURS", defaults.recent_hours as u64)?)?,
            http_timeout_secs: number("KHADAMATI_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
        })
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Websocket endpoint of the realtime service
    pub fn realtime_url(&self) -> String {
        let base = self
            .supabase_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", base, self.anon_key)
    }
}
