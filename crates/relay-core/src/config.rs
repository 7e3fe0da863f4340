use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{cycle::AckPolicy, errors::Error, utils::parse_csv_durations_ms, Result};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_CURSOR_STATE_PATH: &str = ".channel_runtime/telegram_cursor_state.json";
/// Provider cap on updates per `getUpdates` call.
pub const MAX_FETCH_LIMIT: u32 = 100;

/// Typed runtime configuration, read from `CHANNEL_*` environment variables.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    // Provider
    pub token: String,
    pub api_base: String,
    pub http_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Vec<Duration>,

    // Polling
    pub poll_interval: Duration,
    pub poll_timeout_seconds: u32,
    pub fetch_limit: u32,
    pub once: bool,

    // Delivery
    pub ack_policy: AckPolicy,
    pub allowed_chat_ids: Vec<String>,
    pub live_mode: bool,
    pub enable_memory_hook: bool,

    // Cursor state
    pub cursor_state_path: Option<PathBuf>,
    pub strict_cursor_state_io: bool,
}

impl RuntimeConfig {
    /// Load from the process environment (after an optional `.env`).
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"))?;
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|s| s.trim().to_string());

        let token = get("CHANNEL_TOKEN").unwrap_or_default();
        if token.is_empty() {
            return Err(Error::Config(
                "CHANNEL_TOKEN environment variable is required".to_string(),
            ));
        }

        let api_base = get("CHANNEL_API_BASE")
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let ack_policy = match get("CHANNEL_ACK_POLICY") {
            Some(raw) => raw.parse::<AckPolicy>()?,
            None => AckPolicy::Always,
        };

        let poll_interval = Duration::from_millis(positive_u64(
            "CHANNEL_POLL_INTERVAL_MS",
            get("CHANNEL_POLL_INTERVAL_MS"),
            2_000,
        )?);
        let http_timeout = Duration::from_millis(positive_u64(
            "CHANNEL_HTTP_TIMEOUT_MS",
            get("CHANNEL_HTTP_TIMEOUT_MS"),
            10_000,
        )?);
        let poll_timeout_seconds =
            parse_num::<u32>("CHANNEL_POLL_TIMEOUT_S", get("CHANNEL_POLL_TIMEOUT_S"), 0)?;
        let max_retries = parse_num::<u32>("CHANNEL_MAX_RETRIES", get("CHANNEL_MAX_RETRIES"), 2)?;

        let fetch_limit = parse_num::<u32>("CHANNEL_FETCH_LIMIT", get("CHANNEL_FETCH_LIMIT"), 100)?;
        if fetch_limit == 0 || fetch_limit > MAX_FETCH_LIMIT {
            return Err(Error::Config(format!(
                "CHANNEL_FETCH_LIMIT must be between 1 and {MAX_FETCH_LIMIT}"
            )));
        }

        let backoff = match get("CHANNEL_BACKOFF_MS").and_then(non_empty) {
            Some(raw) => parse_csv_durations_ms(&raw).ok_or_else(|| {
                Error::Config(
                    "CHANNEL_BACKOFF_MS must be a comma-separated list of non-negative integers"
                        .to_string(),
                )
            })?,
            None => vec![Duration::from_millis(250), Duration::from_millis(500)],
        };

        let allowed_chat_ids = parse_allowlist(get("CHANNEL_ALLOWED_CHAT_IDS"))?;

        let cursor_state_path = match vars.get("CHANNEL_CURSOR_STATE_PATH") {
            Some(raw) => non_empty(raw.trim().to_string()).map(PathBuf::from),
            None => Some(PathBuf::from(DEFAULT_CURSOR_STATE_PATH)),
        };

        let strict_cursor_state_io = parse_bool(
            "CHANNEL_STRICT_CURSOR_STATE_IO",
            get("CHANNEL_STRICT_CURSOR_STATE_IO"),
        )?;
        let live_mode = parse_bool("CHANNEL_LIVE_MODE", get("CHANNEL_LIVE_MODE"))?;
        let once = parse_bool("CHANNEL_ONCE", get("CHANNEL_ONCE"))?;
        let enable_memory_hook =
            parse_bool("CHANNEL_ENABLE_MEMORY_HOOK", get("CHANNEL_ENABLE_MEMORY_HOOK"))?;

        if live_mode && allowed_chat_ids.is_empty() {
            return Err(Error::Config(
                "CHANNEL_ALLOWED_CHAT_IDS must be non-empty when CHANNEL_LIVE_MODE is enabled"
                    .to_string(),
            ));
        }

        Ok(Self {
            token,
            api_base,
            http_timeout,
            max_retries,
            backoff,
            poll_interval,
            poll_timeout_seconds,
            fetch_limit,
            once,
            ack_policy,
            allowed_chat_ids,
            live_mode,
            enable_memory_hook,
            cursor_state_path,
            strict_cursor_state_io,
        })
    }
}

/// A missing file is fine; an unreadable one is an error.
fn load_dotenv_if_present(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let contents = fs::read_to_string(path)?;

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
    Ok(())
}

fn parse_bool(key: &str, raw: Option<String>) -> Result<bool> {
    let Some(raw) = raw else {
        return Ok(false);
    };
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{key} must be a boolean"))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw.and_then(non_empty) {
        None => Ok(default),
        Some(s) => s
            .parse::<T>()
            .map_err(|_| Error::Config(format!("{key} must be a non-negative integer"))),
    }
}

fn positive_u64(key: &str, raw: Option<String>, default: u64) -> Result<u64> {
    let v = parse_num::<u64>(key, raw, default)?;
    if v == 0 {
        return Err(Error::Config(format!("{key} must be a positive number")));
    }
    Ok(v)
}

fn parse_allowlist(raw: Option<String>) -> Result<Vec<String>> {
    let Some(raw) = raw.and_then(non_empty) else {
        return Ok(Vec::new());
    };
    let values = raw.split(',').map(|s| s.trim().to_string()).collect::<Vec<_>>();
    if values.iter().any(|v| v.is_empty()) {
        return Err(Error::Config(
            "CHANNEL_ALLOWED_CHAT_IDS must not contain empty values".to_string(),
        ));
    }
    Ok(values)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
