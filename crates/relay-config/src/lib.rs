use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PHAB_URL_KEY: &str = "SYNAPSE_PHAB_URL";
pub const PHAB_TOKEN_KEY: &str = "SYNAPSE_PHAB_TOKEN";
pub const HOST_KEY: &str = "SYNAPSE_HOST";
pub const API_TOKEN_KEY: &str = "SYNAPSE_API_TOKEN";
pub const FEED_ROOM_KEY: &str = "SYNAPSE_FEED_ROOM";
pub const FEED_PHIDS_KEY: &str = "SYNAPSE_FEED_PHIDS";
pub const LOOKUP_PHID_KEY: &str = "SYNAPSE_LOOKUP_PHID";
pub const FEED_DEBUG_KEY: &str = "SYNAPSE_FEED_DEBUG";
pub const FEED_LOG_KEY: &str = "SYNAPSE_FEED_LOG";
pub const LISTEN_ADDR_KEY: &str = "SYNAPSE_LISTEN_ADDR";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_LOG_DIR: &str = ".";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub tracker: Tracker,
    pub matrix: Matrix,
    pub activity: Activity,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracker {
    /// Base URL of the Phabricator install, with or without a trailing slash.
    pub base_url: String,
    pub api_token: String,
    /// PHID types (the `TYPE` in `PHID-TYPE-xxxx`) that get resolved.
    pub resolve_types: Vec<String>,
    /// Paste holding the alias table, if any.
    pub lookup_phid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matrix {
    pub host: String,
    pub access_token: String,
    pub default_room: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub log_dir: String,
}

impl Tracker {
    pub fn phid_query_url(&self) -> String {
        self.api_url("phid.query")
    }

    pub fn paste_search_url(&self) -> String {
        self.api_url("paste.search")
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/api/{method}", self.base_url.trim_end_matches('/'))
    }
}

impl Config {
    /// Copy with both API tokens masked, suitable for debug logging.
    pub fn redacted(&self) -> serde_json::Value {
        let mut cfg = self.clone();
        cfg.tracker.api_token = mask(&cfg.tracker.api_token);
        cfg.matrix.access_token = mask(&cfg.matrix.access_token);
        serde_json::to_value(cfg).unwrap_or(serde_json::Value::Null)
    }
}

fn mask(token: &str) -> String {
    if token.is_empty() {
        String::new()
    } else {
        "***".to_string()
    }
}

pub fn load_from_env() -> Result<Config, ConfigError> {
    load_with(|key| std::env::var(key).ok())
}

/// Builds the config from an arbitrary key lookup so callers other than the
/// process environment (tests, wrappers) can supply values.
pub fn load_with<F>(lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string());
    let required = |key: &'static str| {
        get(key)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(key))
    };

    let cfg = Config {
        server: Server {
            listen_addr: get(LISTEN_ADDR_KEY)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
        },
        tracker: Tracker {
            base_url: required(PHAB_URL_KEY)?,
            api_token: get(PHAB_TOKEN_KEY).unwrap_or_default(),
            resolve_types: parse_resolve_types(&get(FEED_PHIDS_KEY).unwrap_or_default()),
            lookup_phid: get(LOOKUP_PHID_KEY).filter(|v| !v.is_empty()),
        },
        matrix: Matrix {
            host: required(HOST_KEY)?.trim_end_matches('/').to_string(),
            access_token: get(API_TOKEN_KEY).unwrap_or_default(),
            default_room: required(FEED_ROOM_KEY)?,
        },
        activity: Activity {
            log_dir: get(FEED_LOG_KEY)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
        },
        debug: parse_debug(get(FEED_DEBUG_KEY).as_deref()),
    };
    validate(&cfg)?;
    Ok(cfg)
}

/// Comma separated list; blanks are dropped so an empty type never matches
/// every `PHID--` token.
pub fn parse_resolve_types(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_debug(raw: Option<&str>) -> bool {
    match raw {
        None | Some("") => false,
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "yes" | "on" => true,
            "0" | "f" | "false" | "no" | "off" => false,
            _ => {
                eprintln!("unable to determine debug setting from {v:?}, debug disabled");
                false
            }
        },
    }
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg
        .server
        .listen_addr
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        return Err(ConfigError::Invalid {
            key: LISTEN_ADDR_KEY,
            reason: format!("{} is not a socket address", cfg.server.listen_addr),
        });
    }
    for (key, url) in [
        (PHAB_URL_KEY, &cfg.tracker.base_url),
        (HOST_KEY, &cfg.matrix.host),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key,
                reason: format!("{url} must be an http(s) URL"),
            });
        }
    }
    if let Some(t) = cfg.tracker.resolve_types.iter().find(|t| t.contains('-')) {
        return Err(ConfigError::Invalid {
            key: FEED_PHIDS_KEY,
            reason: format!("type {t:?} must not contain '-'"),
        });
    }
    Ok(())
}
