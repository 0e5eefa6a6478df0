//! Environment-backed runtime configuration for `convo-term`.

use std::{env, error::Error, fmt, path::PathBuf};

use convo_core::PaginationConfig;
use convo_net::ws_url_from_base;
use url::Url;

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
const DEFAULT_STATE_FILE: &str = "./.convo-term/state.json";
const DEFAULT_PAGE_SIZE: u16 = 10;
const DEFAULT_PAGINATION_TOP_THRESHOLD_PX: f32 = 50.0;
const DEFAULT_PAGINATION_THROTTLE_MS: u64 = 250;

/// Runtime configuration used by the terminal client.
#[derive(Debug, Clone, PartialEq)]
pub struct TermConfig {
    /// Base URL of the request/response API.
    pub server_url: Url,
    /// Push endpoint; derived from `server_url` unless overridden.
    pub ws_url: Url,
    /// JSON file holding the remembered username.
    pub state_file: PathBuf,
    /// History paging tuning forwarded to the runtime.
    pub pagination: PaginationConfig,
}

impl TermConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let server_url = parse_url(
            "CONVO_SERVER_URL",
            optional_trimmed_env("CONVO_SERVER_URL", &mut lookup)
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_owned()),
        )?;

        let ws_url = match optional_trimmed_env("CONVO_WS_URL", &mut lookup) {
            Some(value) => parse_url("CONVO_WS_URL", value)?,
            None => ws_url_from_base(&server_url).map_err(|err| ConfigError::InvalidValue {
                key: "CONVO_SERVER_URL",
                value: server_url.to_string(),
                reason: err.message,
            })?,
        };

        let state_file = optional_trimmed_env("CONVO_STATE_FILE", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));

        let page_size = parse_optional_u16("CONVO_PAGE_SIZE", DEFAULT_PAGE_SIZE, &mut lookup)?;
        let near_top_threshold_px = parse_optional_f32(
            "CONVO_PAGINATION_TOP_THRESHOLD_PX",
            DEFAULT_PAGINATION_TOP_THRESHOLD_PX,
            &mut lookup,
        )?;
        let throttle_interval_ms = parse_optional_u64(
            "CONVO_PAGINATION_THROTTLE_MS",
            DEFAULT_PAGINATION_THROTTLE_MS,
            &mut lookup,
        )?;

        if page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONVO_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if near_top_threshold_px <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "CONVO_PAGINATION_TOP_THRESHOLD_PX",
                value: near_top_threshold_px.to_string(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        Ok(Self {
            server_url,
            ws_url,
            state_file,
            pagination: PaginationConfig {
                page_size,
                near_top_threshold_px,
                throttle_interval_ms,
            },
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_url(key: &'static str, value: String) -> Result<Url, ConfigError> {
    Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_optional_u16<F>(key: &'static str, default: u16, lookup: &mut F) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<u16>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_optional_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<u64>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_optional_f32<F>(key: &'static str, default: f32, lookup: &mut F) -> Result<f32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<f32>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<TermConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        TermConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_target_local_server() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert_eq!(cfg.server_url.as_str(), "http://localhost:8080/");
        assert_eq!(cfg.ws_url.as_str(), "ws://localhost:8080/ws");
        assert_eq!(cfg.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert_eq!(cfg.pagination.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(
            cfg.pagination.near_top_threshold_px,
            DEFAULT_PAGINATION_TOP_THRESHOLD_PX
        );
        assert_eq!(
            cfg.pagination.throttle_interval_ms,
            DEFAULT_PAGINATION_THROTTLE_MS
        );
    }

    #[test]
    fn derives_secure_push_endpoint_from_https_server() {
        let cfg = config_from_pairs(&[("CONVO_SERVER_URL", "https://chat.example.org")])
            .expect("config should parse");
        assert_eq!(cfg.ws_url.as_str(), "wss://chat.example.org/ws");
    }

    #[test]
    fn explicit_push_endpoint_wins() {
        let cfg = config_from_pairs(&[
            ("CONVO_SERVER_URL", "https://chat.example.org"),
            ("CONVO_WS_URL", "wss://push.example.org/socket"),
            ("CONVO_STATE_FILE", " /tmp/convo/state.json "),
        ])
        .expect("config should parse");

        assert_eq!(cfg.ws_url.as_str(), "wss://push.example.org/socket");
        assert_eq!(cfg.state_file, PathBuf::from("/tmp/convo/state.json"));
    }

    #[test]
    fn parses_pagination_tuning() {
        let cfg = config_from_pairs(&[
            ("CONVO_PAGE_SIZE", "25"),
            ("CONVO_PAGINATION_TOP_THRESHOLD_PX", "120.5"),
            ("CONVO_PAGINATION_THROTTLE_MS", "0"),
        ])
        .expect("config should parse");

        assert_eq!(
            cfg.pagination,
            PaginationConfig {
                page_size: 25,
                near_top_threshold_px: 120.5,
                throttle_interval_ms: 0,
            }
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config_from_pairs(&[("CONVO_PAGE_SIZE", "abc")])
            .expect_err("invalid page size should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CONVO_PAGE_SIZE",
                ..
            }
        ));

        let err = config_from_pairs(&[("CONVO_PAGE_SIZE", "0")]).expect_err("zero page size");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CONVO_PAGE_SIZE",
                ..
            }
        ));

        let err = config_from_pairs(&[("CONVO_PAGINATION_TOP_THRESHOLD_PX", "-1")])
            .expect_err("negative threshold");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CONVO_PAGINATION_TOP_THRESHOLD_PX",
                ..
            }
        ));

        let err = config_from_pairs(&[("CONVO_SERVER_URL", "not a url")])
            .expect_err("invalid url");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CONVO_SERVER_URL",
                ..
            }
        ));
    }
}
