// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;

use crate::error::TransportError;

const DEFAULT_SERVER_URL: &str = "http://localhost:8200";
const EVENTS_PATH: &str = "/intake/v2/events";
/// 750kb, the intake server's default request size budget.
const DEFAULT_API_REQUEST_SIZE: u64 = 750 * 1024;
const DEFAULT_API_REQUEST_TIME: Duration = Duration::from_secs(10);
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PIPE_CAPACITY: usize = 128;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Settings consumed by the transport. Read-only once a connection has been built from it.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the intake server, without the events path
    pub server_url: String,
    /// Sent as `Authorization: Bearer <token>` when set
    pub secret_token: Option<String>,
    /// When set, writes are dropped and no request is ever opened
    pub disable_send: bool,
    /// Gzip request bodies on the fly
    pub http_compression: bool,
    /// Flush once this many uncompressed bytes were written to one request
    pub api_request_size: u64,
    /// Flush an open request after this long. `None` disables the timer.
    pub api_request_time: Option<Duration>,
    pub proxy_address: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    /// Extra headers for the proxy, in configuration order
    pub proxy_headers: Vec<(String, String)>,
    /// PEM file used as an additional trust root for https endpoints
    pub server_ca_cert: Option<PathBuf>,
    pub verify_server_cert: bool,
    /// Upper bound on how long a flush waits for the request to finish
    pub flush_timeout: Duration,
    /// Number of chunks the request body pipe buffers before writers wait
    pub pipe_capacity: usize,
    pub log_level: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            secret_token: None,
            disable_send: false,
            http_compression: true,
            api_request_size: DEFAULT_API_REQUEST_SIZE,
            api_request_time: Some(DEFAULT_API_REQUEST_TIME),
            proxy_address: None,
            proxy_port: None,
            proxy_username: None,
            proxy_password: None,
            proxy_headers: Vec::new(),
            server_ca_cert: None,
            verify_server_cert: true,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            log_level: "info".to_string(),
        }
    }
}

impl TransportConfig {
    /// Create configuration from `ELASTIC_APM_*` environment variables
    pub fn from_env() -> Result<Self, TransportError> {
        let defaults = Self::default();

        let server_url = env::var("ELASTIC_APM_SERVER_URL").unwrap_or(defaults.server_url);
        let secret_token = non_empty_var("ELASTIC_APM_SECRET_TOKEN");
        let disable_send = env::var("ELASTIC_APM_DISABLE_SEND")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(defaults.disable_send);
        let http_compression = env::var("ELASTIC_APM_HTTP_COMPRESSION")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(defaults.http_compression);

        let api_request_size = match non_empty_var("ELASTIC_APM_API_REQUEST_SIZE") {
            Some(val) => parse_size(&val).ok_or_else(|| {
                TransportError::InvalidConfig(format!(
                    "ELASTIC_APM_API_REQUEST_SIZE is not a valid size: '{val}'"
                ))
            })?,
            None => defaults.api_request_size,
        };

        let api_request_time = match env::var("ELASTIC_APM_API_REQUEST_TIME") {
            Ok(val) if val.trim().is_empty() => None,
            Ok(val) => {
                let duration = parse_duration(&val).ok_or_else(|| {
                    TransportError::InvalidConfig(format!(
                        "ELASTIC_APM_API_REQUEST_TIME is not a valid duration: '{val}'"
                    ))
                })?;
                (!duration.is_zero()).then_some(duration)
            }
            Err(_) => defaults.api_request_time,
        };

        let proxy_port = match non_empty_var("ELASTIC_APM_PROXY_PORT") {
            Some(val) => Some(val.parse::<u16>().map_err(|_| {
                TransportError::InvalidConfig(format!(
                    "ELASTIC_APM_PROXY_PORT is not a valid port: '{val}'"
                ))
            })?),
            None => None,
        };

        let proxy_headers = env::var("ELASTIC_APM_PROXY_HEADERS")
            .map(|val| parse_headers(&val))
            .unwrap_or_default();

        let flush_timeout = match non_empty_var("ELASTIC_APM_FLUSH_TIMEOUT") {
            Some(val) => parse_duration(&val).ok_or_else(|| {
                TransportError::InvalidConfig(format!(
                    "ELASTIC_APM_FLUSH_TIMEOUT is not a valid duration: '{val}'"
                ))
            })?,
            None => defaults.flush_timeout,
        };

        let pipe_capacity = match non_empty_var("ELASTIC_APM_PIPE_CAPACITY") {
            Some(val) => val.trim().parse::<usize>().map_err(|_| {
                TransportError::InvalidConfig(format!(
                    "ELASTIC_APM_PIPE_CAPACITY is not a valid chunk count: '{val}'"
                ))
            })?,
            None => defaults.pipe_capacity,
        };

        let config = Self {
            server_url,
            secret_token,
            disable_send,
            http_compression,
            api_request_size,
            api_request_time,
            proxy_address: non_empty_var("ELASTIC_APM_PROXY_ADDRESS"),
            proxy_port,
            proxy_username: non_empty_var("ELASTIC_APM_PROXY_USERNAME"),
            proxy_password: non_empty_var("ELASTIC_APM_PROXY_PASSWORD"),
            proxy_headers,
            server_ca_cert: non_empty_var("ELASTIC_APM_SERVER_CA_CERT").map(PathBuf::from),
            verify_server_cert: env::var("ELASTIC_APM_VERIFY_SERVER_CERT")
                .map(|val| val.to_lowercase() != "false")
                .unwrap_or(defaults.verify_server_cert),
            flush_timeout,
            pipe_capacity,
            log_level: env::var("ELASTIC_APM_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        Url::parse(&self.server_url).map_err(|e| {
            TransportError::InvalidConfig(format!(
                "Invalid server URL '{}': {e}",
                self.server_url
            ))
        })?;

        if self.api_request_size == 0 {
            return Err(TransportError::InvalidConfig(
                "api_request_size must be greater than 0".to_string(),
            ));
        }

        if self.pipe_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "pipe_capacity must be greater than 0".to_string(),
            ));
        }

        if self.proxy_address.is_some() && self.proxy_port.is_none() {
            return Err(TransportError::InvalidConfig(
                "proxy_address requires proxy_port".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(TransportError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn use_ssl(&self) -> bool {
        self.server_url.starts_with("https://")
    }

    /// Full URL of the streaming events endpoint
    pub fn events_url(&self) -> String {
        format!("{}{EVENTS_PATH}", self.server_url.trim_end_matches('/'))
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|val| !val.trim().is_empty())
}

/// Parses sizes such as `750kb`, `1mb` or `512b`. Bare numbers are bytes.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim().to_lowercase();
    let (number, multiplier) = if let Some(number) = value.strip_suffix("kb") {
        (number, 1024)
    } else if let Some(number) = value.strip_suffix("mb") {
        (number, 1024 * 1024)
    } else if let Some(number) = value.strip_suffix('b') {
        (number, 1)
    } else {
        (value.as_str(), 1)
    };
    number.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Parses durations such as `10s`, `500ms` or `2m`. Bare numbers are seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim().to_lowercase();
    if let Some(number) = value.strip_suffix("ms") {
        return number.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    let (number, multiplier) = if let Some(number) = value.strip_suffix('s') {
        (number, 1)
    } else if let Some(number) = value.strip_suffix('m') {
        (number, 60)
    } else {
        (value.as_str(), 1)
    };
    let secs = number.trim().parse::<u64>().ok()?.checked_mul(multiplier)?;
    Some(Duration::from_secs(secs))
}

// Comma-separated `key=value` pairs, entries without a `=` are skipped.
fn parse_headers(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|kv| {
            let (key, val) = kv.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), val.trim().to_string()))
        })
        .collect()
}
