// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, PROXY_AUTHORIZATION,
    USER_AGENT,
};
use reqwest::{Certificate, ClientBuilder, Proxy};
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Headers sent with every events request.
///
/// `Transfer-Encoding: chunked` is not listed: the body has no known length, so the client
/// falls back to chunked encoding on its own.
pub fn build_headers(config: &TransportConfig) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("apm-transport/", env!("CARGO_PKG_VERSION"))),
    );
    if config.http_compression {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    if let Some(token) = &config.secret_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            TransportError::InvalidConfig("secret_token is not a valid header value".to_string())
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Builds the client used for every request of a connection, honoring TLS and proxy settings.
pub fn build_client(config: &TransportConfig) -> Result<reqwest::Client, TransportError> {
    let mut builder = create_reqwest_client_builder();

    if config.use_ssl() {
        if let Some(path) = &config.server_ca_cert {
            let pem = std::fs::read(path).map_err(|source| TransportError::CaCert {
                path: path.clone(),
                source,
            })?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
            debug!("Using CA certificate from {}", path.display());
        }
        if !config.verify_server_cert {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    if let Some(proxy) = build_proxy(config)? {
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

fn create_reqwest_client_builder() -> ClientBuilder {
    reqwest::Client::builder().use_rustls_tls()
}

fn build_proxy(config: &TransportConfig) -> Result<Option<Proxy>, TransportError> {
    let (Some(address), Some(port)) = (&config.proxy_address, config.proxy_port) else {
        return Ok(None);
    };

    let proxy_url = if address.contains("://") {
        format!("{address}:{port}")
    } else {
        format!("http://{address}:{port}")
    };
    let mut proxy = Proxy::all(&proxy_url)?;

    if let Some(username) = &config.proxy_username {
        proxy = proxy.basic_auth(username, config.proxy_password.as_deref().unwrap_or_default());
    }

    for (name, value) in &config.proxy_headers {
        if name.eq_ignore_ascii_case(PROXY_AUTHORIZATION.as_str()) {
            let value = HeaderValue::from_str(value).map_err(|_| {
                TransportError::InvalidConfig(
                    "Proxy-Authorization is not a valid header value".to_string(),
                )
            })?;
            proxy = proxy.custom_http_auth(value);
        } else {
            warn!("Proxy header {name} is not supported and will not be sent");
        }
    }

    debug!("Sending events through proxy {proxy_url}");
    Ok(Some(proxy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_headers_with_compression_and_token() {
        let config = TransportConfig {
            secret_token: Some("abc123".to_string()),
            ..Default::default()
        };
        let headers = build_headers(&config).unwrap();

        assert_eq!(headers[CONTENT_TYPE], "application/x-ndjson");
        assert_eq!(headers[CONTENT_ENCODING], "gzip");
        assert_eq!(headers[AUTHORIZATION], "Bearer abc123");
        assert!(headers[AUTHORIZATION].is_sensitive());
        assert!(headers[USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("apm-transport/"));
    }

    #[test]
    fn test_headers_without_compression_or_token() {
        let config = TransportConfig {
            http_compression: false,
            ..Default::default()
        };
        let headers = build_headers(&config).unwrap();

        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let config = TransportConfig {
            secret_token: Some("bad\ntoken".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_headers(&config),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_build_client_with_proxy() {
        let config = TransportConfig {
            proxy_address: Some("proxy.local".to_string()),
            proxy_port: Some(3128),
            proxy_username: Some("user".to_string()),
            proxy_password: Some("pass".to_string()),
            proxy_headers: vec![
                ("Proxy-Authorization".to_string(), "Basic dXNlcjpwYXNz".to_string()),
                ("X-Ignored".to_string(), "1".to_string()),
            ],
            ..Default::default()
        };
        assert!(build_proxy(&config).unwrap().is_some());
        assert!(build_client(&config).is_ok());
    }

    #[test]
    fn test_no_proxy_without_port() {
        let config = TransportConfig {
            proxy_address: Some("proxy.local".to_string()),
            ..Default::default()
        };
        assert!(build_proxy(&config).unwrap().is_none());
    }

    #[test]
    fn test_missing_ca_cert_is_an_error() {
        let config = TransportConfig {
            server_url: "https://apm.example.com".to_string(),
            server_ca_cert: Some(PathBuf::from("/definitely/not/here.pem")),
            ..Default::default()
        };
        assert!(matches!(
            build_client(&config),
            Err(TransportError::CaCert { .. })
        ));
    }

    #[test]
    fn test_ca_cert_ignored_for_plain_http() {
        let config = TransportConfig {
            server_ca_cert: Some(PathBuf::from("/definitely/not/here.pem")),
            ..Default::default()
        };
        assert!(build_client(&config).is_ok());
    }
}
