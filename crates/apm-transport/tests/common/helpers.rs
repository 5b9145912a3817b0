// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use apm_transport::{Connection, Metadata, State, TransportConfig};
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

pub const METADATA: &str = "{\"metadata\":{\"service\":{\"name\":\"test\"}}}\n";

/// Config pointing at `server_url` with timers off and a large size budget
pub fn test_config(server_url: String) -> TransportConfig {
    TransportConfig {
        server_url,
        http_compression: false,
        api_request_size: 1024 * 1024,
        api_request_time: None,
        flush_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn connect(config: TransportConfig, metadata: &'static str) -> Connection {
    Connection::new(Arc::new(config), Metadata::new(metadata)).expect("failed to build connection")
}

pub fn gunzip(body: &[u8]) -> String {
    let mut decoded = String::new();
    GzDecoder::new(body)
        .read_to_string(&mut decoded)
        .expect("body is not valid gzip");
    decoded
}

/// Polls `condition` every 10ms, panicking after `limit`
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    timeout(limit, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub async fn wait_for_state(connection: &Connection, state: State) {
    wait_until(Duration::from_secs(5), || connection.state() == state).await;
}
