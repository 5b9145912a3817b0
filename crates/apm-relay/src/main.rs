// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use apm_transport::metadata::ProcessMetadata;
use apm_transport::{Connection, FlushReason, Metadata, TransportConfig};

const DEFAULT_SERVICE_NAME: &str = "apm-relay";

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = TransportConfig::from_env().context("invalid APM configuration")?;

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).context("could not parse log level")?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let service_name = env::var("ELASTIC_APM_SERVICE_NAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let environment = env::var("ELASTIC_APM_ENVIRONMENT").ok();
    let metadata = Metadata::from_record(&ProcessMetadata::current(&service_name, environment))
        .context("failed to serialize process metadata")?;

    let connection = Connection::new(Arc::new(config), metadata)?;
    info!(
        "Relaying NDJSON records from stdin to {}",
        connection.config().server_url
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (mut sent, mut dropped) = (0u64, 0u64);
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if serde_json::from_str::<serde_json::Value>(line).is_err() {
            warn!("Skipping line that is not a JSON record");
            dropped += 1;
            continue;
        }

        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        if connection.write(record).await {
            sent += 1;
        } else {
            dropped += 1;
        }
    }

    connection.flush(FlushReason::Force).await;
    info!("Relayed {sent} records, dropped {dropped}");
    Ok(())
}
