// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

const AGENT_NAME: &str = "rust";
const UNKNOWN_HOSTNAME: &str = "unknown";

/// Record written at the start of every events request. Opaque to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(Bytes);

impl Metadata {
    /// Uses `bytes` verbatim as the first bytes of each request body.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Serializes `record` as a single `{"metadata":...}` NDJSON line.
    pub fn from_record<T: Serialize>(record: &T) -> Result<Self, serde_json::Error> {
        #[derive(Serialize)]
        struct Envelope<'a, T> {
            metadata: &'a T,
        }

        let mut line = BytesMut::new().writer();
        serde_json::to_writer(&mut line, &Envelope { metadata: record })?;
        let mut line = line.into_inner();
        line.put_u8(b'\n');
        Ok(Self(line.freeze()))
    }

    pub fn bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Identity of the monitored process, in the shape the intake server expects.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetadata {
    pub service: ServiceInfo,
    pub process: ProcessInfo,
    pub system: SystemInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub agent: AgentInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub title: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub platform: String,
    pub architecture: String,
}

impl ProcessMetadata {
    /// Describes the current process running `service_name`.
    pub fn current(service_name: &str, environment: Option<String>) -> Self {
        let argv: Vec<String> = std::env::args().collect();
        let title = argv.first().cloned().unwrap_or_default();
        Self {
            service: ServiceInfo {
                name: service_name.to_string(),
                environment,
                agent: AgentInfo {
                    name: AGENT_NAME.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            },
            process: ProcessInfo {
                pid: std::process::id(),
                title,
                argv,
            },
            system: SystemInfo {
                hostname: current_hostname(),
                platform: std::env::consts::OS.to_string(),
                architecture: std::env::consts::ARCH.to_string(),
            },
        }
    }
}

fn current_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| UNKNOWN_HOSTNAME.to_string())
}
