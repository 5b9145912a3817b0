// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors that can occur while building a transport.
///
/// Once a [`crate::connection::Connection`] exists nothing it does returns an error to the
/// caller; failures on the write path are logged and resolved by flushing.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unable to read CA certificate {path}: {source}")]
    CaCert {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors returned by the producer side of a [`crate::pipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    /// The producer side was closed before or during the append.
    #[error("pipe is closed")]
    Closed,

    /// The consumer side went away, the request body is no longer being read.
    #[error("broken pipe: request body is no longer consumed")]
    BrokenPipe,
}
