// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod connection;
pub mod error;
pub mod http_utils;
pub mod job;
pub mod metadata;
pub mod pipe;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use config::TransportConfig;
pub use connection::{Connection, FlushReason};
pub use error::{PipeError, TransportError};
pub use metadata::Metadata;
pub use state::State;
