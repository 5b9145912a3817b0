// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Body, StatusCode};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::connection::FlushReason;
use crate::pipe::{PipeReader, WeakPipeWriter};
use crate::scheduler::ScheduledFlush;
use crate::state::ConnectionState;

/// Everything needed to issue an events request, built once per connection.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client: reqwest::Client,
    pub url: String,
    pub headers: HeaderMap,
}

/// Drives the single in-flight events request of one epoch.
pub struct RequestWorker {
    epoch: u64,
    state: Arc<ConnectionState>,
    handle: JoinHandle<()>,
    joined: bool,
}

impl RequestWorker {
    /// Marks the state as connecting for `epoch` and starts streaming `body` in the background.
    ///
    /// When the request ends, successfully or not, the pipe is closed, the epoch's scheduled
    /// flush is cancelled and the state goes back to disconnected.
    pub fn start(
        request: RequestContext,
        body: PipeReader,
        writer: WeakPipeWriter,
        state: Arc<ConnectionState>,
        epoch: u64,
        scheduled: Option<ScheduledFlush>,
    ) -> Self {
        state.hold(|s| s.connecting(epoch));
        debug!(epoch, "Opening new request to {}", request.url);

        let task_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            if let Err(e) = post(&request, body).await {
                error!("Couldn't establish connection to APM Server: {e:?}");
            }

            writer.close(FlushReason::RequestEnded);
            if let Some(scheduled) = scheduled {
                scheduled.cancel();
            }
            release(&task_state, epoch);
            debug!(epoch, "Request finished");
        });

        RequestWorker {
            epoch,
            state,
            handle,
            joined: false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits up to `timeout` for the request to finish. Returns `false` if it is still running,
    /// in which case it keeps running in the background.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        if self.joined {
            return true;
        }
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(result) => {
                self.joined = true;
                if let Err(e) = result {
                    // the task never reached its teardown
                    error!(epoch = self.epoch, "Request task failed: {e}");
                    release(&self.state, self.epoch);
                }
                true
            }
            Err(_) => false,
        }
    }
}

async fn post(request: &RequestContext, body: PipeReader) -> Result<(), reqwest::Error> {
    let response = request
        .client
        .post(&request.url)
        .headers(request.headers.clone())
        .body(Body::wrap_stream(body.into_body_stream()))
        .send()
        .await?;

    let status = response.status();
    if status == StatusCode::ACCEPTED {
        debug!("APM Server responded with status 202");
    } else {
        let body = response.text().await.unwrap_or_default();
        error!("APM Server responded with an error ({status}): {body:?}");
    }
    Ok(())
}

// Only the epoch that owns the state may hand it back.
fn release(state: &ConnectionState, epoch: u64) {
    state.hold(|s| {
        if s.epoch() == epoch {
            s.disconnected();
        }
    });
}
