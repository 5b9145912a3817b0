// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to a deferred flush armed by [`FlushScheduler::schedule`].
#[derive(Debug, Clone)]
pub struct ScheduledFlush {
    token: CancellationToken,
}

impl ScheduledFlush {
    /// Prevents the action from running. No-op if it already ran or was cancelled.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Keeps at most one deferred flush pending.
#[derive(Debug, Default)]
pub struct FlushScheduler {
    pending: Option<ScheduledFlush>,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action` after `duration`, cancelling whatever was armed before.
    pub fn schedule<F, Fut>(&mut self, duration: Duration, action: F) -> ScheduledFlush
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(duration) => action().await,
            }
        });

        let scheduled = ScheduledFlush { token };
        self.pending = Some(scheduled.clone());
        scheduled
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
