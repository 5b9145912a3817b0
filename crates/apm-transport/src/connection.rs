// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming connection to the intake server.
//!
//! A [`Connection`] keeps at most one events request open at a time. The first write after
//! the connection went idle opens a request (an epoch): a bounded pipe whose reader is the
//! request body, a worker task driving the request and, when `api_request_time` is set, a
//! deferred flush. Every later write appends to the same body until a flush closes it, either
//! because the request grew past `api_request_size`, because its time ran out, because a write
//! hit a dead pipe, or because a caller asked for it.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::TransportConfig;
use crate::error::{PipeError, TransportError};
use crate::http_utils::{build_client, build_headers};
use crate::metadata::Metadata;
use crate::pipe::{pipe, OnFirstRead, PipeWriter};
use crate::scheduler::{FlushScheduler, ScheduledFlush};
use crate::state::{ConnectionState, State};
use crate::worker::{RequestContext, RequestWorker};

/// Why a request body is being closed. Carried into logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Explicit caller request
    Force,
    /// The request reached `api_request_size` bytes
    ApiRequestSize,
    /// The request was open for `api_request_time`
    ApiRequestTime,
    /// A write landed on an already closed pipe
    IoError,
    /// The request body stopped being consumed
    BrokenPipe,
    /// The request finished on its own
    RequestEnded,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FlushReason::Force => "force",
            FlushReason::ApiRequestSize => "api_request_size",
            FlushReason::ApiRequestTime => "api_request_time",
            FlushReason::IoError => "ioerror",
            FlushReason::BrokenPipe => "broken_pipe",
            FlushReason::RequestEnded => "request_ended",
        };
        f.write_str(reason)
    }
}

/// Producer-facing handle. Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<TransportConfig>,
    metadata: Metadata,
    request: RequestContext,
    state: Arc<ConnectionState>,
    current: Mutex<Current>,
}

#[derive(Default)]
struct Current {
    epoch: Option<Epoch>,
    last_id: u64,
    scheduler: FlushScheduler,
}

struct Epoch {
    id: u64,
    writer: PipeWriter,
    worker: RequestWorker,
    scheduled: Option<ScheduledFlush>,
}

impl Connection {
    pub fn new(config: Arc<TransportConfig>, metadata: Metadata) -> Result<Self, TransportError> {
        config.validate()?;
        let request = RequestContext {
            client: build_client(&config)?,
            url: config.events_url(),
            headers: build_headers(&config)?,
        };
        Ok(Connection {
            inner: Arc::new(Inner {
                config,
                metadata,
                request,
                state: Arc::new(ConnectionState::new()),
                current: Mutex::new(Current::default()),
            }),
        })
    }

    /// Appends one serialized record to the open request, opening one if needed.
    ///
    /// Returns `false` when sending is disabled or the record could not be handed to the
    /// request. Failures never propagate: the connection flushes and the next write starts a
    /// fresh request.
    pub async fn write(&self, bytes: impl Into<Bytes>) -> bool {
        self.inner.write(bytes.into()).await
    }

    /// Closes the open request and waits, bounded by `flush_timeout`, for it to finish.
    /// Does nothing when no request is open.
    pub async fn flush(&self, reason: FlushReason) {
        self.inner.flush_epoch(reason, None).await;
    }

    /// Advisory: whether the intake server has started reading the current request.
    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    pub fn state(&self) -> State {
        self.inner.state.get()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.inner.request.url)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl Inner {
    async fn write(self: &Arc<Self>, bytes: Bytes) -> bool {
        if self.config.disable_send {
            return false;
        }

        // appends run outside the epoch lock
        let (epoch, writer) = self.checkout().await;
        let appended = match writer {
            Ok(writer) => writer.append(bytes).await,
            Err(e) => Err(e),
        };

        match appended {
            Ok(bytes_sent) => {
                if bytes_sent >= self.config.api_request_size {
                    self.flush_epoch(FlushReason::ApiRequestSize, Some(epoch))
                        .await;
                }
                true
            }
            Err(e) => {
                error!("Connection error: {e}");
                let reason = match e {
                    PipeError::Closed => FlushReason::IoError,
                    PipeError::BrokenPipe => FlushReason::BrokenPipe,
                };
                self.flush_epoch(reason, Some(epoch)).await;
                false
            }
        }
    }

    // Id and writer of the open epoch, opening a new one if the current one is closed.
    async fn checkout(self: &Arc<Self>) -> (u64, Result<PipeWriter, PipeError>) {
        let mut current = self.current.lock().await;

        // a replaced epoch already has its producer side closed, its worker finishes alone
        let (epoch, opened) = match current.epoch.take() {
            Some(epoch) if !epoch.writer.is_closed() => (epoch, false),
            _ => (self.open_epoch(&mut current), true),
        };
        let epoch = current.epoch.insert(epoch);

        // a fresh pipe always has room for the metadata chunk
        if opened && !self.metadata.is_empty() {
            if let Err(e) = epoch.writer.append(self.metadata.bytes()).await {
                return (epoch.id, Err(e));
            }
        }
        (epoch.id, Ok(epoch.writer.clone()))
    }

    fn open_epoch(self: &Arc<Self>, current: &mut Current) -> Epoch {
        current.last_id += 1;
        let id = current.last_id;

        let state = Arc::clone(&self.state);
        let on_first_read: OnFirstRead = Box::new(move || {
            state.hold(|s| {
                if s.epoch() == id && s.is_connecting() {
                    s.connected();
                }
            });
        });
        let (writer, reader) = pipe(
            Some(on_first_read),
            self.config.http_compression,
            self.config.pipe_capacity,
        );

        let scheduled = self.config.api_request_time.map(|duration| {
            let connection: Weak<Inner> = Arc::downgrade(self);
            current.scheduler.schedule(duration, move || async move {
                if let Some(connection) = connection.upgrade() {
                    connection
                        .flush_epoch(FlushReason::ApiRequestTime, Some(id))
                        .await;
                }
            })
        });

        let worker = RequestWorker::start(
            self.request.clone(),
            reader,
            writer.downgrade(),
            Arc::clone(&self.state),
            id,
            scheduled.clone(),
        );

        Epoch {
            id,
            writer,
            worker,
            scheduled,
        }
    }

    /// Flushes the open epoch. With `target`, only if that epoch is still the open one.
    async fn flush_epoch(&self, reason: FlushReason, target: Option<u64>) {
        let mut current = self.current.lock().await;

        let is_target = match (&current.epoch, target) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(epoch), Some(id)) => epoch.id == id,
        };
        if !is_target {
            return;
        }
        let Some(mut epoch) = current.epoch.take() else {
            return;
        };

        // the worker already tore the request down
        if self.state.is_disconnected() {
            debug!(epoch = epoch.id, reason = %reason, "Request already closed");
            return;
        }

        current.scheduler.cancel();
        if let Some(scheduled) = &epoch.scheduled {
            scheduled.cancel();
        }
        debug!(epoch = epoch.id, reason = %reason, "Flushing request");
        epoch.writer.close(reason);

        if !epoch.worker.join(self.config.flush_timeout).await {
            error!(
                epoch = epoch.worker.epoch(),
                "Request could not finish in time, leaving it to terminate in the background"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn unreachable_config() -> TransportConfig {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        TransportConfig {
            server_url: format!("http://{addr}"),
            http_compression: false,
            api_request_time: None,
            ..Default::default()
        }
    }

    async fn wait_for_state(connection: &Connection, state: State) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while connection.state() != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection never reached the expected state");
    }

    #[test]
    fn test_flush_reason_tags() {
        assert_eq!(FlushReason::Force.to_string(), "force");
        assert_eq!(FlushReason::ApiRequestSize.to_string(), "api_request_size");
        assert_eq!(FlushReason::ApiRequestTime.to_string(), "api_request_time");
        assert_eq!(FlushReason::IoError.to_string(), "ioerror");
        assert_eq!(FlushReason::BrokenPipe.to_string(), "broken_pipe");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TransportConfig {
            api_request_size: 0,
            ..Default::default()
        };
        assert!(Connection::new(Arc::new(config), Metadata::empty()).is_err());
    }

    #[tokio::test]
    async fn test_disabled_send_never_connects() {
        let config = TransportConfig {
            disable_send: true,
            ..unreachable_config()
        };
        let connection = Connection::new(Arc::new(config), Metadata::empty()).unwrap();

        for _ in 0..3 {
            assert!(!connection.write("{}\n").await);
        }
        assert_eq!(connection.state(), State::Disconnected);
        assert!(connection.inner.current.lock().await.epoch.is_none());
    }

    #[tokio::test]
    async fn test_flush_without_request_returns_immediately() {
        let connection =
            Connection::new(Arc::new(unreachable_config()), Metadata::empty()).unwrap();
        tokio::time::timeout(
            Duration::from_millis(100),
            connection.flush(FlushReason::Force),
        )
        .await
        .expect("flush blocked on an idle connection");
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_broken_pipe_flushes_and_reopens() {
        // accepted by the kernel but never answered, the request stays in flight
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = TransportConfig {
            server_url: format!("http://{}", listener.local_addr().unwrap()),
            http_compression: false,
            api_request_time: None,
            flush_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let connection = Connection::new(Arc::new(config), Metadata::empty()).unwrap();
        assert!(connection.write("{\"a\":1}\n").await);

        // the open epoch loses its body reader
        let (broken, reader) = pipe(None, false, 1);
        drop(reader);
        connection
            .inner
            .current
            .lock()
            .await
            .epoch
            .as_mut()
            .unwrap()
            .writer = broken.clone();

        assert!(!connection.write("{\"b\":2}\n").await);
        assert!(broken.is_closed());
        assert!(connection.inner.current.lock().await.epoch.is_none());
        assert!(logs_contain("Connection error"));
        assert!(logs_contain("broken_pipe"));

        assert!(connection.write("{\"c\":3}\n").await);
        assert_eq!(connection.inner.current.lock().await.last_id, 2);
        drop(listener);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreachable_server_does_not_poison_connection() {
        let connection =
            Connection::new(Arc::new(unreachable_config()), Metadata::new("{\"m\":1}\n"))
                .unwrap();

        assert!(connection.write("{\"a\":1}\n").await);
        wait_for_state(&connection, State::Disconnected).await;

        // the dead request is replaced by a brand new one
        assert!(connection.write("{\"a\":2}\n").await);
        assert_eq!(connection.inner.current.lock().await.last_id, 2);

        wait_for_state(&connection, State::Disconnected).await;
        connection.flush(FlushReason::Force).await;
        assert!(connection.inner.current.lock().await.epoch.is_none());
        assert!(logs_contain("Couldn't establish connection to APM Server"));
    }
}
