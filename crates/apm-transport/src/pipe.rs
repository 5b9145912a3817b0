// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded byte pipe bridging event writers and a streaming request body.
//!
//! The writer half is shared by whoever appends records and by the worker that tears the
//! request down. The reader half is moved into the HTTP request as its body.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::FlushReason;
use crate::error::PipeError;

/// Invoked once, when the request body is read for the first time.
pub type OnFirstRead = Box<dyn FnOnce() + Send + Sync>;

/// Creates a linked writer/reader pair buffering at most `capacity` chunks.
pub fn pipe(
    on_first_read: Option<OnFirstRead>,
    compress: bool,
    capacity: usize,
) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer = PipeWriter {
        inner: Arc::new(WriterInner {
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            bytes_sent: AtomicU64::new(0),
        }),
    };
    let reader = PipeReader {
        rx,
        encoder: compress.then(|| GzEncoder::new(Vec::new(), Compression::default())),
        on_first_read,
        finished: false,
    };
    (writer, reader)
}

#[derive(Clone)]
pub struct PipeWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    // Taken on close. Appends send through a clone, so the body ends once they settle.
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
    // Wakes appends waiting for room when the pipe is closed.
    close_token: CancellationToken,
    bytes_sent: AtomicU64,
}

impl PipeWriter {
    /// Hands `bytes` to the reader as one chunk, waiting while the buffer is full.
    ///
    /// Returns the total number of uncompressed bytes appended so far. A pending append
    /// returns [`PipeError::Closed`] as soon as the pipe is closed.
    pub async fn append(&self, bytes: Bytes) -> Result<u64, PipeError> {
        let Some(tx) = self.sender() else {
            return Err(PipeError::Closed);
        };
        let len = bytes.len() as u64;

        tokio::select! {
            biased;
            _ = self.inner.close_token.cancelled() => Err(PipeError::Closed),
            sent = tx.send(bytes) => {
                sent.map_err(|_| PipeError::BrokenPipe)?;
                Ok(self.inner.bytes_sent.fetch_add(len, Ordering::AcqRel) + len)
            }
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        if self.is_closed() {
            return None;
        }
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ends the body once buffered chunks are drained. Calling it again does nothing.
    ///
    /// Never waits: appends blocked on a full buffer give up with [`PipeError::Closed`].
    pub fn close(&self, reason: FlushReason) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            reason = %reason,
            bytes_sent = self.bytes_sent(),
            "Closing request body"
        );
        self.inner.close_token.cancel();
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Acquire)
    }

    /// A handle that can close the pipe without keeping it open.
    pub fn downgrade(&self) -> WeakPipeWriter {
        WeakPipeWriter {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning handle to a [`PipeWriter`]. Once every `PipeWriter` is dropped the body ends
/// on its own and closing through this handle does nothing.
#[derive(Clone)]
pub struct WeakPipeWriter {
    inner: Weak<WriterInner>,
}

impl WeakPipeWriter {
    pub fn close(&self, reason: FlushReason) {
        if let Some(inner) = self.inner.upgrade() {
            PipeWriter { inner }.close(reason);
        }
    }
}

pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    encoder: Option<GzEncoder<Vec<u8>>>,
    on_first_read: Option<OnFirstRead>,
    finished: bool,
}

impl PipeReader {
    /// Next chunk of the body, gzipped when compression is on. `None` once the writer is
    /// closed and every buffered chunk has been returned.
    pub async fn read(&mut self) -> io::Result<Option<Bytes>> {
        while !self.finished {
            let Some(chunk) = self.rx.recv().await else {
                self.finished = true;
                return match self.encoder.take() {
                    Some(encoder) => {
                        let trailer = encoder.finish()?;
                        Ok((!trailer.is_empty()).then(|| Bytes::from(trailer)))
                    }
                    None => Ok(None),
                };
            };

            if let Some(on_first_read) = self.on_first_read.take() {
                on_first_read();
            }
            if chunk.is_empty() {
                continue;
            }

            let Some(encoder) = self.encoder.as_mut() else {
                return Ok(Some(chunk));
            };
            encoder.write_all(&chunk)?;
            // sync flush so the server can decode what it has received so far
            encoder.flush()?;
            let compressed = std::mem::take(encoder.get_mut());
            if !compressed.is_empty() {
                return Ok(Some(Bytes::from(compressed)));
            }
        }
        Ok(None)
    }

    /// Adapts the reader into a stream suitable for a streaming request body.
    pub fn into_body_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), reader)),
                Ok(None) => None,
                Err(e) => {
                    reader.finished = true;
                    Some((Err(e), reader))
                }
            }
        })
    }
}
