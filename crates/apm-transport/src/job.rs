// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hooks for background job frameworks.
//!
//! A framework integration calls [`JobInstrumentation::before_process`] when a worker picks a
//! job up and [`JobInstrumentation::after_process`] once it is done, passing the returned
//! [`JobTransaction`] along. [`perform`] wraps both around a job's future.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::connection::Connection;

/// Class name Resque reports for jobs enqueued through ActiveJob.
pub const ACTIVE_JOB_WRAPPER: &str = "ActiveJob::QueueAdapters::ResqueAdapter::JobWrapper";
const DEFAULT_TRANSACTION_TYPE: &str = "Resque";

#[derive(Debug, Clone)]
pub struct Job {
    pub class_name: String,
    pub queue: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNaming {
    pub name: String,
    pub queue: Option<String>,
}

impl Job {
    /// Transaction name and queue tag for this job.
    ///
    /// ActiveJob wraps the real job class in the first element of `args`; a wrapped job with
    /// no arguments gets no name.
    pub fn naming(&self) -> Option<JobNaming> {
        if self.class_name != ACTIVE_JOB_WRAPPER {
            return Some(JobNaming {
                name: self.class_name.clone(),
                queue: Some(self.queue.clone()),
            });
        }

        let args = self.payload.get("args")?.as_array()?.first()?;
        Some(JobNaming {
            name: args.get("job_class")?.as_str()?.to_string(),
            queue: args
                .get("queue_name")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Error,
}

impl JobOutcome {
    fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionContext {
    pub tags: BTreeMap<String, String>,
}

/// A job execution in progress, handed from `before_process` to `after_process`.
#[derive(Debug, Clone)]
pub struct JobTransaction {
    pub id: String,
    pub trace_id: String,
    pub name: Option<String>,
    pub kind: String,
    pub context: TransactionContext,
    timestamp_us: u64,
    started: Instant,
}

#[derive(Serialize)]
struct TransactionRecord<'a> {
    id: &'a str,
    trace_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(rename = "type")]
    kind: &'a str,
    result: &'static str,
    duration: f64,
    timestamp: u64,
    sampled: bool,
    span_count: SpanCount,
    context: &'a TransactionContext,
}

#[derive(Serialize)]
struct SpanCount {
    started: u32,
}

#[derive(Serialize)]
struct Envelope<'a> {
    transaction: TransactionRecord<'a>,
}

impl JobTransaction {
    pub fn start(kind: &str, job: &Job) -> Self {
        let naming = job.naming();
        let mut context = TransactionContext::default();
        if let Some(queue) = naming.as_ref().and_then(|n| n.queue.clone()) {
            context.tags.insert("queue".to_string(), queue);
        }
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();

        Self {
            id: hex_id(&rand::random::<[u8; 8]>()),
            trace_id: hex_id(&rand::random::<[u8; 16]>()),
            name: naming.map(|n| n.name),
            kind: kind.to_string(),
            context,
            timestamp_us,
            started: Instant::now(),
        }
    }

    /// Serializes the finished transaction as one `{"transaction":...}` NDJSON line.
    pub fn to_record(&self, outcome: JobOutcome) -> Result<Bytes, serde_json::Error> {
        let record = Envelope {
            transaction: TransactionRecord {
                id: &self.id,
                trace_id: &self.trace_id,
                name: self.name.as_deref(),
                kind: &self.kind,
                result: outcome.as_str(),
                duration: self.started.elapsed().as_secs_f64() * 1000.0,
                timestamp: self.timestamp_us,
                sampled: true,
                span_count: SpanCount { started: 0 },
                context: &self.context,
            },
        };
        let mut line = BytesMut::new().writer();
        serde_json::to_writer(&mut line, &record)?;
        let mut line = line.into_inner();
        line.put_u8(b'\n');
        Ok(line.freeze())
    }
}

/// Integration point a job framework calls around each job.
#[async_trait]
pub trait JobInstrumentation: Send + Sync {
    fn before_process(&self, job: &Job) -> JobTransaction;

    /// Reports the finished transaction. Returns whether it was handed to the transport.
    async fn after_process(&self, transaction: JobTransaction, outcome: JobOutcome) -> bool;
}

/// Reports job transactions through a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionJobInstrumentation {
    connection: Connection,
    transaction_type: String,
}

impl ConnectionJobInstrumentation {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            transaction_type: DEFAULT_TRANSACTION_TYPE.to_string(),
        }
    }

    pub fn with_transaction_type(mut self, transaction_type: impl Into<String>) -> Self {
        self.transaction_type = transaction_type.into();
        self
    }
}

#[async_trait]
impl JobInstrumentation for ConnectionJobInstrumentation {
    fn before_process(&self, job: &Job) -> JobTransaction {
        let transaction = JobTransaction::start(&self.transaction_type, job);
        debug!(
            id = %transaction.id,
            "Started transaction for job {}",
            job.class_name
        );
        transaction
    }

    async fn after_process(&self, transaction: JobTransaction, outcome: JobOutcome) -> bool {
        match transaction.to_record(outcome) {
            Ok(record) => self.connection.write(record).await,
            Err(e) => {
                error!("Failed to serialize transaction {}: {e}", transaction.id);
                false
            }
        }
    }
}

/// Runs `work` for `job` between the instrumentation's before and after hooks.
pub async fn perform<I, F, T, E>(instrumentation: &I, job: &Job, work: F) -> Result<T, E>
where
    I: JobInstrumentation + ?Sized,
    F: Future<Output = Result<T, E>>,
{
    let transaction = instrumentation.before_process(job);
    let result = work.await;
    let outcome = if result.is_ok() {
        JobOutcome::Success
    } else {
        JobOutcome::Error
    };
    instrumentation.after_process(transaction, outcome).await;
    result
}

fn hex_id(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
