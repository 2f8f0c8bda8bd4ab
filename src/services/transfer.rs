//! Streams a dump job's output into storage.
//!
//! The job output is read by a spawned producer task and handed to the storage
//! sink through a bounded channel. A slow sink blocks the producer, and an
//! idle producer leaves the sink waiting, so memory use is bounded by
//! `capacity * chunk_size` however large the dump is.

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use std::{
    future::Future,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{
    platform::jobs::{JobError, JobOutput},
    storage::{ByteStream, StorageError},
};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CAPACITY: usize = 1;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("reading job output failed: {0}")]
    Source(#[source] io::Error),

    #[error("dump job failed: {0}")]
    Job(#[source] JobError),

    #[error("storage sink failed: {0}")]
    Sink(#[source] StorageError),

    #[error("storage sink finished before the job output was drained")]
    SinkClosedEarly,

    #[error("byte count mismatch: produced {produced}, consumed {consumed}, stored {stored}")]
    ByteCountMismatch {
        produced: u64,
        consumed: u64,
        stored: u64,
    },

    #[error("transfer did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("producer task failed: {0}")]
    Producer(String),
}

/// Keeps the first failure reported by either side.
#[derive(Default)]
struct FirstFailure(Mutex<Option<TransferError>>);

impl FirstFailure {
    fn record(&self, err: TransferError) {
        if let Ok(mut slot) = self.0.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }

    fn take(&self) -> Option<TransferError> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

enum ProducerEnd {
    Drained,
    SinkClosed,
    Failed,
}

/// Bounded, backpressuring conduit between a job and a storage sink.
#[derive(Debug, Clone, Copy)]
pub struct TransferPipe {
    capacity: usize,
    chunk_size: usize,
    deadline: Option<Duration>,
}

impl Default for TransferPipe {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            deadline: None,
        }
    }
}

impl TransferPipe {
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chunk_size: chunk_size.max(1),
            deadline: None,
        }
    }

    /// Fail transfers that run longer than `deadline`.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Move `job`'s output into the sink built by `sink`, returning the
    /// number of bytes transferred.
    ///
    /// The sink receives a [`ByteStream`] and must consume it to the end,
    /// reporting how many bytes it stored. End of stream is only signalled
    /// after the job exited successfully; a failed job surfaces as an error
    /// item so the sink can abandon the upload. Whichever side fails first
    /// determines the returned error.
    pub async fn transfer<F, Fut>(&self, job: JobOutput, sink: F) -> Result<u64, TransferError>
    where
        F: FnOnce(ByteStream) -> Fut,
        Fut: Future<Output = Result<u64, StorageError>>,
    {
        let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(self.capacity);
        let failure = Arc::new(FirstFailure::default());
        let produced = Arc::new(AtomicU64::new(0));
        let consumed = Arc::new(AtomicU64::new(0));

        let producer = tokio::spawn(produce(
            job,
            tx,
            self.chunk_size,
            failure.clone(),
            produced.clone(),
        ));
        let abort = producer.abort_handle();

        let counter = consumed.clone();
        let chunks: ByteStream = Box::pin(
            stream::poll_fn(move |cx| rx.poll_recv(cx)).inspect_ok(move |chunk| {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }),
        );

        let run = async {
            let stored = match sink(chunks).await {
                Ok(stored) => Some(stored),
                Err(err) => {
                    failure.record(TransferError::Sink(err));
                    None
                }
            };
            let end = match producer.await {
                Ok(end) => end,
                Err(err) => {
                    failure.record(TransferError::Producer(err.to_string()));
                    ProducerEnd::Failed
                }
            };
            (stored, end)
        };

        let (stored, end) = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    abort.abort();
                    return Err(TransferError::TimedOut(deadline));
                }
            },
            None => run.await,
        };

        if let Some(err) = failure.take() {
            return Err(err);
        }
        let stored = stored.ok_or(TransferError::SinkClosedEarly)?;
        if let ProducerEnd::SinkClosed | ProducerEnd::Failed = end {
            return Err(TransferError::SinkClosedEarly);
        }

        let produced = produced.load(Ordering::Relaxed);
        let consumed = consumed.load(Ordering::Relaxed);
        if produced != consumed || consumed != stored {
            return Err(TransferError::ByteCountMismatch {
                produced,
                consumed,
                stored,
            });
        }
        debug!("transferred {} bytes", consumed);
        Ok(consumed)
    }
}

/// Read the job output into the channel.
///
/// A send failure means the sink dropped its end; that is the sink's failure
/// to report, so it is not recorded here.
async fn produce(
    job: JobOutput,
    tx: mpsc::Sender<io::Result<Bytes>>,
    chunk_size: usize,
    failure: Arc<FirstFailure>,
    produced: Arc<AtomicU64>,
) -> ProducerEnd {
    let JobOutput { stdout, exit } = job;
    let mut reader = ReaderStream::with_capacity(stdout, chunk_size);

    while let Some(item) = reader.next().await {
        match item {
            Ok(chunk) => {
                let len = chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    return ProducerEnd::SinkClosed;
                }
                produced.fetch_add(len, Ordering::Relaxed);
            }
            Err(err) => {
                if tx.is_closed() {
                    return ProducerEnd::SinkClosed;
                }
                let forwarded = io::Error::new(err.kind(), err.to_string());
                failure.record(TransferError::Source(err));
                let _ = tx.send(Err(forwarded)).await;
                return ProducerEnd::Failed;
            }
        }
    }
    drop(reader);

    match exit.await {
        Ok(()) => ProducerEnd::Drained,
        Err(err) => {
            if tx.is_closed() {
                return ProducerEnd::SinkClosed;
            }
            let forwarded = io::Error::other(err.to_string());
            failure.record(TransferError::Job(err));
            let _ = tx.send(Err(forwarded)).await;
            ProducerEnd::Failed
        }
    }
}
