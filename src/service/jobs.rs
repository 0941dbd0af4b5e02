//! Job correlation: matching replies to in-flight requests.
//!
//! A job is a request expecting one or more correlated replies. Ids are
//! monotonically increasing and scoped to one underlying connection; on
//! disconnect every pending job fails with `ConnectionLost` rather than
//! hanging, since ids mean nothing across reconnects.
//!
//! Single-reply jobs complete through a oneshot channel (at most one
//! fulfilment by construction); multi-reply jobs stream replies until an
//! explicit job-complete marker or cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::core::envelope::{MessageEnvelope, MsgKind};
use crate::error::{CmError, Result};

/// Correlation identifier. 0 is reserved for "none" on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

/// Why a pending job ended without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailure {
    Timeout,
    Cancelled,
    ConnectionLost,
}

impl From<JobFailure> for CmError {
    fn from(failure: JobFailure) -> Self {
        match failure {
            JobFailure::Timeout => CmError::JobTimeout,
            JobFailure::Cancelled => CmError::JobCancelled,
            JobFailure::ConnectionLost => CmError::ConnectionLost,
        }
    }
}

type JobOutcome = std::result::Result<MessageEnvelope, JobFailure>;

enum Completion {
    Single(oneshot::Sender<JobOutcome>),
    Multi(mpsc::UnboundedSender<JobOutcome>),
}

struct PendingJob {
    completion: Completion,
    /// Optional reply-kind validation; mismatches are delivered but logged
    expected: Option<MsgKind>,
}

#[derive(Default)]
struct CorrelatorInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingJob>>,
}

/// Tracks pending jobs for one client.
///
/// Cheap to clone; the sender task inserts, the receiver task fulfils.
#[derive(Clone, Default)]
pub struct JobCorrelator {
    inner: Arc<CorrelatorInner>,
}

impl JobCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next correlation id, monotonically increasing within the session.
    fn next_id(&self) -> JobId {
        JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a single-reply job.
    pub fn begin(&self) -> JobHandle {
        self.begin_expecting(None)
    }

    /// Register a single-reply job that validates the reply kind.
    pub fn begin_expecting(&self, expected: Option<MsgKind>) -> JobHandle {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.insert(id, Completion::Single(tx), expected);
        JobHandle {
            id,
            rx,
            jobs: self.clone(),
        }
    }

    /// Register a multi-reply job, ended by a job-complete marker.
    pub fn begin_multi(&self) -> JobStream {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(id, Completion::Multi(tx), None);
        JobStream {
            id,
            rx,
            jobs: self.clone(),
        }
    }

    fn insert(&self, id: JobId, completion: Completion, expected: Option<MsgKind>) {
        let mut pending = self.inner.pending.lock().expect("job table lock poisoned");
        // Ids are never reused while pending: next_id is monotonic and
        // entries are removed before an id could wrap.
        let previous = pending.insert(
            id.0,
            PendingJob {
                completion,
                expected,
            },
        );
        debug_assert!(previous.is_none(), "correlation id collision");
    }

    /// Offer an inbound envelope to the pending table.
    ///
    /// Returns true when a pending job consumed the envelope. An unknown
    /// target id fulfils nothing; the caller still forwards the envelope
    /// to the callback dispatcher.
    pub fn dispatch(&self, envelope: &MessageEnvelope) -> bool {
        let target = envelope.header.target_job;
        if target == 0 {
            return false;
        }

        let mut pending = self.inner.pending.lock().expect("job table lock poisoned");
        // Take the entry out; multi-reply jobs that stay alive are
        // re-inserted below. A single-reply entry never returns to the
        // table, so a second reply cannot reach the waiter.
        let Some(job) = pending.remove(&target) else {
            debug!(target_job = target, "reply for unknown job ignored");
            return false;
        };

        let kind = envelope.kind();
        if let Some(expected) = job.expected {
            if kind != expected && kind != MsgKind::JobComplete {
                warn!(
                    target_job = target,
                    ?expected,
                    got = ?kind,
                    "job reply kind mismatch"
                );
            }
        }

        match job.completion {
            Completion::Single(tx) => {
                let _ = tx.send(Ok(envelope.clone()));
                true
            }
            Completion::Multi(tx) => {
                if kind == MsgKind::JobComplete {
                    // Dropping the sender ends the stream cleanly
                    true
                } else if tx.send(Ok(envelope.clone())).is_ok() {
                    pending.insert(
                        target,
                        PendingJob {
                            completion: Completion::Multi(tx),
                            expected: job.expected,
                        },
                    );
                    true
                } else {
                    // Stream consumer went away; job stays removed
                    false
                }
            }
        }
    }

    /// Remove a job; a waiter sees `Cancelled`, a stream simply ends.
    pub fn cancel(&self, id: JobId) {
        let mut pending = self.inner.pending.lock().expect("job table lock poisoned");
        pending.remove(&id.0);
    }

    /// Fail every pending job. Called on disconnect.
    pub fn fail_all(&self, failure: JobFailure) {
        let mut pending = self.inner.pending.lock().expect("job table lock poisoned");
        let count = pending.len();
        for (_, job) in pending.drain() {
            match job.completion {
                Completion::Single(tx) => {
                    let _ = tx.send(Err(failure));
                }
                Completion::Multi(tx) => {
                    let _ = tx.send(Err(failure));
                }
            }
        }
        if count > 0 {
            debug!(count, ?failure, "failed all pending jobs");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("job table lock poisoned").len()
    }
}

/// Waiter for a single-reply job.
pub struct JobHandle {
    pub id: JobId,
    rx: oneshot::Receiver<JobOutcome>,
    jobs: JobCorrelator,
}

impl JobHandle {
    /// Wait for the reply.
    ///
    /// # Errors
    /// `CmError::JobTimeout` when `timeout` elapses first; the job is
    /// removed, so a late reply is dropped, not delivered. Connection loss
    /// surfaces as `CmError::ConnectionLost`.
    pub async fn wait(self, timeout: Duration) -> Result<MessageEnvelope> {
        let JobHandle { id, rx, jobs } = self;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                jobs.cancel(id);
                Err(CmError::JobTimeout)
            }
            Ok(Ok(Ok(envelope))) => Ok(envelope),
            Ok(Ok(Err(failure))) => Err(failure.into()),
            Ok(Err(_)) => Err(CmError::JobCancelled),
        }
    }
}

/// Lazy sequence of replies for a multi-reply job.
pub struct JobStream {
    pub id: JobId,
    rx: mpsc::UnboundedReceiver<JobOutcome>,
    jobs: JobCorrelator,
}

impl JobStream {
    /// Next reply in the stream.
    ///
    /// `Ok(Some(envelope))` is a reply, `Ok(None)` the clean end of the
    /// job (complete marker or cancellation).
    ///
    /// # Errors
    /// `CmError::JobTimeout` when `timeout` elapses, `ConnectionLost` when
    /// the connection dropped under the job.
    pub async fn next_reply(&mut self, timeout: Duration) -> Result<Option<MessageEnvelope>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => {
                self.jobs.cancel(self.id);
                Err(CmError::JobTimeout)
            }
            Ok(None) => Ok(None),
            Ok(Some(Ok(envelope))) => Ok(Some(envelope)),
            Ok(Some(Err(failure))) => Err(failure.into()),
        }
    }

    /// Adapt into a `tokio_stream` stream of outcomes.
    pub fn into_stream(self) -> UnboundedReceiverStream<JobOutcome> {
        UnboundedReceiverStream::new(self.rx)
    }
}
