//! Streaming Pipeline Module
//!
//! Moves bytes from a backend object stream into an HTTP response body.
//! Every session ends in exactly one terminal state and runs its cleanup
//! (admission slot, registry entry, backend stream) exactly once, whether it
//! completes, the client disconnects, the backend fails, the idle timer fires,
//! or the janitor cancels it.

use crate::admission::AdmissionPermit;
use crate::s3_client::ByteStream;
use crate::stream_registry::{StreamRegistration, StreamRegistry};
use crate::{GatewayError, Result};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::StreamBody;
use hyper::body::Frame;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Response body type produced by the pipeline
pub type GatewayBody = BoxBody<Bytes, GatewayError>;

type FrameSender = mpsc::Sender<Frame<Bytes>>;

/// How a stream session ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamTermination {
    Completed { bytes: u64 },
    /// Client went away or the session was cancelled.
    Aborted { bytes: u64 },
    TimedOut { bytes: u64 },
    Errored { bytes: u64, error: GatewayError },
}

impl StreamTermination {
    pub fn bytes(&self) -> u64 {
        match self {
            StreamTermination::Completed { bytes }
            | StreamTermination::Aborted { bytes }
            | StreamTermination::TimedOut { bytes }
            | StreamTermination::Errored { bytes, .. } => *bytes,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StreamTermination::Completed { .. } => "completed",
            StreamTermination::Aborted { .. } => "aborted",
            StreamTermination::TimedOut { .. } => "timed_out",
            StreamTermination::Errored { .. } => "errored",
        }
    }
}

#[derive(Debug, Default)]
struct StreamingMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    timed_out: AtomicU64,
    errored: AtomicU64,
    bytes_sent: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamingMetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub timed_out: u64,
    pub errored: u64,
    pub bytes_sent: u64,
}

impl StreamingMetrics {
    fn record(&self, termination: &StreamTermination) {
        let counter = match termination {
            StreamTermination::Completed { .. } => &self.completed,
            StreamTermination::Aborted { .. } => &self.aborted,
            StreamTermination::TimedOut { .. } => &self.timed_out,
            StreamTermination::Errored { .. } => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(termination.bytes(), Ordering::Relaxed);
    }
}

/// Everything one session needs from the gateway
pub struct StreamRequest {
    pub file_key: String,
    pub backend: ByteStream,
    /// Admission slot held for the life of the stream, if any.
    pub permit: Option<AdmissionPermit>,
    /// Cancelled when the client connection closes.
    pub connection: CancellationToken,
}

/// A started stream: the response body plus a handle resolving to its
/// terminal state once cleanup has run.
pub struct StreamHandle {
    pub id: Uuid,
    pub body: GatewayBody,
    pub completion: JoinHandle<StreamTermination>,
}

/// Cleanup owner for one session. `finish` may be called any number of
/// times; only the first call has effect. Dropping an unfinished session
/// finishes it as aborted.
struct StreamSession {
    id: Uuid,
    file_key: String,
    registration: Option<StreamRegistration>,
    permit: Option<AdmissionPermit>,
    started_at: Instant,
    finished: bool,
    verbose: bool,
    pipeline: Arc<PipelineShared>,
}

impl StreamSession {
    fn finish(&mut self, termination: &StreamTermination) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
        self.registration.take();
        self.pipeline.metrics.record(termination);

        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        match termination {
            StreamTermination::Errored { error, .. } => warn!(
                stream_id = %self.id,
                file_key = %self.file_key,
                bytes = termination.bytes(),
                elapsed_ms,
                error = %error,
                "Stream failed"
            ),
            StreamTermination::TimedOut { .. } => warn!(
                stream_id = %self.id,
                file_key = %self.file_key,
                bytes = termination.bytes(),
                elapsed_ms,
                "Stream idle timeout"
            ),
            _ if self.verbose => info!(
                stream_id = %self.id,
                file_key = %self.file_key,
                bytes = termination.bytes(),
                elapsed_ms,
                outcome = termination.label(),
                "Stream finished"
            ),
            _ => debug!(
                stream_id = %self.id,
                file_key = %self.file_key,
                bytes = termination.bytes(),
                elapsed_ms,
                outcome = termination.label(),
                "Stream finished"
            ),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.finish(&StreamTermination::Aborted { bytes: 0 });
    }
}

struct PipelineShared {
    metrics: StreamingMetrics,
}

#[derive(Clone)]
pub struct StreamingPipeline {
    registry: Arc<StreamRegistry>,
    idle_timeout: Duration,
    channel_capacity: usize,
    verbose: bool,
    shared: Arc<PipelineShared>,
}

impl StreamingPipeline {
    pub fn new(
        registry: Arc<StreamRegistry>,
        idle_timeout: Duration,
        channel_capacity: usize,
        verbose: bool,
    ) -> Self {
        Self {
            registry,
            idle_timeout,
            channel_capacity: channel_capacity.max(1),
            verbose,
            shared: Arc::new(PipelineShared {
                metrics: StreamingMetrics::default(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Whether lifecycle events are logged at info
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn metrics(&self) -> StreamingMetricsSnapshot {
        let m = &self.shared.metrics;
        StreamingMetricsSnapshot {
            started: m.started.load(Ordering::Relaxed),
            completed: m.completed.load(Ordering::Relaxed),
            aborted: m.aborted.load(Ordering::Relaxed),
            timed_out: m.timed_out.load(Ordering::Relaxed),
            errored: m.errored.load(Ordering::Relaxed),
            bytes_sent: m.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Start a session. The first chunk is read before returning so that a
    /// backend that never answers, or fails immediately, can still be turned
    /// into an error response (`StreamTimeout` / the backend error) instead
    /// of a truncated body. Once this returns `Ok`, failures surface as a body
    /// error, which aborts the connection.
    pub async fn start(&self, request: StreamRequest) -> Result<StreamHandle> {
        let StreamRequest {
            file_key,
            mut backend,
            permit,
            connection,
        } = request;

        if connection.is_cancelled() {
            drop(backend);
            drop(permit);
            return Err(GatewayError::ClientDisconnected(format!(
                "client left before streaming {}",
                file_key
            )));
        }

        let cancel = connection.child_token();
        let registration = self.registry.register(&file_key, cancel.clone());
        let id = registration.id();
        self.shared.metrics.started.fetch_add(1, Ordering::Relaxed);

        let mut session = StreamSession {
            id,
            file_key,
            registration: Some(registration),
            permit,
            started_at: Instant::now(),
            finished: false,
            verbose: self.verbose,
            pipeline: Arc::clone(&self.shared),
        };
        if self.verbose {
            info!(stream_id = %id, file_key = %session.file_key, "Stream started");
        }

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                session.finish(&StreamTermination::Aborted { bytes: 0 });
                return Err(GatewayError::ClientDisconnected(format!(
                    "stream {} cancelled before first byte",
                    id
                )));
            }
            next = tokio::time::timeout(self.idle_timeout, backend.next()) => next,
        };

        let first = match first {
            Err(_) => {
                let error = GatewayError::StreamTimeout(format!(
                    "no data from backend within {:?}",
                    self.idle_timeout
                ));
                session.finish(&StreamTermination::TimedOut { bytes: 0 });
                return Err(error);
            }
            Ok(None) => None,
            Ok(Some(Ok(chunk))) => Some(chunk),
            Ok(Some(Err(error))) => {
                if error.is_client_disconnect() {
                    session.finish(&StreamTermination::Aborted { bytes: 0 });
                } else {
                    session.finish(&StreamTermination::Errored {
                        bytes: 0,
                        error: error.clone(),
                    });
                }
                return Err(error);
            }
        };

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (failure_tx, failure_rx) = oneshot::channel();
        let (drained_tx, drained_rx) = oneshot::channel();
        let delivered = Arc::new(AtomicU64::new(0));
        let body = BoxBody::new(StreamBody::new(BodyFeed {
            rx,
            failure: Some(failure_rx),
            drained: Some(drained_tx),
            delivered: Arc::clone(&delivered),
            done: false,
        }));
        let outlet = BodyOutlet {
            tx,
            failure: failure_tx,
            drained: drained_rx,
            delivered,
        };

        let idle_timeout = self.idle_timeout;
        let completion = tokio::spawn(async move {
            let termination = pump(backend, first, outlet, cancel, idle_timeout).await;
            session.finish(&termination);
            termination
        });

        Ok(StreamHandle {
            id,
            body,
            completion,
        })
    }
}

/// Response body side of a session. Counts the bytes it hands to hyper,
/// reports `drained` once the last queued frame is out, and ends with the
/// error sent on `failure` ahead of anything still queued.
struct BodyFeed {
    rx: mpsc::Receiver<Frame<Bytes>>,
    failure: Option<oneshot::Receiver<GatewayError>>,
    drained: Option<oneshot::Sender<()>>,
    delivered: Arc<AtomicU64>,
    done: bool,
}

impl futures::Stream for BodyFeed {
    type Item = std::result::Result<Frame<Bytes>, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(failure) = this.failure.as_mut() {
            match Pin::new(failure).poll(cx) {
                Poll::Ready(Ok(error)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(Err(_)) => this.failure = None,
                Poll::Pending => {}
            }
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.delivered
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.done = true;
                if let Some(drained) = this.drained.take() {
                    let _ = drained.send(());
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Pump side of the body: the frame queue plus the signals shared with
/// [`BodyFeed`].
struct BodyOutlet {
    tx: FrameSender,
    failure: oneshot::Sender<GatewayError>,
    drained: oneshot::Receiver<()>,
    delivered: Arc<AtomicU64>,
}

/// Copy chunks from `backend` into the body until the backend ends, the body
/// is dropped, `cancel` fires, or nothing moves for `idle_timeout`. After
/// the backend ends the session stays open until the body has handed out
/// its last frame. Byte counts are what the body delivered, not what was
/// queued.
async fn pump(
    mut backend: ByteStream,
    first: Option<Bytes>,
    outlet: BodyOutlet,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> StreamTermination {
    let BodyOutlet {
        tx,
        failure,
        mut drained,
        delivered,
    } = outlet;
    let sent = || delivered.load(Ordering::Relaxed);

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    if let Some(mut chunk) = first {
        loop {
            idle.as_mut().reset(Instant::now() + idle_timeout);

            // A stalled reader counts as idle too.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamTermination::Aborted { bytes: sent() },
                _ = &mut idle => return time_out(failure, sent(), idle_timeout),
                result = tx.send(Frame::data(chunk)) => {
                    if result.is_err() {
                        return StreamTermination::Aborted { bytes: sent() };
                    }
                }
            }
            idle.as_mut().reset(Instant::now() + idle_timeout);

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamTermination::Aborted { bytes: sent() },
                _ = tx.closed() => return StreamTermination::Aborted { bytes: sent() },
                _ = &mut idle => return time_out(failure, sent(), idle_timeout),
                next = backend.next() => next,
            };
            chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) if error.is_client_disconnect() => {
                    return StreamTermination::Aborted { bytes: sent() };
                }
                Some(Err(error)) => {
                    let _ = failure.send(error.clone());
                    return StreamTermination::Errored {
                        bytes: sent(),
                        error,
                    };
                }
            };
        }
    }

    // Backend exhausted: release it and wait for the client to take the tail
    drop(backend);
    drop(tx);
    idle.as_mut().reset(Instant::now() + idle_timeout);
    let mut last = sent();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamTermination::Aborted { bytes: sent() },
            result = &mut drained => {
                return match result {
                    Ok(()) => StreamTermination::Completed { bytes: sent() },
                    Err(_) => StreamTermination::Aborted { bytes: sent() },
                };
            }
            _ = &mut idle => {
                let now = sent();
                if now == last {
                    return time_out(failure, now, idle_timeout);
                }
                last = now;
                idle.as_mut().reset(Instant::now() + idle_timeout);
            }
        }
    }
}

fn time_out(
    failure: oneshot::Sender<GatewayError>,
    bytes: u64,
    idle_timeout: Duration,
) -> StreamTermination {
    let _ = failure.send(GatewayError::StreamTimeout(format!(
        "stream idle for {:?}",
        idle_timeout
    )));
    StreamTermination::TimedOut { bytes }
}
