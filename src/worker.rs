//! The worker contract: one opaque worker per data source.
//!
//! A worker accepts typed requests, executes them against its source in its
//! own thread of control, and deposits exactly one reply per request. The
//! orchestrator only ever talks to the channel handle - it never blocks on a
//! worker and never implements one. [`spawn_service_worker`] adapts a
//! blocking [`SourceService`] (the part that actually speaks a source
//! protocol, supplied by the embedder) onto that contract.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::config::SourceDescriptor;
use crate::context::Region;
use crate::protocol::{Reply, ReplyPayload, Request};

// =============================================================================
// Channel handle
// =============================================================================

/// Orchestrator-side handle to one worker.
///
/// All calls are non-blocking; replies are collected by polling
/// [`try_reply`](WorkerChannel::try_reply).
#[derive(Debug)]
pub struct WorkerChannel {
    request_tx: Sender<Request>,
    reply_rx: Receiver<Reply>,
    kill_tx: Sender<()>,
}

impl WorkerChannel {
    /// Hand a request to the worker. Returns `false` if the worker is gone
    /// (its channel disconnected) - the caller treats that as a death.
    pub fn execute(&self, request: Request) -> bool {
        self.request_tx.send(request).is_ok()
    }

    /// Non-blocking poll for the next deposited reply.
    pub fn try_reply(&self) -> Option<Reply> {
        match self.reply_rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty) => None,
            // A disconnected worker that never said goodbye died abruptly.
            Err(TryRecvError::Disconnected) => Some(Reply::Died {
                message: "worker channel disconnected".to_string(),
            }),
        }
    }

    /// Fire-and-forget kill. The worker confirms with a `Cancelled` reply at
    /// its own pace; it may deposit earlier replies first.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(());
    }
}

/// Worker-side endpoint, for implementations that run their own loop.
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub request_rx: Receiver<Request>,
    pub reply_tx: Sender<Reply>,
    pub kill_rx: Receiver<()>,
}

/// Create a connected handle/endpoint pair.
pub fn worker_channel() -> (WorkerChannel, WorkerEndpoint) {
    let (request_tx, request_rx) = unbounded();
    let (reply_tx, reply_rx) = unbounded();
    let (kill_tx, kill_rx) = unbounded();
    (
        WorkerChannel {
            request_tx,
            reply_rx,
            kill_tx,
        },
        WorkerEndpoint {
            request_rx,
            reply_tx,
            kill_rx,
        },
    )
}

// =============================================================================
// Blocking service adapter
// =============================================================================

/// Error from one service call.
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub message: String,
    /// Fatal errors kill the worker (`Died`); non-fatal ones become
    /// `RequestError` and leave the worker running.
    pub fatal: bool,
}

impl ServiceError {
    pub fn request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// The blocking per-source protocol implementation, supplied by the embedder.
/// One instance per connection; it owns each request's payload for the
/// duration of execution and must not retain it afterwards.
pub trait SourceService: Send + 'static {
    fn execute(&mut self, request: Request) -> Result<ReplyPayload, ServiceError>;
}

/// Run a blocking service on its own thread behind the polled-channel
/// contract. A pending kill wins over pending requests.
pub fn spawn_service_worker<S: SourceService>(mut service: S) -> WorkerChannel {
    let (handle, endpoint) = worker_channel();
    std::thread::spawn(move || {
        let WorkerEndpoint {
            request_rx,
            reply_tx,
            kill_rx,
        } = endpoint;
        loop {
            crossbeam_channel::select! {
                recv(kill_rx) -> _ => {
                    let _ = reply_tx.send(Reply::Cancelled);
                    break;
                }
                recv(request_rx) -> request => {
                    let Ok(request) = request else {
                        // Orchestrator dropped the handle; nothing left to do.
                        break;
                    };
                    // A kill that arrived while we slept beats the request.
                    if kill_rx.try_recv().is_ok() {
                        let _ = reply_tx.send(Reply::Cancelled);
                        break;
                    }
                    let stage = request.stage;
                    let reply = match service.execute(request) {
                        Ok(payload) => Reply::GotData { stage, payload },
                        Err(e) if e.fatal => Reply::Died { message: e.message },
                        Err(e) => Reply::RequestError {
                            stage,
                            message: e.message,
                        },
                    };
                    let fatal = matches!(reply, Reply::Died { .. });
                    if reply_tx.send(reply).is_err() || fatal {
                        break;
                    }
                }
            }
        }
    });
    handle
}

// =============================================================================
// Factory
// =============================================================================

/// Spawns one worker per accepted source descriptor. Injected into the view
/// at construction; tests supply scripted factories.
pub trait WorkerFactory {
    fn spawn(
        &mut self,
        descriptor: &SourceDescriptor,
        region: &Region,
    ) -> Result<WorkerChannel, String>;
}
