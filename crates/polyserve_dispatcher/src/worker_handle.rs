//! Dispatcher-side endpoint of one worker's message channel.
//!
//! Two tasks own the transport: a writer draining an outbound queue and
//! a reader resolving in-flight requests by correlation id. When the
//! transport breaks, every in-flight request fails with
//! `worker-crashed` and the handle is marked closed.

use crate::error::DispatchError;
use crate::launcher::{LaunchedWorker, WorkerGuard};
use polyserve_protocol::codec::{read_message, write_message};
use polyserve_protocol::{
    ErrorKind, ErrorPayload, Message, OpCode, WireRequest, WireResponse,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// What a worker sent back for one request.
pub enum WorkerReply {
    Response(WireResponse),
    /// The app handler failed; surfaced verbatim to the client.
    AppError(ErrorPayload),
}

#[derive(Default)]
struct Pending {
    map: HashMap<Uuid, oneshot::Sender<WorkerReply>>,
    closed: bool,
}

pub struct WorkerHandle {
    outbound: mpsc::Sender<Message>,
    pending: Arc<Mutex<Pending>>,
    guard: tokio::sync::Mutex<Box<dyn WorkerGuard>>,
}

impl WorkerHandle {
    /// Wire up the transport tasks and wait for the READY handshake.
    /// On any failure the worker is killed and nothing is cached.
    pub async fn establish(
        launched: LaunchedWorker,
        ready_timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let LaunchedWorker {
            mut reader,
            mut writer,
            guard,
        } = launched;

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), DispatchError>>();
        let pending: Arc<Mutex<Pending>> = Arc::default();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(err) = write_message(&mut writer, &msg).await {
                    debug!(%err, "worker transport write failed");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            loop {
                let msg = match read_message(&mut reader).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "worker transport read failed");
                        break;
                    }
                };

                match msg.header.opcode {
                    OpCode::Ready => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    OpCode::Response => match msg.parse_payload::<WireResponse>() {
                        Ok(res) => {
                            resolve(&reader_pending, msg.header.req_id, WorkerReply::Response(res));
                        }
                        Err(err) => {
                            warn!(%err, "unreadable RESPONSE payload");
                            let payload = ErrorPayload::new(
                                ErrorKind::WorkerCrashed,
                                format!("unreadable worker response: {err}"),
                            );
                            resolve(&reader_pending, msg.header.req_id, WorkerReply::AppError(payload));
                        }
                    },
                    OpCode::Err => {
                        let payload = msg.parse_payload::<ErrorPayload>().unwrap_or_else(|err| {
                            ErrorPayload::new(
                                ErrorKind::WorkerCrashed,
                                format!("unreadable worker error: {err}"),
                            )
                        });
                        if msg.header.req_id.is_nil() {
                            // Startup failure, before READY.
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Err(DispatchError::new(
                                    ErrorKind::WorkerSpawnFailed,
                                    payload.message,
                                )));
                            }
                        } else {
                            resolve(&reader_pending, msg.header.req_id, WorkerReply::AppError(payload));
                        }
                    }
                    other => {
                        warn!(opcode = ?other, "unexpected frame from worker");
                    }
                }
            }

            // Transport gone: fail everything still in flight.
            let mut pending = lock_pending(&reader_pending);
            pending.closed = true;
            pending.map.clear();
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(DispatchError::new(
                    ErrorKind::WorkerSpawnFailed,
                    "worker exited before READY",
                )));
            }
        });

        let handle = Self {
            outbound,
            pending,
            guard: tokio::sync::Mutex::new(guard),
        };

        let readiness = tokio::time::timeout(ready_timeout, ready_rx).await;
        match readiness {
            Ok(Ok(Ok(()))) => Ok(handle),
            Ok(Ok(Err(err))) => {
                handle.kill_now().await;
                Err(err)
            }
            Ok(Err(_)) | Err(_) => {
                handle.kill_now().await;
                Err(DispatchError::new(
                    ErrorKind::WorkerSpawnFailed,
                    "worker did not become ready in time",
                ))
            }
        }
    }

    /// Send one request and await its reply, bounded by `timeout`.
    pub async fn request(
        &self,
        req: &WireRequest,
        timeout: Duration,
    ) -> Result<WorkerReply, DispatchError> {
        let req_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = lock_pending(&self.pending);
            if pending.closed {
                return Err(crashed("worker channel is closed"));
            }
            pending.map.insert(req_id, tx);
        }

        let msg = Message::with_payload(OpCode::Request, req_id, req).map_err(|err| {
            lock_pending(&self.pending).map.remove(&req_id);
            DispatchError::new(ErrorKind::AppError, format!("unsendable request: {err}"))
        })?;

        if self.outbound.send(msg).await.is_err() {
            lock_pending(&self.pending).map.remove(&req_id);
            return Err(crashed("worker channel is closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(crashed("worker exited mid-request")),
            Err(_) => {
                lock_pending(&self.pending).map.remove(&req_id);
                Err(DispatchError::new(
                    ErrorKind::WorkerTimeout,
                    format!("worker did not respond within {}ms", timeout.as_millis()),
                ))
            }
        }
    }

    /// Whether the transport has broken.
    pub fn is_closed(&self) -> bool {
        lock_pending(&self.pending).closed
    }

    pub async fn send_idle(&self) {
        let _ = self.outbound.send(Message::lifecycle(OpCode::Idle)).await;
    }

    pub async fn send_terminate(&self) {
        let _ = self
            .outbound
            .send(Message::lifecycle(OpCode::Terminate))
            .await;
    }

    /// Cooperative shutdown: TERMINATE, bounded grace, then force.
    pub async fn shutdown(&self, grace: Duration) {
        self.send_terminate().await;
        let mut guard = self.guard.lock().await;
        if tokio::time::timeout(grace, guard.wait()).await.is_err() {
            guard.kill().await;
        }
    }

    /// Force the worker down immediately (stuck worker path).
    pub async fn kill_now(&self) {
        let mut guard = self.guard.lock().await;
        guard.kill().await;
    }
}

fn resolve(pending: &Arc<Mutex<Pending>>, req_id: Uuid, reply: WorkerReply) {
    let sender = lock_pending(pending).map.remove(&req_id);
    match sender {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => {
            // Timed out or cancelled; the reply is discarded.
            debug!(%req_id, "reply for unknown request");
        }
    }
}

fn crashed(message: &str) -> DispatchError {
    DispatchError::new(ErrorKind::WorkerCrashed, message)
}

fn lock_pending(pending: &Arc<Mutex<Pending>>) -> std::sync::MutexGuard<'_, Pending> {
    // Lock poisoning cannot happen: holders never panic while holding it.
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
