//! Server invocation engine (spec §4.5): turns inbound `Request`/`OneWay`
//! frames surfaced by a [`Connection`] into calls against an
//! [`ActivationDispatcher`], with bounded concurrency as admission control.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use granville_shared::errors::RpcError;
use granville_shared::wire::{ResponseFlags, Status};
use granville_transport::{Connection, ConnectionEvent};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::dispatcher::{ActivationDispatcher, StreamChunk};

/// Maps a dispatch failure onto the wire status it should be reported as.
/// Everything outside the taxonomy spec §4.5 gives its own status collapses
/// into `Error` with the error's message.
fn error_to_status(err: &RpcError) -> (Status, String) {
    match err {
        RpcError::GrainUnknown => (Status::GrainUnknown, String::new()),
        RpcError::MethodUnknown => (Status::MethodUnknown, String::new()),
        RpcError::Overloaded => (Status::Overloaded, String::new()),
        RpcError::Canceled => (Status::Canceled, String::new()),
        other => (Status::Error, other.to_string()),
    }
}

/// Drives one connection's inbound invocations against a single dispatcher.
/// Concurrency is capped with a semaphore: once exhausted, further requests
/// are answered `Overloaded` immediately rather than queued (spec §4.5
/// "Backpressure").
pub struct InvocationEngine<D: ActivationDispatcher + 'static> {
    dispatcher: Arc<D>,
    admission: Arc<Semaphore>,
}

impl<D: ActivationDispatcher + 'static> InvocationEngine<D> {
    pub fn new(dispatcher: Arc<D>, max_concurrent_invocations: usize) -> Self {
        Self {
            dispatcher,
            admission: Arc::new(Semaphore::new(max_concurrent_invocations)),
        }
    }

    /// Runs until the connection closes, spawning one task per inbound
    /// invocation so a slow grain call never blocks the connection's other
    /// in-flight requests.
    pub async fn run(self: Arc<Self>, connection: Arc<Connection>) {
        loop {
            match connection.next_event().await {
                Some(ConnectionEvent::Invocation {
                    correlation_id,
                    grain_id,
                    interface_id,
                    method_index,
                    arguments,
                    deadline_ms,
                    one_way,
                }) => {
                    let engine = self.clone();
                    let connection = connection.clone();
                    tokio::spawn(async move {
                        engine
                            .handle_invocation(
                                connection,
                                correlation_id,
                                grain_id,
                                interface_id,
                                method_index,
                                arguments,
                                deadline_ms,
                                one_way,
                            )
                            .await;
                    });
                }
                Some(ConnectionEvent::ManifestUpdated(_)) | Some(ConnectionEvent::StateChanged(_)) => {}
                Some(ConnectionEvent::Closed) | None => {
                    debug!(remote = %connection.remote_addr(), "connection closed, stopping engine loop");
                    return;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_invocation(
        &self,
        connection: Arc<Connection>,
        correlation_id: u64,
        grain_id: granville_shared::model::GrainId,
        interface_id: u32,
        method_index: u16,
        arguments: Bytes,
        deadline_ms: u32,
        one_way: bool,
    ) {
        let permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if !one_way {
                    let _ = connection
                        .respond(correlation_id, Status::Overloaded, ResponseFlags::NONE, Bytes::new())
                        .await;
                }
                return;
            }
        };

        if !self.dispatcher.resolve_activation(&grain_id).await {
            if !one_way {
                let _ = connection
                    .respond(correlation_id, Status::GrainUnknown, ResponseFlags::NONE, Bytes::new())
                    .await;
            }
            drop(permit);
            return;
        }

        let remaining = Duration::from_millis(deadline_ms as u64);
        let deadline = Instant::now() + remaining;

        let mut chunks: Vec<StreamChunk> = Vec::new();
        let outcome = tokio::time::timeout_at(
            deadline.into(),
            self.dispatcher.dispatch_stream(
                &grain_id,
                interface_id,
                method_index,
                &arguments,
                &mut |chunk| chunks.push(chunk),
            ),
        )
        .await;
        drop(permit);

        if one_way {
            return;
        }

        match outcome {
            Err(_elapsed) => {
                // The caller's own deadline will have already fired locally;
                // no Response frame is sent for a call we couldn't finish in
                // time (spec §4.5's deadline semantics are caller-local).
                warn!(%correlation_id, "invocation exceeded its deadline, dropping response");
            }
            Ok(Err(err)) => {
                let (status, message) = error_to_status(&err);
                let _ = connection
                    .respond(correlation_id, status, ResponseFlags::NONE, Bytes::from(message))
                    .await;
            }
            Ok(Ok(())) => {
                if chunks.is_empty() {
                    let _ = connection
                        .respond(correlation_id, Status::Ok, ResponseFlags::END_OF_STREAM, Bytes::new())
                        .await;
                    return;
                }
                let last = chunks.len() - 1;
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let flags = if i == last || chunk.final_chunk {
                        ResponseFlags::END_OF_STREAM
                    } else {
                        ResponseFlags::NONE
                    };
                    if connection
                        .respond(correlation_id, Status::Ok, flags, Bytes::from(chunk.payload))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }
}
