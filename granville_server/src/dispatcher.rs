//! Embedder interface for the invocation engine (spec §6).
//!
//! `granville_server` itself knows nothing about what a "grain" actually
//! does; it only knows how to turn decoded wire frames into calls against
//! this trait and turn the trait's results back into `Response` frames.

use async_trait::async_trait;
use granville_shared::errors::RpcError;
use granville_shared::model::{GrainId, Manifest};

/// A chunk of a streaming method's result (spec §4.6). `final_chunk` mirrors
/// `END_OF_STREAM` on the wire.
pub struct StreamChunk {
    pub payload: Vec<u8>,
    pub final_chunk: bool,
}

/// What the embedder implements to host grains under this runtime.
///
/// `resolve_activation` runs before `dispatch` so the engine can return
/// `GrainUnknown` without ever invoking embedder method code for an
/// interface/key it doesn't host (spec §4.5 "Unknown grain").
#[async_trait]
pub trait ActivationDispatcher: Send + Sync {
    /// Whether this server hosts (or can activate) the given grain.
    async fn resolve_activation(&self, grain_id: &GrainId) -> bool;

    /// Invokes one non-streaming method and returns its encoded result.
    async fn dispatch(
        &self,
        grain_id: &GrainId,
        interface_id: u32,
        method_index: u16,
        arguments: &[u8],
    ) -> Result<Vec<u8>, RpcError>;

    /// Invokes a streaming method, sending each chunk as it becomes ready.
    /// The default implementation calls `dispatch` once and wraps the whole
    /// result as a single final chunk, which is correct for interfaces with
    /// no genuinely streaming methods.
    async fn dispatch_stream(
        &self,
        grain_id: &GrainId,
        interface_id: u32,
        method_index: u16,
        arguments: &[u8],
        sink: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Result<(), RpcError> {
        let payload = self
            .dispatch(grain_id, interface_id, method_index, arguments)
            .await?;
        sink(StreamChunk {
            payload,
            final_chunk: true,
        });
        Ok(())
    }

    /// The interface/method catalog advertised during the manifest exchange.
    fn manifest(&self) -> Manifest;
}
