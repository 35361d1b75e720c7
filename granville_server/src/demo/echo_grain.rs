//! Minimal grain used by seed tests and the `--demo` binary mode: proves the
//! engine end to end without pulling in a real game's grain types.

use async_trait::async_trait;
use granville_shared::errors::RpcError;
use granville_shared::model::{method_index_of, GrainId, Manifest};

use crate::dispatcher::{ActivationDispatcher, StreamChunk};

/// Interface id the demo grain answers to; arbitrary, just needs to be
/// distinct within a deployment.
pub const ECHO_INTERFACE_ID: u32 = 1;

/// Method names, indexed by sorting ordinally (spec §4.4) rather than by
/// hand-assigned numbers — `add` sorts before `echo`.
const METHOD_NAMES: &[&str] = &["echo", "add", "stream_count"];

fn method_echo() -> u16 {
    method_index_of(METHOD_NAMES, "echo")
}
fn method_add() -> u16 {
    method_index_of(METHOD_NAMES, "add")
}
fn method_stream_count() -> u16 {
    method_index_of(METHOD_NAMES, "stream_count")
}

/// Hosts a single grain type with three methods: `echo`, `add`, and
/// `stream_count` (a genuinely multi-chunk streaming reply).
pub struct EchoGrain;

impl Default for EchoGrain {
    fn default() -> Self {
        Self
    }
}

#[async_trait]
impl ActivationDispatcher for EchoGrain {
    async fn resolve_activation(&self, grain_id: &GrainId) -> bool {
        grain_id.interface_type_id == ECHO_INTERFACE_ID
    }

    async fn dispatch(
        &self,
        grain_id: &GrainId,
        interface_id: u32,
        method_index: u16,
        arguments: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        if interface_id != ECHO_INTERFACE_ID || !self.resolve_activation(grain_id).await {
            return Err(RpcError::GrainUnknown);
        }
        match method_index {
            idx if idx == method_echo() => {
                let text: String = serde_json::from_slice(arguments)
                    .map_err(|e| RpcError::Protocol(format!("decode echo args: {e}")))?;
                serde_json::to_vec(&text)
                    .map_err(|e| RpcError::Protocol(format!("encode echo result: {e}")))
            }
            idx if idx == method_add() => {
                let (a, b): (i64, i64) = serde_json::from_slice(arguments)
                    .map_err(|e| RpcError::Protocol(format!("decode add args: {e}")))?;
                serde_json::to_vec(&(a + b))
                    .map_err(|e| RpcError::Protocol(format!("encode add result: {e}")))
            }
            idx if idx == method_stream_count() => Err(RpcError::Protocol(
                "stream_count must be invoked as a streaming call".into(),
            )),
            _ => Err(RpcError::MethodUnknown),
        }
    }

    async fn dispatch_stream(
        &self,
        grain_id: &GrainId,
        interface_id: u32,
        method_index: u16,
        arguments: &[u8],
        sink: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Result<(), RpcError> {
        if method_index != method_stream_count() {
            let payload = self
                .dispatch(grain_id, interface_id, method_index, arguments)
                .await?;
            sink(StreamChunk {
                payload,
                final_chunk: true,
            });
            return Ok(());
        }
        if interface_id != ECHO_INTERFACE_ID || !self.resolve_activation(grain_id).await {
            return Err(RpcError::GrainUnknown);
        }
        let count: u32 = serde_json::from_slice(arguments)
            .map_err(|e| RpcError::Protocol(format!("decode stream_count args: {e}")))?;
        for i in 0..count {
            let payload = serde_json::to_vec(&i)
                .map_err(|e| RpcError::Protocol(format!("encode stream_count chunk: {e}")))?;
            sink(StreamChunk {
                payload,
                final_chunk: i + 1 == count,
            });
        }
        if count == 0 {
            sink(StreamChunk {
                payload: Vec::new(),
                final_chunk: true,
            });
        }
        Ok(())
    }

    fn manifest(&self) -> Manifest {
        let mut manifest = Manifest::default();
        manifest.register_interface(ECHO_INTERFACE_ID, METHOD_NAMES);
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granville_shared::model::GrainKey;

    fn grain_id() -> GrainId {
        GrainId::with_string_key(ECHO_INTERFACE_ID, "demo")
    }

    #[test]
    fn method_indices_are_derived_ordinally() {
        // "add" < "echo" < "stream_count" ordinally, so add gets index 0
        // even though it's declared second in METHOD_NAMES.
        assert_eq!(method_add(), 0);
        assert_eq!(method_echo(), 1);
        assert_eq!(method_stream_count(), 2);
    }

    #[tokio::test]
    async fn echo_roundtrips() {
        let grain = EchoGrain::default();
        let args = serde_json::to_vec(&"hi".to_string()).unwrap();
        let result = grain
            .dispatch(&grain_id(), ECHO_INTERFACE_ID, method_echo(), &args)
            .await
            .unwrap();
        let decoded: String = serde_json::from_slice(&result).unwrap();
        assert_eq!(decoded, "hi");
    }

    #[tokio::test]
    async fn add_sums_arguments() {
        let grain = EchoGrain::default();
        let args = serde_json::to_vec(&(2i64, 3i64)).unwrap();
        let result = grain
            .dispatch(&grain_id(), ECHO_INTERFACE_ID, method_add(), &args)
            .await
            .unwrap();
        let decoded: i64 = serde_json::from_slice(&result).unwrap();
        assert_eq!(decoded, 5);
    }

    #[tokio::test]
    async fn unknown_grain_is_rejected() {
        let grain = EchoGrain::default();
        let other = GrainId::with_string_key(99, "demo");
        let err = grain
            .dispatch(&other, 99, method_echo(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::GrainUnknown));
    }

    #[tokio::test]
    async fn stream_count_emits_one_chunk_per_value() {
        let grain = EchoGrain::default();
        let args = serde_json::to_vec(&3u32).unwrap();
        let mut chunks = Vec::new();
        grain
            .dispatch_stream(&grain_id(), ECHO_INTERFACE_ID, method_stream_count(), &args, &mut |c| {
                chunks.push(c)
            })
            .await
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.last().unwrap().final_chunk);
        assert!(!chunks[0].final_chunk);
    }
}
