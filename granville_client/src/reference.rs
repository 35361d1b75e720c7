//! Client grain reference runtime (spec §4.6 / C6): typed proxies over an
//! [`Invocation`], dispatched through whatever carries calls to a peer
//! (ordinarily a [`Connection`]).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use granville_shared::errors::RpcError;
use granville_shared::model::{GrainId, Invocation, InvocationOptions, RoutingContext};
use granville_transport::Connection;
use tokio::sync::mpsc;

/// A [`RoutingContext`] shared between an embedder and the dispatcher behind
/// a [`GrainRef`], so mutating it changes where the *next* call through that
/// same reference routes (spec §4.6: "the target server is resolved at call
/// time"; spec §8 zone-handoff scenario). Cloning this handle is cheap and
/// shares the same underlying context.
#[derive(Clone, Default)]
pub struct SharedRoutingContext(Arc<std::sync::Mutex<RoutingContext>>);

impl SharedRoutingContext {
    pub fn new(context: RoutingContext) -> Self {
        Self(Arc::new(std::sync::Mutex::new(context)))
    }

    /// Mutates the context in place.
    pub fn update(&self, f: impl FnOnce(&mut RoutingContext)) {
        f(&mut self.0.lock().unwrap());
    }

    /// Snapshots the current context for a single routing decision.
    pub fn snapshot(&self) -> RoutingContext {
        self.0.lock().unwrap().clone()
    }
}

/// Anything that can carry an [`Invocation`] to a peer and return its result.
/// `Connection` implements this directly; `ClientMultiplexer` implements it
/// by re-resolving a target connection on every call (spec §4.6: "the
/// target server is resolved at call time"). Tests can supply a fake to
/// drive a `GrainRef` without a real transport.
#[async_trait]
pub trait CallDispatch: Send + Sync {
    async fn call(&self, invocation: Invocation) -> Result<Bytes, RpcError>;
    async fn call_stream(
        &self,
        invocation: Invocation,
    ) -> Result<mpsc::Receiver<Result<Bytes, RpcError>>, RpcError>;
    async fn call_one_way(&self, invocation: Invocation) -> Result<(), RpcError>;

    /// Deadline (ms) to use when a caller doesn't specify one explicitly.
    /// Backed by `RpcConfig.call_timeout_ms` rather than a bare literal, so
    /// changing that config setting actually changes call behavior.
    fn call_timeout_ms(&self) -> u32;
}

#[async_trait]
impl CallDispatch for Connection {
    async fn call(&self, invocation: Invocation) -> Result<Bytes, RpcError> {
        Connection::call(self, invocation).await
    }

    async fn call_stream(
        &self,
        invocation: Invocation,
    ) -> Result<mpsc::Receiver<Result<Bytes, RpcError>>, RpcError> {
        Connection::call_stream(self, invocation).await
    }

    async fn call_one_way(&self, invocation: Invocation) -> Result<(), RpcError> {
        Connection::call_one_way(self, invocation).await
    }

    fn call_timeout_ms(&self) -> u32 {
        Connection::call_timeout_ms(self)
    }
}

/// A bound reference to one grain activation behind some dispatcher.
/// `define_grain_interface!` wraps this to add typed, named methods.
pub struct GrainRef<D: CallDispatch + ?Sized> {
    dispatch: Arc<D>,
    grain_id: GrainId,
    interface_id: u32,
}

impl<D: CallDispatch + ?Sized> GrainRef<D> {
    pub fn new(dispatch: Arc<D>, grain_id: GrainId, interface_id: u32) -> Self {
        Self {
            dispatch,
            grain_id,
            interface_id,
        }
    }

    pub fn grain_id(&self) -> &GrainId {
        &self.grain_id
    }

    /// Default per-call options, honoring the dispatcher's configured call
    /// timeout (spec §6 `call_timeout_ms`) rather than a fixed literal.
    pub fn default_options(&self) -> InvocationOptions {
        InvocationOptions {
            deadline_ms: self.dispatch.call_timeout_ms(),
            ..Default::default()
        }
    }

    /// Invokes `method_index` and awaits the single reply.
    pub async fn invoke(
        &self,
        method_index: u16,
        arguments: Vec<u8>,
        options: InvocationOptions,
    ) -> Result<Bytes, RpcError> {
        let invocation = Invocation {
            grain_id: self.grain_id.clone(),
            interface_id: self.interface_id,
            method_index,
            arguments,
            options,
        };
        if options.one_way {
            self.dispatch.call_one_way(invocation).await?;
            Ok(Bytes::new())
        } else {
            self.dispatch.call(invocation).await
        }
    }

    /// Invokes a streaming method; each item off the returned channel is one
    /// chunk, ending when the peer marks `END_OF_STREAM`.
    pub async fn invoke_stream(
        &self,
        method_index: u16,
        arguments: Vec<u8>,
        options: InvocationOptions,
    ) -> Result<mpsc::Receiver<Result<Bytes, RpcError>>, RpcError> {
        let invocation = Invocation {
            grain_id: self.grain_id.clone(),
            interface_id: self.interface_id,
            method_index,
            arguments,
            options,
        };
        self.dispatch.call_stream(invocation).await
    }
}

impl<D: CallDispatch + ?Sized> Clone for GrainRef<D> {
    fn clone(&self) -> Self {
        Self {
            dispatch: self.dispatch.clone(),
            grain_id: self.grain_id.clone(),
            interface_id: self.interface_id,
        }
    }
}

/// Encodes a method's arguments the same way the embedder-side dispatch does:
/// a lone argument is encoded bare, two or more are encoded as a tuple.
/// Matches the convention the demo grain host's `echo`/`add` methods use.
#[doc(hidden)]
#[macro_export]
macro_rules! __grv_encode_args {
    () => {
        serde_json::to_vec(&())
    };
    ($only:expr $(,)?) => {
        serde_json::to_vec(&$only)
    };
    ($first:expr, $($rest:expr),+ $(,)?) => {
        serde_json::to_vec(&($first, $($rest),+))
    };
}

/// Generates a typed proxy wrapping a [`GrainRef`]. Method indices are
/// **not** written by hand: they're derived by sorting the declared method
/// names ordinally and numbering from 0 (spec §4.4), the same rule
/// `Manifest::register_interface` uses server-side, so the two sides agree
/// without anyone typing matching numbers on each end.
///
/// ```ignore
/// define_grain_interface! {
///     pub trait EchoInterface : 1 {
///         fn echo(&self, text: String) -> String;
///         fn add(&self, a: i64, b: i64) -> i64;
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_grain_interface {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident : $interface_id:expr {
            $(
                fn $method:ident(&self $(, $arg:ident : $arg_ty:ty)*) -> $ret:ty;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name<D: $crate::reference::CallDispatch + ?Sized> {
            inner: $crate::reference::GrainRef<D>,
        }

        impl<D: $crate::reference::CallDispatch + ?Sized> $name<D> {
            pub const INTERFACE_ID: u32 = $interface_id;
            const METHOD_NAMES: &'static [&'static str] = &[$(stringify!($method)),*];

            pub fn new(inner: $crate::reference::GrainRef<D>) -> Self {
                Self { inner }
            }

            pub fn grain_ref(&self) -> &$crate::reference::GrainRef<D> {
                &self.inner
            }

            $(
                pub async fn $method(
                    &self,
                    $($arg: $arg_ty),*
                ) -> ::std::result::Result<$ret, granville_shared::errors::RpcError> {
                    let args = $crate::__grv_encode_args!($($arg),*)
                        .map_err(|e| granville_shared::errors::RpcError::Protocol(e.to_string()))?;
                    let method_index = granville_shared::model::method_index_of(
                        Self::METHOD_NAMES,
                        ::std::stringify!($method),
                    );
                    let options = self.inner.default_options();
                    let bytes = self.inner.invoke(method_index, args, options).await?;
                    serde_json::from_slice(&bytes)
                        .map_err(|e| granville_shared::errors::RpcError::Protocol(e.to_string()))
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoDispatch {
        last: Mutex<Option<Invocation>>,
    }

    #[async_trait]
    impl CallDispatch for EchoDispatch {
        async fn call(&self, invocation: Invocation) -> Result<Bytes, RpcError> {
            let text: String = serde_json::from_slice(&invocation.arguments).unwrap();
            let reply = Bytes::from(serde_json::to_vec(&text).unwrap());
            *self.last.lock().unwrap() = Some(invocation);
            Ok(reply)
        }

        async fn call_stream(
            &self,
            _invocation: Invocation,
        ) -> Result<mpsc::Receiver<Result<Bytes, RpcError>>, RpcError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn call_one_way(&self, _invocation: Invocation) -> Result<(), RpcError> {
            Ok(())
        }

        fn call_timeout_ms(&self) -> u32 {
            30_000
        }
    }

    define_grain_interface! {
        pub trait EchoInterface : 7 {
            fn echo(&self, text: String) -> String;
        }
    }

    #[tokio::test]
    async fn generated_proxy_round_trips_json_arguments() {
        let dispatch = Arc::new(EchoDispatch { last: Mutex::new(None) });
        let grain_ref = GrainRef::new(
            dispatch,
            GrainId::with_string_key(7, "room-1"),
            EchoInterface::<EchoDispatch>::INTERFACE_ID,
        );
        let echo = EchoInterface::new(grain_ref);
        let reply = echo.echo("hi".to_string()).await.unwrap();
        assert_eq!(reply, "hi");
    }

    #[tokio::test]
    async fn generated_proxy_sends_config_driven_deadline() {
        let dispatch = Arc::new(EchoDispatch { last: Mutex::new(None) });
        let grain_ref = GrainRef::new(
            dispatch.clone(),
            GrainId::with_string_key(7, "room-1"),
            EchoInterface::<EchoDispatch>::INTERFACE_ID,
        );
        let echo = EchoInterface::new(grain_ref);
        echo.echo("hi".to_string()).await.unwrap();
        let last = dispatch.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.options.deadline_ms, dispatch.call_timeout_ms());
    }

    define_grain_interface! {
        pub trait UnsortedInterface : 9 {
            fn zebra(&self, v: i64) -> i64;
            fn apple(&self, v: i64) -> i64;
        }
    }

    #[test]
    fn macro_derives_indices_by_ordinal_sort_not_declaration_order() {
        assert_eq!(
            granville_shared::model::method_index_of(
                UnsortedInterface::<EchoDispatch>::METHOD_NAMES,
                "apple"
            ),
            0
        );
        assert_eq!(
            granville_shared::model::method_index_of(
                UnsortedInterface::<EchoDispatch>::METHOD_NAMES,
                "zebra"
            ),
            1
        );
    }
}
