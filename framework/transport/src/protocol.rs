use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use rpc_tester_codec::{decode_payload, encode_payload, WireDecode, WireEncode};

use crate::RpcError;

pub(crate) type Handler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, RpcError>> + Send + Sync>;

/// The table of verb handlers served on a shard's connections.
#[derive(Default)]
pub struct RpcProtocol {
    handlers: RwLock<HashMap<i32, Handler>>,
}

impl std::fmt::Debug for RpcProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut verbs = self.handlers.read().keys().copied().collect::<Vec<_>>();
        verbs.sort_unstable();
        f.debug_struct("RpcProtocol").field("verbs", &verbs).finish()
    }
}

impl RpcProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a verb, replacing any previous handler.
    ///
    /// The request payload is decoded as a single `A` and the handler's return value is encoded
    /// as the response payload. A payload that does not decode as exactly one `A` is answered
    /// with an error frame.
    pub fn register_handler<A, R, F, Fut>(&self, verb: impl Into<i32>, handler: F)
    where
        A: WireDecode + Send + 'static,
        R: WireEncode + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let verb = verb.into();
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |payload: Bytes| {
            let handler = handler.clone();
            async move {
                let arg = decode_payload::<A>(payload)?;
                let ret = handler(arg).await;
                Ok(encode_payload(&ret))
            }
            .boxed()
        });

        if self.handlers.write().insert(verb, erased).is_some() {
            log::warn!("Replaced the handler for verb {verb}");
        }
    }

    pub(crate) fn handler(&self, verb: i32) -> Option<Handler> {
        self.handlers.read().get(&verb).cloned()
    }
}
