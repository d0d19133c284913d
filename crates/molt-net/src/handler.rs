//! Message handler registration.
//!
//! A handler is an async function receiving the inbound [`Connection`] and the
//! payload of its single request frame. It may write one response frame on
//! the connection; the connection closes when the handler drops it.
//!
//! Typed handlers ("RPCs") decode the payload into a concrete value first and
//! only see that value. The decoder and the application function are checked
//! against each other by the compiler when they are registered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::codec;
use crate::connection::Connection;
use crate::error::NetError;

/// Future returned by a registered handler.
pub type HandlerFuture = BoxFuture<'static, Result<(), NetError>>;

/// Type-erased handler stored in the table.
pub type BoxedHandler = Arc<dyn Fn(Connection, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Mapping from message tag to handler. At most one handler per tag.
///
/// Cloning is cheap and yields a handle to the same table.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<RwLock<HashMap<u8, BoxedHandler>>>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("tags", &self.tags())
            .finish()
    }
}

impl HandlerTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `tag`, replacing any existing binding.
    ///
    /// Returns true if a handler was replaced.
    pub fn register<F, Fut>(&self, tag: u8, handler: F) -> bool
    where
        F: Fn(Connection, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetError>> + Send + 'static,
    {
        let boxed: BoxedHandler =
            Arc::new(move |conn: Connection, payload: Vec<u8>| handler(conn, payload).boxed());
        self.handlers.write().insert(tag, boxed).is_some()
    }

    /// Binds a typed handler to `tag`.
    ///
    /// `decode` turns the payload into a `T`; `apply` runs on the decoded value.
    /// A decode failure becomes the handler's error and `apply` is not called.
    pub fn register_rpc<T, D, F, Fut>(&self, tag: u8, decode: D, apply: F) -> bool
    where
        T: Send + 'static,
        D: Fn(&[u8]) -> Result<T, NetError> + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetError>> + Send + 'static,
    {
        self.register(tag, move |_conn, payload| {
            let call = decode(payload.as_slice()).map(&apply);
            async move { call?.await }
        })
    }

    /// Binds a typed handler whose payload is decoded with [`codec::unmarshal`].
    pub fn register_json_rpc<T, F, Fut>(&self, tag: u8, apply: F) -> bool
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetError>> + Send + 'static,
    {
        self.register_rpc(tag, codec::unmarshal::<T>, apply)
    }

    /// Returns the handler bound to `tag`.
    #[must_use]
    pub fn get(&self, tag: u8) -> Option<BoxedHandler> {
        self.handlers.read().get(&tag).cloned()
    }

    /// Removes the binding for `tag`. Returns true if there was one.
    pub fn unregister(&self, tag: u8) -> bool {
        self.handlers.write().remove(&tag).is_some()
    }

    /// Returns the bound tags in ascending order.
    #[must_use]
    pub fn tags(&self) -> Vec<u8> {
        let mut tags: Vec<u8> = self.handlers.read().keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}
