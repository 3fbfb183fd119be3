//! Service registry mapping `Type.Method` names to handlers.
//!
//! The registry is an ordinary value built by the server's owner and handed to
//! [`RpcServer`](crate::RpcServer). Nothing is registered globally.

use crate::error::{HandlerError, Result};
use crate::protocol::codec::{from_value, to_value};
use async_trait::async_trait;
use ciborium::Value;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Trait for handling a single RPC method.
///
/// The argument arrives untyped. Returning [`Error::Codec`](crate::Error::Codec)
/// or [`Error::Handler`](crate::Error::Handler) produces an error response.
/// The connection stays open.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one call.
    async fn call(&self, arg: Value) -> Result<Value>;
}

/// Adapter turning a typed async function into an [`RpcHandler`].
pub struct FnHandler<F, A, R> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

impl<F, A, R> FnHandler<F, A, R> {
    /// Wrap a typed handler function.
    pub const fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, A, R, E> RpcHandler for FnHandler<F, A, R>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    async fn call(&self, arg: Value) -> Result<Value> {
        let arg: A = from_value(&arg)?;
        let reply = (self.f)(arg)
            .await
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        to_value(&reply)
    }
}

/// Split `Type.Method` at its last dot. Both sides must be non-empty.
fn split_service_method(name: &str) -> Option<(&str, &str)> {
    name.rsplit_once('.')
        .filter(|(service, method)| !service.is_empty() && !method.is_empty())
}

/// Registry of handlers keyed by `Type.Method`.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler object under `Type.Method`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is ill-formed or already taken.
    pub fn register_handler(
        &mut self,
        service_method: impl Into<String>,
        handler: impl RpcHandler,
    ) -> Result<&mut Self> {
        let service_method = service_method.into();

        if split_service_method(&service_method).is_none() {
            return Err(HandlerError::IllFormed(service_method).into());
        }
        if self.handlers.contains_key(&service_method) {
            return Err(HandlerError::Duplicate(service_method).into());
        }

        self.handlers.insert(service_method, Arc::new(handler));
        Ok(self)
    }

    /// Register a typed async function under `Type.Method`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is ill-formed or already taken.
    pub fn register<F, Fut, A, R, E>(
        &mut self,
        service_method: impl Into<String>,
        f: F,
    ) -> Result<&mut Self>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.register_handler(service_method, FnHandler::new(f))
    }

    /// Start registering methods under a service type name.
    pub fn service<'a>(&'a mut self, type_name: &'a str) -> ServiceBuilder<'a> {
        ServiceBuilder {
            registry: self,
            type_name,
        }
    }

    /// Find the handler for `service_method`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::IllFormed`] if the name has no `Type.Method`
    /// shape, or [`HandlerError::NotFound`] if nothing is registered.
    pub fn lookup(&self, service_method: &str) -> Result<Arc<dyn RpcHandler>> {
        if split_service_method(service_method).is_none() {
            return Err(HandlerError::IllFormed(service_method.to_string()).into());
        }

        self.handlers
            .get(service_method)
            .cloned()
            .ok_or_else(|| HandlerError::NotFound(service_method.to_string()).into())
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no methods are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Registers methods as `<type_name>.<method>`.
pub struct ServiceBuilder<'a> {
    registry: &'a mut ServiceRegistry,
    type_name: &'a str,
}

impl ServiceBuilder<'_> {
    /// Register a typed async function as a method of this service.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting name is ill-formed or already taken.
    pub fn method<F, Fut, A, R, E>(&mut self, method: &str, f: F) -> Result<&mut Self>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.registry
            .register(format!("{}.{method}", self.type_name), f)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CodecError, Error};
    use std::convert::Infallible;

    fn echo_registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry
            .service("Echo")
            .method("Echo", |arg: String| async move { Ok::<_, Infallible>(arg) })
            .unwrap()
            .method("Fail", |_: String| async move { Err::<String, _>("refused") })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let registry = echo_registry();
        assert_eq!(registry.len(), 2);

        let handler = registry.lookup("Echo.Echo").unwrap();
        let reply = handler.call(to_value("hi").unwrap()).await.unwrap();
        assert_eq!(from_value::<String>(&reply).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_handler_business_error() {
        let handler = echo_registry().lookup("Echo.Fail").unwrap();
        let err = handler.call(to_value("hi").unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::Handler(HandlerError::Internal(ref msg)) if msg == "refused"));
    }

    #[tokio::test]
    async fn test_argument_coercion_error() {
        let handler = echo_registry().lookup("Echo.Echo").unwrap();
        let err = handler.call(to_value(&5u8).unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::Codec(CodecError::Coercion { .. })));
    }

    #[test]
    fn test_lookup_errors() {
        let registry = echo_registry();
        assert!(matches!(
            registry.lookup("Missing.Method"),
            Err(Error::Handler(HandlerError::NotFound(_)))
        ));
        assert!(matches!(
            registry.lookup("NoDot"),
            Err(Error::Handler(HandlerError::IllFormed(_)))
        ));
        assert!(matches!(
            registry.lookup("Echo."),
            Err(Error::Handler(HandlerError::IllFormed(_)))
        ));
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_names() {
        let mut registry = echo_registry();
        assert!(matches!(
            registry.register("Echo.Echo", |x: u8| async move { Ok::<_, Infallible>(x) }),
            Err(Error::Handler(HandlerError::Duplicate(_)))
        ));
        assert!(matches!(
            registry.register(".Echo", |x: u8| async move { Ok::<_, Infallible>(x) }),
            Err(Error::Handler(HandlerError::IllFormed(_)))
        ));
        assert_eq!(registry.len(), 2);
    }
}
