//! Seams between the registry and the message bus it publishes on.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{InterfaceMap, ManagedObjects, PropertyMap, ServiceMap, SessionMethod};

/// Bus error.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Unknown service: {0}")]
    UnknownService(String),
    #[error("Unknown object: {service} {path}")]
    UnknownObject { service: String, path: String },
    #[error("Unknown method {method} on {path}")]
    UnknownMethod { path: String, method: String },
    #[error("Service name already owned: {0}")]
    NameTaken(String),
    #[error("Object path already published: {0}")]
    PathInUse(String),
    #[error("Method {method} failed: {message}")]
    MethodFailed { method: String, message: String },
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// An object handed to the bus for publication.
///
/// The bus holds it while published and routes property reads and method
/// calls to it.
#[async_trait]
pub trait BusObject: Send + Sync {
    /// Interfaces implemented by the object.
    fn interfaces(&self) -> Vec<String>;

    /// Current properties, grouped by interface.
    fn properties(&self) -> InterfaceMap;

    /// Handle a remote method call.
    async fn call(&self, method: SessionMethod) -> Result<(), BusError>;
}

/// Connection to the message bus.
#[async_trait]
pub trait SessionBus: Send + Sync {
    /// Acquire a well-known service name for this connection.
    async fn request_name(&self, service: &str) -> Result<(), BusError>;

    /// Publish an object under `service` at `path`.
    async fn publish(
        &self,
        service: &str,
        path: &str,
        object: Arc<dyn BusObject>,
    ) -> Result<(), BusError>;

    /// Withdraw a published object. Unknown paths are ignored.
    fn unpublish(&self, service: &str, path: &str);

    /// Read the properties of every interface of a remote object.
    async fn get_all_properties(&self, service: &str, path: &str)
    -> Result<PropertyMap, BusError>;

    /// Call a remote method and wait for its reply.
    async fn call(&self, service: &str, path: &str, method: SessionMethod)
    -> Result<(), BusError>;

    /// Send a remote method call without waiting for its outcome.
    ///
    /// Only delivery failures are reported.
    async fn call_no_reply(
        &self,
        service: &str,
        path: &str,
        method: SessionMethod,
    ) -> Result<(), BusError>;
}

/// Bus-wide object directory.
#[async_trait]
pub trait ObjectDirectory: Send + Sync {
    /// All objects known to the directory, including association objects.
    async fn managed_objects(&self) -> Result<ManagedObjects, BusError>;

    /// Services hosting `path` that implement any of `interfaces`.
    async fn get_object(&self, path: &str, interfaces: &[&str]) -> Result<ServiceMap, BusError>;
}

/// Directory of known users.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Resolve `username` to its user object path, `None` if unknown.
    async fn resolve_user(&self, username: &str) -> Result<Option<String>, BusError>;
}

/// Everything a registry needs from its environment.
pub trait Bus: SessionBus + ObjectDirectory + IdentityDirectory + 'static {}

impl<T> Bus for T where T: SessionBus + ObjectDirectory + IdentityDirectory + 'static {}
