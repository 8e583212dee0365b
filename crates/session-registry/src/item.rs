//! Published session items.
//!
//! A [`SessionItem`] is the storage of one session and is owned exclusively
//! by the registry that created it. A [`SessionHandle`] is what the bus sees:
//! it carries only the identifier and a weak reference to the registry, and
//! resolves the item through the registry on every request.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use session_registry_core::{
    Association, Bus, BusError, BusObject, PropertyValue, SessionBus, SessionError, SessionId,
    SessionInfo, SessionMethod, SessionType,
    error::Result,
    protocol::{
        ASSOCIATION_DEFINITIONS_IFACE, InterfaceMap, OBJECT_DELETE_IFACE, OWNER_FORWARD,
        OWNER_REVERSE, PROP_ASSOCIATIONS, PROP_REMOTE_IP_ADDR, PROP_SESSION_ID,
        PROP_SESSION_TYPE, PropertyMap, SESSION_ITEM_IFACE,
    },
    username_from_object_path,
};

use crate::manager::{Inner, SessionManager};

/// Cleanup routine run when a session item is released.
///
/// Receives the session identifier; the return value reports whether the
/// cleanup succeeded.
pub type CleanupFn = Box<dyn FnOnce(SessionId) -> bool + Send>;

/// Unpublishes the object when dropped.
pub(crate) struct Publication {
    bus: Arc<dyn SessionBus>,
    service: String,
    path: String,
}

impl Publication {
    pub(crate) fn new(bus: Arc<dyn SessionBus>, service: String, path: String) -> Self {
        Self { bus, service, path }
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        self.bus.unpublish(&self.service, &self.path);
    }
}

/// Storage of one session.
pub struct SessionItem {
    id: SessionId,
    object_path: String,
    session_type: SessionType,
    remote_address: String,
    owner: Option<Association>,
    cleanup: Option<CleanupFn>,
    publication: Option<Publication>,
}

impl SessionItem {
    pub(crate) fn new(
        id: SessionId,
        object_path: String,
        session_type: SessionType,
        remote_address: String,
    ) -> Self {
        Self {
            id,
            object_path,
            session_type,
            remote_address,
            owner: None,
            cleanup: None,
            publication: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    #[must_use]
    pub const fn session_type(&self) -> SessionType {
        self.session_type
    }

    #[must_use]
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Owner username, if associated.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner
            .as_ref()
            .map(|assoc| username_from_object_path(&assoc.endpoint))
    }

    /// Set owner and remote address together.
    pub(crate) fn set_metadata(&mut self, user_path: String, remote_address: &str) {
        self.set_owner(user_path);
        remote_address.clone_into(&mut self.remote_address);
    }

    /// Replace the owner association with one pointing at `user_path`.
    pub(crate) fn set_owner(&mut self, user_path: String) {
        self.owner = Some(Association::new(OWNER_FORWARD, OWNER_REVERSE, user_path));
    }

    /// Replace the cleanup routine, returning the previous one.
    ///
    /// Routines are not chained; the previous one will not run.
    pub(crate) fn reset_cleanup(&mut self, cleanup: Option<CleanupFn>) -> Option<CleanupFn> {
        std::mem::replace(&mut self.cleanup, cleanup)
    }

    pub(crate) fn attach_publication(&mut self, publication: Publication) {
        self.publication = Some(publication);
    }

    /// Snapshot as seen by the owning registry.
    #[must_use]
    pub fn info(&self, service_name: &str) -> SessionInfo {
        SessionInfo {
            id: self.id,
            username: self.owner().map(str::to_owned),
            remote_address: self.remote_address.clone(),
            session_type: self.session_type,
            service_name: service_name.to_owned(),
            object_path: self.object_path.clone(),
            is_own: true,
        }
    }

    /// Published properties, grouped by interface.
    #[must_use]
    pub fn properties(&self) -> InterfaceMap {
        let mut item = PropertyMap::new();
        item.insert(PROP_SESSION_ID.into(), PropertyValue::Str(self.id.to_hex()));
        item.insert(
            PROP_SESSION_TYPE.into(),
            PropertyValue::Str(self.session_type.wire_name()),
        );
        item.insert(
            PROP_REMOTE_IP_ADDR.into(),
            PropertyValue::Str(self.remote_address.clone()),
        );

        let mut assoc = PropertyMap::new();
        assoc.insert(
            PROP_ASSOCIATIONS.into(),
            PropertyValue::Associations(self.owner.iter().cloned().collect()),
        );

        let mut ifaces = InterfaceMap::new();
        ifaces.insert(SESSION_ITEM_IFACE.into(), item);
        ifaces.insert(ASSOCIATION_DEFINITIONS_IFACE.into(), assoc);
        ifaces.insert(OBJECT_DELETE_IFACE.into(), PropertyMap::new());
        ifaces
    }
}

impl fmt::Debug for SessionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionItem")
            .field("id", &self.id)
            .field("object_path", &self.object_path)
            .field("session_type", &self.session_type)
            .field("remote_address", &self.remote_address)
            .field("owner", &self.owner())
            .field("has_cleanup", &self.cleanup.is_some())
            .field("published", &self.publication.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionItem {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            let id = self.id;
            if cleanup(id) {
                tracing::debug!(session_id = %id, "session cleanup done");
            } else {
                tracing::warn!(session_id = %id, "session cleanup reported failure");
            }
        }
    }
}

/// Bus-facing handle of a session owned by a registry.
pub struct SessionHandle<B: Bus> {
    id: SessionId,
    registry: Weak<Inner<B>>,
}

impl<B: Bus> SessionHandle<B> {
    pub(crate) fn new(id: SessionId, registry: Weak<Inner<B>>) -> Self {
        Self { id, registry }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    fn registry(&self) -> Result<SessionManager<B>> {
        self.registry
            .upgrade()
            .map(SessionManager::from_inner)
            .ok_or_else(|| SessionError::InternalFailure("session registry is gone".into()))
    }

    /// Resolve `username` to the object path of the user.
    async fn resolve_owner(&self, registry: &SessionManager<B>, username: &str) -> Result<String> {
        if username.is_empty() {
            return Err(SessionError::UnknownUser(username.to_owned()));
        }
        match registry.bus().resolve_user(username).await {
            Ok(Some(path)) => Ok(path),
            Ok(None) => Err(SessionError::UnknownUser(username.to_owned())),
            Err(e) => Err(SessionError::InternalFailure(format!(
                "failed to associate user {username}: {e}"
            ))),
        }
    }

    /// Associate the session with `username`, replacing any previous owner.
    ///
    /// # Errors
    /// `UnknownUser` if the identity directory does not know the user,
    /// `InternalFailure` on any other fault.
    pub async fn adjust_session_owner(&self, username: &str) -> Result<()> {
        let registry = self.registry()?;
        let user_path = self.resolve_owner(&registry, username).await?;
        registry.with_item_mut(self.id, |item| item.set_owner(user_path))
    }

    /// Set owner and remote address of the session.
    ///
    /// Nothing is changed unless both succeed.
    ///
    /// # Errors
    /// `UnknownUser` if the user is unknown, `InvalidArgument` for an empty
    /// address.
    pub async fn set_session_metadata(&self, username: &str, remote_address: &str) -> Result<()> {
        let registry = self.registry()?;
        let user_path = self.validate_metadata(&registry, username, remote_address).await?;
        registry.with_item_mut(self.id, |item| item.set_metadata(user_path, remote_address))
    }

    /// Resolve the owner and check the address without touching the item.
    ///
    /// Returns the user object path.
    pub(crate) async fn validate_metadata(
        &self,
        registry: &SessionManager<B>,
        username: &str,
        remote_address: &str,
    ) -> Result<String> {
        let user_path = self.resolve_owner(registry, username).await?;
        if remote_address.is_empty() {
            return Err(SessionError::InvalidArgument(
                "remote address must not be empty".into(),
            ));
        }
        Ok(user_path)
    }

    /// Owner username.
    ///
    /// # Errors
    /// `NoOwner` if the session has not been associated yet.
    pub fn owner(&self) -> Result<String> {
        self.registry()?
            .with_item(self.id, |item| item.owner().map(str::to_owned))?
            .ok_or(SessionError::NoOwner(self.id))
    }

    /// Ask the owning registry to remove this session.
    ///
    /// Without `with_cleanup` the cleanup routine is dropped in the same
    /// locked step that takes the item out, so it never runs.
    ///
    /// # Errors
    /// `InternalFailure` if the registry no longer holds the session.
    pub fn close(&self, with_cleanup: bool) -> Result<()> {
        let registry = self.registry()?;
        tracing::debug!(session_id = %self.id, with_cleanup, "close session");

        if registry.remove_local(self.id, with_cleanup) {
            Ok(())
        } else {
            Err(SessionError::InternalFailure(format!(
                "failed to close session {}",
                self.id
            )))
        }
    }

    /// Remove the session, running its cleanup routine.
    ///
    /// # Errors
    /// See [`close`](Self::close).
    pub fn delete(&self) -> Result<()> {
        self.close(true)
    }
}

fn method_failed(method: &SessionMethod, e: &SessionError) -> BusError {
    BusError::MethodFailed {
        method: method.name().to_owned(),
        message: e.to_string(),
    }
}

#[async_trait]
impl<B: Bus> BusObject for SessionHandle<B> {
    fn interfaces(&self) -> Vec<String> {
        vec![
            SESSION_ITEM_IFACE.to_owned(),
            ASSOCIATION_DEFINITIONS_IFACE.to_owned(),
            OBJECT_DELETE_IFACE.to_owned(),
        ]
    }

    fn properties(&self) -> InterfaceMap {
        self.registry()
            .and_then(|registry| registry.with_item(self.id, SessionItem::properties))
            .unwrap_or_default()
    }

    async fn call(&self, method: SessionMethod) -> Result<(), BusError> {
        let result = match &method {
            SessionMethod::Close { with_cleanup } => self.close(*with_cleanup),
            SessionMethod::Delete => self.delete(),
            SessionMethod::SetSessionMetadata {
                username,
                remote_addr,
            } => self.set_session_metadata(username, remote_addr).await,
            SessionMethod::CommitSessionBuild { .. } => {
                return Err(BusError::UnknownMethod {
                    path: format!("session {}", self.id),
                    method: method.name().to_owned(),
                });
            }
        };
        result.map_err(|e| method_failed(&method, &e))
    }
}
