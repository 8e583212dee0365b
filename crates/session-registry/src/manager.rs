//! Session registry.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use session_registry_core::{
    Bus, BusError, BusObject, SessionBus, SessionError, SessionId, SessionInfo, SessionMethod,
    SessionType,
    error::Result,
    protocol::{self, InterfaceMap, MANAGER_OBJECT_PATH, PropertyMap, SESSION_BUILD_IFACE},
};
use tokio::{sync::oneshot, time::Instant};

use crate::{
    config::RegistryConfig,
    item::{CleanupFn, Publication, SessionHandle, SessionItem},
    transaction::{self, PendingBuild},
};

/// Deadline and resolve signal handed to a build watcher.
type BuildWatch = (Instant, oneshot::Receiver<()>);

/// Items and build slot, guarded by one lock.
#[derive(Default)]
pub(crate) struct State {
    items: BTreeMap<SessionId, SessionItem>,
    pending: Option<PendingBuild>,
}

impl State {
    /// Take the item out of the map, clearing the build slot if it was the
    /// pending session.
    fn take(&mut self, id: SessionId, with_cleanup: bool) -> Option<SessionItem> {
        let mut item = self.items.remove(&id)?;
        if !with_cleanup {
            item.reset_cleanup(None);
        }
        if let Some(pending) = self.pending.take_if(|p| p.session_id() == id) {
            pending.resolve();
        }
        Some(item)
    }
}

pub(crate) struct Inner<B: Bus> {
    bus: Arc<B>,
    config: RegistryConfig,
    service_name: String,
    state: Mutex<State>,
}

impl<B: Bus> Drop for Inner<B> {
    fn drop(&mut self) {
        self.bus.unpublish(&self.service_name, MANAGER_OBJECT_PATH);
    }
}

/// Registry of the sessions created by one service.
///
/// Cheap to clone; clones share the same registry.
pub struct SessionManager<B: Bus> {
    inner: Arc<Inner<B>>,
}

impl<B: Bus> Clone for SessionManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Bus> SessionManager<B> {
    /// Create a registry, acquire its service name and publish its manager
    /// object.
    ///
    /// # Errors
    /// `InvalidArgument` for an unusable slug, `InternalFailure` if the bus
    /// refuses the name or the object.
    pub async fn new(bus: Arc<B>, config: RegistryConfig) -> Result<Self> {
        if !protocol::is_valid_slug(&config.slug) {
            return Err(SessionError::InvalidArgument(format!(
                "invalid service slug: {:?}",
                config.slug
            )));
        }
        let service_name = protocol::service_name(&config.slug);
        bus.request_name(&service_name).await?;

        let inner = Arc::new(Inner {
            bus: Arc::clone(&bus),
            config,
            service_name,
            state: Mutex::new(State::default()),
        });
        let manager_object = Arc::new(ManagerObject {
            registry: Arc::downgrade(&inner),
        });
        bus.publish(&inner.service_name, MANAGER_OBJECT_PATH, manager_object)
            .await?;

        tracing::info!(
            service = %inner.service_name,
            session_type = %inner.config.session_type,
            "session registry started"
        );
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<Inner<B>>) -> Self {
        Self { inner }
    }

    pub(crate) fn bus(&self) -> &B {
        &self.inner.bus
    }

    fn downgrade(&self) -> Weak<Inner<B>> {
        Arc::downgrade(&self.inner)
    }

    #[must_use]
    pub fn slug(&self) -> &str {
        &self.inner.config.slug
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    #[must_use]
    pub fn session_type(&self) -> SessionType {
        self.inner.config.session_type
    }

    /// Parent path of this registry's session objects.
    #[must_use]
    pub fn manager_object_path(&self) -> String {
        protocol::registry_object_path(self.slug())
    }

    /// Object path of a session of this registry.
    #[must_use]
    pub fn session_object_path(&self, id: SessionId) -> String {
        protocol::session_object_path(self.slug(), id)
    }

    /// Bus-facing handle of a session of this registry.
    #[must_use]
    pub fn handle(&self, id: SessionId) -> SessionHandle<B> {
        SessionHandle::new(id, self.downgrade())
    }

    pub(crate) fn with_item<R>(&self, id: SessionId, f: impl FnOnce(&SessionItem) -> R) -> Result<R> {
        let state = self.inner.state.lock();
        state.items.get(&id).map(f).ok_or(SessionError::NotFound(id))
    }

    pub(crate) fn with_item_mut<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut SessionItem) -> R,
    ) -> Result<R> {
        let mut state = self.inner.state.lock();
        state.items.get_mut(&id).map(f).ok_or(SessionError::NotFound(id))
    }

    /// Identifiers of the sessions held by this registry.
    pub(crate) fn local_ids(&self) -> Vec<SessionId> {
        self.inner.state.lock().items.keys().copied().collect()
    }

    fn next_id(&self, state: &State) -> SessionId {
        loop {
            let id = SessionId::generate(&self.inner.service_name);
            if !state.items.contains_key(&id) {
                return id;
            }
            tracing::debug!(session_id = %id, "generated session id in use, regenerating");
        }
    }

    /// Insert a fresh item under the lock; a `build_window` also opens a build.
    fn insert_item(
        &self,
        remote_address: &str,
        cleanup: Option<CleanupFn>,
        build_window: Option<Duration>,
    ) -> Result<(SessionId, Option<BuildWatch>)> {
        let mut state = self.inner.state.lock();
        if state.pending.is_some() {
            tracing::error!(
                service = %self.inner.service_name,
                "session build pending, building a new session is locked"
            );
            return Err(SessionError::TransactionLocked);
        }

        let id = self.next_id(&state);
        let mut item = SessionItem::new(
            id,
            self.session_object_path(id),
            self.inner.config.session_type,
            remote_address.to_owned(),
        );
        item.reset_cleanup(cleanup);
        state.items.insert(id, item);

        let watch = build_window.map(|window| {
            let (pending, rx) = PendingBuild::start(id, window);
            let deadline = pending.deadline();
            state.pending = Some(pending);
            (deadline, rx)
        });
        Ok((id, watch))
    }

    /// Publish the item on the bus. Removes it without cleanup on failure.
    async fn publish_item(&self, id: SessionId) -> Result<()> {
        let path = self.session_object_path(id);
        let handle = Arc::new(self.handle(id));
        if let Err(e) = self
            .inner
            .bus
            .publish(&self.inner.service_name, &path, handle)
            .await
        {
            tracing::error!(session_id = %id, path = %path, error = %e, "failed to publish session");
            self.remove_local(id, false);
            return Err(e.into());
        }

        let bus: Arc<dyn SessionBus> = self.inner.bus.clone();
        let publication = Publication::new(bus, self.inner.service_name.clone(), path);
        // Dropped outside the lock if the item was removed meanwhile.
        let orphan = {
            let mut state = self.inner.state.lock();
            match state.items.get_mut(&id) {
                Some(item) => {
                    item.attach_publication(publication);
                    None
                }
                None => Some(publication),
            }
        };
        drop(orphan);
        Ok(())
    }

    async fn create_session(
        &self,
        username: &str,
        remote_address: &str,
        cleanup: Option<CleanupFn>,
    ) -> Result<SessionId> {
        let (id, _) = self.insert_item(remote_address, cleanup, None)?;
        self.publish_item(id).await?;

        if !username.is_empty() {
            if let Err(e) = self.handle(id).adjust_session_owner(username).await {
                self.remove_local(id, false);
                if e.is_unknown_user() {
                    tracing::debug!(
                        user = username,
                        error = %e,
                        "user not found, session not published"
                    );
                    return Ok(SessionId::NULL);
                }
                tracing::error!(user = username, error = %e, "failed to set session owner");
                return Err(e);
            }
        }

        tracing::info!(
            session_id = %id,
            user = username,
            remote_address,
            "session created"
        );
        Ok(id)
    }

    /// Create and publish a session owned by `username`.
    ///
    /// Returns [`SessionId::NULL`] without publishing anything if the user is
    /// unknown. An empty `username` creates a session without owner.
    ///
    /// # Errors
    /// `TransactionLocked` while a session build is pending,
    /// `InternalFailure` on bus faults.
    pub async fn create(&self, username: &str, remote_address: &str) -> Result<SessionId> {
        self.create_session(username, remote_address, None).await
    }

    /// Like [`create`](Self::create), attaching `cleanup` to the session.
    ///
    /// `cleanup` never runs for a session that was not created.
    ///
    /// # Errors
    /// See [`create`](Self::create).
    pub async fn create_with_cleanup<F>(
        &self,
        username: &str,
        remote_address: &str,
        cleanup: F,
    ) -> Result<SessionId>
    where
        F: FnOnce(SessionId) -> bool + Send + 'static,
    {
        self.create_session(username, remote_address, Some(Box::new(cleanup)))
            .await
    }

    async fn start_build(&self, cleanup: Option<CleanupFn>) -> Result<SessionId> {
        let window = self.inner.config.build_timeout();
        let (id, watch) = self.insert_item("", cleanup, Some(window))?;
        self.publish_item(id).await?;

        if let Some((deadline, rx)) = watch {
            transaction::spawn_watcher(self.downgrade(), id, deadline, rx);
        }
        tracing::info!(
            session_id = %id,
            timeout_ms = self.inner.config.build_timeout_ms,
            "session build started"
        );
        Ok(id)
    }

    /// Publish a session without owner and address, pending a commit.
    ///
    /// The session is removed if [`commit_session_build`] does not complete
    /// within the configured window.
    ///
    /// [`commit_session_build`]: Self::commit_session_build
    ///
    /// # Errors
    /// `TransactionLocked` if a build is already pending.
    pub async fn start_transaction(&self) -> Result<SessionId> {
        self.start_build(None).await
    }

    /// Like [`start_transaction`](Self::start_transaction), attaching
    /// `cleanup` to the session.
    ///
    /// # Errors
    /// `TransactionLocked` if a build is already pending.
    pub async fn start_transaction_with_cleanup<F>(&self, cleanup: F) -> Result<SessionId>
    where
        F: FnOnce(SessionId) -> bool + Send + 'static,
    {
        self.start_build(Some(Box::new(cleanup))).await
    }

    /// Commit owner and address of the pending session build.
    ///
    /// An unknown user tears the pending session down and is not reported as
    /// an error. Other failures keep the session pending, so the commit can
    /// be retried within the remaining window.
    ///
    /// # Errors
    /// `NotPending` without a pending build, `NotFound` if its session is
    /// gone, `InternalFailure` otherwise.
    pub async fn commit_session_build(&self, username: &str, remote_address: &str) -> Result<()> {
        let id = {
            let state = self.inner.state.lock();
            let Some(pending) = state.pending.as_ref() else {
                tracing::error!("failed to commit session build: transaction not started");
                return Err(SessionError::NotPending);
            };
            let id = pending.session_id();
            if !state.items.contains_key(&id) {
                tracing::error!(session_id = %id, "failed to commit session build: session not found");
                return Err(SessionError::NotFound(id));
            }
            id
        };

        let user_path = match self
            .handle(id)
            .validate_metadata(self, username, remote_address)
            .await
        {
            Ok(user_path) => user_path,
            Err(e) if e.is_unknown_user() => {
                tracing::info!(
                    session_id = %id,
                    user = username,
                    "user is not known, dropping pending session"
                );
                self.remove_local(id, false);
                return Ok(());
            }
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "failed to commit session build");
                return Err(SessionError::InternalFailure(e.to_string()));
            }
        };

        // The watcher may have expired the build while the owner was resolved.
        {
            let mut state = self.inner.state.lock();
            if !state.items.contains_key(&id) {
                tracing::error!(session_id = %id, "failed to commit session build: session expired");
                return Err(SessionError::NotFound(id));
            }
            let Some(pending) = state.pending.take_if(|p| p.session_id() == id) else {
                tracing::error!(session_id = %id, "failed to commit session build: no longer pending");
                return Err(SessionError::NotPending);
            };
            pending.resolve();
            if let Some(item) = state.items.get_mut(&id) {
                item.set_metadata(user_path, remote_address);
            }
        }

        tracing::info!(
            session_id = %id,
            user = username,
            remote_address,
            "session build committed"
        );
        Ok(())
    }

    /// Commit the pending build of the registry `slug` running elsewhere on
    /// the bus. One-way: only delivery failures are reported.
    ///
    /// # Errors
    /// `InvalidArgument` for an unusable slug, `InternalFailure` if the call
    /// cannot be delivered.
    pub async fn commit_session_build_remote(
        bus: &B,
        slug: &str,
        username: &str,
        remote_address: &str,
    ) -> Result<()> {
        if !protocol::is_valid_slug(slug) {
            return Err(SessionError::InvalidArgument(format!(
                "invalid service slug: {slug:?}"
            )));
        }
        let service = protocol::service_name(slug);
        bus.call_no_reply(
            &service,
            MANAGER_OBJECT_PATH,
            SessionMethod::CommitSessionBuild {
                username: username.to_owned(),
                remote_addr: remote_address.to_owned(),
            },
        )
        .await
        .map_err(|e| {
            tracing::error!(service = %service, error = %e, "failed to send session build commit");
            SessionError::from(e)
        })
    }

    /// Remove the pending session `id` if its build is still pending.
    ///
    /// Returns whether the session was removed.
    pub(crate) fn expire_pending_build(&self, id: SessionId) -> bool {
        let item = {
            let mut state = self.inner.state.lock();
            if state.pending.take_if(|p| p.session_id() == id).is_none() {
                return false;
            }
            state.take(id, true)
        };
        drop(item);
        true
    }

    /// Whether a session build is pending.
    #[must_use]
    pub fn is_session_build_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Identifier of the session whose build is pending.
    #[must_use]
    pub fn pending_session_build(&self) -> Option<SessionId> {
        self.inner
            .state
            .lock()
            .pending
            .as_ref()
            .map(PendingBuild::session_id)
    }

    /// Abort the pending session build, removing its incomplete session.
    ///
    /// Returns whether a build was pending.
    pub fn reset_pending_session_build(&self) -> bool {
        let (was_pending, item) = {
            let mut state = self.inner.state.lock();
            match state.pending.take() {
                Some(pending) => {
                    let id = pending.session_id();
                    pending.resolve();
                    (true, state.take(id, true))
                }
                None => (false, None),
            }
        };
        drop(item);
        was_pending
    }

    /// Remove a session held by this registry.
    ///
    /// Returns whether the session was found.
    pub(crate) fn remove_local(&self, id: SessionId, with_cleanup: bool) -> bool {
        let item = self.inner.state.lock().take(id, with_cleanup);
        let found = item.is_some();
        // Cleanup and unpublish run here, outside the lock.
        drop(item);
        found
    }

    /// Remove a session, looking it up on the whole bus unless `local_only`.
    ///
    /// Returns `false` if the session could not be found.
    ///
    /// # Errors
    /// `InternalFailure` if discovery or the remote close fails.
    pub async fn remove(&self, id: SessionId, with_cleanup: bool, local_only: bool) -> Result<bool> {
        tracing::debug!(session_id = %id, with_cleanup, local_only, "remove session");
        if id.is_null() {
            return Ok(false);
        }
        if self.remove_local(id, with_cleanup) {
            return Ok(true);
        }
        if local_only {
            tracing::debug!(session_id = %id, "session not held locally");
            return Ok(false);
        }

        let objects = self.find_session_item_objects().await?;
        let sessions = self.sessions_info(&objects, Some(&[id])).await;
        if let Some(info) = sessions.get(&id) {
            self.call_close_session(&info.service_name, &info.object_path, with_cleanup)
                .await?;
            return Ok(true);
        }

        tracing::warn!(session_id = %id, "failed to remove session: not found");
        Ok(false)
    }

    /// Close every session, local or remote, matching `matches`.
    async fn remove_all_where(&self, matches: impl Fn(&SessionInfo) -> bool) -> usize {
        let removed: Vec<SessionItem> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<SessionId> = state
                .items
                .values()
                .filter(|item| matches(&item.info(&self.inner.service_name)))
                .map(SessionItem::id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.take(id, true))
                .collect()
        };
        let mut handled = removed.len();
        drop(removed);

        let objects = match self.find_session_item_objects().await {
            Ok(objects) => objects,
            Err(e) => {
                tracing::error!(error = %e, "failed to discover remote sessions");
                return handled;
            }
        };
        let sessions = self.sessions_info(&objects, None).await;
        for info in sessions.values().filter(|info| !info.is_own && matches(info)) {
            match self
                .call_close_session(&info.service_name, &info.object_path, true)
                .await
            {
                Ok(()) => handled += 1,
                Err(e) => tracing::warn!(
                    session_id = %info.id,
                    path = %info.object_path,
                    error = %e,
                    "failed to remove session, skipping"
                ),
            }
        }
        handled
    }

    /// Close every session owned by `username`. Returns the count closed.
    pub async fn remove_all_by_user(&self, username: &str) -> usize {
        self.remove_all_where(|info| info.username.as_deref() == Some(username))
            .await
    }

    /// Close every session opened from `remote_address`. Returns the count
    /// closed. Sessions without an address never match.
    pub async fn remove_all_by_remote_address(&self, remote_address: &str) -> usize {
        if remote_address.is_empty() {
            return 0;
        }
        self.remove_all_where(|info| info.remote_address == remote_address)
            .await
    }

    /// Close every session of `session_type`. Returns the count closed.
    pub async fn remove_all_by_type(&self, session_type: SessionType) -> usize {
        self.remove_all_where(|info| info.session_type == session_type)
            .await
    }

    /// Close every session on the bus. Returns the count closed.
    pub async fn remove_all(&self) -> usize {
        self.remove_all_where(|_| true).await
    }

    /// Details of a session, local or remote.
    ///
    /// # Errors
    /// `InvalidArgument` for [`SessionId::NULL`], `NotFound` if no registry
    /// publishes the session, `InternalFailure` if discovery fails.
    pub async fn session_info(&self, id: SessionId) -> Result<SessionInfo> {
        if id.is_null() {
            return Err(SessionError::InvalidArgument(
                "reserved session id".into(),
            ));
        }
        let local = self
            .with_item(id, |item| item.info(&self.inner.service_name))
            .ok();
        if let Some(info) = local {
            return Ok(info);
        }

        let objects = self.find_session_item_objects().await?;
        tracing::debug!(count = objects.len(), "external session objects");
        let mut sessions = self.sessions_info(&objects, Some(&[id])).await;
        sessions.remove(&id).ok_or(SessionError::NotFound(id))
    }

    /// Details of every session on the bus, local ones first.
    ///
    /// # Errors
    /// `InternalFailure` if discovery fails.
    pub async fn all_sessions(&self) -> Result<BTreeMap<SessionId, SessionInfo>> {
        let mut sessions: BTreeMap<SessionId, SessionInfo> = {
            let state = self.inner.state.lock();
            state
                .items
                .values()
                .map(|item| (item.id(), item.info(&self.inner.service_name)))
                .collect()
        };

        let objects = self.find_session_item_objects().await?;
        for (id, info) in self.sessions_info(&objects, None).await {
            sessions.entry(id).or_insert(info);
        }
        Ok(sessions)
    }
}

/// The registry's own bus object, serving remote build commits.
struct ManagerObject<B: Bus> {
    registry: Weak<Inner<B>>,
}

#[async_trait]
impl<B: Bus> BusObject for ManagerObject<B> {
    fn interfaces(&self) -> Vec<String> {
        vec![SESSION_BUILD_IFACE.to_owned()]
    }

    fn properties(&self) -> InterfaceMap {
        let mut ifaces = InterfaceMap::new();
        ifaces.insert(SESSION_BUILD_IFACE.to_owned(), PropertyMap::new());
        ifaces
    }

    async fn call(&self, method: SessionMethod) -> Result<(), BusError> {
        let SessionMethod::CommitSessionBuild {
            username,
            remote_addr,
        } = &method
        else {
            return Err(BusError::UnknownMethod {
                path: MANAGER_OBJECT_PATH.to_owned(),
                method: method.name().to_owned(),
            });
        };
        let registry = self
            .registry
            .upgrade()
            .map(SessionManager::from_inner)
            .ok_or_else(|| BusError::Unavailable("session registry is gone".into()))?;
        registry
            .commit_session_build(username, remote_addr)
            .await
            .map_err(|e| BusError::MethodFailed {
                method: method.name().to_owned(),
                message: e.to_string(),
            })
    }
}
