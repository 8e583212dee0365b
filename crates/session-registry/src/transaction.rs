//! Session build transactions.
//!
//! A build transaction publishes a session without owner and address and
//! gives the caller a bounded window to commit metadata for it. At most one
//! transaction is pending per registry. A watcher task tears the session down
//! if the window elapses first.

use std::{sync::Weak, time::Duration};

use session_registry_core::{Bus, SessionId};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, sleep_until},
};

use crate::manager::{Inner, SessionManager};

/// The pending build slot of a registry.
#[derive(Debug)]
pub(crate) struct PendingBuild {
    session_id: SessionId,
    deadline: Instant,
    resolved_tx: Option<oneshot::Sender<()>>,
}

impl PendingBuild {
    /// Start a build for `session_id` that must be committed within `window`.
    ///
    /// The returned receiver fires once the build is resolved.
    pub(crate) fn start(session_id: SessionId, window: Duration) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            session_id,
            deadline: Instant::now() + window,
            resolved_tx: Some(tx),
        };
        (pending, rx)
    }

    pub(crate) const fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub(crate) const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Release the watcher waiting on this build.
    pub(crate) fn resolve(mut self) {
        if let Some(tx) = self.resolved_tx.take() {
            // The watcher may already have exited.
            let _ = tx.send(());
        }
    }
}

/// Spawn the task guarding the deadline of a pending build.
///
/// If `resolved_rx` fires (or its sender is dropped) first, the watcher exits
/// without touching the registry. Otherwise it asks the registry to expire
/// the build, which re-checks under the registry lock that the same build is
/// still pending.
pub(crate) fn spawn_watcher<B: Bus>(
    registry: Weak<Inner<B>>,
    session_id: SessionId,
    deadline: Instant,
    resolved_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = resolved_rx => {
                tracing::debug!(session_id = %session_id, "session build resolved");
                return;
            }
            () = sleep_until(deadline) => {}
        }

        let Some(inner) = registry.upgrade() else {
            return;
        };
        let registry = SessionManager::from_inner(inner);
        if registry.expire_pending_build(session_id) {
            tracing::warn!(
                service = registry.service_name(),
                session_id = %session_id,
                "session build timed out, session removed"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_resolve_signals_receiver() {
        let (pending, rx) = PendingBuild::start(SessionId::from_raw(1), Duration::from_secs(20));
        assert_eq!(pending.session_id(), SessionId::from_raw(1));
        pending.resolve();
        assert!(rx.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_window_from_now() {
        let start = Instant::now();
        let (pending, _rx) = PendingBuild::start(SessionId::from_raw(1), Duration::from_secs(20));
        assert_eq!(pending.deadline() - start, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_dropped_build_releases_receiver() {
        let (pending, rx) = PendingBuild::start(SessionId::from_raw(2), Duration::from_secs(20));
        drop(pending);
        assert!(rx.await.is_err());
    }
}
