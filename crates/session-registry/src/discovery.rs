//! Discovery of sessions published by other registries.
//!
//! Sessions owned by a user are reachable through the association object
//! `/xyz/openbmc_project/user/<name>/session`, whose `endpoints` list the
//! session object paths. Each candidate is resolved and read independently;
//! a failing candidate is logged and skipped.

use std::collections::{BTreeMap, BTreeSet};

use session_registry_core::{
    Bus, BusError, PropertyValue, SessionId, SessionInfo, SessionMethod, SessionType,
    error::Result,
    protocol::{
        ASSOCIATION_IFACE, OWNER_FORWARD, PROP_ASSOCIATIONS, PROP_ENDPOINTS, PROP_REMOTE_IP_ADDR,
        PROP_SESSION_TYPE, PropertyMap, SESSION_ITEM_IFACE, SubTree, is_user_sessions_path,
    },
    username_from_object_path,
};

use crate::manager::SessionManager;

impl<B: Bus> SessionManager<B> {
    /// Session objects published by other registries, keyed by object path.
    ///
    /// # Errors
    /// `InternalFailure` if the object directory cannot be listed.
    pub(crate) async fn find_session_item_objects(&self) -> Result<SubTree> {
        let local: BTreeSet<SessionId> = self.local_ids().into_iter().collect();
        let managed = self.bus().managed_objects().await?;
        tracing::debug!(count = managed.len(), "fetched managed objects");

        let mut found = SubTree::new();
        for (path, ifaces) in &managed {
            if !is_user_sessions_path(path) {
                continue;
            }
            let Some(endpoints) = ifaces
                .get(ASSOCIATION_IFACE)
                .and_then(|props| props.get(PROP_ENDPOINTS))
                .and_then(PropertyValue::as_str_list)
            else {
                tracing::debug!(path = %path, "user session object without endpoints");
                continue;
            };

            for endpoint in endpoints {
                let id = match SessionId::from_object_path(endpoint) {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::warn!(path = %endpoint, error = %e, "invalid session object path");
                        continue;
                    }
                };
                if local.contains(&id) {
                    continue;
                }
                match self.bus().get_object(endpoint, &[SESSION_ITEM_IFACE]).await {
                    Ok(services) => {
                        found.insert(endpoint.clone(), services);
                    }
                    Err(e) => {
                        tracing::error!(path = %endpoint, error = %e, "failed to query session object");
                    }
                }
            }
        }

        tracing::debug!(count = found.len(), "found external session objects");
        Ok(found)
    }

    /// Read the details of the discovered session objects, optionally only
    /// of those in `only`.
    pub(crate) async fn sessions_info(
        &self,
        objects: &SubTree,
        only: Option<&[SessionId]>,
    ) -> BTreeMap<SessionId, SessionInfo> {
        let mut sessions = BTreeMap::new();
        for (path, services) in objects {
            let Some(service) = services.keys().next() else {
                tracing::debug!(path = %path, "session object without service, skipping");
                continue;
            };
            let id = match SessionId::from_object_path(path) {
                Ok(id) if !id.is_null() => id,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "invalid session object path");
                    continue;
                }
            };
            if only.is_some_and(|ids| !ids.contains(&id)) {
                continue;
            }

            let properties = match self.bus().get_all_properties(service, path).await {
                Ok(properties) => properties,
                Err(e) => {
                    tracing::error!(
                        path = %path,
                        service = %service,
                        error = %e,
                        "failed to read session properties"
                    );
                    continue;
                }
            };
            match session_info_from_properties(id, service, path, &properties) {
                Some(info) => {
                    sessions.insert(id, info);
                }
                None => tracing::warn!(path = %path, "session object without valid type, skipping"),
            }
        }
        sessions
    }

    /// Ask the registry `service` to close the session at `path`.
    pub(crate) async fn call_close_session(
        &self,
        service: &str,
        path: &str,
        with_cleanup: bool,
    ) -> Result<(), BusError> {
        tracing::debug!(service, path, with_cleanup, "close remote session");
        self.bus()
            .call(service, path, SessionMethod::Close { with_cleanup })
            .await
    }
}

/// Decode a remote session from its flattened properties.
///
/// Returns `None` without a recognizable `SessionType`.
fn session_info_from_properties(
    id: SessionId,
    service: &str,
    path: &str,
    properties: &PropertyMap,
) -> Option<SessionInfo> {
    let session_type = properties
        .get(PROP_SESSION_TYPE)
        .and_then(PropertyValue::as_str)
        .and_then(|s| s.parse::<SessionType>().ok())?;

    let remote_address = properties
        .get(PROP_REMOTE_IP_ADDR)
        .and_then(PropertyValue::as_str)
        .unwrap_or_default()
        .to_owned();

    let username = properties
        .get(PROP_ASSOCIATIONS)
        .and_then(PropertyValue::as_associations)
        .and_then(|assocs| assocs.iter().find(|a| a.forward == OWNER_FORWARD))
        .map(|assoc| username_from_object_path(&assoc.endpoint).to_owned());

    Some(SessionInfo {
        id,
        username,
        remote_address,
        session_type,
        service_name: service.to_owned(),
        object_path: path.to_owned(),
        is_own: false,
    })
}
