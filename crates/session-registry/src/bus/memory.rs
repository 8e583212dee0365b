//! In-memory bus.
//!
//! Useful for development, tests and single-process deployments where
//! several registries share one process. Emulates the object directory
//! (association objects are derived from published `Associations`) and the
//! user directory.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use session_registry_core::{
    BusError, BusObject, IdentityDirectory, ObjectDirectory, PropertyValue, SessionBus,
    SessionMethod,
    protocol::{
        ASSOCIATION_DEFINITIONS_IFACE, ASSOCIATION_IFACE, InterfaceMap, ManagedObjects,
        PROP_ASSOCIATIONS, PROP_ENDPOINTS, PropertyMap, ServiceMap, user_object_path,
    },
};

/// Name the emulated object directory answers as.
const DIRECTORY_SERVICE: &str = "xyz.openbmc_project.ObjectMapper";

#[derive(Default)]
struct State {
    names: BTreeSet<String>,
    objects: BTreeMap<(String, String), Arc<dyn BusObject>>,
    users: BTreeSet<String>,
    failing_services: BTreeSet<String>,
    directory_down: bool,
}

/// In-memory bus implementation.
#[derive(Default)]
pub struct MemoryBus {
    state: RwLock<State>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with the identity directory.
    pub fn add_user(&self, username: impl Into<String>) {
        self.state.write().users.insert(username.into());
    }

    /// Remove a user from the identity directory.
    pub fn remove_user(&self, username: &str) {
        self.state.write().users.remove(username);
    }

    /// Make every property read and method call to `service` fail.
    pub fn fail_service(&self, service: impl Into<String>) {
        self.state.write().failing_services.insert(service.into());
    }

    /// Undo [`fail_service`](Self::fail_service).
    pub fn restore_service(&self, service: &str) {
        self.state.write().failing_services.remove(service);
    }

    /// Make the object and identity directories unavailable.
    pub fn set_directory_available(&self, available: bool) {
        self.state.write().directory_down = !available;
    }

    /// Whether an object is published at `path` by `service`.
    #[must_use]
    pub fn is_published(&self, service: &str, path: &str) -> bool {
        self.state
            .read()
            .objects
            .contains_key(&(service.to_owned(), path.to_owned()))
    }

    /// Paths published by `service`.
    #[must_use]
    pub fn published_paths(&self, service: &str) -> Vec<String> {
        self.state
            .read()
            .objects
            .keys()
            .filter(|(s, _)| s == service)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn object(&self, service: &str, path: &str) -> Result<Arc<dyn BusObject>, BusError> {
        let state = self.state.read();
        if state.failing_services.contains(service) {
            return Err(BusError::Unavailable(format!("{service} is not responding")));
        }
        if !state.names.contains(service) {
            return Err(BusError::UnknownService(service.to_owned()));
        }
        state
            .objects
            .get(&(service.to_owned(), path.to_owned()))
            .cloned()
            .ok_or_else(|| BusError::UnknownObject {
                service: service.to_owned(),
                path: path.to_owned(),
            })
    }

    fn check_directory(&self) -> Result<(), BusError> {
        if self.state.read().directory_down {
            return Err(BusError::Unavailable(format!(
                "{DIRECTORY_SERVICE} is not responding"
            )));
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<((String, String), Arc<dyn BusObject>)> {
        self.state
            .read()
            .objects
            .iter()
            .map(|(key, object)| (key.clone(), Arc::clone(object)))
            .collect()
    }
}

fn add_endpoint(objects: &mut ManagedObjects, assoc_path: String, endpoint: &str) {
    let props = objects
        .entry(assoc_path)
        .or_default()
        .entry(ASSOCIATION_IFACE.to_owned())
        .or_default();
    let entry = props
        .entry(PROP_ENDPOINTS.to_owned())
        .or_insert_with(|| PropertyValue::StrList(Vec::new()));
    if let PropertyValue::StrList(list) = entry {
        if !list.iter().any(|e| e == endpoint) {
            list.push(endpoint.to_owned());
        }
    }
}

#[async_trait]
impl SessionBus for MemoryBus {
    async fn request_name(&self, service: &str) -> Result<(), BusError> {
        if self.state.write().names.insert(service.to_owned()) {
            Ok(())
        } else {
            Err(BusError::NameTaken(service.to_owned()))
        }
    }

    async fn publish(
        &self,
        service: &str,
        path: &str,
        object: Arc<dyn BusObject>,
    ) -> Result<(), BusError> {
        let mut state = self.state.write();
        let key = (service.to_owned(), path.to_owned());
        if state.objects.contains_key(&key) {
            return Err(BusError::PathInUse(path.to_owned()));
        }
        state.objects.insert(key, object);
        tracing::trace!(service, path, "object published");
        Ok(())
    }

    fn unpublish(&self, service: &str, path: &str) {
        let removed = self
            .state
            .write()
            .objects
            .remove(&(service.to_owned(), path.to_owned()));
        if removed.is_some() {
            tracing::trace!(service, path, "object unpublished");
        }
    }

    async fn get_all_properties(
        &self,
        service: &str,
        path: &str,
    ) -> Result<PropertyMap, BusError> {
        let object = self.object(service, path)?;
        Ok(object.properties().into_values().flatten().collect())
    }

    async fn call(
        &self,
        service: &str,
        path: &str,
        method: SessionMethod,
    ) -> Result<(), BusError> {
        let object = self.object(service, path)?;
        object.call(method).await
    }

    async fn call_no_reply(
        &self,
        service: &str,
        path: &str,
        method: SessionMethod,
    ) -> Result<(), BusError> {
        let object = self.object(service, path)?;
        let name = method.name();
        if let Err(e) = object.call(method).await {
            tracing::debug!(service, path, method = name, error = %e, "one-way call failed");
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectDirectory for MemoryBus {
    async fn managed_objects(&self) -> Result<ManagedObjects, BusError> {
        self.check_directory()?;

        let mut managed = ManagedObjects::new();
        for ((_, path), object) in self.snapshot() {
            let ifaces: InterfaceMap = object.properties();
            let associations = ifaces
                .get(ASSOCIATION_DEFINITIONS_IFACE)
                .and_then(|props| props.get(PROP_ASSOCIATIONS))
                .and_then(PropertyValue::as_associations)
                .map(<[_]>::to_vec)
                .unwrap_or_default();

            for assoc in associations {
                add_endpoint(
                    &mut managed,
                    format!("{}/{}", assoc.endpoint, assoc.reverse),
                    &path,
                );
                add_endpoint(&mut managed, format!("{path}/{}", assoc.forward), &assoc.endpoint);
            }
            managed.entry(path).or_default().extend(ifaces);
        }
        Ok(managed)
    }

    async fn get_object(&self, path: &str, interfaces: &[&str]) -> Result<ServiceMap, BusError> {
        self.check_directory()?;

        let services: ServiceMap = self
            .snapshot()
            .into_iter()
            .filter(|((_, p), _)| p == path)
            .filter_map(|((service, _), object)| {
                let ifaces = object.interfaces();
                let wanted = interfaces.is_empty()
                    || ifaces.iter().any(|i| interfaces.contains(&i.as_str()));
                wanted.then_some((service, ifaces))
            })
            .collect();

        if services.is_empty() {
            return Err(BusError::UnknownObject {
                service: DIRECTORY_SERVICE.to_owned(),
                path: path.to_owned(),
            });
        }
        Ok(services)
    }
}

#[async_trait]
impl IdentityDirectory for MemoryBus {
    async fn resolve_user(&self, username: &str) -> Result<Option<String>, BusError> {
        self.check_directory()?;
        let known = self.state.read().users.contains(username);
        Ok(known.then(|| user_object_path(username)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use session_registry_core::{Association, protocol::SESSION_ITEM_IFACE};

    use super::*;

    struct Counter {
        calls: AtomicUsize,
        owner: Option<Association>,
    }

    #[async_trait]
    impl BusObject for Counter {
        fn interfaces(&self) -> Vec<String> {
            vec![SESSION_ITEM_IFACE.to_owned(), ASSOCIATION_DEFINITIONS_IFACE.to_owned()]
        }

        fn properties(&self) -> InterfaceMap {
            let mut assoc = PropertyMap::new();
            assoc.insert(
                PROP_ASSOCIATIONS.into(),
                PropertyValue::Associations(self.owner.iter().cloned().collect()),
            );
            let mut ifaces = InterfaceMap::new();
            ifaces.insert(ASSOCIATION_DEFINITIONS_IFACE.into(), assoc);
            ifaces
        }

        async fn call(&self, _method: SessionMethod) -> Result<(), BusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter(owner: Option<&str>) -> Arc<Counter> {
        Arc::new(Counter {
            calls: AtomicUsize::new(0),
            owner: owner.map(|u| Association::new("user", "session", user_object_path(u))),
        })
    }

    #[tokio::test]
    async fn test_request_name_once() {
        let bus = MemoryBus::new();
        bus.request_name("svc.a").await.unwrap();
        assert!(matches!(
            bus.request_name("svc.a").await,
            Err(BusError::NameTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_call_unpublish() {
        let bus = MemoryBus::new();
        bus.request_name("svc.a").await.unwrap();
        let object = counter(None);
        bus.publish("svc.a", "/obj/1", object.clone()).await.unwrap();
        assert!(bus.publish("svc.a", "/obj/1", object.clone()).await.is_err());

        bus.call("svc.a", "/obj/1", SessionMethod::Delete).await.unwrap();
        assert_eq!(object.calls.load(Ordering::SeqCst), 1);

        bus.unpublish("svc.a", "/obj/1");
        assert!(!bus.is_published("svc.a", "/obj/1"));
        assert!(matches!(
            bus.call("svc.a", "/obj/1", SessionMethod::Delete).await,
            Err(BusError::UnknownObject { .. })
        ));
    }

    #[tokio::test]
    async fn test_association_objects() {
        let bus = MemoryBus::new();
        bus.request_name("svc.a").await.unwrap();
        bus.publish("svc.a", "/obj/1", counter(Some("admin"))).await.unwrap();
        bus.publish("svc.a", "/obj/2", counter(Some("admin"))).await.unwrap();
        bus.publish("svc.a", "/obj/3", counter(None)).await.unwrap();

        let managed = bus.managed_objects().await.unwrap();
        let endpoints = managed["/xyz/openbmc_project/user/admin/session"][ASSOCIATION_IFACE]
            [PROP_ENDPOINTS]
            .as_str_list()
            .unwrap();
        assert_eq!(endpoints, ["/obj/1", "/obj/2"]);
        assert!(managed.contains_key("/obj/1/user"));
    }

    #[tokio::test]
    async fn test_get_object_filters_by_interface() {
        let bus = MemoryBus::new();
        bus.request_name("svc.a").await.unwrap();
        bus.publish("svc.a", "/obj/1", counter(None)).await.unwrap();

        let services = bus.get_object("/obj/1", &[SESSION_ITEM_IFACE]).await.unwrap();
        assert!(services.contains_key("svc.a"));
        assert!(bus.get_object("/obj/1", &["other.Iface"]).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_service() {
        let bus = MemoryBus::new();
        bus.request_name("svc.a").await.unwrap();
        bus.publish("svc.a", "/obj/1", counter(None)).await.unwrap();
        bus.fail_service("svc.a");
        assert!(matches!(
            bus.get_all_properties("svc.a", "/obj/1").await,
            Err(BusError::Unavailable(_))
        ));
        bus.restore_service("svc.a");
        assert!(bus.get_all_properties("svc.a", "/obj/1").await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_user() {
        let bus = MemoryBus::new();
        bus.add_user("admin");
        assert_eq!(
            bus.resolve_user("admin").await.unwrap().as_deref(),
            Some("/xyz/openbmc_project/user/admin")
        );
        assert!(bus.resolve_user("guest").await.unwrap().is_none());
        bus.set_directory_available(false);
        assert!(bus.resolve_user("admin").await.is_err());
    }
}
