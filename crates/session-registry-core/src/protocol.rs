//! Bus-facing names, property values and remote methods.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Association, SessionId};

/// Service name prefix; a registry publishes as `<prefix><slug>`.
pub const SERVICE_NAME_PREFIX: &str = "xyz.openbmc_project.Session.";
/// Object path of every registry's manager object.
pub const MANAGER_OBJECT_PATH: &str = "/xyz/openbmc_project/session_manager";
/// Parent path of user objects in the identity directory.
pub const USER_OBJECT_ROOT: &str = "/xyz/openbmc_project/user";

pub const SESSION_ITEM_IFACE: &str = "xyz.openbmc_project.Session.Item";
pub const SESSION_BUILD_IFACE: &str = "xyz.openbmc_project.Session.Build";
pub const ASSOCIATION_DEFINITIONS_IFACE: &str = "xyz.openbmc_project.Association.Definitions";
pub const ASSOCIATION_IFACE: &str = "xyz.openbmc_project.Association";
pub const OBJECT_DELETE_IFACE: &str = "xyz.openbmc_project.Object.Delete";
pub const USER_ATTRIBUTES_IFACE: &str = "xyz.openbmc_project.User.Attributes";

pub const PROP_SESSION_ID: &str = "SessionID";
pub const PROP_SESSION_TYPE: &str = "SessionType";
pub const PROP_REMOTE_IP_ADDR: &str = "RemoteIPAddr";
pub const PROP_ASSOCIATIONS: &str = "Associations";
pub const PROP_ENDPOINTS: &str = "endpoints";

/// Forward name of the owner association.
pub const OWNER_FORWARD: &str = "user";
/// Reverse name of the owner association.
pub const OWNER_REVERSE: &str = "session";

/// Value of a published property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Str(String),
    StrList(Vec<String>),
    Associations(Vec<Association>),
}

impl PropertyValue {
    /// Borrow as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as a string list, if it is one.
    #[must_use]
    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Self::StrList(l) => Some(l),
            _ => None,
        }
    }

    /// Borrow as association definitions, if they are.
    #[must_use]
    pub fn as_associations(&self) -> Option<&[Association]> {
        match self {
            Self::Associations(a) => Some(a),
            _ => None,
        }
    }
}

/// Property name to value.
pub type PropertyMap = BTreeMap<String, PropertyValue>;
/// Interface name to its properties.
pub type InterfaceMap = BTreeMap<String, PropertyMap>;
/// Object path to its interfaces, as returned by the object directory.
pub type ManagedObjects = BTreeMap<String, InterfaceMap>;
/// Service name to the interfaces it implements for one object.
pub type ServiceMap = BTreeMap<String, Vec<String>>;
/// Object path to the services hosting it.
pub type SubTree = BTreeMap<String, ServiceMap>;

/// Remote methods exposed by session and manager objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "PascalCase")]
pub enum SessionMethod {
    /// Close the session, optionally running its cleanup routine.
    Close { with_cleanup: bool },
    /// Assign owner and remote address of a session.
    SetSessionMetadata { username: String, remote_addr: String },
    /// Remove the session object.
    Delete,
    /// Complete a pending session build on a manager object.
    CommitSessionBuild { username: String, remote_addr: String },
}

impl SessionMethod {
    /// Member name on the bus.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Close { .. } => "Close",
            Self::SetSessionMetadata { .. } => "SetSessionMetadata",
            Self::Delete => "Delete",
            Self::CommitSessionBuild { .. } => "CommitSessionBuild",
        }
    }
}

/// Service name of the registry identified by `slug`.
#[must_use]
pub fn service_name(slug: &str) -> String {
    format!("{SERVICE_NAME_PREFIX}{slug}")
}

/// Parent path of all session objects of the registry identified by `slug`.
#[must_use]
pub fn registry_object_path(slug: &str) -> String {
    format!("{MANAGER_OBJECT_PATH}/{slug}")
}

/// Object path of a session published by the registry identified by `slug`.
#[must_use]
pub fn session_object_path(slug: &str, id: SessionId) -> String {
    format!("{}/{}", registry_object_path(slug), id.to_hex())
}

/// Object path of a user in the identity directory.
#[must_use]
pub fn user_object_path(username: &str) -> String {
    format!("{USER_OBJECT_ROOT}/{username}")
}

/// Whether `path` is the association object listing a user's sessions.
#[must_use]
pub fn is_user_sessions_path(path: &str) -> bool {
    path.starts_with(USER_OBJECT_ROOT) && path.ends_with(&format!("/{OWNER_REVERSE}"))
}

/// Whether `slug` can be embedded in a service name and object path.
#[must_use]
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let id = SessionId::from_raw(0x1234);
        assert_eq!(service_name("ssh"), "xyz.openbmc_project.Session.ssh");
        assert_eq!(
            session_object_path("ssh", id),
            "/xyz/openbmc_project/session_manager/ssh/0000000000001234"
        );
        assert!(is_user_sessions_path("/xyz/openbmc_project/user/admin/session"));
        assert!(!is_user_sessions_path("/xyz/openbmc_project/user/admin"));
        assert!(!is_user_sessions_path("/xyz/openbmc_project/session_manager/ssh/session"));
    }

    #[test]
    fn test_slug_validation() {
        assert!(is_valid_slug("web_ui2"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("web.ui"));
        assert!(!is_valid_slug("web/ui"));
    }

    #[test]
    fn test_method_serialization() {
        let msg = SessionMethod::Close { with_cleanup: false };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("Close"));

        let parsed: SessionMethod = serde_json::from_str(&json).unwrap();
        if let SessionMethod::Close { with_cleanup } = parsed {
            assert!(!with_cleanup);
        } else {
            panic!("Wrong method");
        }
        assert_eq!(parsed.name(), "Close");
    }

    #[test]
    fn test_property_accessors() {
        let value = PropertyValue::Str("10.0.0.1".into());
        assert_eq!(value.as_str(), Some("10.0.0.1"));
        assert!(value.as_str_list().is_none());
        assert!(value.as_associations().is_none());
    }
}
