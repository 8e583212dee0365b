//! Session records shared between registries.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SessionId;

/// Prefix of the fully-qualified session type names on the wire.
const TYPE_PREFIX: &str = "xyz.openbmc_project.Session.Item.Type.";

/// Kind of service a session was opened through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    HostConsole,
    #[serde(rename = "IPMI")]
    Ipmi,
    #[serde(rename = "KVMIP")]
    KvmIp,
    ManagerConsole,
    Redfish,
    VirtualMedia,
    #[serde(rename = "WebUI")]
    WebUi,
    #[serde(rename = "NBD")]
    Nbd,
}

/// Error parsing a session type name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown session type: {0}")]
pub struct ParseSessionTypeError(pub String);

impl SessionType {
    /// All session types.
    pub const ALL: [Self; 8] = [
        Self::HostConsole,
        Self::Ipmi,
        Self::KvmIp,
        Self::ManagerConsole,
        Self::Redfish,
        Self::VirtualMedia,
        Self::WebUi,
        Self::Nbd,
    ];

    /// Short name, e.g. `Redfish`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::HostConsole => "HostConsole",
            Self::Ipmi => "IPMI",
            Self::KvmIp => "KVMIP",
            Self::ManagerConsole => "ManagerConsole",
            Self::Redfish => "Redfish",
            Self::VirtualMedia => "VirtualMedia",
            Self::WebUi => "WebUI",
            Self::Nbd => "NBD",
        }
    }

    /// Fully-qualified name as published in the `SessionType` property.
    #[must_use]
    pub fn wire_name(self) -> String {
        format!("{TYPE_PREFIX}{}", self.name())
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SessionType {
    type Err = ParseSessionTypeError;

    /// Accepts both the fully-qualified and the short name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s.strip_prefix(TYPE_PREFIX).unwrap_or(s);
        Self::ALL
            .into_iter()
            .find(|t| t.name() == short)
            .ok_or_else(|| ParseSessionTypeError(s.to_owned()))
    }
}

/// Association definition: `(forward, reverse, endpoint)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Association {
    pub forward: String,
    pub reverse: String,
    pub endpoint: String,
}

impl Association {
    /// Create an association definition.
    #[must_use]
    pub fn new(
        forward: impl Into<String>,
        reverse: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            forward: forward.into(),
            reverse: reverse.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Snapshot of one session, local or discovered on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Owner username, absent until the session build is committed.
    pub username: Option<String>,
    /// Address of the session initiator.
    pub remote_address: String,
    /// Kind of session.
    pub session_type: SessionType,
    /// Bus service name of the owning registry.
    pub service_name: String,
    /// Object path of the published session.
    pub object_path: String,
    /// Whether the querying registry owns the session.
    pub is_own: bool,
}
