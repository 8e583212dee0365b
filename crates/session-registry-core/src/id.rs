//! Session identifiers and their hex wire form.

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of hex digits in the wire form of an identifier.
pub const HEX_WIDTH: usize = 16;

/// Opaque 64-bit session identifier.
///
/// Unique within the namespace of every registry sharing one object
/// directory. The zero value is reserved and never names a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

/// Error parsing a session identifier from its hex form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseSessionIdError {
    #[error("empty session id")]
    Empty,
    #[error("session id longer than {HEX_WIDTH} hex digits: {0}")]
    TooLong(String),
    #[error("invalid hex session id: {0}")]
    InvalidDigit(String),
}

impl SessionId {
    /// The reserved identifier. Returned by operations that decline to
    /// create a session without raising an error.
    pub const NULL: Self = Self(0);

    /// Wrap a raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw integer value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Whether this is the reserved identifier.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Generate a new identifier for the registry publishing under
    /// `service_name`, using the current wall-clock time.
    ///
    /// Best-effort uniqueness: two registries with different service names
    /// land in different namespaces for the same timestamp, but collisions
    /// are not provably excluded.
    #[must_use]
    pub fn generate(service_name: &str) -> Self {
        loop {
            let id = Self::generate_at(timestamp_nanos(), service_name);
            if !id.is_null() {
                return id;
            }
        }
    }

    /// Deterministic core of [`generate`](Self::generate).
    ///
    /// May return [`SessionId::NULL`]; callers must regenerate in that case.
    #[must_use]
    pub fn generate_at(timestamp_nanos: u128, service_name: &str) -> Self {
        let time_hash = hash_of(&timestamp_nanos);
        let service_hash = hash_of(service_name);
        Self(time_hash ^ (service_hash << 1))
    }

    /// Fixed-width lowercase hex form, as used in object paths.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:0width$x}", self.0, width = HEX_WIDTH)
    }

    /// Parse the identifier from the last segment of a session object path.
    ///
    /// # Errors
    /// Returns error if the last segment is not a valid hex identifier.
    pub fn from_object_path(path: &str) -> Result<Self, ParseSessionIdError> {
        last_segment(path).parse()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for SessionId {
    type Err = ParseSessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseSessionIdError::Empty);
        }
        if s.len() > HEX_WIDTH {
            return Err(ParseSessionIdError::TooLong(s.to_owned()));
        }
        // `from_str_radix` tolerates a leading sign; the wire form never has one.
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseSessionIdError::InvalidDigit(s.to_owned()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ParseSessionIdError::InvalidDigit(s.to_owned()))
    }
}

/// Username encoded as the last segment of a user object path.
#[must_use]
pub fn username_from_object_path(path: &str) -> &str {
    last_segment(path)
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn timestamp_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_is_fixed_width() {
        assert_eq!(SessionId::from_raw(0xab).to_hex(), "00000000000000ab");
        assert_eq!(
            SessionId::from_raw(u64::MAX).to_hex(),
            "ffffffffffffffff"
        );
    }

    #[test]
    fn test_parse_hex() {
        let id: SessionId = "00000000deadbeef".parse().unwrap();
        assert_eq!(id.as_raw(), 0xdead_beef);

        let short: SessionId = "1F".parse().unwrap();
        assert_eq!(short.as_raw(), 0x1f);

        let id = SessionId::from_raw(0x0123_4567_89ab_cdef);
        assert_eq!(id.to_hex().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!("".parse::<SessionId>(), Err(ParseSessionIdError::Empty));
        assert!(matches!(
            "+1".parse::<SessionId>(),
            Err(ParseSessionIdError::InvalidDigit(_))
        ));
        assert!(matches!(
            "xyz".parse::<SessionId>(),
            Err(ParseSessionIdError::InvalidDigit(_))
        ));
        assert!(matches!(
            "10000000000000000".parse::<SessionId>(),
            Err(ParseSessionIdError::TooLong(_))
        ));
    }

    #[test]
    fn test_from_object_path() {
        let path = "/xyz/openbmc_project/session_manager/ssh/00000000000000ff";
        assert_eq!(
            SessionId::from_object_path(path).unwrap(),
            SessionId::from_raw(0xff)
        );
        assert!(SessionId::from_object_path("/xyz/openbmc_project/session_manager/ssh/").is_err());
    }

    #[test]
    fn test_username_from_object_path() {
        assert_eq!(
            username_from_object_path("/xyz/openbmc_project/user/admin"),
            "admin"
        );
    }

    #[test]
    fn test_generate_never_null() {
        for _ in 0..64 {
            assert!(!SessionId::generate("xyz.openbmc_project.Session.ssh").is_null());
        }
    }

    #[test]
    fn test_distinct_services_same_tick() {
        let tick = 1_700_000_000_123_456_789;
        let a = SessionId::generate_at(tick, "xyz.openbmc_project.Session.ssh");
        let b = SessionId::generate_at(tick, "xyz.openbmc_project.Session.webui");
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_at_is_deterministic() {
        let tick = 42;
        assert_eq!(
            SessionId::generate_at(tick, "svc"),
            SessionId::generate_at(tick, "svc")
        );
    }
}
