//! Bus-wide session registry.
//!
//! Provides:
//! - `SessionManager` - Per-service registry with two-phase session build
//! - `SessionItem`, `SessionHandle` - Session storage and its bus object
//! - Discovery and removal of sessions published by other registries
//! - Bus implementations (memory)

pub mod bus;
pub mod config;
mod discovery;
pub mod item;
pub mod manager;
mod transaction;

#[cfg(feature = "memory")]
pub use bus::MemoryBus;
pub use config::{DEFAULT_BUILD_TIMEOUT, RegistryConfig};
pub use item::{CleanupFn, SessionHandle, SessionItem};
pub use manager::SessionManager;
pub use session_registry_core::{
    Bus, BusError, Result, SessionError, SessionId, SessionInfo, SessionType,
};
