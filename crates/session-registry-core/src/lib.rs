//! Core abstractions for the bus-wide session registry.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionId` - Reserved-zero 64-bit identifier with hex wire form
//! - `SessionType`, `SessionInfo` - Session records
//! - `protocol` - Bus names, properties and remote methods
//! - Bus, object directory and identity directory traits

pub mod error;
pub mod id;
pub mod protocol;
pub mod traits;
pub mod types;

pub use error::{Result, SessionError};
pub use id::{ParseSessionIdError, SessionId, username_from_object_path};
pub use protocol::{PropertyMap, PropertyValue, SessionMethod};
pub use traits::{Bus, BusError, BusObject, IdentityDirectory, ObjectDirectory, SessionBus};
pub use types::{Association, ParseSessionTypeError, SessionInfo, SessionType};
