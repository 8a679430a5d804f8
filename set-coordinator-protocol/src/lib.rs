//! Set Coordinator Protocol Implementation
//!
//! This library coordinates connections to devices that belong to coordinated
//! sets (for example a pair of earbuds): one connection state machine per
//! device, group membership ordered by rank, and an exclusive lock per group.
//! Radio commands go out through [`NativeInterface`]; their outcomes come back
//! as [`StackEvent`]s.

pub mod address;
pub mod device;
pub mod events;
pub mod group;
pub mod native;
pub mod policy;
pub mod service;
pub mod state_machine;

mod error;

pub use address::PeerAddress;
pub use device::{BondState, ConnectionPolicy, ConnectionState};
pub use error::{CoordinatorError, Result};
pub use events::{CoordinatorEvent, EventHub, StackEvent};
pub use group::{
    GroupCoordinator, GroupId, GroupSnapshot, LockCallback, LockOutcome, LockStatus, LockToken,
    Rank,
};
pub use native::NativeInterface;
pub use policy::{ConnectionGate, PolicyRegistry, PolicyStore};
pub use service::{
    ConnectionService, DeviceSnapshot, ServiceConfig, ServiceSnapshot, COORDINATED_SET_UUID,
};
pub use state_machine::{PeerConfig, PeerHandle, PeerMessage};

#[cfg(test)]
pub mod test_utils;
