//! Stack events and coordinator notifications
//!
//! [`StackEvent`]s flow in from the native radio layer and are consumed once by
//! the dispatcher. [`CoordinatorEvent`]s flow out to every subscriber of the
//! [`EventHub`].

use crate::device::ConnectionState;
use crate::group::{GroupId, LockStatus, Rank};
use crate::PeerAddress;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Asynchronous event reported by the native radio stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// A coordinated set member was discovered with full set information
    DeviceAvailable {
        /// Device address
        address: PeerAddress,
        /// Group the device belongs to
        group_id: GroupId,
        /// Expected number of members in the group
        group_size: usize,
        /// Rank of the device within the group (lower sorts first)
        rank: Rank,
        /// Coordinated set type identifier
        set_uuid: Uuid,
    },

    /// A further member of a known set was found
    SetMemberAvailable {
        /// Device address
        address: PeerAddress,
        /// Group the device belongs to
        group_id: GroupId,
    },

    /// The profile connection state of a device changed
    ConnectionStateChanged {
        /// Device address
        address: PeerAddress,
        /// Native connection state code (see [`ConnectionState::from_native`])
        state: i32,
    },

    /// The lock state of a group changed
    GroupLockChanged {
        /// Group id
        group_id: GroupId,
        /// Whether the group is now locked
        is_locked: bool,
        /// Native lock status code (see [`LockStatus::from_native`])
        status: i32,
    },
}

impl StackEvent {
    /// Device address, for device-scoped events
    pub fn address(&self) -> Option<PeerAddress> {
        match self {
            StackEvent::DeviceAvailable { address, .. } => Some(*address),
            StackEvent::SetMemberAvailable { address, .. } => Some(*address),
            StackEvent::ConnectionStateChanged { address, .. } => Some(*address),
            StackEvent::GroupLockChanged { .. } => None,
        }
    }
}

/// Notification emitted by the coordinator to its listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A state machine completed a transition
    ConnectionStateChanged {
        /// Device address
        address: PeerAddress,
        /// State before the transition
        previous: ConnectionState,
        /// State after the transition
        current: ConnectionState,
    },

    /// A set member became available
    DeviceAvailable {
        /// Device address
        address: PeerAddress,
        /// Group id
        group_id: GroupId,
        /// Expected group size
        group_size: usize,
        /// Coordinated set type identifier
        set_uuid: Uuid,
    },

    /// A further set member became available
    SetMemberAvailable {
        /// Device address
        address: PeerAddress,
        /// Group id
        group_id: GroupId,
    },

    /// A group lock request was resolved
    GroupLockChanged {
        /// Group id
        group_id: GroupId,
        /// Resolution status
        status: LockStatus,
        /// Whether the group is locked afterwards
        is_locked: bool,
    },
}

impl CoordinatorEvent {
    /// Check if this is a connection state change
    pub fn is_connection_state_changed(&self) -> bool {
        matches!(self, CoordinatorEvent::ConnectionStateChanged { .. })
    }

    /// Get the device address if this event is device-related
    pub fn address(&self) -> Option<PeerAddress> {
        match self {
            CoordinatorEvent::ConnectionStateChanged { address, .. } => Some(*address),
            CoordinatorEvent::DeviceAvailable { address, .. } => Some(*address),
            CoordinatorEvent::SetMemberAvailable { address, .. } => Some(*address),
            CoordinatorEvent::GroupLockChanged { .. } => None,
        }
    }

    /// Get the group id if this event is group-related
    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            CoordinatorEvent::ConnectionStateChanged { .. } => None,
            CoordinatorEvent::DeviceAvailable { group_id, .. } => Some(*group_id),
            CoordinatorEvent::SetMemberAvailable { group_id, .. } => Some(*group_id),
            CoordinatorEvent::GroupLockChanged { group_id, .. } => Some(*group_id),
        }
    }
}

/// Fan-out of coordinator events to any number of listeners
///
/// Every subscriber gets its own unbounded channel. Events from a single
/// emitter arrive in emission order; closed receivers are pruned on the next
/// emit.
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<CoordinatorEvent>>>>,
}

impl EventHub {
    /// Create a hub with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<CoordinatorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Deliver an event to every live listener
    pub async fn emit(&self, event: CoordinatorEvent) {
        let mut saw_closed = false;
        {
            let subscribers = self.subscribers.read().await;
            for tx in subscribers.iter() {
                if tx.send(event.clone()).is_err() {
                    saw_closed = true;
                }
            }
        }

        if saw_closed {
            let mut subscribers = self.subscribers.write().await;
            subscribers.retain(|tx| !tx.is_closed());
            debug!("Pruned closed listeners, {} remaining", subscribers.len());
        }
    }

    /// Number of registered listeners
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0, 0, 0, 0, 0, last])
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let hub = EventHub::new();
        let mut first = hub.subscribe().await;
        let mut second = hub.subscribe().await;

        let event = CoordinatorEvent::SetMemberAvailable {
            address: addr(1),
            group_id: 3,
        };
        hub.emit(event.clone()).await;

        assert_eq!(first.recv().await, Some(event.clone()));
        assert_eq!(second.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let hub = EventHub::new();
        let dropped = hub.subscribe().await;
        let _kept = hub.subscribe().await;
        drop(dropped);

        hub.emit(CoordinatorEvent::GroupLockChanged {
            group_id: 1,
            status: LockStatus::Success,
            is_locked: true,
        })
        .await;

        assert_eq!(hub.subscriber_count().await, 1);
    }

    #[test]
    fn test_event_accessors() {
        let event = CoordinatorEvent::ConnectionStateChanged {
            address: addr(7),
            previous: ConnectionState::Disconnected,
            current: ConnectionState::Connecting,
        };
        assert!(event.is_connection_state_changed());
        assert_eq!(event.address(), Some(addr(7)));
        assert_eq!(event.group_id(), None);

        let stack = StackEvent::GroupLockChanged {
            group_id: 2,
            is_locked: false,
            status: 0,
        };
        assert_eq!(stack.address(), None);
    }
}
