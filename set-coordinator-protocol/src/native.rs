//! Native radio stack interface
//!
//! The coordinator never talks to the radio directly. It issues commands
//! through [`NativeInterface`], whose methods are fire-and-forget: the return
//! value only says whether the command could be issued. The real outcome
//! arrives later as a [`StackEvent`](crate::StackEvent) fed into
//! [`ConnectionService::handle_stack_event`](crate::ConnectionService::handle_stack_event).

use crate::group::GroupId;
use crate::PeerAddress;

/// Commands the coordinator issues to the radio stack
///
/// Implementations must not block; they are called from the dispatcher and
/// from per-device state machine tasks.
pub trait NativeInterface: Send + Sync {
    /// Start a profile connection to `address`
    fn connect(&self, address: &PeerAddress) -> bool;

    /// Tear down the profile connection to `address`
    fn disconnect(&self, address: &PeerAddress) -> bool;

    /// Request (`lock = true`) or release (`lock = false`) the exclusive
    /// lock of a coordinated set
    fn group_lock_set(&self, group_id: GroupId, lock: bool) -> bool;
}
