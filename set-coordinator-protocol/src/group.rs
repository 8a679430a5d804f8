//! Group Coordinator
//!
//! Tracks every coordinated set the stack has announced and serializes lock
//! acquisition per set.
//!
//! ## Membership
//!
//! A group record is created by the first announcement that names an unseen
//! group id and lives for the lifetime of the service. Members carry the rank
//! from their DeviceAvailable announcement; lower rank sorts first, ties keep
//! discovery order. Members only seen through SetMemberAvailable have no rank
//! and sort after all ranked members.
//!
//! ## Locking
//!
//! At most one lock entry exists per group. The entry is stored as *pending*
//! before the native lock command is issued, so a second request arriving
//! before the stack confirms is rejected with [`LockStatus::LockedByOther`].
//! The stack's GroupLockChanged event promotes the entry to *held*, or
//! releases it.
//!
//! The coordinator is owned by the service dispatcher and is never shared, so
//! none of this needs locking of its own.

use crate::events::CoordinatorEvent;
use crate::native::NativeInterface;
use crate::PeerAddress;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Coordinated set identifier assigned by the stack
pub type GroupId = i32;

/// Priority of a device within its set (lower value = higher priority)
pub type Rank = i32;

/// Outcome of a lock request, as reported to lock callbacks and listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Lock acquired or released
    Success,
    /// The group id is not known to the stack
    InvalidGroupId,
    /// The group has no members
    GroupEmpty,
    /// No member of the group is connected
    GroupNotConnected,
    /// Another requester holds the lock
    LockedByOther,
    /// Any other failure, including a native command that could not be issued
    OtherReason,
    /// A member of a locked group was lost
    LockedGroupMemberLost,
    /// A status code this coordinator does not know
    Unknown(i32),
}

impl LockStatus {
    /// Map a native lock status code
    pub fn from_native(code: i32) -> Self {
        match code {
            0 => LockStatus::Success,
            1 => LockStatus::InvalidGroupId,
            2 => LockStatus::GroupEmpty,
            3 => LockStatus::GroupNotConnected,
            4 => LockStatus::LockedByOther,
            5 => LockStatus::OtherReason,
            6 => LockStatus::LockedGroupMemberLost,
            other => LockStatus::Unknown(other),
        }
    }

    /// Native code for this status
    pub fn to_native(self) -> i32 {
        match self {
            LockStatus::Success => 0,
            LockStatus::InvalidGroupId => 1,
            LockStatus::GroupEmpty => 2,
            LockStatus::GroupNotConnected => 3,
            LockStatus::LockedByOther => 4,
            LockStatus::OtherReason => 5,
            LockStatus::LockedGroupMemberLost => 6,
            LockStatus::Unknown(code) => code,
        }
    }

    /// Check if the status reports success
    pub fn is_success(&self) -> bool {
        matches!(self, LockStatus::Success)
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStatus::Success => f.write_str("SUCCESS"),
            LockStatus::InvalidGroupId => f.write_str("INVALID_GROUP_ID"),
            LockStatus::GroupEmpty => f.write_str("GROUP_EMPTY"),
            LockStatus::GroupNotConnected => f.write_str("GROUP_NOT_CONNECTED"),
            LockStatus::LockedByOther => f.write_str("GROUP_LOCKED_BY_OTHER"),
            LockStatus::OtherReason => f.write_str("OTHER_REASON"),
            LockStatus::LockedGroupMemberLost => f.write_str("LOCKED_GROUP_MEMBER_LOST"),
            LockStatus::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// Exclusivity grant returned by a successful lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LockToken {
    id: Uuid,
    group_id: GroupId,
}

impl LockToken {
    fn new(group_id: GroupId) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
        }
    }

    /// Unique token identity
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Group the token applies to
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }
}

/// Receiver of lock results
///
/// Invoked exactly once per lock request with a terminal status, and again
/// when the lock is released or lost.
pub trait LockCallback: Send + Sync {
    /// Lock state of `group_id` changed for this requester
    fn on_group_lock_set(&self, group_id: GroupId, status: LockStatus, is_locked: bool);
}

/// Lock result delivered over a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOutcome {
    /// Group id
    pub group_id: GroupId,
    /// Resolution status
    pub status: LockStatus,
    /// Whether the group is locked afterwards
    pub is_locked: bool,
}

impl LockCallback for mpsc::UnboundedSender<LockOutcome> {
    fn on_group_lock_set(&self, group_id: GroupId, status: LockStatus, is_locked: bool) {
        let _ = self.send(LockOutcome {
            group_id,
            status,
            is_locked,
        });
    }
}

/// Known member of a group
#[derive(Debug, Clone)]
struct Member {
    address: PeerAddress,
    /// `None` until a full DeviceAvailable announcement arrives
    rank: Option<Rank>,
    /// Discovery order within the coordinator
    discovered: u64,
    /// When a DeviceAvailable notification was last emitted for this member
    last_notified: Option<Instant>,
}

/// A coordinated set
#[derive(Debug, Clone)]
struct Group {
    size: usize,
    set_uuid: Option<Uuid>,
    members: Vec<Member>,
}

impl Group {
    fn empty() -> Self {
        Self {
            size: 0,
            set_uuid: None,
            members: Vec::new(),
        }
    }

    fn member_mut(&mut self, address: &PeerAddress) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| &m.address == address)
    }

    fn ordered_members(&self) -> Vec<&Member> {
        let mut members: Vec<&Member> = self.members.iter().collect();
        members.sort_by_key(|m| (m.rank.is_none(), m.rank, m.discovered));
        members
    }
}

struct LockEntry {
    token: LockToken,
    callback: Arc<dyn LockCallback>,
    /// Confirmed by the stack
    held: bool,
}

/// Serializable view of a group, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    /// Group id
    pub group_id: GroupId,
    /// Expected member count
    pub size: usize,
    /// Coordinated set type, if announced
    pub set_uuid: Option<Uuid>,
    /// Members in rank order
    pub members: Vec<MemberSnapshot>,
    /// Lock entry state, if any
    pub lock: Option<LockSnapshot>,
}

/// Serializable view of a group member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSnapshot {
    /// Device address
    pub address: PeerAddress,
    /// Rank, if announced
    pub rank: Option<Rank>,
}

/// Serializable view of a lock entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSnapshot {
    /// Token identity
    pub token: Uuid,
    /// Confirmed by the stack
    pub held: bool,
}

/// Group membership and lock bookkeeping
pub struct GroupCoordinator {
    native: Arc<dyn NativeInterface>,
    groups: HashMap<GroupId, Group>,
    locks: HashMap<GroupId, LockEntry>,
    /// Minimum spacing between DeviceAvailable notifications for a changed
    /// re-announcement of the same (device, group)
    min_reannounce_interval: Duration,
    next_discovery: u64,
}

impl GroupCoordinator {
    /// Create an empty coordinator
    pub fn new(native: Arc<dyn NativeInterface>, min_reannounce_interval: Duration) -> Self {
        Self {
            native,
            groups: HashMap::new(),
            locks: HashMap::new(),
            min_reannounce_interval,
            next_discovery: 0,
        }
    }

    fn next_discovery(&mut self) -> u64 {
        let seq = self.next_discovery;
        self.next_discovery += 1;
        seq
    }

    /// Record a DeviceAvailable announcement
    ///
    /// Returns the notification to emit, or `None` when the announcement is
    /// an identical repeat or a changed repeat inside the re-announcement
    /// interval.
    pub fn on_device_available(
        &mut self,
        address: PeerAddress,
        group_id: GroupId,
        group_size: usize,
        rank: Rank,
        set_uuid: Uuid,
    ) -> Option<CoordinatorEvent> {
        let now = Instant::now();
        let discovered = self.next_discovery();
        let interval = self.min_reannounce_interval;

        let group = self.groups.entry(group_id).or_insert_with(|| {
            info!("New group {} of size {} ({})", group_id, group_size, set_uuid);
            Group::empty()
        });

        let group_changed = group.size != group_size || group.set_uuid != Some(set_uuid);
        group.size = group_size;
        group.set_uuid = Some(set_uuid);

        let notify = match group.member_mut(&address) {
            None => {
                group.members.push(Member {
                    address,
                    rank: Some(rank),
                    discovered,
                    last_notified: Some(now),
                });
                info!("Device {} joined group {} with rank {}", address, group_id, rank);
                true
            }
            Some(member) => {
                let changed = group_changed || member.rank != Some(rank);
                member.rank = Some(rank);

                if !changed {
                    debug!("Identical re-announcement of {} in group {}", address, group_id);
                    false
                } else if member
                    .last_notified
                    .map(|at| now.duration_since(at) < interval)
                    .unwrap_or(false)
                {
                    debug!(
                        "Suppressing re-announcement of {} in group {} (rank {}) within {:?}",
                        address, group_id, rank, interval
                    );
                    false
                } else {
                    info!("Device {} re-announced in group {} with rank {}", address, group_id, rank);
                    member.last_notified = Some(now);
                    true
                }
            }
        };

        notify.then_some(CoordinatorEvent::DeviceAvailable {
            address,
            group_id,
            group_size,
            set_uuid,
        })
    }

    /// Record a SetMemberAvailable announcement
    ///
    /// Existing members are left untouched. The notification is always
    /// forwarded.
    pub fn on_set_member_available(
        &mut self,
        address: PeerAddress,
        group_id: GroupId,
    ) -> CoordinatorEvent {
        let discovered = self.next_discovery();
        let group = self.groups.entry(group_id).or_insert_with(Group::empty);

        if group.member_mut(&address).is_none() {
            debug!("Set member {} available in group {}", address, group_id);
            group.members.push(Member {
                address,
                rank: None,
                discovered,
                last_notified: None,
            });
        }

        CoordinatorEvent::SetMemberAvailable { address, group_id }
    }

    /// Request the exclusive lock of a group
    ///
    /// Rejections invoke `callback` before returning `None`. On success the
    /// token is pending until the stack confirms through
    /// [`on_group_lock_changed`](Self::on_group_lock_changed).
    pub fn lock_group(
        &mut self,
        group_id: GroupId,
        callback: Arc<dyn LockCallback>,
    ) -> Option<LockToken> {
        if self.locks.contains_key(&group_id) {
            info!("Group {} is already locked, rejecting request", group_id);
            callback.on_group_lock_set(group_id, LockStatus::LockedByOther, true);
            return None;
        }

        let token = LockToken::new(group_id);
        self.locks.insert(
            group_id,
            LockEntry {
                token,
                callback: callback.clone(),
                held: false,
            },
        );

        if !self.native.group_lock_set(group_id, true) {
            warn!("Failed to issue lock for group {}", group_id);
            self.locks.remove(&group_id);
            callback.on_group_lock_set(group_id, LockStatus::OtherReason, false);
            return None;
        }

        debug!("Lock requested for group {} (token {})", group_id, token.id);
        Some(token)
    }

    /// Release the lock identified by `token`
    ///
    /// Returns whether the native unlock was issued. The entry is cleared
    /// when the stack confirms.
    pub fn unlock_group(&mut self, token: &LockToken) -> bool {
        match self.locks.get(&token.group_id) {
            Some(entry) if entry.token == *token => {}
            _ => {
                warn!(
                    "Unlock with unknown token {} for group {}",
                    token.id, token.group_id
                );
                return false;
            }
        }

        if !self.native.group_lock_set(token.group_id, false) {
            warn!("Failed to issue unlock for group {}", token.group_id);
            return false;
        }

        debug!("Unlock requested for group {}", token.group_id);
        true
    }

    /// Apply a GroupLockChanged stack event
    ///
    /// Returns the listener notification describing the resulting state.
    pub fn on_group_lock_changed(
        &mut self,
        group_id: GroupId,
        is_locked: bool,
        status_code: i32,
    ) -> CoordinatorEvent {
        let status = LockStatus::from_native(status_code);

        let Some(entry) = self.locks.get_mut(&group_id) else {
            debug!(
                "Lock change for group {} with no requester (locked: {}, status: {})",
                group_id, is_locked, status
            );
            return CoordinatorEvent::GroupLockChanged {
                group_id,
                status,
                is_locked,
            };
        };

        if status.is_success() && is_locked {
            entry.held = true;
        }
        let now_locked = entry.held && is_locked;
        let callback = entry.callback.clone();

        if !now_locked {
            self.locks.remove(&group_id);
        }

        info!(
            "Group {} lock changed: status {}, locked {}",
            group_id, status, now_locked
        );
        callback.on_group_lock_set(group_id, status, now_locked);

        CoordinatorEvent::GroupLockChanged {
            group_id,
            status,
            is_locked: now_locked,
        }
    }

    /// Check whether a lock entry (pending or held) exists for the group
    pub fn is_group_locked(&self, group_id: GroupId) -> bool {
        self.locks.contains_key(&group_id)
    }

    /// Group members in ascending rank order
    pub fn group_devices_ordered(&self, group_id: GroupId) -> Vec<PeerAddress> {
        self.groups
            .get(&group_id)
            .map(|g| g.ordered_members().into_iter().map(|m| m.address).collect())
            .unwrap_or_default()
    }

    /// Ids of all groups announced with the given set type, ascending
    pub fn all_group_ids(&self, set_uuid: Uuid) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, g)| g.set_uuid == Some(set_uuid))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Group id of the device within the set type, if it is a member
    pub fn group_id(&self, address: &PeerAddress, set_uuid: Uuid) -> Option<GroupId> {
        self.groups
            .iter()
            .filter(|(_, g)| g.set_uuid == Some(set_uuid))
            .filter(|(_, g)| g.members.iter().any(|m| &m.address == address))
            .map(|(id, _)| *id)
            .min()
    }

    /// Every group the device belongs to, with the group's set type
    pub fn group_uuid_map_by_device(&self, address: &PeerAddress) -> HashMap<GroupId, Uuid> {
        self.groups
            .iter()
            .filter(|(_, g)| g.members.iter().any(|m| &m.address == address))
            .filter_map(|(id, g)| g.set_uuid.map(|uuid| (*id, uuid)))
            .collect()
    }

    /// Expected member count announced for the group
    pub fn desired_group_size(&self, group_id: GroupId) -> Option<usize> {
        self.groups
            .get(&group_id)
            .filter(|g| g.set_uuid.is_some())
            .map(|g| g.size)
    }

    /// Diagnostic view of all groups, ordered by id
    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        let mut ids: Vec<GroupId> = self.groups.keys().chain(self.locks.keys()).copied().collect();
        ids.sort_unstable();
        ids.dedup();

        ids.into_iter()
            .map(|group_id| {
                let group = self.groups.get(&group_id);
                GroupSnapshot {
                    group_id,
                    size: group.map(|g| g.size).unwrap_or(0),
                    set_uuid: group.and_then(|g| g.set_uuid),
                    members: group
                        .map(|g| {
                            g.ordered_members()
                                .into_iter()
                                .map(|m| MemberSnapshot {
                                    address: m.address,
                                    rank: m.rank,
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                    lock: self.locks.get(&group_id).map(|entry| LockSnapshot {
                        token: entry.token.id,
                        held: entry.held,
                    }),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingNative;

    const SET_UUID: Uuid = Uuid::from_u128(0x0000_1846_0000_1000_8000_0080_5f9b_34fb);

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0xAA, 0xBB, 0xCC, 0x00, 0x00, last])
    }

    fn coordinator() -> (GroupCoordinator, Arc<RecordingNative>) {
        let native = Arc::new(RecordingNative::new());
        (GroupCoordinator::new(native.clone(), Duration::ZERO), native)
    }

    #[test]
    fn test_ordering_by_rank() {
        let (mut groups, _) = coordinator();
        let (a, b, c) = (addr(1), addr(2), addr(3));

        groups.on_device_available(a, 1, 3, 2, SET_UUID);
        groups.on_device_available(b, 1, 3, 1, SET_UUID);
        groups.on_device_available(c, 1, 3, 3, SET_UUID);

        assert_eq!(groups.group_devices_ordered(1), vec![b, a, c]);
    }

    #[test]
    fn test_rank_ties_keep_discovery_order() {
        let (mut groups, _) = coordinator();

        groups.on_device_available(addr(9), 1, 2, 1, SET_UUID);
        groups.on_device_available(addr(4), 1, 2, 1, SET_UUID);

        assert_eq!(groups.group_devices_ordered(1), vec![addr(9), addr(4)]);
    }

    #[test]
    fn test_unranked_members_sort_last() {
        let (mut groups, _) = coordinator();

        groups.on_set_member_available(addr(5), 1);
        groups.on_device_available(addr(6), 1, 2, 7, SET_UUID);

        assert_eq!(groups.group_devices_ordered(1), vec![addr(6), addr(5)]);
    }

    #[test]
    fn test_identical_reannouncement_is_not_notified() {
        let (mut groups, _) = coordinator();

        assert!(groups.on_device_available(addr(1), 1, 2, 1, SET_UUID).is_some());
        assert!(groups.on_device_available(addr(1), 1, 2, 1, SET_UUID).is_none());
        assert!(groups.on_device_available(addr(1), 1, 2, 2, SET_UUID).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reannouncement_interval() {
        let native = Arc::new(RecordingNative::new());
        let mut groups = GroupCoordinator::new(native, Duration::from_secs(5));

        assert!(groups.on_device_available(addr(1), 1, 2, 1, SET_UUID).is_some());
        // Rank change inside the interval updates the record silently
        assert!(groups.on_device_available(addr(1), 1, 2, 2, SET_UUID).is_none());
        assert_eq!(groups.snapshot()[0].members[0].rank, Some(2));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(groups.on_device_available(addr(1), 1, 2, 3, SET_UUID).is_some());
    }

    #[test]
    fn test_set_member_does_not_override_rank() {
        let (mut groups, _) = coordinator();

        groups.on_device_available(addr(1), 1, 2, 4, SET_UUID);
        let event = groups.on_set_member_available(addr(1), 1);

        assert_eq!(
            event,
            CoordinatorEvent::SetMemberAvailable {
                address: addr(1),
                group_id: 1
            }
        );
        assert_eq!(groups.snapshot()[0].members[0].rank, Some(4));
    }

    #[test]
    fn test_second_lock_rejected() {
        let (mut groups, native) = coordinator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: Arc<dyn LockCallback> = Arc::new(tx);

        let token = groups.lock_group(1, callback.clone());
        assert!(token.is_some());
        assert!(groups.is_group_locked(1));

        assert!(groups.lock_group(1, callback).is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            LockOutcome {
                group_id: 1,
                status: LockStatus::LockedByOther,
                is_locked: true
            }
        );
        assert_eq!(native.lock_calls(), vec![(1, true)]);
    }

    #[test]
    fn test_lock_round_trip() {
        let (mut groups, native) = coordinator();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let token = groups.lock_group(2, Arc::new(tx)).unwrap();
        groups.on_group_lock_changed(2, true, 0);
        assert_eq!(rx.try_recv().unwrap().status, LockStatus::Success);
        assert!(groups.is_group_locked(2));

        assert!(groups.unlock_group(&token));
        let event = groups.on_group_lock_changed(2, false, 0);
        assert_eq!(
            event,
            CoordinatorEvent::GroupLockChanged {
                group_id: 2,
                status: LockStatus::Success,
                is_locked: false
            }
        );
        assert!(!rx.try_recv().unwrap().is_locked);
        assert!(!groups.is_group_locked(2));
        assert_eq!(native.lock_calls(), vec![(2, true), (2, false)]);
    }

    #[test]
    fn test_failed_lock_clears_pending() {
        let (mut groups, _) = coordinator();
        let (tx, mut rx) = mpsc::unbounded_channel();

        groups.lock_group(3, Arc::new(tx)).unwrap();
        groups.on_group_lock_changed(3, true, LockStatus::GroupNotConnected.to_native());

        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.status, LockStatus::GroupNotConnected);
        assert!(!outcome.is_locked);
        assert!(!groups.is_group_locked(3));
    }

    #[test]
    fn test_native_lock_failure() {
        let (mut groups, native) = coordinator();
        native.set_lock_result(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(groups.lock_group(4, Arc::new(tx)).is_none());
        assert_eq!(rx.try_recv().unwrap().status, LockStatus::OtherReason);
        assert!(!groups.is_group_locked(4));
    }

    #[test]
    fn test_unlock_with_stale_token() {
        let (mut groups, _) = coordinator();
        let (tx, _rx) = mpsc::unbounded_channel();

        let token = groups.lock_group(5, Arc::new(tx)).unwrap();
        groups.on_group_lock_changed(5, false, 0);

        assert!(!groups.unlock_group(&token));
    }

    #[test]
    fn test_group_queries() {
        let (mut groups, _) = coordinator();
        let other = Uuid::from_u128(7);

        groups.on_device_available(addr(1), 1, 2, 1, SET_UUID);
        groups.on_device_available(addr(1), 8, 4, 1, other);
        groups.on_device_available(addr(2), 3, 2, 1, SET_UUID);

        assert_eq!(groups.all_group_ids(SET_UUID), vec![1, 3]);
        assert_eq!(groups.group_id(&addr(1), other), Some(8));
        assert_eq!(groups.group_id(&addr(2), other), None);
        assert_eq!(groups.desired_group_size(8), Some(4));
        assert_eq!(groups.desired_group_size(99), None);

        let map = groups.group_uuid_map_by_device(&addr(1));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&1), Some(&SET_UUID));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(LockStatus::from_native(0), LockStatus::Success);
        assert_eq!(LockStatus::from_native(4), LockStatus::LockedByOther);
        assert_eq!(LockStatus::from_native(42), LockStatus::Unknown(42));
        assert_eq!(LockStatus::LockedByOther.to_string(), "GROUP_LOCKED_BY_OTHER");
    }
}
