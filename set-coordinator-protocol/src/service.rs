//! Connection Service
//!
//! Public entry point of the set coordinator. [`ConnectionService`] is a cheap
//! cloneable handle; every mutating operation is sent as a command to a single
//! dispatcher task that owns the device registry and the
//! [`GroupCoordinator`]. Group check-and-set and membership updates therefore
//! never interleave, and no state is shared with callers apart from the
//! registry of published connection states.
//!
//! Stack events from the native layer are queued on a separate channel that
//! the dispatcher always drains first, so an event handed in before a command
//! is applied before that command runs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use set_coordinator_protocol::{
//!     ConnectionService, NativeInterface, PolicyRegistry, ServiceConfig, StackEvent,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(native: Arc<dyn NativeInterface>) -> set_coordinator_protocol::Result<()> {
//! let policy = Arc::new(PolicyRegistry::in_memory());
//! let service = ConnectionService::start(ServiceConfig::default(), native, policy);
//! let mut events = service.subscribe().await;
//!
//! let address = "00:11:22:33:44:55".parse()?;
//! if service.connect(address).await? {
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! }
//!
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::device::{BondState, ConnectionPolicy, ConnectionState};
use crate::events::{CoordinatorEvent, EventHub, StackEvent};
use crate::group::{GroupCoordinator, GroupId, GroupSnapshot, LockCallback, LockToken};
use crate::native::NativeInterface;
use crate::policy::{ConnectionGate, PolicyStore};
use crate::state_machine::{PeerConfig, PeerContext, PeerHandle, PeerMessage, PeerStateMachine};
use crate::{CoordinatorError, PeerAddress, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Coordinated Set Identification Service UUID
pub const COORDINATED_SET_UUID: Uuid = Uuid::from_u128(0x0000_1846_0000_1000_8000_0080_5f9b_34fb);

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Timing of every per-device state machine
    pub peer: PeerConfig,
    /// Capability a device must advertise before an outgoing connect
    pub required_uuid: Uuid,
    /// Minimum spacing of DeviceAvailable re-notifications for the same
    /// device and group
    pub min_reannounce_interval: Duration,
    /// Devices refused while their stored policy is UNKNOWN
    pub forbidden_overrides: HashSet<PeerAddress>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            required_uuid: COORDINATED_SET_UUID,
            min_reannounce_interval: Duration::ZERO,
            forbidden_overrides: HashSet::new(),
        }
    }
}

impl ServiceConfig {
    /// Configuration with short timeouts for tests
    pub fn for_testing() -> Self {
        Self {
            peer: PeerConfig::for_testing(),
            ..Default::default()
        }
    }
}

/// Connection state and policy of one device, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    /// Device address
    pub address: PeerAddress,
    /// Published connection state
    pub state: ConnectionState,
    /// Stored connection policy
    pub policy: ConnectionPolicy,
}

/// Serializable view of the whole service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Devices with a state machine, ordered by address
    pub devices: Vec<DeviceSnapshot>,
    /// Known groups, ordered by id
    pub groups: Vec<GroupSnapshot>,
}

/// Commands handled by the dispatcher
enum ServiceCommand {
    Connect {
        address: PeerAddress,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        address: PeerAddress,
        reply: oneshot::Sender<bool>,
    },
    SetConnectionPolicy {
        address: PeerAddress,
        policy: ConnectionPolicy,
        reply: oneshot::Sender<Result<()>>,
    },
    LockGroup {
        group_id: GroupId,
        callback: Arc<dyn LockCallback>,
        reply: oneshot::Sender<Option<LockToken>>,
    },
    UnlockGroup {
        token: LockToken,
        reply: oneshot::Sender<bool>,
    },
    IsGroupLocked {
        group_id: GroupId,
        reply: oneshot::Sender<bool>,
    },
    GroupDevicesOrdered {
        group_id: GroupId,
        reply: oneshot::Sender<Vec<PeerAddress>>,
    },
    AllGroupIds {
        set_uuid: Uuid,
        reply: oneshot::Sender<Vec<GroupId>>,
    },
    GroupUuidMap {
        address: PeerAddress,
        reply: oneshot::Sender<HashMap<GroupId, Uuid>>,
    },
    DesiredGroupSize {
        group_id: GroupId,
        reply: oneshot::Sender<Option<usize>>,
    },
    GroupIdOf {
        address: PeerAddress,
        set_uuid: Uuid,
        reply: oneshot::Sender<Option<GroupId>>,
    },
    Dump {
        reply: oneshot::Sender<ServiceSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type PeerRegistry = Arc<RwLock<HashMap<PeerAddress, PeerHandle>>>;

/// Handle to a running set coordinator
#[derive(Clone)]
pub struct ConnectionService {
    command_tx: mpsc::UnboundedSender<ServiceCommand>,
    stack_tx: mpsc::UnboundedSender<StackEvent>,
    peers: PeerRegistry,
    policy: Arc<dyn PolicyStore>,
    gate: ConnectionGate,
    events: EventHub,
}

impl ConnectionService {
    /// Spawn the dispatcher and return a handle to it
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: ServiceConfig,
        native: Arc<dyn NativeInterface>,
        policy: Arc<dyn PolicyStore>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stack_tx, stack_rx) = mpsc::unbounded_channel();
        let peers: PeerRegistry = Arc::new(RwLock::new(HashMap::new()));
        let events = EventHub::new();
        let gate = ConnectionGate::new(config.forbidden_overrides.iter().copied());

        let dispatcher = Dispatcher {
            context: PeerContext {
                native: native.clone(),
                policy: policy.clone(),
                gate: gate.clone(),
                events: events.clone(),
                config: config.peer,
            },
            required_uuid: config.required_uuid,
            peers: peers.clone(),
            tasks: Vec::new(),
            groups: GroupCoordinator::new(native, config.min_reannounce_interval),
            command_rx,
            stack_rx,
        };

        tokio::spawn(dispatcher.run());
        info!(
            "Set coordinator started (required capability {})",
            config.required_uuid
        );

        Self {
            command_tx,
            stack_tx,
            peers,
            policy,
            gate,
            events,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ServiceCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .map_err(|_| CoordinatorError::ServiceStopped)?;
        response.await.map_err(|_| CoordinatorError::ServiceStopped)
    }

    /// Register a listener for coordinator notifications
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<CoordinatorEvent> {
        self.events.subscribe().await
    }

    /// Hand a native stack event to the dispatcher
    pub fn handle_stack_event(&self, event: StackEvent) -> Result<()> {
        self.stack_tx
            .send(event)
            .map_err(|_| CoordinatorError::ServiceStopped)
    }

    /// Sender the native layer can keep for delivering stack events
    pub fn stack_event_sender(&self) -> mpsc::UnboundedSender<StackEvent> {
        self.stack_tx.clone()
    }

    /// Request a connection to `address`
    ///
    /// Returns `false` when the device is FORBIDDEN, not bonded or lacks the
    /// required capability. Otherwise the request is queued on the device's
    /// state machine and the outcome is reported through notifications.
    pub async fn connect(&self, address: PeerAddress) -> Result<bool> {
        self.request(|reply| ServiceCommand::Connect { address, reply })
            .await
    }

    /// Request disconnection of `address`
    ///
    /// Returns whether a state machine existed to receive the request.
    pub async fn disconnect(&self, address: PeerAddress) -> Result<bool> {
        self.request(|reply| ServiceCommand::Disconnect { address, reply })
            .await
    }

    /// Last published connection state; DISCONNECTED for unknown devices
    pub async fn get_connection_state(&self, address: &PeerAddress) -> ConnectionState {
        self.peers
            .read()
            .await
            .get(address)
            .map(PeerHandle::connection_state)
            .unwrap_or_default()
    }

    /// Devices currently connected
    pub async fn get_connected_devices(&self) -> Vec<PeerAddress> {
        self.get_devices_matching_connection_states(&[ConnectionState::Connected])
            .await
    }

    /// Devices whose published state is one of `states`, ordered by address
    pub async fn get_devices_matching_connection_states(
        &self,
        states: &[ConnectionState],
    ) -> Vec<PeerAddress> {
        let mut devices: Vec<PeerAddress> = self
            .peers
            .read()
            .await
            .values()
            .filter(|peer| states.contains(&peer.connection_state()))
            .map(PeerHandle::address)
            .collect();
        devices.sort_unstable();
        devices
    }

    /// Stored connection policy
    pub async fn get_connection_policy(&self, address: &PeerAddress) -> ConnectionPolicy {
        self.policy.connection_policy(address).await
    }

    /// Persist a connection policy
    ///
    /// FORBIDDEN disconnects the device, ALLOWED connects it.
    pub async fn set_connection_policy(
        &self,
        address: PeerAddress,
        policy: ConnectionPolicy,
    ) -> Result<()> {
        self.request(|reply| ServiceCommand::SetConnectionPolicy {
            address,
            policy,
            reply,
        })
        .await?
    }

    /// Whether the device passes the bond and policy gate
    pub async fn ok_to_connect(&self, address: &PeerAddress) -> bool {
        self.gate.ok_to_connect(self.policy.as_ref(), address).await
    }

    /// Request the exclusive lock of a group
    ///
    /// A rejected request has already invoked `callback` by the time this
    /// returns `None`.
    pub async fn lock_group(
        &self,
        group_id: GroupId,
        callback: Arc<dyn LockCallback>,
    ) -> Result<Option<LockToken>> {
        self.request(|reply| ServiceCommand::LockGroup {
            group_id,
            callback,
            reply,
        })
        .await
    }

    /// Release a lock; returns whether the native unlock was issued
    pub async fn unlock_group(&self, token: &LockToken) -> Result<bool> {
        let token = *token;
        self.request(|reply| ServiceCommand::UnlockGroup { token, reply })
            .await
    }

    /// Whether a lock is pending or held for the group
    pub async fn is_group_locked(&self, group_id: GroupId) -> Result<bool> {
        self.request(|reply| ServiceCommand::IsGroupLocked { group_id, reply })
            .await
    }

    /// Group members in ascending rank order
    pub async fn get_group_devices_ordered(&self, group_id: GroupId) -> Result<Vec<PeerAddress>> {
        self.request(|reply| ServiceCommand::GroupDevicesOrdered { group_id, reply })
            .await
    }

    /// All group ids announced with the given set type
    pub async fn get_all_group_ids(&self, set_uuid: Uuid) -> Result<Vec<GroupId>> {
        self.request(|reply| ServiceCommand::AllGroupIds { set_uuid, reply })
            .await
    }

    /// Groups the device belongs to, with their set type
    pub async fn get_group_uuid_map_by_device(
        &self,
        address: &PeerAddress,
    ) -> Result<HashMap<GroupId, Uuid>> {
        let address = *address;
        self.request(|reply| ServiceCommand::GroupUuidMap { address, reply })
            .await
    }

    /// Announced size of the group
    pub async fn get_desired_group_size(&self, group_id: GroupId) -> Result<Option<usize>> {
        self.request(|reply| ServiceCommand::DesiredGroupSize { group_id, reply })
            .await
    }

    /// Group of the device within the set type
    pub async fn get_group_id(
        &self,
        address: &PeerAddress,
        set_uuid: Uuid,
    ) -> Result<Option<GroupId>> {
        let address = *address;
        self.request(|reply| ServiceCommand::GroupIdOf {
            address,
            set_uuid,
            reply,
        })
        .await
    }

    /// Snapshot of devices, groups and locks
    pub async fn dump(&self) -> Result<ServiceSnapshot> {
        self.request(|reply| ServiceCommand::Dump { reply }).await
    }

    /// Stop every state machine and the dispatcher
    ///
    /// Later operations fail with [`CoordinatorError::ServiceStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| ServiceCommand::Shutdown { reply })
            .await
    }
}

/// Owner of the device registry and group state
struct Dispatcher {
    context: PeerContext,
    required_uuid: Uuid,
    peers: PeerRegistry,
    tasks: Vec<JoinHandle<()>>,
    groups: GroupCoordinator,
    command_rx: mpsc::UnboundedReceiver<ServiceCommand>,
    stack_rx: mpsc::UnboundedReceiver<StackEvent>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(event) = self.stack_rx.recv() => {
                    self.on_stack_event(event).await;
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(ServiceCommand::Shutdown { reply }) => {
                            self.command_rx.close();
                            self.stack_rx.close();
                            self.stop_peers().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.on_command(command).await,
                        None => {
                            self.stop_peers().await;
                            break;
                        }
                    }
                }
            }
        }

        info!("Set coordinator stopped");
    }

    async fn on_command(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::Connect { address, reply } => {
                let accepted = self.connect(address).await;
                let _ = reply.send(accepted);
            }
            ServiceCommand::Disconnect { address, reply } => {
                let _ = reply.send(self.disconnect(address).await);
            }
            ServiceCommand::SetConnectionPolicy {
                address,
                policy,
                reply,
            } => {
                let _ = reply.send(self.set_connection_policy(address, policy).await);
            }
            ServiceCommand::LockGroup {
                group_id,
                callback,
                reply,
            } => {
                let _ = reply.send(self.groups.lock_group(group_id, callback));
            }
            ServiceCommand::UnlockGroup { token, reply } => {
                let _ = reply.send(self.groups.unlock_group(&token));
            }
            ServiceCommand::IsGroupLocked { group_id, reply } => {
                let _ = reply.send(self.groups.is_group_locked(group_id));
            }
            ServiceCommand::GroupDevicesOrdered { group_id, reply } => {
                let _ = reply.send(self.groups.group_devices_ordered(group_id));
            }
            ServiceCommand::AllGroupIds { set_uuid, reply } => {
                let _ = reply.send(self.groups.all_group_ids(set_uuid));
            }
            ServiceCommand::GroupUuidMap { address, reply } => {
                let _ = reply.send(self.groups.group_uuid_map_by_device(&address));
            }
            ServiceCommand::DesiredGroupSize { group_id, reply } => {
                let _ = reply.send(self.groups.desired_group_size(group_id));
            }
            ServiceCommand::GroupIdOf {
                address,
                set_uuid,
                reply,
            } => {
                let _ = reply.send(self.groups.group_id(&address, set_uuid));
            }
            ServiceCommand::Dump { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
            ServiceCommand::Shutdown { .. } => {}
        }
    }

    async fn on_stack_event(&mut self, event: StackEvent) {
        match event {
            StackEvent::DeviceAvailable {
                address,
                group_id,
                group_size,
                rank,
                set_uuid,
            } => {
                if let Some(notification) =
                    self.groups
                        .on_device_available(address, group_id, group_size, rank, set_uuid)
                {
                    self.context.events.emit(notification).await;
                }
            }
            StackEvent::SetMemberAvailable { address, group_id } => {
                let notification = self.groups.on_set_member_available(address, group_id);
                self.context.events.emit(notification).await;
            }
            StackEvent::ConnectionStateChanged { address, state } => {
                if ConnectionState::from_native(state).is_none() {
                    warn!(
                        "Ignoring unknown connection state {} reported for {}",
                        state, address
                    );
                    return;
                }
                let peer = self.peer(address).await;
                peer.send(PeerMessage::StackEvent(state));
            }
            StackEvent::GroupLockChanged {
                group_id,
                is_locked,
                status,
            } => {
                let notification = self.groups.on_group_lock_changed(group_id, is_locked, status);
                self.context.events.emit(notification).await;
            }
        }
    }

    /// State machine for `address`, created on first use
    async fn peer(&mut self, address: PeerAddress) -> PeerHandle {
        if let Some(peer) = self.peers.read().await.get(&address) {
            return peer.clone();
        }

        let (peer, task) = PeerStateMachine::spawn(address, self.context.clone());
        self.peers.write().await.insert(address, peer.clone());
        self.tasks.push(task);
        info!("Created state machine for {}", address);
        peer
    }

    async fn connect(&mut self, address: PeerAddress) -> bool {
        let policy = self.context.policy.as_ref();

        if policy.connection_policy(&address).await == ConnectionPolicy::Forbidden {
            info!("Not connecting to {}: connection policy is forbidden", address);
            return false;
        }
        if policy.bond_state(&address).await != BondState::Bonded {
            info!("Not connecting to {}: device is not bonded", address);
            return false;
        }
        if !policy.remote_uuids(&address).await.contains(&self.required_uuid) {
            warn!(
                "Not connecting to {}: device does not advertise {}",
                address, self.required_uuid
            );
            return false;
        }

        self.peer(address).await.send(PeerMessage::Connect)
    }

    async fn disconnect(&mut self, address: PeerAddress) -> bool {
        match self.peers.read().await.get(&address) {
            Some(peer) => peer.send(PeerMessage::Disconnect),
            None => {
                debug!("No state machine for {}, nothing to disconnect", address);
                false
            }
        }
    }

    async fn set_connection_policy(
        &mut self,
        address: PeerAddress,
        policy: ConnectionPolicy,
    ) -> Result<()> {
        self.context
            .policy
            .set_connection_policy(&address, policy)
            .await?;
        info!("Connection policy of {} set to {:?}", address, policy);

        match policy {
            ConnectionPolicy::Allowed => {
                self.connect(address).await;
            }
            ConnectionPolicy::Forbidden => {
                self.disconnect(address).await;
            }
            ConnectionPolicy::Unknown => {}
        }

        Ok(())
    }

    async fn snapshot(&self) -> ServiceSnapshot {
        let peers: Vec<(PeerAddress, ConnectionState)> = self
            .peers
            .read()
            .await
            .values()
            .map(|peer| (peer.address(), peer.connection_state()))
            .collect();

        let mut devices = Vec::with_capacity(peers.len());
        for (address, state) in peers {
            devices.push(DeviceSnapshot {
                address,
                state,
                policy: self.context.policy.connection_policy(&address).await,
            });
        }
        devices.sort_by_key(|device| device.address);

        ServiceSnapshot {
            taken_at: Utc::now(),
            devices,
            groups: self.groups.snapshot(),
        }
    }

    async fn stop_peers(&mut self) {
        let peers: Vec<PeerHandle> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.send(PeerMessage::Stop);
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("State machine task failed: {}", e);
            }
        }
        debug!("Stopped {} state machines", peers.len());
    }
}
