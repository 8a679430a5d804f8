//! Shared helpers for the integration tests

#![allow(dead_code)]

use set_coordinator_protocol::{
    BondState, ConnectionService, ConnectionState, CoordinatorEvent, GroupId, NativeInterface,
    PeerAddress, PolicyRegistry, ServiceConfig, COORDINATED_SET_UUID,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Native command observed by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCall {
    Connect(PeerAddress),
    Disconnect(PeerAddress),
    GroupLockSet(GroupId, bool),
}

/// Mock radio stack recording every command
pub struct MockNative {
    calls: Arc<Mutex<Vec<NativeCall>>>,
    accept_commands: Mutex<bool>,
}

impl MockNative {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            accept_commands: Mutex::new(true),
        }
    }

    /// Make every later command report an issue failure
    pub fn reject_commands(&self) {
        *self.accept_commands.lock().unwrap() = false;
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: NativeCall) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    fn record(&self, call: NativeCall) -> bool {
        self.calls.lock().unwrap().push(call);
        *self.accept_commands.lock().unwrap()
    }
}

impl NativeInterface for MockNative {
    fn connect(&self, address: &PeerAddress) -> bool {
        self.record(NativeCall::Connect(*address))
    }

    fn disconnect(&self, address: &PeerAddress) -> bool {
        self.record(NativeCall::Disconnect(*address))
    }

    fn group_lock_set(&self, group_id: GroupId, lock: bool) -> bool {
        self.record(NativeCall::GroupLockSet(group_id, lock))
    }
}

/// A running service with its collaborators
pub struct Harness {
    pub service: ConnectionService,
    pub native: Arc<MockNative>,
    pub registry: Arc<PolicyRegistry>,
    pub events: mpsc::UnboundedReceiver<CoordinatorEvent>,
}

/// Start a service whose `devices` are bonded and advertise the set capability
pub async fn harness(devices: &[PeerAddress]) -> Harness {
    harness_with(ServiceConfig::for_testing(), Arc::new(PolicyRegistry::in_memory()), devices).await
}

pub async fn harness_with(
    config: ServiceConfig,
    registry: Arc<PolicyRegistry>,
    devices: &[PeerAddress],
) -> Harness {
    init_tracing();

    for address in devices {
        registry.set_bond_state(*address, BondState::Bonded).await;
        registry
            .set_remote_uuids(*address, [COORDINATED_SET_UUID])
            .await;
    }

    let native = Arc::new(MockNative::new());
    let service = ConnectionService::start(config, native.clone(), registry.clone());
    let events = service.subscribe().await;

    Harness {
        service,
        native,
        registry,
        events,
    }
}

pub fn addr(last: u8) -> PeerAddress {
    PeerAddress::new([0x5C, 0xF3, 0x70, 0x00, 0x10, last])
}

/// Next connection state notification, skipping group notifications
pub async fn next_state_change(
    events: &mut mpsc::UnboundedReceiver<CoordinatorEvent>,
) -> (PeerAddress, ConnectionState, ConnectionState) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("event hub closed");

        if let CoordinatorEvent::ConnectionStateChanged {
            address,
            previous,
            current,
        } = event
        {
            return (address, previous, current);
        }
    }
}

/// Yield until `condition` holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

/// Let spawned tasks drain their queues
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
