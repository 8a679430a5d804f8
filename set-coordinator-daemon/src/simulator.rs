//! Simulated radio stack
//!
//! Stands in for the native layer so the coordinator can run without
//! hardware. Commands are accepted synchronously and answered with stack
//! events after a configurable delay, like a real controller would.

use crate::config::SimulatedDeviceConfig;
use anyhow::{Context, Result};
use set_coordinator_protocol::{
    ConnectionState, GroupId, NativeInterface, PeerAddress, Rank, StackEvent,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct SimulatedDevice {
    group_id: GroupId,
    group_size: usize,
    rank: Rank,
    responds: bool,
}

pub struct SimulatedStack {
    devices: HashMap<PeerAddress, SimulatedDevice>,
    set_uuid: Uuid,
    delay: Duration,
    events: mpsc::UnboundedSender<StackEvent>,
    runtime: Handle,
}

impl SimulatedStack {
    /// Create the stack and the receiver its events are delivered on
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        devices: &[SimulatedDeviceConfig],
        set_uuid: Uuid,
        delay: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StackEvent>)> {
        let devices = devices
            .iter()
            .map(|device| {
                let address = device
                    .address
                    .parse::<PeerAddress>()
                    .with_context(|| format!("Invalid simulated device '{}'", device.address))?;
                Ok((
                    address,
                    SimulatedDevice {
                        group_id: device.group_id,
                        group_size: device.group_size,
                        rank: device.rank,
                        responds: device.responds,
                    },
                ))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let (events, rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                devices,
                set_uuid,
                delay,
                events,
                runtime: Handle::current(),
            },
            rx,
        ))
    }

    /// Addresses of all simulated devices
    pub fn addresses(&self) -> Vec<PeerAddress> {
        let mut addresses: Vec<PeerAddress> = self.devices.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Group ids present in the simulation
    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.devices.values().map(|d| d.group_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of simulated devices in the group
    pub fn member_count(&self, group_id: GroupId) -> usize {
        self.devices.values().filter(|d| d.group_id == group_id).count()
    }

    /// Announce every device as a coordinated set member
    pub fn announce(&self) {
        for address in self.addresses() {
            if let Some(device) = self.devices.get(&address) {
                let _ = self.events.send(StackEvent::DeviceAvailable {
                    address,
                    group_id: device.group_id,
                    group_size: device.group_size,
                    rank: device.rank,
                    set_uuid: self.set_uuid,
                });
            }
        }
    }

    fn respond_later(&self, events: Vec<StackEvent>) {
        let tx = self.events.clone();
        let delay = self.delay;

        self.runtime.spawn(async move {
            for event in events {
                tokio::time::sleep(delay).await;
                debug!("Simulated stack reports {:?}", event);
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
    }
}

impl NativeInterface for SimulatedStack {
    fn connect(&self, address: &PeerAddress) -> bool {
        let Some(device) = self.devices.get(address) else {
            debug!("Simulated stack has no device {}", address);
            return false;
        };

        if device.responds {
            self.respond_later(vec![StackEvent::ConnectionStateChanged {
                address: *address,
                state: ConnectionState::Connected.to_native(),
            }]);
        }
        true
    }

    fn disconnect(&self, address: &PeerAddress) -> bool {
        if !self.devices.contains_key(address) {
            return false;
        }

        self.respond_later(vec![StackEvent::ConnectionStateChanged {
            address: *address,
            state: ConnectionState::Disconnected.to_native(),
        }]);
        true
    }

    fn group_lock_set(&self, group_id: GroupId, lock: bool) -> bool {
        // Lock status codes: 0 success, 1 invalid group id
        let status = if self.member_count(group_id) == 0 { 1 } else { 0 };

        self.respond_later(vec![StackEvent::GroupLockChanged {
            group_id,
            is_locked: lock && status == 0,
            status,
        }]);
        true
    }
}
