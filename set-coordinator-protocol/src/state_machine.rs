//! Per-peer connection state machine
//!
//! Each device gets its own task that drains an ordered message queue, so two
//! transitions of the same device never race. Commands from the service,
//! connection state reports from the stack and timer expiries all arrive on
//! that one queue.
//!
//! ## Timers
//!
//! Entering Connecting arms the connect timeout; entering Disconnecting arms
//! the disconnect timeout, if one is configured. A timer is a spawned sleep
//! that posts a timeout message carrying the attempt number it was armed for.
//! Leaving the state aborts the timer, and a message that still slips through
//! is dropped because its attempt no longer matches or the state moved on.
//!
//! ## Deferred messages
//!
//! CONNECT and DISCONNECT arriving while Disconnecting are parked and replayed,
//! in arrival order, as soon as the machine leaves Disconnecting.

use crate::device::ConnectionState;
use crate::events::{CoordinatorEvent, EventHub};
use crate::native::NativeInterface;
use crate::policy::{ConnectionGate, PolicyStore};
use crate::PeerAddress;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default disconnect timeout
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout used by [`PeerConfig::for_testing`]
pub const TEST_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timing configuration of a state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConfig {
    /// How long Connecting may last before the attempt is abandoned
    pub connect_timeout: Duration,
    /// How long Disconnecting may last before Disconnected is forced;
    /// `None` waits for the stack indefinitely
    pub disconnect_timeout: Option<Duration>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: Some(DEFAULT_DISCONNECT_TIMEOUT),
        }
    }
}

impl PeerConfig {
    /// Short timeouts for tests
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: TEST_CONNECT_TIMEOUT,
            disconnect_timeout: Some(TEST_CONNECT_TIMEOUT),
        }
    }
}

/// Message processed by a state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMessage {
    /// Start a connection
    Connect,
    /// Tear the connection down
    Disconnect,
    /// Native connection state code reported by the stack
    StackEvent(i32),
    /// Connect timer expiry
    ConnectTimeout {
        /// Timer generation
        attempt: u64,
    },
    /// Disconnect timer expiry
    DisconnectTimeout {
        /// Timer generation
        attempt: u64,
    },
    /// Terminate the machine
    Stop,
}

/// Handle to a running state machine
#[derive(Clone)]
pub struct PeerHandle {
    address: PeerAddress,
    tx: mpsc::UnboundedSender<PeerMessage>,
    state: watch::Receiver<ConnectionState>,
}

impl PeerHandle {
    /// Device the machine belongs to
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// Enqueue a message, returning false if the machine has stopped
    pub fn send(&self, message: PeerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Last published connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch published connection states
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Check if the machine task is gone
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Collaborators shared by every state machine of a service
#[derive(Clone)]
pub struct PeerContext {
    /// Native radio commands
    pub native: Arc<dyn NativeInterface>,
    /// Policy and bond lookups
    pub policy: Arc<dyn PolicyStore>,
    /// okToConnect rule
    pub gate: ConnectionGate,
    /// Listener fan-out
    pub events: EventHub,
    /// Timing
    pub config: PeerConfig,
}

/// Connection state machine of one device
pub struct PeerStateMachine {
    address: PeerAddress,
    context: PeerContext,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    rx: mpsc::UnboundedReceiver<PeerMessage>,
    /// Used by timers to post back into the queue without keeping it open
    self_tx: mpsc::WeakUnboundedSender<PeerMessage>,
    deferred: VecDeque<PeerMessage>,
    attempt: u64,
    timer: Option<JoinHandle<()>>,
}

impl PeerStateMachine {
    /// Spawn a machine for `address` in the Disconnected state
    pub fn spawn(address: PeerAddress, context: PeerContext) -> (PeerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let machine = Self {
            address,
            context,
            state: ConnectionState::Disconnected,
            state_tx,
            rx,
            self_tx: tx.downgrade(),
            deferred: VecDeque::new(),
            attempt: 0,
            timer: None,
        };

        debug!("Spawning state machine for {}", address);
        let task = tokio::spawn(machine.run());

        (
            PeerHandle {
                address,
                tx,
                state: state_rx,
            },
            task,
        )
    }

    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            if message == PeerMessage::Stop {
                break;
            }
            self.process(message).await;
        }

        self.cancel_timer();
        debug!("State machine for {} stopped", self.address);
    }

    async fn process(&mut self, message: PeerMessage) {
        let mut pending = VecDeque::from([message]);

        while let Some(message) = pending.pop_front() {
            let was_disconnecting = self.state == ConnectionState::Disconnecting;
            self.handle(message).await;

            if was_disconnecting
                && self.state != ConnectionState::Disconnecting
                && !self.deferred.is_empty()
            {
                debug!(
                    "Replaying {} deferred messages for {}",
                    self.deferred.len(),
                    self.address
                );
                while let Some(deferred) = self.deferred.pop_back() {
                    pending.push_front(deferred);
                }
            }
        }
    }

    async fn handle(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::Connect => self.on_connect().await,
            PeerMessage::Disconnect => self.on_disconnect().await,
            PeerMessage::StackEvent(code) => self.on_stack_state(code).await,
            PeerMessage::ConnectTimeout { attempt } => {
                if self.state != ConnectionState::Connecting || attempt != self.attempt {
                    debug!("Stale connect timeout for {}", self.address);
                    return;
                }
                warn!("Connection attempt to {} timed out", self.address);
                self.context.native.disconnect(&self.address);
                self.transition(ConnectionState::Disconnected).await;
            }
            PeerMessage::DisconnectTimeout { attempt } => {
                if self.state != ConnectionState::Disconnecting || attempt != self.attempt {
                    debug!("Stale disconnect timeout for {}", self.address);
                    return;
                }
                warn!(
                    "Disconnect of {} not confirmed by the stack, forcing disconnected",
                    self.address
                );
                self.transition(ConnectionState::Disconnected).await;
            }
            PeerMessage::Stop => {}
        }
    }

    async fn ok_to_connect(&self) -> bool {
        self.context
            .gate
            .ok_to_connect(self.context.policy.as_ref(), &self.address)
            .await
    }

    async fn on_connect(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                if !self.ok_to_connect().await {
                    warn!("Outgoing connection to {} not allowed", self.address);
                    return;
                }
                if !self.context.native.connect(&self.address) {
                    warn!("Failed to issue connect to {}", self.address);
                    return;
                }
                self.transition(ConnectionState::Connecting).await;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("{} is already {}, ignoring connect", self.address, self.state);
            }
            ConnectionState::Disconnecting => {
                debug!("Deferring connect for {} until disconnected", self.address);
                self.deferred.push_back(PeerMessage::Connect);
            }
        }
    }

    async fn on_disconnect(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                debug!("{} is not connected, ignoring disconnect", self.address);
            }
            ConnectionState::Connecting => {
                if !self.context.native.disconnect(&self.address) {
                    warn!("Failed to issue disconnect to {}", self.address);
                }
                self.transition(ConnectionState::Disconnected).await;
            }
            ConnectionState::Connected => {
                if self.context.native.disconnect(&self.address) {
                    self.transition(ConnectionState::Disconnecting).await;
                } else {
                    warn!("Failed to issue disconnect to {}", self.address);
                    self.transition(ConnectionState::Disconnected).await;
                }
            }
            ConnectionState::Disconnecting => {
                debug!("Disconnect of {} already in progress, deferring", self.address);
                self.deferred.push_back(PeerMessage::Disconnect);
            }
        }
    }

    async fn on_stack_state(&mut self, code: i32) {
        use ConnectionState::*;

        let Some(reported) = ConnectionState::from_native(code) else {
            warn!(
                "Ignoring unknown connection state {} reported for {}",
                code, self.address
            );
            return;
        };

        debug!(
            "Stack reports {} for {} while {}",
            reported, self.address, self.state
        );

        match (self.state, reported) {
            (Disconnected | Disconnecting, Connecting) => {
                if self.ok_to_connect().await {
                    self.transition(Connecting).await;
                } else {
                    warn!("Incoming connection from {} rejected", self.address);
                    self.context.native.disconnect(&self.address);
                }
            }
            (Disconnected | Connecting | Disconnecting, Connected) => {
                if self.ok_to_connect().await {
                    self.transition(Connected).await;
                } else {
                    warn!("Connection with {} rejected", self.address);
                    self.context.native.disconnect(&self.address);
                    if self.state == Connecting {
                        self.transition(Disconnected).await;
                    }
                }
            }
            (Connecting | Connected | Disconnecting, Disconnected) => {
                self.transition(Disconnected).await;
            }
            (Connecting | Connected, Disconnecting) => {
                self.transition(Disconnecting).await;
            }
            (current, reported) => {
                debug!(
                    "Ignoring stack state {} for {} while {}",
                    reported, self.address, current
                );
            }
        }
    }

    async fn transition(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }

        let previous = std::mem::replace(&mut self.state, next);
        self.cancel_timer();

        match next {
            ConnectionState::Connecting => {
                self.arm_timer(self.context.config.connect_timeout, |attempt| {
                    PeerMessage::ConnectTimeout { attempt }
                });
            }
            ConnectionState::Disconnecting => {
                if let Some(timeout) = self.context.config.disconnect_timeout {
                    self.arm_timer(timeout, |attempt| PeerMessage::DisconnectTimeout { attempt });
                }
            }
            ConnectionState::Disconnected | ConnectionState::Connected => {}
        }

        info!("{}: {} -> {}", self.address, previous, next);
        self.state_tx.send_replace(next);
        self.context
            .events
            .emit(CoordinatorEvent::ConnectionStateChanged {
                address: self.address,
                previous,
                current: next,
            })
            .await;
    }

    fn arm_timer(&mut self, after: Duration, message: fn(u64) -> PeerMessage) {
        self.attempt += 1;
        let attempt = self.attempt;
        let tx = self.self_tx.clone();

        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(message(attempt));
            }
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
