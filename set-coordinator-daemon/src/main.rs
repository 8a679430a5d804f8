mod config;
mod diagnostics;
mod simulator;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{Cli, Command};
use set_coordinator_protocol::{
    BondState, ConnectionService, CoordinatorEvent, GroupId, LockCallback, LockOutcome,
    PeerAddress, PolicyRegistry, StackEvent,
};
use simulator::SimulatedStack;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long to wait for the simulated stack to confirm a lock or
/// announce a group
const STACK_WAIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Daemon {
    config: Config,
    service: ConnectionService,
    stack: Arc<SimulatedStack>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    async fn new(config: Config) -> Result<Self> {
        let registry_path = config.policy_registry_path();
        let registry = Arc::new(
            PolicyRegistry::open(&registry_path)
                .await
                .with_context(|| format!("Failed to open policy registry {:?}", registry_path))?,
        );

        let (stack, stack_events) = SimulatedStack::new(
            &config.simulation.devices,
            config.policy.required_uuid,
            config.simulation.response_delay(),
        )?;
        let stack = Arc::new(stack);

        // The simulated devices are bonded and advertise the set capability
        for address in stack.addresses() {
            registry.set_bond_state(address, BondState::Bonded).await;
            registry
                .set_remote_uuids(address, [config.policy.required_uuid])
                .await;
        }

        let service =
            ConnectionService::start(config.service_config()?, stack.clone(), registry);

        let mut daemon = Self {
            config,
            service,
            stack,
            tasks: Vec::new(),
        };
        daemon.start_stack_forwarding(stack_events);
        daemon.start_event_logging().await;

        Ok(daemon)
    }

    /// Deliver stack events into the coordinator
    fn start_stack_forwarding(&mut self, mut stack_events: mpsc::UnboundedReceiver<StackEvent>) {
        let sender = self.service.stack_event_sender();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = stack_events.recv().await {
                if sender.send(event).is_err() {
                    break;
                }
            }
        }));
    }

    async fn start_event_logging(&mut self) {
        let mut events = self.service.subscribe().await;
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CoordinatorEvent::ConnectionStateChanged {
                        address,
                        previous,
                        current,
                    } => info!("Device {} {} -> {}", address, previous, current),
                    CoordinatorEvent::DeviceAvailable {
                        address,
                        group_id,
                        group_size,
                        set_uuid,
                    } => info!(
                        "Device {} available in group {} (size {}, set {})",
                        address, group_id, group_size, set_uuid
                    ),
                    CoordinatorEvent::SetMemberAvailable { address, group_id } => {
                        info!("Set member {} available in group {}", address, group_id)
                    }
                    CoordinatorEvent::GroupLockChanged {
                        group_id,
                        status,
                        is_locked,
                    } => info!(
                        "Group {} lock changed: {} (locked: {})",
                        group_id, status, is_locked
                    ),
                }
            }
        }));
    }

    /// Connect every group in rank order, then take and release its lock
    async fn run_scenario(&self) -> Result<()> {
        self.stack.announce();

        for group_id in self.stack.group_ids() {
            let members = self.wait_for_members(group_id).await?;
            info!("Group {} members in rank order: {:?}", group_id, members);

            for address in &members {
                if !self.service.connect(*address).await? {
                    warn!("Connect to {} rejected", address);
                }
            }

            self.exercise_lock(group_id).await?;
        }

        Ok(())
    }

    /// Rank-ordered members once every simulated member has been announced
    async fn wait_for_members(&self, group_id: GroupId) -> Result<Vec<PeerAddress>> {
        let expected = self.stack.member_count(group_id);
        let deadline = tokio::time::Instant::now() + STACK_WAIT;

        loop {
            let members = self.service.get_group_devices_ordered(group_id).await?;
            if members.len() >= expected || tokio::time::Instant::now() >= deadline {
                return Ok(members);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn exercise_lock(&self, group_id: GroupId) -> Result<()> {
        let (tx, mut outcomes) = mpsc::unbounded_channel::<LockOutcome>();
        let callback: Arc<dyn LockCallback> = Arc::new(tx);

        let Some(token) = self.service.lock_group(group_id, callback).await? else {
            warn!("Could not request lock for group {}", group_id);
            return Ok(());
        };

        match tokio::time::timeout(STACK_WAIT, outcomes.recv()).await {
            Ok(Some(outcome)) if outcome.is_locked => {
                info!("Holding lock on group {}", group_id);
                if !self.service.unlock_group(&token).await? {
                    warn!("Unlock of group {} was not issued", group_id);
                }
            }
            Ok(Some(outcome)) => {
                warn!("Lock on group {} failed: {}", group_id, outcome.status)
            }
            Ok(None) | Err(_) => warn!("No lock confirmation for group {}", group_id),
        }

        Ok(())
    }

    async fn run(self) -> Result<()> {
        self.run_scenario().await?;

        let run_for = Duration::from_secs(self.config.simulation.run_for_secs);
        tokio::select! {
            _ = tokio::time::sleep(run_for) => {}
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }

        let snapshot = self.service.dump().await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?
        );

        self.service.shutdown().await?;
        for task in self.tasks {
            task.abort();
        }

        info!("Set coordinator daemon stopped");
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::Version { verbose }) => {
            diagnostics::show_version(*verbose);
            return Ok(());
        }
        Some(Command::DumpConfig) => {
            let config = load_config(&cli).context("Failed to load configuration")?;
            println!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
            return Ok(());
        }
        Some(Command::Run) | None => {}
    }

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    info!("Starting set coordinator daemon...");

    let config = load_config(&cli).context("Failed to load configuration")?;
    info!(
        "Configuration loaded: {} simulated devices, connect timeout {} ms",
        config.simulation.devices.len(),
        config.timeouts.connect_timeout_ms
    );

    let daemon = Daemon::new(config)
        .await
        .context("Failed to create daemon")?;

    let result = daemon.run().await;
    if let Err(e) = &result {
        error!("Daemon error: {:#}", e);
    }
    result
}
