//! Connection policy, bonding and capability lookups
//!
//! The coordinator reads three facts about a peer before it lets a connection
//! proceed: the stored connection policy, the bond state and the capability
//! UUIDs the device advertised. [`PolicyStore`] is the seam to whoever owns
//! those facts. [`PolicyRegistry`] is the bundled implementation: policies are
//! persisted to a JSON file, bond state and capabilities are fed in by the
//! embedding application.
//!
//! [`ConnectionGate`] applies the okToConnect rule on top of a store.

use crate::device::{BondState, ConnectionPolicy};
use crate::{CoordinatorError, PeerAddress, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Source of per-device policy, bond state and capabilities
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Stored connection policy for the profile
    async fn connection_policy(&self, address: &PeerAddress) -> ConnectionPolicy;

    /// Persist a new connection policy
    async fn set_connection_policy(
        &self,
        address: &PeerAddress,
        policy: ConnectionPolicy,
    ) -> Result<()>;

    /// Current bond state
    async fn bond_state(&self, address: &PeerAddress) -> BondState;

    /// Service UUIDs the remote device advertised
    async fn remote_uuids(&self, address: &PeerAddress) -> HashSet<Uuid>;
}

#[derive(Debug, Default)]
struct RegistryState {
    policies: BTreeMap<PeerAddress, ConnectionPolicy>,
    bond_states: HashMap<PeerAddress, BondState>,
    remote_uuids: HashMap<PeerAddress, HashSet<Uuid>>,
}

/// Policy store with optional JSON persistence of connection policies
pub struct PolicyRegistry {
    state: RwLock<RegistryState>,
    /// Where policies are saved; `None` keeps everything in memory
    registry_path: Option<PathBuf>,
}

impl PolicyRegistry {
    /// Create a registry that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            registry_path: None,
        }
    }

    /// Open a registry backed by a JSON file, loading existing policies
    ///
    /// The parent directory is created if needed. A missing file is an empty
    /// registry.
    pub async fn open(registry_path: impl Into<PathBuf>) -> Result<Self> {
        let registry_path = registry_path.into();

        if let Some(parent) = registry_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let policies = Self::load(&registry_path).await?;
        info!(
            "Loaded {} connection policies from {:?}",
            policies.len(),
            registry_path
        );

        Ok(Self {
            state: RwLock::new(RegistryState {
                policies,
                ..Default::default()
            }),
            registry_path: Some(registry_path),
        })
    }

    async fn load(path: &Path) -> Result<BTreeMap<PeerAddress, ConnectionPolicy>> {
        if !fs::try_exists(path).await? {
            debug!("No existing policy registry at {:?}", path);
            return Ok(BTreeMap::new());
        }

        let json = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn save(&self, policies: &BTreeMap<PeerAddress, ConnectionPolicy>) -> Result<()> {
        if let Some(path) = &self.registry_path {
            let json = serde_json::to_string_pretty(policies)?;
            fs::write(path, json).await.map_err(|e| {
                CoordinatorError::PolicyStore(format!("failed to write {:?}: {}", path, e))
            })?;
            debug!("Saved policy registry to {:?}", path);
        }
        Ok(())
    }

    /// Record the bond state reported by the pairing layer
    pub async fn set_bond_state(&self, address: PeerAddress, bond_state: BondState) {
        self.state
            .write()
            .await
            .bond_states
            .insert(address, bond_state);
    }

    /// Record the capability UUIDs reported by service discovery
    pub async fn set_remote_uuids(&self, address: PeerAddress, uuids: impl IntoIterator<Item = Uuid>) {
        self.state
            .write()
            .await
            .remote_uuids
            .insert(address, uuids.into_iter().collect());
    }

    /// Path of the backing JSON file, if any
    pub fn registry_path(&self) -> Option<&Path> {
        self.registry_path.as_deref()
    }
}

#[async_trait]
impl PolicyStore for PolicyRegistry {
    async fn connection_policy(&self, address: &PeerAddress) -> ConnectionPolicy {
        self.state
            .read()
            .await
            .policies
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    async fn set_connection_policy(
        &self,
        address: &PeerAddress,
        policy: ConnectionPolicy,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        // Memory only changes once the new map is on disk
        let mut policies = state.policies.clone();
        policies.insert(*address, policy);
        self.save(&policies).await?;

        state.policies = policies;
        Ok(())
    }

    async fn bond_state(&self, address: &PeerAddress) -> BondState {
        self.state
            .read()
            .await
            .bond_states
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    async fn remote_uuids(&self, address: &PeerAddress) -> HashSet<Uuid> {
        self.state
            .read()
            .await
            .remote_uuids
            .get(address)
            .cloned()
            .unwrap_or_default()
    }
}

/// The okToConnect gate
///
/// A device may connect only when it is bonded and its policy is ALLOWED, or
/// its policy is UNKNOWN and it is not on the forbidden override list.
#[derive(Debug, Clone, Default)]
pub struct ConnectionGate {
    forbidden_overrides: HashSet<PeerAddress>,
}

impl ConnectionGate {
    /// Create a gate with a set of devices forbidden regardless of an
    /// UNKNOWN stored policy
    pub fn new(forbidden_overrides: impl IntoIterator<Item = PeerAddress>) -> Self {
        Self {
            forbidden_overrides: forbidden_overrides.into_iter().collect(),
        }
    }

    /// Pure decision on already fetched facts
    pub fn permits(
        &self,
        address: &PeerAddress,
        bond_state: BondState,
        policy: ConnectionPolicy,
    ) -> bool {
        if bond_state != BondState::Bonded {
            return false;
        }

        match policy {
            ConnectionPolicy::Allowed => true,
            ConnectionPolicy::Unknown => !self.forbidden_overrides.contains(address),
            ConnectionPolicy::Forbidden => false,
        }
    }

    /// Fetch bond state and policy from `store` and decide
    pub async fn ok_to_connect(&self, store: &dyn PolicyStore, address: &PeerAddress) -> bool {
        let bond_state = store.bond_state(address).await;
        let policy = store.connection_policy(address).await;
        let ok = self.permits(address, bond_state, policy);

        if !ok {
            debug!(
                "Connection to {} not permitted (bond: {:?}, policy: {:?})",
                address, bond_state, policy
            );
        }

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0x10, 0x20, 0x30, 0x40, 0x50, last])
    }

    #[test]
    fn test_gate_requires_bond() {
        let gate = ConnectionGate::default();
        assert!(!gate.permits(&addr(1), BondState::None, ConnectionPolicy::Allowed));
        assert!(!gate.permits(&addr(1), BondState::Bonding, ConnectionPolicy::Allowed));
        assert!(gate.permits(&addr(1), BondState::Bonded, ConnectionPolicy::Allowed));
    }

    #[test]
    fn test_gate_policy_rules() {
        let gate = ConnectionGate::new([addr(2)]);

        assert!(gate.permits(&addr(1), BondState::Bonded, ConnectionPolicy::Unknown));
        assert!(!gate.permits(&addr(2), BondState::Bonded, ConnectionPolicy::Unknown));
        assert!(gate.permits(&addr(2), BondState::Bonded, ConnectionPolicy::Allowed));
        assert!(!gate.permits(&addr(1), BondState::Bonded, ConnectionPolicy::Forbidden));
    }

    #[tokio::test]
    async fn test_in_memory_defaults() {
        let registry = PolicyRegistry::in_memory();

        assert_eq!(registry.connection_policy(&addr(1)).await, ConnectionPolicy::Unknown);
        assert_eq!(registry.bond_state(&addr(1)).await, BondState::None);
        assert!(registry.remote_uuids(&addr(1)).await.is_empty());
        assert!(registry.registry_path().is_none());
    }

    #[tokio::test]
    async fn test_ok_to_connect_reads_store() {
        let registry = PolicyRegistry::in_memory();
        let gate = ConnectionGate::default();

        assert!(!gate.ok_to_connect(&registry, &addr(1)).await);

        registry.set_bond_state(addr(1), BondState::Bonded).await;
        assert!(gate.ok_to_connect(&registry, &addr(1)).await);

        registry
            .set_connection_policy(&addr(1), ConnectionPolicy::Forbidden)
            .await
            .unwrap();
        assert!(!gate.ok_to_connect(&registry, &addr(1)).await);
    }

    #[tokio::test]
    async fn test_registry_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("policies").join("registry.json");

        {
            let registry = PolicyRegistry::open(&path).await.unwrap();
            registry
                .set_connection_policy(&addr(1), ConnectionPolicy::Allowed)
                .await
                .unwrap();
            registry
                .set_connection_policy(&addr(2), ConnectionPolicy::Forbidden)
                .await
                .unwrap();
            registry.set_bond_state(addr(1), BondState::Bonded).await;
        }

        let registry = PolicyRegistry::open(&path).await.unwrap();
        assert_eq!(registry.connection_policy(&addr(1)).await, ConnectionPolicy::Allowed);
        assert_eq!(registry.connection_policy(&addr(2)).await, ConnectionPolicy::Forbidden);
        // Bond state belongs to the pairing layer and is not persisted here
        assert_eq!(registry.bond_state(&addr(1)).await, BondState::None);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_policy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("registry.json");

        let registry = PolicyRegistry::open(&path).await.unwrap();
        registry
            .set_connection_policy(&addr(1), ConnectionPolicy::Allowed)
            .await
            .unwrap();

        // A directory in place of the file makes every write fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = registry
            .set_connection_policy(&addr(1), ConnectionPolicy::Forbidden)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::PolicyStore(_)));
        assert!(err.is_recoverable());

        assert_eq!(registry.connection_policy(&addr(1)).await, ConnectionPolicy::Allowed);
        assert_eq!(registry.connection_policy(&addr(2)).await, ConnectionPolicy::Unknown);
    }

    #[tokio::test]
    async fn test_registry_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("registry.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(PolicyRegistry::open(&path).await.is_err());
    }
}
