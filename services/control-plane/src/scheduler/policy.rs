//! Promotion policies.
//!
//! A policy moves discovered machines without any role into a role set
//! until the set holds its expected number of machines. Each `apply` runs
//! in one transaction and is a fixed point: once capacity is reached it
//! promotes nothing and writes nothing.

use metalcast_model::ScheduleRole;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, instrument};

use super::schedule::{available_machines, count_machines_by_roles, insert_roles};
use super::SchedulerResult;
use crate::db::now_millis;

/// Capacity settings for promotion.
#[derive(Debug, Clone)]
pub struct PolicySettings {
    /// Machines expected to hold both etcd-member and control-plane roles.
    pub control_plane_expected_nb: usize,

    /// Upper bound on Kubernetes nodes; `None` promotes every available machine.
    pub node_expected_nb: Option<usize>,

    /// Run the control-plane policy before node promotion.
    pub apply_dependencies: bool,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            control_plane_expected_nb: 3,
            node_expected_nb: None,
            apply_dependencies: true,
        }
    }
}

/// Result of one `apply` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PromotionOutcome {
    /// Machines promoted by this call.
    pub promoted: usize,

    /// Machines holding the role set after this call.
    pub current: usize,

    /// Expected machine count, when bounded.
    pub expected: Option<usize>,

    /// Whether the role set is at capacity (or, for nodes, may proceed).
    pub satisfied: bool,
}

// =============================================================================
// Control plane
// =============================================================================

/// Promotes machines into `etcd-member` + `kubernetes-control-plane`.
///
/// Promotion is all-or-nothing: an etcd cluster bootstraps from a complete
/// `initial-cluster` list, so when fewer machines are available than the
/// shortfall nothing is scheduled.
#[derive(Debug, Clone)]
pub struct EtcdMemberKubernetesControlPlane {
    pool: SqlitePool,
    expected_nb: usize,
}

impl EtcdMemberKubernetesControlPlane {
    pub const ROLES: [ScheduleRole; 2] = [
        ScheduleRole::EtcdMember,
        ScheduleRole::KubernetesControlPlane,
    ];

    pub fn new(pool: SqlitePool, expected_nb: usize) -> Self {
        Self { pool, expected_nb }
    }

    pub fn expected_nb(&self) -> usize {
        self.expected_nb
    }

    #[instrument(skip(self), fields(expected = self.expected_nb))]
    pub async fn apply(&self) -> SchedulerResult<PromotionOutcome> {
        let mut tx = self.pool.begin().await?;

        let current = count_machines_by_roles(&mut tx, &Self::ROLES).await?;
        if current >= self.expected_nb {
            debug!(current, "Control plane already satisfied");
            return Ok(self.outcome(0, current));
        }

        let shortfall = self.expected_nb - current;
        let available = available_machines(&mut tx).await?;
        if available.len() < shortfall {
            info!(
                current,
                available = available.len(),
                shortfall,
                "Not enough machines for the control plane; waiting"
            );
            return Ok(self.outcome(0, current));
        }

        let now = now_millis();
        for machine in available.iter().take(shortfall) {
            insert_roles(&mut tx, &machine.mac, &Self::ROLES, now).await?;
            info!(mac = %machine.mac, ip = %machine.ipv4, "Promoted to control plane");
        }
        tx.commit().await?;

        Ok(self.outcome(shortfall, current + shortfall))
    }

    /// Whether the control plane holds its expected machine count.
    pub async fn is_satisfied(&self) -> SchedulerResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let current = count_machines_by_roles(&mut conn, &Self::ROLES).await?;
        Ok(current >= self.expected_nb)
    }

    fn outcome(&self, promoted: usize, current: usize) -> PromotionOutcome {
        PromotionOutcome {
            promoted,
            current,
            expected: Some(self.expected_nb),
            satisfied: current >= self.expected_nb,
        }
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// Promotes available machines into `kubernetes-node` once the control
/// plane is complete.
#[derive(Debug, Clone)]
pub struct KubernetesNode {
    pool: SqlitePool,
    expected_nb: Option<usize>,
    control_plane: EtcdMemberKubernetesControlPlane,
    apply_dependencies: bool,
}

impl KubernetesNode {
    pub const ROLES: [ScheduleRole; 1] = [ScheduleRole::KubernetesNode];

    pub fn new(pool: SqlitePool, settings: &PolicySettings) -> Self {
        Self {
            control_plane: EtcdMemberKubernetesControlPlane::new(
                pool.clone(),
                settings.control_plane_expected_nb,
            ),
            pool,
            expected_nb: settings.node_expected_nb,
            apply_dependencies: settings.apply_dependencies,
        }
    }

    #[instrument(skip(self), fields(expected = ?self.expected_nb))]
    pub async fn apply(&self) -> SchedulerResult<PromotionOutcome> {
        let control_plane_ready = if self.apply_dependencies {
            self.control_plane.apply().await?.satisfied
        } else {
            self.control_plane.is_satisfied().await?
        };
        self.promote(control_plane_ready).await
    }

    /// Node promotion given the control-plane state.
    pub(super) async fn promote(&self, control_plane_ready: bool) -> SchedulerResult<PromotionOutcome> {
        let mut tx = self.pool.begin().await?;
        let current = count_machines_by_roles(&mut tx, &Self::ROLES).await?;

        if !control_plane_ready {
            debug!(current, "Control plane not ready; skipping node promotion");
            return Ok(PromotionOutcome {
                promoted: 0,
                current,
                expected: self.expected_nb,
                satisfied: false,
            });
        }

        let available = available_machines(&mut tx).await?;
        let room = self
            .expected_nb
            .map_or(available.len(), |expected| expected.saturating_sub(current));
        let promoted = room.min(available.len());

        if promoted > 0 {
            let now = now_millis();
            for machine in available.iter().take(promoted) {
                insert_roles(&mut tx, &machine.mac, &Self::ROLES, now).await?;
                info!(mac = %machine.mac, ip = %machine.ipv4, "Promoted to node");
            }
            tx.commit().await?;
        }

        let current = current + promoted;
        Ok(PromotionOutcome {
            promoted,
            current,
            expected: self.expected_nb,
            satisfied: self.expected_nb.map_or(true, |expected| current >= expected),
        })
    }
}

// =============================================================================
// Combined pass
// =============================================================================

/// Outcome of a full promotion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleStats {
    pub control_plane: PromotionOutcome,
    pub nodes: PromotionOutcome,
}

impl ScheduleStats {
    pub fn promoted(&self) -> usize {
        self.control_plane.promoted + self.nodes.promoted
    }
}

/// Runs control-plane then node promotion.
#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    control_plane: EtcdMemberKubernetesControlPlane,
    nodes: KubernetesNode,
}

impl SchedulerPolicy {
    pub fn new(pool: SqlitePool, settings: &PolicySettings) -> Self {
        Self {
            control_plane: EtcdMemberKubernetesControlPlane::new(
                pool.clone(),
                settings.control_plane_expected_nb,
            ),
            nodes: KubernetesNode::new(pool, settings),
        }
    }

    #[instrument(skip(self))]
    pub async fn apply_all(&self) -> SchedulerResult<ScheduleStats> {
        let control_plane = self.control_plane.apply().await?;
        let nodes = self.nodes.promote(control_plane.satisfied).await?;
        Ok(ScheduleStats {
            control_plane,
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::scheduler::MachineScheduleStore;
    use crate::testutil::{discover, report};

    #[tokio::test]
    async fn test_control_plane_waits_for_enough_machines() {
        let db = Database::in_memory().await.unwrap();
        discover(&db, 2).await;
        let policy = EtcdMemberKubernetesControlPlane::new(db.pool().clone(), 3);

        let outcome = policy.apply().await.unwrap();
        assert_eq!(outcome.promoted, 0);
        assert_eq!(outcome.current, 0);
        assert!(!outcome.satisfied);

        let store = MachineScheduleStore::new(db.pool().clone());
        assert!(store.get_all_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_control_plane_is_a_fixed_point() {
        let db = Database::in_memory().await.unwrap();
        let macs = discover(&db, 4).await;
        let policy = EtcdMemberKubernetesControlPlane::new(db.pool().clone(), 3);

        let outcome = policy.apply().await.unwrap();
        assert_eq!(
            outcome,
            PromotionOutcome {
                promoted: 3,
                current: 3,
                expected: Some(3),
                satisfied: true,
            }
        );

        for _ in 0..2 {
            let again = policy.apply().await.unwrap();
            assert_eq!(again.promoted, 0);
            assert!(again.satisfied);
        }

        let store = MachineScheduleStore::new(db.pool().clone());
        let members = store
            .get_machines_by_roles(&EtcdMemberKubernetesControlPlane::ROLES)
            .await
            .unwrap();
        let member_macs: Vec<_> = members.iter().map(|m| m.mac).collect();
        assert_eq!(member_macs, macs[..3].to_vec());
        assert_eq!(store.get_available_machines().await.unwrap()[0].mac, macs[3]);
    }

    #[tokio::test]
    async fn test_nodes_wait_for_control_plane() {
        let db = Database::in_memory().await.unwrap();
        discover(&db, 2).await;
        let settings = PolicySettings {
            apply_dependencies: false,
            ..Default::default()
        };
        let nodes = KubernetesNode::new(db.pool().clone(), &settings);

        let outcome = nodes.apply().await.unwrap();
        assert_eq!(outcome.promoted, 0);
        assert!(!outcome.satisfied);
    }

    #[tokio::test]
    async fn test_nodes_promote_with_dependency() {
        let db = Database::in_memory().await.unwrap();
        discover(&db, 5).await;
        let nodes = KubernetesNode::new(db.pool().clone(), &PolicySettings::default());

        let outcome = nodes.apply().await.unwrap();
        assert_eq!(outcome.promoted, 2);
        assert_eq!(outcome.current, 2);
        assert_eq!(nodes.apply().await.unwrap().promoted, 0);

        let store = MachineScheduleStore::new(db.pool().clone());
        assert_eq!(
            store
                .get_role_ip_list(ScheduleRole::KubernetesNode)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_node_capacity_is_respected() {
        let db = Database::in_memory().await.unwrap();
        discover(&db, 6).await;
        let settings = PolicySettings {
            node_expected_nb: Some(1),
            ..Default::default()
        };
        let policy = SchedulerPolicy::new(db.pool().clone(), &settings);

        let stats = policy.apply_all().await.unwrap();
        assert_eq!(stats.control_plane.promoted, 3);
        assert_eq!(stats.nodes.promoted, 1);
        assert!(stats.nodes.satisfied);
        assert_eq!(stats.promoted(), 4);

        let again = policy.apply_all().await.unwrap();
        assert_eq!(again.promoted(), 0);
        assert_eq!(
            MachineScheduleStore::new(db.pool().clone())
                .get_available_machines()
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_late_machine_becomes_node() {
        let db = Database::in_memory().await.unwrap();
        discover(&db, 3).await;
        let policy = SchedulerPolicy::new(db.pool().clone(), &PolicySettings::default());

        let stats = policy.apply_all().await.unwrap();
        assert_eq!(stats.control_plane.promoted, 3);
        assert_eq!(stats.nodes.promoted, 0);

        db.discovery_store().upsert(&report(4)).await.unwrap();
        let stats = policy.apply_all().await.unwrap();
        assert_eq!(stats.control_plane.promoted, 0);
        assert_eq!(stats.nodes.promoted, 1);
    }
}
