//! The sync pass: scheduled machines in, boot-config profiles and groups out.

use std::collections::BTreeMap;

use metalcast_model::{ScheduleRole, ScheduledMachine};
use metalcast_reconcile::{retry_fixed, FixedRetry};
use tracing::{error, info, instrument};

use crate::client::ApiClient;
use crate::config::{SyncConfig, CONTROL_PLANE_MARKER, NODES_MARKER};
use crate::error::{SyncError, SyncResult};
use crate::matchbox::{Boot, Group, MatchboxWriter, Profile, WriteOutcome};
use crate::render::{automatic_name, machine_metadata, ClusterView, ControlPlaneMetadata};

const CONTROL_PLANE_ROLES: [ScheduleRole; 2] = [
    ScheduleRole::EtcdMember,
    ScheduleRole::KubernetesControlPlane,
];
const NODE_ROLES: [ScheduleRole; 1] = [ScheduleRole::KubernetesNode];

/// Renders the scheduler's view of the cluster into the boot-config service.
///
/// The engine only reads scheduler state; its writes go to the boot-config
/// data directory and to the API's ignition-version and sync-notify records.
#[derive(Debug)]
pub struct ConfigSyncSchedules {
    config: SyncConfig,
    api: ApiClient,
    writer: MatchboxWriter,
}

impl ConfigSyncSchedules {
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let api = ApiClient::new(&config.api_uri, config.http_timeout(), config.cache_ttl())?;
        let writer = MatchboxWriter::new(&config.matchbox_path);
        Ok(Self {
            config,
            api,
            writer,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Publish every configured ignition template to the API.
    ///
    /// A missing template is fatal. An unreachable API is logged and the
    /// template skipped. Returns how many templates were accepted.
    #[instrument(skip(self))]
    pub async fn report_ignitions(&self) -> SyncResult<usize> {
        let mut reported = 0;
        for (marker, name) in &self.config.ignition_dict {
            let path = self
                .config
                .matchbox_path
                .join("ignition")
                .join(format!("{name}.yaml"));
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                error!(%marker, path = %path.display(), "ignition template is missing");
                SyncError::io(&path, e)
            })?;

            match self.api.report_ignition(name, &content).await {
                Ok(()) => {
                    info!(%marker, %name, "ignition content reported");
                    reported += 1;
                }
                Err(e) => error!(%marker, %name, error = %e, "ignition content not reported"),
            }
        }
        Ok(reported)
    }

    async fn cluster_view(&self) -> SyncResult<ClusterView> {
        Ok(ClusterView {
            etcd_member_ips: self.api.query_ip_list(ScheduleRole::EtcdMember).await?,
            control_plane_ips: self
                .api
                .query_ip_list(ScheduleRole::KubernetesControlPlane)
                .await?,
        })
    }

    /// Render every etcd member running the Kubernetes control plane.
    #[instrument(skip(self))]
    pub async fn etcd_member_kubernetes_control_plane(&self) -> SyncResult<usize> {
        let machines = self.api.query_roles(&CONTROL_PLANE_ROLES).await?;
        let cluster = self.cluster_view().await?;
        let control_plane = ControlPlaneMetadata::new(&self.config, &cluster, machines.len());

        for (i, machine) in machines.iter().enumerate() {
            let name = automatic_name("cp", i, machine);
            let mut metadata =
                machine_metadata(&self.config, &cluster, machine, &name, &CONTROL_PLANE_ROLES)?;
            metadata.control_plane = Some(control_plane.clone());
            self.produce(CONTROL_PLANE_MARKER, i, machine, serde_json::to_value(&metadata)?)
                .await?;
        }
        info!(synced = machines.len(), "control plane synced");
        Ok(machines.len())
    }

    /// Render every Kubernetes worker.
    #[instrument(skip(self))]
    pub async fn kubernetes_nodes(&self) -> SyncResult<usize> {
        let machines = self.api.query_roles(&NODE_ROLES).await?;
        let cluster = self.cluster_view().await?;

        for (i, machine) in machines.iter().enumerate() {
            let name = automatic_name("no", i, machine);
            let metadata = machine_metadata(&self.config, &cluster, machine, &name, &NODE_ROLES)?;
            self.produce(NODES_MARKER, i, machine, serde_json::to_value(&metadata)?)
                .await?;
        }
        info!(synced = machines.len(), "nodes synced");
        Ok(machines.len())
    }

    pub async fn notify(&self) -> SyncResult<()> {
        self.api.notify().await
    }

    /// Both renders followed by a sync notification, retried as a whole
    /// while the failure is transient.
    ///
    /// Returns the number of machines rendered by the successful attempt.
    pub async fn apply(&self, policy: FixedRetry) -> SyncResult<usize> {
        info!(attempts = policy.attempts, "start syncing");
        retry_fixed(policy, SyncError::is_transient, |_| self.apply_once())
            .await
            .inspect_err(|e| {
                error!(error = %e, attempts = policy.attempts, "sync failed");
            })
    }

    async fn apply_once(&self) -> SyncResult<usize> {
        let synced = self.etcd_member_kubernetes_control_plane().await?
            + self.kubernetes_nodes().await?;
        self.notify().await?;
        Ok(synced)
    }

    async fn produce(
        &self,
        marker: &str,
        index: usize,
        machine: &ScheduledMachine,
        metadata: serde_json::Value,
    ) -> SyncResult<()> {
        self.writer.write_profile(&self.profile(marker)?).await?;

        let mut selector = BTreeMap::from([("mac".to_string(), machine.mac.to_string())]);
        selector.extend(self.config.extra_selectors.clone());

        let group = Group {
            id: format!("{marker}-{index}"),
            name: marker.to_string(),
            profile: marker.to_string(),
            selector,
            metadata,
        };
        if self.writer.write_group(&group).await? == WriteOutcome::Written {
            info!(group = %group.id, mac = %machine.mac, "group updated");
        }
        Ok(())
    }

    fn profile(&self, marker: &str) -> SyncResult<Profile> {
        let ignition = self
            .config
            .ignition_dict
            .get(marker)
            .ok_or_else(|| SyncError::MissingIgnition(marker.to_string()))?;

        let assets = self
            .config
            .assets_server_uri
            .as_deref()
            .unwrap_or(&self.config.matchbox_uri)
            .trim_end_matches('/');
        let matchbox = self.config.matchbox_uri.trim_end_matches('/');

        Ok(Profile {
            id: marker.to_string(),
            name: marker.to_string(),
            ignition_id: format!("{ignition}.yaml"),
            boot: Boot {
                kernel: format!("{assets}{}", self.config.kernel),
                initrd: vec![format!("{assets}{}", self.config.initrd)],
                args: vec![
                    format!("coreos.config.url={matchbox}/ignition?uuid=${{uuid}}&mac=${{net0/mac:hexhyp}}"),
                    "coreos.first_boot".to_string(),
                    "coreos.oem.id=pxe".to_string(),
                    "console=ttyS0".to_string(),
                    "console=tty0".to_string(),
                ],
            },
        })
    }
}
