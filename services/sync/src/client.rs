//! HTTP client for the control-plane API.

use std::time::Duration;

use metalcast_model::{ScheduleRole, ScheduledMachine};
use metalcast_networking::sort_ip_list;
use metalcast_reconcile::TtlCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{SyncError, SyncResult};

/// Scheduler queries go through a TTL cache keyed on the request path.
#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    machines: TtlCache<String, Vec<ScheduledMachine>>,
    ip_lists: TtlCache<String, Vec<String>>,
}

impl ApiClient {
    pub fn new(api_uri: &str, timeout: Duration, cache_ttl: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| SyncError::Http {
                url: api_uri.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: api_uri.trim_end_matches('/').to_string(),
            machines: TtlCache::new(cache_ttl),
            ip_lists: TtlCache::new(cache_ttl),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Machines holding every role in `roles`, sorted by MAC.
    #[instrument(skip(self))]
    pub async fn query_roles(&self, roles: &[ScheduleRole]) -> SyncResult<Vec<ScheduledMachine>> {
        let joined = roles
            .iter()
            .map(ScheduleRole::as_str)
            .collect::<Vec<_>>()
            .join("&");
        let path = format!("/scheduler/{joined}");
        if let Some(machines) = self.machines.get(&path) {
            return Ok(machines);
        }

        debug!(%path, "cache is empty");
        let mut machines: Vec<ScheduledMachine> = self.get(&path).await?;
        machines.sort_by(|a, b| a.mac.cmp(&b.mac));
        self.machines.insert(path, machines.clone());
        Ok(machines)
    }

    /// IPv4 addresses of the machines holding `role`, sorted as text.
    #[instrument(skip(self))]
    pub async fn query_ip_list(&self, role: ScheduleRole) -> SyncResult<Vec<String>> {
        let path = format!("/scheduler/ip-list/{}", role.as_str());
        if let Some(ips) = self.ip_lists.get(&path) {
            return Ok(ips);
        }

        debug!(%path, "cache is empty");
        let ips: Vec<String> = self.get(&path).await?;
        let ips = sort_ip_list(&ips);
        self.ip_lists.insert(path, ips.clone());
        Ok(ips)
    }

    /// Publish the content of an ignition template under its name.
    pub async fn report_ignition(&self, name: &str, content: &str) -> SyncResult<()> {
        let body = serde_json::json!({ name: content });
        self.post(&format!("/ignition/version/{name}"), &body).await
    }

    /// Mark the rendered state as current.
    pub async fn notify(&self) -> SyncResult<()> {
        self.post("/sync-notify", &serde_json::json!({})).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| SyncError::Http {
                url: url.clone(),
                source,
            })?;
        let response = check_status(&url, response)?;
        response
            .json()
            .await
            .map_err(|source| SyncError::Http { url, source })
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> SyncResult<()> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| SyncError::Http {
                url: url.clone(),
                source,
            })?;
        check_status(&url, response)?;
        Ok(())
    }
}

fn check_status(url: &str, response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SyncError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}
