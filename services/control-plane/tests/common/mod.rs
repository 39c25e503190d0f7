//! Shared harness for control-plane API tests.

#![allow(dead_code)]

use metalcast_control_plane::{
    api,
    db::Database,
    state::{ApiSettings, AppState},
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use wiremock::MockServer;

pub const M01_MAC: &str = "52:54:00:e8:32:5b";
pub const M01_UUID: &str = "b7f5f93a-b029-475f-b3a4-479ba198cb8a";
pub const M02_MAC: &str = "52:54:00:a5:24:f5";
pub const M02_UUID: &str = "a21a9123-302d-488d-976c-5d6ded84a32d";

/// A running control plane backed by an in-memory store, with a mock
/// boot-config service.
pub struct TestHarness {
    pub base_url: String,
    pub client: reqwest::Client,
    pub db: Database,
    pub matchbox: MockServer,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    pub async fn with_settings(configure: impl FnOnce(&mut ApiSettings)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,metalcast_control_plane=debug,sqlx=warn".into()),
            )
            .with_test_writer()
            .try_init();

        let matchbox = MockServer::start().await;
        let db = Database::in_memory().await.unwrap();

        let mut settings = ApiSettings {
            matchbox_uri: matchbox.uri(),
            ..Default::default()
        };
        configure(&mut settings);

        let state = AppState::new(db.clone(), settings).unwrap();
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            db,
            matchbox,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    pub async fn get_json(&self, path: &str) -> (u16, Value) {
        let resp = self.get(path).await;
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    pub async fn discover(&self, mac: &str, uuid: &str, ip: &str) {
        let (status, body) = self.post_json("/discovery", &discovery_body(mac, uuid, ip)).await;
        assert_eq!(status, 200, "discovery failed: {body}");
    }

    pub async fn schedule(&self, mac: &str, roles: &[&str]) -> (u16, Value) {
        self.post_json("/scheduler", &json!({"roles": roles, "selector": {"mac": mac}}))
            .await
    }
}

/// A discovery report as posted by the discovery agent.
pub fn discovery_body(mac: &str, uuid: &str, ip: &str) -> Value {
    json!({
        "boot-info": {"uuid": uuid, "mac": mac},
        "interfaces": [
            {
                "name": "eth0",
                "netmask": 21,
                "mac": mac,
                "ipv4": ip,
                "cidrv4": format!("{ip}/21"),
                "gateway": "172.20.0.1",
                "as_boot": true
            }
        ],
        "disks": [{"path": "/dev/sda", "size-bytes": 21474836480u64}],
        "lldp": {"is_file": false, "data": null}
    })
}

/// The raw query a booted machine sends, with a hyphenated MAC.
pub fn raw_query(mac: &str, uuid: &str) -> String {
    format!("mac={}&uuid={}&os=installed", mac.replace(':', "-"), uuid)
}

/// Deterministic machine `i` for multi-machine scenarios.
pub fn machine(i: u8) -> (String, String, String) {
    (
        format!("52:54:00:00:01:{i:02x}"),
        format!("00000000-0000-4000-8000-0000000001{i:02x}"),
        format!("172.20.0.{}", 10 + i),
    )
}
