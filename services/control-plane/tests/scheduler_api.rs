//! Discovery, scheduler and health API integration tests.

mod common;

use common::{discovery_body, TestHarness, M01_MAC, M01_UUID, M02_MAC, M02_UUID};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn discovery_reports_new_then_known() {
    let h = TestHarness::new().await;
    let body = discovery_body(M01_MAC, M01_UUID, "172.20.0.65");

    let (status, ack) = h.post_json("/discovery", &body).await;
    assert_eq!(status, 200);
    assert_eq!(ack, json!({"new-discovery": true}));

    let (_, ack) = h.post_json("/discovery", &body).await;
    assert_eq!(ack, json!({"new-discovery": false}));

    let (status, all) = h.get_json("/discovery").await;
    assert_eq!(status, 200);
    assert_eq!(all.as_array().unwrap().len(), 1);
    assert_eq!(all[0]["boot-info"]["mac"], M01_MAC);
    assert_eq!(all[0]["interfaces"][0]["as_boot"], true);
}

#[tokio::test]
async fn discovery_without_boot_interface_is_rejected() {
    let h = TestHarness::new().await;
    let mut body = discovery_body(M01_MAC, M01_UUID, "172.20.0.65");
    body["interfaces"][0]["mac"] = json!("52:54:00:00:00:99");

    let (status, problem) = h.post_json("/discovery", &body).await;
    assert_eq!(status, 406);
    assert_eq!(problem["code"], "invalid_report");

    let (status, _) = h.post_json("/discovery", &json!({"nope": 1})).await;
    assert_eq!(status, 406);
}

#[tokio::test]
async fn empty_schedule_request_returns_template() {
    let h = TestHarness::new().await;
    let template = json!({
        "roles": ["etcd-member", "kubernetes-control-plane", "kubernetes-node"],
        "selector": {"mac": ""}
    });

    let (status, body) = h.post_json("/scheduler", &json!({})).await;
    assert_eq!(status, 406);
    assert_eq!(body, template);

    let resp = h
        .client
        .post(h.url("/scheduler"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 406);
    assert_eq!(resp.json::<serde_json::Value>().await.unwrap(), template);

    let (status, body) = h
        .post_json(
            "/scheduler",
            &json!({"roles": ["etcd-member"], "selector": {"mac": M01_MAC}, "force": true}),
        )
        .await;
    assert_eq!(status, 406);
    assert_eq!(body, template);
}

#[tokio::test]
async fn schedule_accumulates_roles() {
    let h = TestHarness::new().await;
    h.discover(M01_MAC, M01_UUID, "172.20.0.65").await;

    let (status, echo) = h.schedule(M01_MAC, &["etcd-member"]).await;
    assert_eq!(status, 200);
    assert_eq!(echo["selector"]["mac"], M01_MAC);

    h.schedule(M01_MAC, &["etcd-member", "kubernetes-control-plane"])
        .await;
    h.schedule(M01_MAC, &["etcd-member"]).await;

    let (_, all) = h.get_json("/scheduler").await;
    assert_eq!(
        all,
        json!({M01_MAC: ["etcd-member", "kubernetes-control-plane"]})
    );

    let (_, machines) = h
        .get_json("/scheduler/etcd-member&kubernetes-control-plane")
        .await;
    assert_eq!(machines.as_array().unwrap().len(), 1);
    assert_eq!(machines[0]["roles"], "etcd-member,kubernetes-control-plane");
    assert_eq!(machines[0]["ipv4"], "172.20.0.65");

    let (_, ips) = h.get_json("/scheduler/ip-list/etcd-member").await;
    assert_eq!(ips, json!(["172.20.0.65"]));
}

#[tokio::test]
async fn schedule_errors_map_to_statuses() {
    let h = TestHarness::new().await;
    h.discover(M01_MAC, M01_UUID, "172.20.0.65").await;

    let (status, problem) = h.schedule(M01_MAC, &["bad-role"]).await;
    assert_eq!(status, 406);
    assert_eq!(problem["code"], "unknown_role");

    let (status, problem) = h.schedule(M02_MAC, &["etcd-member"]).await;
    assert_eq!(status, 404);
    assert_eq!(problem["code"], "unknown_machine");

    let (_, all) = h.get_json("/scheduler").await;
    assert_eq!(all, json!({}));
}

#[tokio::test]
async fn role_queries_tolerate_unknown_roles() {
    let h = TestHarness::new().await;
    h.discover(M01_MAC, M01_UUID, "172.20.0.65").await;
    h.discover(M02_MAC, M02_UUID, "172.20.0.66").await;
    h.schedule(M01_MAC, &["kubernetes-node"]).await;

    let (status, machines) = h.get_json("/scheduler/not-a-role").await;
    assert_eq!(status, 200);
    assert_eq!(machines, json!([]));

    let (_, ips) = h.get_json("/scheduler/ip-list/not-a-role").await;
    assert_eq!(ips, json!([]));

    let (_, available) = h.get_json("/scheduler/available").await;
    assert_eq!(available.as_array().unwrap().len(), 1);
    assert_eq!(available[0]["mac"], M02_MAC);
    assert_eq!(available[0]["roles"], "");
}

#[tokio::test]
async fn ignition_versions_and_sync_notify() {
    let h = TestHarness::new().await;

    let (_, notify) = h.get_json("/sync-notify").await;
    assert_eq!(notify, json!({"sync-notify": null}));

    let (status, version) = h
        .post_json("/ignition/version/k8s-node", &json!({"k8s-node": "ignition: v1"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(version["changed"], true);

    let (_, again) = h
        .post_json("/ignition/version/k8s-node", &json!({"k8s-node": "ignition: v1"}))
        .await;
    assert_eq!(again["changed"], false);

    let (_, hashes) = h.get_json("/ignition/version").await;
    assert_eq!(hashes["k8s-node"], version["hash"]);

    let (status, _) = h.post_json("/sync-notify", &json!({})).await;
    assert_eq!(status, 200);
    let (_, notify) = h.get_json("/sync-notify").await;
    assert!(notify["sync-notify"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn healthz_reports_each_matchbox_path() {
    let h = TestHarness::with_settings(|s| {
        s.matchbox_health_paths = vec!["/".into(), "/metadata".into()];
    })
    .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.matchbox)
        .await;

    let (status, health) = h.get_json("/healthz").await;
    assert_eq!(status, 503);
    assert_eq!(
        health,
        json!({"global": false, "db": true, "matchbox": {"/": true, "/metadata": false}})
    );

    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.matchbox)
        .await;

    let (status, health) = h.get_json("/healthz").await;
    assert_eq!(status, 200);
    assert_eq!(health["global"], true);

    assert_eq!(h.get("/livez").await.status().as_u16(), 200);
}
