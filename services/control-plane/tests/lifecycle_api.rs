//! Lifecycle and install-authorization API integration tests.

mod common;

use common::{raw_query, TestHarness, M01_MAC, M01_UUID, M02_MAC, M02_UUID};
use metalcast_control_plane::lifecycle::LockScope;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn lists_start_empty() {
    let h = TestHarness::new().await;
    for list in ["/lifecycle/coreos-install", "/lifecycle/ignition", "/lifecycle/rolling"] {
        let (status, body) = h.get_json(list).await;
        assert_eq!(status, 200);
        assert_eq!(body, json!([]), "{list}");
    }
}

#[tokio::test]
async fn coreos_install_keeps_creation_order() {
    let h = TestHarness::new().await;

    let (status, _) = h
        .post_json(
            &format!("/lifecycle/coreos-install/success/{}", raw_query(M01_MAC, M01_UUID)),
            &json!(null),
        )
        .await;
    assert_eq!(status, 200);
    h.post_json(
        &format!("/lifecycle/coreos-install/fail/{}", raw_query(M02_MAC, M02_UUID)),
        &json!(null),
    )
    .await;

    let (_, all) = h.get_json("/lifecycle/coreos-install").await;
    let all = all.as_array().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["success"], true);
    assert_eq!(all[0]["mac"], M01_MAC);
    assert_eq!(all[1]["success"], false);

    let (status, _) = h
        .post_json(
            &format!("/lifecycle/coreos-install/maybe/{}", raw_query(M01_MAC, M01_UUID)),
            &json!(null),
        )
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn query_without_uuid_is_rejected() {
    let h = TestHarness::new().await;
    let (status, problem) = h
        .post_json("/lifecycle/coreos-install/success/mac=52-54-00-e8-32-5b", &json!(null))
        .await;
    assert_eq!(status, 406);
    assert_eq!(problem["code"], "invalid_query");
}

#[tokio::test]
async fn rolling_enable_get_and_disable() {
    let h = TestHarness::new().await;
    let rawq = raw_query(M01_MAC, M01_UUID);

    let resp = h
        .client
        .post(h.url(&format!("/lifecycle/rolling/{rawq}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let (status, body) = h.get_json(&format!("/lifecycle/rolling/{rawq}")).await;
    assert_eq!(status, 200);
    assert_eq!(
        body,
        json!({
            "enable": true,
            "request_raw_query": "mac=52-54-00-e8-32-5b&uuid=b7f5f93a-b029-475f-b3a4-479ba198cb8a&os=installed",
            "strategy": "kexec"
        })
    );

    let (_, all) = h.get_json("/lifecycle/rolling").await;
    assert_eq!(all.as_array().unwrap().len(), 1);
    assert_eq!(all[0]["enable"], true);

    let resp = h
        .client
        .delete(h.url(&format!("/lifecycle/rolling/{rawq}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let (status, body) = h.get_json(&format!("/lifecycle/rolling/{rawq}")).await;
    assert_eq!(status, 401);
    assert_eq!(body["enable"], false);
}

#[tokio::test]
async fn rolling_unknown_machine_is_unauthorized() {
    let h = TestHarness::new().await;
    let rawq = raw_query(M02_MAC, M02_UUID);

    let (status, body) = h.get_json(&format!("/lifecycle/rolling/{rawq}")).await;
    assert_eq!(status, 401);
    assert_eq!(
        body,
        json!({
            "enable": false,
            "strategy": null,
            "request_raw_query": "mac=52-54-00-a5-24-f5&uuid=a21a9123-302d-488d-976c-5d6ded84a32d&os=installed"
        })
    );
}

#[tokio::test]
async fn rolling_bad_strategy_keeps_previous() {
    let h = TestHarness::new().await;
    let rawq = raw_query(M01_MAC, M01_UUID);
    let url = format!("/lifecycle/rolling/{rawq}");

    let (status, _) = h.post_json(&url, &json!({"strategy": "reboot"})).await;
    assert_eq!(status, 200);

    let (status, problem) = h.post_json(&url, &json!({"strategy": "notpossible"})).await;
    assert_eq!(status, 406);
    assert_eq!(problem["code"], "invalid_request");

    let (_, body) = h.get_json(&url).await;
    assert_eq!(body["strategy"], "reboot");
}

#[tokio::test]
async fn ignition_report_compares_with_matchbox() {
    let h = TestHarness::new().await;
    let rawq = raw_query(M01_MAC, M01_UUID);
    let served = json!({"ignition": {"version": "2.0.0"}, "storage": {"files": []}});

    Mock::given(method("GET"))
        .and(path("/ignition"))
        .and(query_param("mac", "52-54-00-e8-32-5b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&served))
        .mount(&h.matchbox)
        .await;

    // Same document with keys in another order.
    let applied = json!({"storage": {"files": []}, "ignition": {"version": "2.0.0"}});
    let (status, body) = h
        .post_json(&format!("/lifecycle/ignition/{rawq}"), &applied)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"up_to_date": true}));

    let stale = json!({"ignition": {"version": "2.0.0"}});
    let (_, body) = h
        .post_json(&format!("/lifecycle/ignition/{rawq}"), &stale)
        .await;
    assert_eq!(body, json!({"up_to_date": false}));

    let (_, all) = h.get_json("/lifecycle/ignition").await;
    assert_eq!(all.as_array().unwrap().len(), 1);
    assert_eq!(all[0]["up_to_date"], false);
}

#[tokio::test]
async fn ignition_report_fails_when_matchbox_is_down() {
    let h = TestHarness::with_settings(|s| {
        s.matchbox_uri = "http://127.0.0.1:1".into();
    })
    .await;
    let rawq = raw_query(M01_MAC, M01_UUID);

    let (status, problem) = h
        .post_json(&format!("/lifecycle/ignition/{rawq}"), &json!({}))
        .await;
    assert_eq!(status, 502);
    assert_eq!(problem["retryable"], true);

    let (_, all) = h.get_json("/lifecycle/ignition").await;
    assert_eq!(all, json!([]));
}

#[tokio::test]
async fn install_authorization_is_locked_per_machine() {
    let h = TestHarness::new().await;

    let first = h.get("/install-authorization/mac=01-02-03-04-05-06").await;
    assert_eq!(first.status().as_u16(), 200);

    let again = h.get("/install-authorization/mac=01-02-03-04-05-06").await;
    assert_eq!(again.status().as_u16(), 403);

    let other = h.get("/install-authorization/mac=01-02-03-04-05-07").await;
    assert_eq!(other.status().as_u16(), 200);

    let bad = h.get("/install-authorization/uuid=nope").await;
    assert_eq!(bad.status().as_u16(), 406);
}

#[tokio::test]
async fn install_authorization_global_scope() {
    let h = TestHarness::with_settings(|s| {
        s.install_lock.scope = LockScope::Global;
    })
    .await;

    assert_eq!(
        h.get("/install-authorization/mac=01-02-03-04-05-06")
            .await
            .status()
            .as_u16(),
        200
    );
    let (status, body) = h.get_json("/install-authorization/mac=01-02-03-04-05-07").await;
    assert_eq!(status, 403);
    assert_eq!(body["authorized"], false);
}
