//! Proxy allocation scenarios: fallback, stable-open release, rotation.

use std::time::Duration;

use serde_json::json;
use wahub_core::{ConnectionPhase, CountryCode, PhoneNumber};
use wahub_integration_tests::{HarnessBuilder, key};
use wahub_pool::{AttachOptions, PoolError};
use wahub_protocol::ProtocolError;
use wahub_proxy::testing::FakeVendor;

#[tokio::test]
async fn proxy_exhaustion_falls_back_to_neighbor() {
    // Belgium is empty; the region table's first neighbor is nl
    let harness = HarnessBuilder::new()
        .auto_open()
        .with_proxy(FakeVendor::new().with_stock("nl", 2))
        .build()
        .await;
    let k = key("U2", "+3212345678");

    harness
        .pool
        .attach(
            k.clone(),
            AttachOptions {
                country: Some(CountryCode::parse("be").unwrap()),
                is_recovery: true,
                ..AttachOptions::default()
            },
        )
        .await
        .unwrap();

    let assignment = harness.allocator.as_ref().unwrap().assignment_of(&k).unwrap();
    assert_eq!(assignment.country.as_str(), "nl");
    assert_eq!(assignment.original_country.as_str(), "be");
    assert!(assignment.fallback_used);

    // The projection records the country actually in use
    let row = harness.state.read_projection(&k).await.unwrap().unwrap();
    assert_eq!(
        row.proxy_country.map(|c| c.as_str().to_string()).as_deref(),
        Some("nl")
    );
}

#[tokio::test]
async fn strict_mode_surfaces_unavailable() {
    let harness = HarnessBuilder::new()
        .auto_open()
        .with_proxy(FakeVendor::new().with_stock("nl", 2))
        .strict_proxy()
        .build()
        .await;
    let k = key("U2", "+3212345678");

    let err = harness
        .pool
        .attach(
            k.clone(),
            AttachOptions {
                country: Some(CountryCode::parse("be").unwrap()),
                ..AttachOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Proxy(wahub_proxy::ProxyError::Unavailable(_))
    ));
    // Nothing leaked: no connection, no ownership, no assignment
    assert_eq!(harness.pool.session_count().await, 0);
    assert_eq!(harness.coordinator.owned_count(), 0);
    assert_eq!(harness.vendor.live_count(), 0);
}

#[tokio::test]
async fn stable_open_releases_proxy_once() {
    let harness = HarnessBuilder::new()
        .auto_open()
        .with_proxy(FakeVendor::new().with_stock("us", 5))
        .build()
        .await;
    let k = key("U1", "+12025550101");

    harness
        .pool
        .attach(
            k.clone(),
            AttachOptions {
                is_recovery: true,
                ..AttachOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(harness.wait_phase(&k, ConnectionPhase::Connected).await);
    assert_eq!(harness.vendor.live_count(), 1);

    // The stable-open window elapses while the socket stays up
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(harness.vendor.live_count(), 0);
    let record = harness.pool.snapshot_of(&k).await.unwrap();
    assert!(record.proxy_released);
    assert_eq!(harness.vendor.released().len(), 1);
}

#[tokio::test]
async fn network_send_error_rotates_proxy_and_reconnects() {
    let harness = HarnessBuilder::new()
        .auto_open()
        .with_proxy(FakeVendor::new().with_stock("us", 5))
        .build()
        .await;
    let k = key("U1", "+12025550101");

    harness
        .pool
        .attach(
            k.clone(),
            AttachOptions {
                is_recovery: true,
                ..AttachOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(harness.wait_phase(&k, ConnectionPhase::Connected).await);
    let first_ip = harness
        .allocator
        .as_ref()
        .unwrap()
        .assignment_of(&k)
        .unwrap()
        .ip;

    let session0 = harness.session(0).await;
    session0
        .fail_next_send(ProtocolError::SendFailed("connect ETIMEDOUT".to_string()))
        .await;

    let to = PhoneNumber::parse("+3212345678").unwrap();
    let err = harness
        .pool
        .send(&k, &to, &json!({"text": "hello"}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Protocol(_)));

    // The owner task rotates and opens a replacement socket
    for _ in 0..200 {
        if harness.connector.connect_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.connector.connect_count(), 2);
    assert!(harness.wait_phase(&k, ConnectionPhase::Connected).await);

    let rotated = harness
        .allocator
        .as_ref()
        .unwrap()
        .assignment_of(&k)
        .unwrap();
    assert_eq!(rotated.country.as_str(), "us");
    assert_ne!(rotated.ip, first_ip);
}

#[tokio::test]
async fn send_through_open_session_tracks_api_origin() {
    let harness = HarnessBuilder::new().auto_open().build().await;
    let k = key("U1", "+12025550101");
    harness
        .pool
        .attach(
            k.clone(),
            AttachOptions {
                is_recovery: true,
                ..AttachOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(harness.wait_phase(&k, ConnectionPhase::Connected).await);

    let to = PhoneNumber::parse("+3212345678").unwrap();
    let id = harness
        .pool
        .send(&k, &to, &json!({"text": "hello"}))
        .await
        .unwrap();
    assert!(!id.is_empty());

    let session0 = harness.session(0).await;
    let sent = session0.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, to);
}
