//! Restart recovery, ownership takeover, and shutdown scenarios.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wahub_core::{ConnectionPhase, ConnectionStatus, CredentialBlob};
use wahub_integration_tests::{HarnessBuilder, drain_status_updates, key};
use wahub_pool::{AttachOptions, ShutdownMode};
use wahub_storage::{DocPath, DocumentStore, FieldPatch};

async fn seed_projection(docs: &Arc<wahub_storage::MemoryDocumentStore>, id: &str, status: &str) {
    docs.set(
        &DocPath::new("sessions", id).unwrap(),
        json!({
            "session_doc": {
                "whatsapp_web": {
                    "status": status,
                    "proxy_country": "us",
                    "last_updated": chrono::Utc::now().to_rfc3339(),
                }
            }
        }),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn recovery_after_crash_stays_connected() {
    let blob_dir = tempfile::tempdir().unwrap();
    let k = key("U3", "+447700900123");

    // A previous process life: blob on disk, projection says connected
    {
        let harness = HarnessBuilder::new()
            .blob_root(blob_dir.path().to_path_buf())
            .build()
            .await;
        harness
            .blobs
            .save(&k, &CredentialBlob::new().with_file("creds.json", b"{}".to_vec()))
            .await
            .unwrap();
        seed_projection(&harness.docs, "U3:+447700900123", "connected").await;

        // "Restart": build a fresh harness over the same stores
        let restarted = HarnessBuilder::new()
            .auto_open()
            .sharing(&harness)
            .blob_root(blob_dir.path().to_path_buf())
            .instance_id("restarted")
            .build()
            .await;
        let mut receiver = restarted.bus.subscribe();

        let recovered = restarted.pool.recover_on_startup().await.unwrap();
        assert_eq!(recovered, 1);

        assert!(restarted.wait_phase(&k, ConnectionPhase::Connected).await);
        let record = restarted.pool.snapshot_of(&k).await.unwrap();
        assert!(record.is_recovery);
        assert!(record.handshake_completed);
        assert!(record.sync_completed);
        // The stored country is reused, never re-detected
        assert_eq!(record.country.as_str(), "us");

        // The projection never dipped below connected
        let statuses = drain_status_updates(&mut receiver);
        assert!(statuses.iter().all(|s| *s == ConnectionStatus::Connected));
        assert_eq!(
            restarted.doc_status(&k).await,
            Some(ConnectionStatus::Connected)
        );

        // No import pipeline ran
        let snapshot = restarted.state.snapshot(&k).unwrap();
        assert!(snapshot.sync_completed);
    }
}

#[tokio::test]
async fn recovery_skips_logged_out_sessions() {
    let blob_dir = tempfile::tempdir().unwrap();
    let harness = HarnessBuilder::new()
        .auto_open()
        .blob_root(blob_dir.path().to_path_buf())
        .build()
        .await;

    let active = key("U1", "+12025550101");
    let gone = key("U2", "+12025550102");
    for k in [&active, &gone] {
        harness
            .blobs
            .save(k, &CredentialBlob::new().with_file("creds.json", b"{}".to_vec()))
            .await
            .unwrap();
    }
    seed_projection(&harness.docs, "U1:+12025550101", "connected").await;
    seed_projection(&harness.docs, "U2:+12025550102", "logged_out").await;

    let recovered = harness.pool.recover_on_startup().await.unwrap();
    assert_eq!(recovered, 1);
    assert!(harness.pool.snapshot_of(&active).await.is_some());
    assert!(harness.pool.snapshot_of(&gone).await.is_none());
}

#[tokio::test]
async fn ownership_takeover_after_stale_heartbeat() {
    let k = key("U4", "+819012345678");
    let instance_a = HarnessBuilder::new().instance_id("instance-a").build().await;
    instance_a
        .pool
        .attach(k.clone(), AttachOptions::default())
        .await
        .unwrap();

    // Instance A stops heartbeating
    let old = chrono::Utc::now()
        .checked_sub_signed(chrono::Duration::seconds(120))
        .unwrap();
    let mut patch = FieldPatch::new();
    patch.insert(
        "last_heartbeat".to_string(),
        serde_json::to_value(old).unwrap(),
    );
    instance_a
        .docs
        .merge_fields(&DocPath::new("instances", "instance-a").unwrap(), &patch)
        .await
        .unwrap();

    // Instance B acquires and attaches fresh
    let instance_b = HarnessBuilder::new()
        .instance_id("instance-b")
        .auto_open()
        .sharing(&instance_a)
        .build()
        .await;
    instance_b
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

    let doc = instance_a
        .docs
        .get(&DocPath::new("session_ownership", k.to_string()).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["instance_id"], "instance-b");
}

#[tokio::test]
async fn preserving_shutdown_marks_pending_recovery() {
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
    // Save a blob the way pairing would have
    harness
        .blobs
        .save(&k, &CredentialBlob::new().with_file("creds.json", b"{}".to_vec()))
        .await
        .unwrap();

    harness.pool.shutdown(ShutdownMode::Preserving).await;

    assert_eq!(harness.pool.session_count().await, 0);
    assert_eq!(
        harness.doc_status(&k).await,
        Some(ConnectionStatus::PendingRecovery)
    );
    // The blob survives for adoption by another instance
    assert!(harness.blobs.load(&k).await.unwrap().is_some());
    // No protocol logout happened
    let session0 = harness.session(0).await;
    assert!(!session0.logged_out());
    assert_eq!(harness.coordinator.owned_count(), 0);
}

#[tokio::test]
async fn logout_shutdown_destroys_credentials() {
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
    harness
        .blobs
        .save(&k, &CredentialBlob::new().with_file("creds.json", b"{}".to_vec()))
        .await
        .unwrap();

    harness.pool.shutdown(ShutdownMode::Logout).await;

    assert_eq!(harness.pool.session_count().await, 0);
    assert_eq!(harness.doc_status(&k).await, Some(ConnectionStatus::LoggedOut));
    assert!(harness.blobs.load(&k).await.unwrap().is_none());
    let session0 = harness.session(0).await;
    assert!(session0.logged_out());
}

#[tokio::test]
async fn detach_then_detach_is_noop() {
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

    let options = wahub_pool::DetachOptions {
        preserve_session: true,
        reason: "user request".to_string(),
    };
    harness.pool.detach(&k, options.clone()).await.unwrap();
    assert!(harness.wait_absent(&k).await);
    harness.pool.detach(&k, options).await.unwrap();

    assert!(harness.wait_doc_status(&k, ConnectionStatus::Disconnected).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.coordinator.owned_count(), 0);
}
