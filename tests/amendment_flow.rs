mod support;

use casebook_core::model::{AmendmentPatch, UserId};
use casebook_core::queue::QueueConfig;
use casebook_core::CaseError;

use support::{booking, build_harness, MockRemote};

fn patch_hospital(name: &str) -> AmendmentPatch {
    AmendmentPatch {
        hospital: Some(name.into()),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn second_amendment_without_override_is_rejected() {
    let remote = MockRemote::new(true);
    let harness = build_harness(remote, QueueConfig::default()).await;
    let editor = UserId::new("editor");

    let case = harness.store.create_case(booking("General Hospital")).await.unwrap();

    harness
        .store
        .amend_case(&case.id, patch_hospital("City Hospital"), &editor, None, false)
        .await
        .unwrap();

    let result = harness
        .store
        .amend_case(&case.id, patch_hospital("Riverside Clinic"), &editor, None, false)
        .await;
    assert!(matches!(result, Err(CaseError::AlreadyAmended(_))));

    let local = harness.ledger.get(&case.id).await.unwrap();
    assert_eq!(local.amendment_history.len(), 1);
    assert_eq!(local.fields.hospital, "City Hospital");
}

#[tokio::test(flavor = "multi_thread")]
async fn override_appends_second_amendment_and_keeps_the_first() {
    let remote = MockRemote::new(true);
    let harness = build_harness(remote, QueueConfig::default()).await;
    let editor = UserId::new("editor");
    let admin = UserId::new("admin");

    let case = harness.store.create_case(booking("General Hospital")).await.unwrap();
    let original_hospital = case.fields.hospital.clone();

    harness
        .store
        .amend_case(&case.id, patch_hospital("City Hospital"), &editor, None, false)
        .await
        .unwrap();
    let amended = harness
        .store
        .amend_case(
            &case.id,
            patch_hospital("Riverside Clinic"),
            &admin,
            Some("booking error".into()),
            true,
        )
        .await
        .unwrap();

    assert_eq!(amended.amendment_history.len(), 2);
    assert_eq!(amended.amendment_history[0].actor, editor);
    assert_eq!(amended.amendment_history[1].actor, admin);
    assert_eq!(amended.fields.hospital, "Riverside Clinic");

    // The snapshot of pre-amendment values is written exactly once.
    let originals = amended.original_values.as_ref().unwrap();
    assert_eq!(originals.hospital, original_hospital);
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_amendment_replays_on_reconnect() {
    let remote = MockRemote::new(true);
    let harness = build_harness(remote.clone(), QueueConfig::default()).await;
    let editor = UserId::new("editor");

    let case = harness.store.create_case(booking("General Hospital")).await.unwrap();

    remote.set_online(false);
    let amended = harness
        .store
        .amend_case(&case.id, patch_hospital("City Hospital"), &editor, None, false)
        .await
        .unwrap();
    assert!(amended.is_amended);
    assert!(amended.sync_status.is_pending());
    assert_eq!(harness.queue.len().await, 1);

    remote.set_online(true);
    let report = harness.engine.drain().await;
    assert_eq!(report.committed, 1);

    let remote_case = remote.case(case.id.as_str()).unwrap();
    assert!(remote_case.is_amended);
    assert_eq!(remote_case.fields.hospital, "City Hospital");

    let local = harness.ledger.get(&case.id).await.unwrap();
    assert!(local.sync_status.is_synced());
}
