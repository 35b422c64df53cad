// Reconciler behaviour against the mock provider: create, update and
// finalizer-driven delete paths.

mod common;

use common::{harness, key, owner_label, provisioned, server, terminating, vm_spec};
use vmctl_common::{LifecycleState, ResourceKey, VmResource, FINALIZER};
use vmctl_controller::reconciler::{ReconcileError, ReconcileOutcome, OWNER_LABEL_KEY};
use vmctl_controller::ResourceStore;
use vmctl_providers::mock::{MockOperation, ProviderCall};
use vmctl_providers::{
    CloneStorageDevice, ErrorKind, IpFamily, Label, ModifyVmRequest, NetworkInterface,
    NetworkType, ProviderError, ServerState,
};

const FIRST_MOCK_ID: &str = "00000000-0000-4000-8000-000000000001";

#[tokio::test]
async fn creates_vm_and_records_status() {
    let h = harness();
    let created = h.store.create(&key("vm-1"), vm_spec()).await.unwrap();

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Created);

    let calls = h.provider.calls().await;
    assert_eq!(calls.len(), 2, "expected create + wait, got {:?}", calls);
    let ProviderCall::Create(request) = &calls[0] else {
        panic!("first call should be a create, got {:?}", calls[0]);
    };
    assert_eq!(request.title, "vm-1");
    assert_eq!(request.hostname, "vm-1");
    assert_eq!(request.core_number, 2);
    assert_eq!(request.memory_amount, 4096);
    assert_eq!(request.zone, "fi-hel1");
    assert_eq!(request.plan, "custom");
    assert_eq!(
        request.storage_devices,
        vec![CloneStorageDevice {
            template: "template-uuid".to_string(),
            title: "vm-1".to_string(),
            size_gb: 25,
            tier: "maxiops".to_string(),
        }]
    );
    assert_eq!(
        request.interfaces,
        vec![NetworkInterface {
            network_type: NetworkType::Utility,
            ip_families: vec![IpFamily::IPv4],
        }]
    );
    assert_eq!(
        request.labels,
        vec![Label::new(OWNER_LABEL_KEY, created.metadata.uid.to_string())]
    );
    assert_eq!(
        calls[1],
        ProviderCall::Wait(FIRST_MOCK_ID.to_string(), ServerState::Started)
    );

    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(stored.status.vm_id, FIRST_MOCK_ID);
    assert_eq!(stored.status.state, LifecycleState::Ready);
    assert_eq!(stored.status.ip_address, "10.0.0.1");
    assert!(stored.metadata.has_finalizer(FINALIZER));
}

#[tokio::test]
async fn rename_appends_title_label_and_waits() {
    let h = harness();
    h.store.insert(provisioned("vm-2", "abc123")).await;
    h.provider
        .insert_server(server("abc123", "vm-1", vec![Label::new("env", "prod")]))
        .await;

    let outcome = h.reconciler.reconcile(&key("vm-2")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated);

    let expected = ModifyVmRequest {
        title: "vm-2".to_string(),
        plan: "custom".to_string(),
        zone: "fi-hel1".to_string(),
        core_number: 2,
        memory_amount: 4096,
        timezone: None,
        labels: Some(vec![Label::new("env", "prod"), Label::new("title", "vm-2")]),
    };
    assert_eq!(
        h.provider.calls().await,
        vec![
            ProviderCall::Get("abc123".to_string()),
            ProviderCall::Modify("abc123".to_string(), expected),
            ProviderCall::Wait("abc123".to_string(), ServerState::Started),
        ]
    );
    let stored = h.store.get(&key("vm-2")).await.unwrap();
    assert_eq!(stored.status.vm_id, "abc123");
    assert_eq!(h.provider.server("abc123").await.unwrap().title, "vm-2");
}

#[tokio::test]
async fn second_rename_keeps_earlier_title_label() {
    let h = harness();
    h.store.insert(provisioned("vm-3", "abc123")).await;
    h.provider
        .insert_server(server(
            "abc123",
            "vm-2",
            vec![Label::new("env", "prod"), Label::new("title", "vm-2")],
        ))
        .await;

    let outcome = h.reconciler.reconcile(&key("vm-3")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated);

    let labels = h.provider.server("abc123").await.unwrap().labels;
    assert_eq!(
        labels,
        vec![
            Label::new("env", "prod"),
            Label::new("title", "vm-2"),
            Label::new("title", "vm-3"),
        ]
    );

    // Title now matches, so the next pass leaves the VM alone.
    h.provider.clear_calls().await;
    let outcome = h.reconciler.reconcile(&key("vm-3")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::InSync);
    assert!(h.provider.calls_of(MockOperation::Modify).await.is_empty());
}

#[tokio::test]
async fn deletion_with_vm_deletes_then_releases_finalizer() {
    let h = harness();
    let mut record = terminating("vm-1", "abc123");
    record.metadata.add_finalizer("example.com/keep");
    h.store.insert(record).await;
    h.provider.insert_server(server("abc123", "vm-1", vec![])).await;

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Finalized);
    assert_eq!(
        h.provider.calls().await,
        vec![ProviderCall::Delete("abc123".to_string())]
    );
    assert_eq!(h.provider.server_count().await, 0);

    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(stored.metadata.finalizers, vec!["example.com/keep".to_string()]);
}

#[tokio::test]
async fn deletion_of_last_finalizer_removes_record() {
    let h = harness();
    h.store.insert(terminating("vm-1", "abc123")).await;
    h.provider.insert_server(server("abc123", "vm-1", vec![])).await;

    h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert!(h.store.get(&key("vm-1")).await.unwrap_err().is_not_found());

    // A later pass finds nothing and touches nothing.
    h.provider.clear_calls().await;
    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::NotFound);
    assert!(h.provider.calls().await.is_empty());
}

#[tokio::test]
async fn deletion_without_vm_makes_no_provider_calls() {
    let h = harness();
    let mut record = terminating("vm-1", "");
    record.status.state = LifecycleState::Uninitialized;
    h.store.insert(record).await;

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Finalized);
    assert!(h.provider.calls().await.is_empty());
    assert!(h.store.get(&key("vm-1")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn missing_record_is_a_no_op() {
    let h = harness();
    let outcome = h
        .reconciler
        .reconcile(&ResourceKey::new("default", "ghost"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::NotFound);
    assert!(h.provider.calls().await.is_empty());
}

#[tokio::test]
async fn second_pass_does_not_create_again() {
    let h = harness();
    h.store.create(&key("vm-1"), vm_spec()).await.unwrap();

    assert_eq!(
        h.reconciler.reconcile(&key("vm-1")).await.unwrap(),
        ReconcileOutcome::Created
    );
    let before = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(
        h.reconciler.reconcile(&key("vm-1")).await.unwrap(),
        ReconcileOutcome::InSync
    );

    assert_eq!(h.provider.calls_of(MockOperation::Create).await.len(), 1);
    assert!(h.provider.calls_of(MockOperation::Modify).await.is_empty());
    assert_eq!(h.provider.server_count().await, 1);
    // In-sync pass writes nothing.
    let after = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(after.metadata.resource_version, before.metadata.resource_version);
}

#[tokio::test]
async fn status_conflict_refetches_before_retrying() {
    let h = harness();
    h.store.create(&key("vm-1"), vm_spec()).await.unwrap();
    h.store.fail_next_status_updates_with_conflict(1);

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Created);
    // Initial read plus one re-read after the conflict.
    assert_eq!(h.store.get_count(), 2);

    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(stored.status.vm_id, FIRST_MOCK_ID);
    assert_eq!(h.provider.calls_of(MockOperation::Create).await.len(), 1);
}

#[tokio::test]
async fn interrupted_create_is_adopted_not_duplicated() {
    let h = harness();
    let mut record = VmResource::new(key("vm-1"), vm_spec());
    record.metadata.add_finalizer(FINALIZER);
    record.status.state = LifecycleState::Provisioning;
    let record = h.store.insert(record).await;

    let mut orphan = server("orphan-1", "vm-1", vec![owner_label(&record)]);
    orphan.state = ServerState::Maintenance;
    h.provider.insert_server(orphan).await;

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Adopted);
    assert_eq!(
        h.provider.calls().await,
        vec![
            ProviderCall::FindByLabel(owner_label(&record)),
            ProviderCall::Wait("orphan-1".to_string(), ServerState::Started),
        ]
    );

    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(stored.status.vm_id, "orphan-1");
    assert_eq!(stored.status.ip_address, "10.1.1.1");
    assert_eq!(stored.status.state, LifecycleState::Ready);
}

#[tokio::test]
async fn already_exists_on_create_adopts_labelled_vm() {
    let h = harness();
    let record = h.store.create(&key("vm-1"), vm_spec()).await.unwrap();
    h.provider
        .insert_server(server("existing-1", "vm-1", vec![owner_label(&record)]))
        .await;
    h.provider
        .fail_next(
            MockOperation::Create,
            ProviderError::api(
                ErrorKind::AlreadyExists,
                409,
                "RESOURCE_ALREADY_EXISTS",
                "already exists",
            ),
        )
        .await;

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Adopted);
    assert_eq!(h.provider.server_count().await, 1);
    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(stored.status.vm_id, "existing-1");
}

#[tokio::test]
async fn wait_timeout_leaves_marker_and_next_pass_adopts() {
    let h = harness();
    h.store.create(&key("vm-1"), vm_spec()).await.unwrap();
    h.provider
        .fail_next(
            MockOperation::Wait,
            ProviderError::Timeout {
                uuid: FIRST_MOCK_ID.to_string(),
                desired: ServerState::Started,
                last: ServerState::Maintenance,
                waited: std::time::Duration::from_secs(600),
            },
        )
        .await;

    let err = h.reconciler.reconcile(&key("vm-1")).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Provider {
            operation: "wait_for_state",
            ..
        }
    ));
    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert!(stored.status.vm_id.is_empty());
    assert_eq!(stored.status.state, LifecycleState::Provisioning);
    assert!(stored.metadata.has_finalizer(FINALIZER));

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Adopted);
    assert_eq!(h.provider.calls_of(MockOperation::Create).await.len(), 1);
    assert_eq!(h.provider.server_count().await, 1);
}

#[tokio::test]
async fn rejected_create_keeps_finalizer_and_retries() {
    let h = harness();
    h.store.create(&key("vm-1"), vm_spec()).await.unwrap();
    h.provider
        .fail_next(
            MockOperation::Create,
            ProviderError::api(
                ErrorKind::PermanentRejection,
                400,
                "PLAN_INVALID",
                "plan is not valid",
            ),
        )
        .await;

    let err = h.reconciler.reconcile(&key("vm-1")).await.unwrap_err();
    let ReconcileError::Provider { source, .. } = &err else {
        panic!("expected provider error, got {:?}", err);
    };
    assert_eq!(source.kind(), ErrorKind::PermanentRejection);
    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert!(stored.metadata.has_finalizer(FINALIZER));
    assert!(stored.status.vm_id.is_empty());

    assert_eq!(
        h.reconciler.reconcile(&key("vm-1")).await.unwrap(),
        ReconcileOutcome::Created
    );
}

#[tokio::test]
async fn failed_delete_keeps_finalizer() {
    let h = harness();
    h.store.insert(terminating("vm-1", "abc123")).await;
    h.provider.insert_server(server("abc123", "vm-1", vec![])).await;
    h.provider
        .fail_next(
            MockOperation::Delete,
            ProviderError::api(ErrorKind::Transient, 503, "SERVICE_UNAVAILABLE", "try later"),
        )
        .await;

    let err = h.reconciler.reconcile(&key("vm-1")).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Provider {
            operation: "delete_vm_and_storage",
            ..
        }
    ));
    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert!(stored.metadata.has_finalizer(FINALIZER));

    assert_eq!(
        h.reconciler.reconcile(&key("vm-1")).await.unwrap(),
        ReconcileOutcome::Finalized
    );
    assert!(h.store.get(&key("vm-1")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn vm_already_gone_counts_as_deleted() {
    let h = harness();
    h.store.insert(terminating("vm-1", "vanished")).await;

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Finalized);
    assert_eq!(
        h.provider.calls().await,
        vec![ProviderCall::Delete("vanished".to_string())]
    );
    assert!(h.store.get(&key("vm-1")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn deletion_during_create_cleans_up_by_label() {
    let h = harness();
    let mut record = terminating("vm-1", "");
    record.status.state = LifecycleState::Provisioning;
    let record = h.store.insert(record).await;
    h.provider
        .insert_server(server("orphan-1", "vm-1", vec![owner_label(&record)]))
        .await;

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Finalized);
    assert_eq!(
        h.provider.calls().await,
        vec![
            ProviderCall::FindByLabel(owner_label(&record)),
            ProviderCall::Delete("orphan-1".to_string()),
        ]
    );
    assert_eq!(h.provider.server_count().await, 0);
}

#[tokio::test]
async fn foreign_finalizers_are_left_alone() {
    let h = harness();
    let mut record = terminating("vm-1", "abc123");
    record.metadata.finalizers = vec!["example.com/other".to_string()];
    h.store.insert(record).await;

    let outcome = h.reconciler.reconcile(&key("vm-1")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Skipped);
    assert!(h.provider.calls().await.is_empty());
    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(stored.metadata.finalizers, vec!["example.com/other".to_string()]);
}

#[tokio::test]
async fn finalizer_is_persisted_before_provisioning() {
    let h = harness();
    h.store.create(&key("vm-1"), vm_spec()).await.unwrap();
    h.provider
        .fail_next(
            MockOperation::Create,
            ProviderError::api(ErrorKind::Transient, 503, "SERVICE_UNAVAILABLE", "try later"),
        )
        .await;

    h.reconciler.reconcile(&key("vm-1")).await.unwrap_err();
    let stored = h.store.get(&key("vm-1")).await.unwrap();
    assert_eq!(stored.metadata.finalizers, vec![FINALIZER.to_string()]);
}
