//! Kubernetes `Event` emission for the handful of significant transitions:
//! pod created/deleted, display secret rotated, StatefulSet evicted, and
//! startup-purge deletions.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventRecorder, EventSource, EventType, NewEvent};
use kube::{Client, Resource, ResourceExt};
use vmop_types::VirtualMachine;

/// The literal `action` every event is published with; differentiation
/// between event kinds comes from `reason`/`note`, not `action`.
const ACTION: &str = "StatusUpdate";

fn event_source() -> EventSource {
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| "vmop-manager".to_string());
    let controller_name = format!("{}/{}", VirtualMachine::group(&()), crate::util::APP_NAME);
    EventSource {
        controller_name,
        controller_pod_name: pod_name
            .try_into()
            .unwrap_or_else(|_| "vmop-manager".to_string().try_into().expect("fallback name is valid")),
    }
}

/// Builds the recorder for one VM's object reference. Cheap to construct;
/// callers build one per event rather than holding it across reconciles.
fn recorder_for(client: &Client, vm: &VirtualMachine) -> EventRecorder {
    EventRecorder::new(client.clone(), event_source(), vm.object_ref(&()))
}

/// Builds a recorder regarding an arbitrary object reference, for events
/// (like the startup purge) that don't concern a still-existing VM.
fn recorder_for_ref(client: &Client, object_ref: ObjectReference) -> EventRecorder {
    EventRecorder::new(client.clone(), event_source(), object_ref)
}

pub async fn pod_created(client: &Client, vm: &VirtualMachine) {
    publish(client, vm, "CreatePod", "runner pod created", EventType::Normal).await;
}

pub async fn pod_deleted(client: &Client, vm: &VirtualMachine) {
    publish(client, vm, "DeletePod", "runner pod deleted", EventType::Normal).await;
}

pub async fn display_secret_rotated(client: &Client, vm: &VirtualMachine, user: &str) {
    publish(
        client,
        vm,
        "RotateDisplaySecret",
        &format!("display secret rotated for console user {user}"),
        EventType::Normal,
    )
    .await;
}

pub async fn statefulset_evicted(client: &Client, vm: &VirtualMachine) {
    publish(
        client,
        vm,
        "EvictStatefulSet",
        "legacy StatefulSet-managed runner evicted in favour of a bare pod",
        EventType::Normal,
    )
    .await;
}

pub async fn orphan_purged(client: &Client, object_ref: ObjectReference, kind: &str, name: &str) {
    let recorder = recorder_for_ref(client, object_ref);
    let result = recorder
        .publish(NewEvent {
            action: ACTION.to_string(),
            reason: "PurgeOrphan".to_string(),
            note: Some(format!("deleted orphaned {kind} {name} with no matching VM")),
            event_type: EventType::Warning,
            secondary_object: None,
        })
        .await;
    if let Err(err) = result {
        eprintln!("failed to publish purge event for {kind} {name}: {err}");
    }
}

async fn publish(client: &Client, vm: &VirtualMachine, reason: &str, note: &str, event_type: EventType) {
    let recorder = recorder_for(client, vm);
    let result = recorder
        .publish(NewEvent {
            action: ACTION.to_string(),
            reason: reason.to_string(),
            note: Some(note.to_string()),
            event_type,
            secondary_object: None,
        })
        .await;
    if let Err(err) = result {
        eprintln!("failed to publish event {reason} for {}: {err}", vm.name_any());
    }
}
