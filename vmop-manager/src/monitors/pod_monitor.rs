//! Watches runner pods and routes each change onto its VM's channel. A pod
//! event that arrives before the VM is known is buffered and replayed once
//! the VM shows up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use crate::bus::{ChangeType, ChannelDictionary, PodChangeKind, VmEvent};
use crate::model::PendingPodChange;
use crate::observer::{self, ObserverChange};
use crate::util::PENDING_POD_CHANGE_TTL;
use crate::util::annotations::{COMPONENT_RUNNER, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME};
use crate::util::colors::FG2;

/// Pod changes buffered for VMs the Channel Dictionary doesn't know about
/// yet. Shared between the Pod Monitor (which enqueues) and the VM Monitor
/// (which drains, exactly when it creates that VM's channel).
#[derive(Clone, Default)]
pub struct PendingBuffer {
    by_vm: Arc<Mutex<HashMap<String, Vec<PendingPodChange>>>>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, vm_name: String, change: PodChangeKind, pod: Arc<Pod>) {
        let mut by_vm = self.by_vm.lock().unwrap();
        self.purge_locked(&mut by_vm);
        by_vm.entry(vm_name.clone()).or_default().push(PendingPodChange {
            vm_name,
            change,
            pod,
            enqueued_at: Instant::now(),
        });
    }

    pub fn drain(&self, vm_name: &str) -> Vec<PendingPodChange> {
        let mut by_vm = self.by_vm.lock().unwrap();
        self.purge_locked(&mut by_vm);
        by_vm.remove(vm_name).unwrap_or_default()
    }

    fn purge_locked(&self, by_vm: &mut HashMap<String, Vec<PendingPodChange>>) {
        let now = Instant::now();
        by_vm.retain(|_, entries| {
            entries.retain(|e| now.duration_since(e.enqueued_at) < PENDING_POD_CHANGE_TTL);
            !entries.is_empty()
        });
    }
}

pub async fn run(
    client: Client,
    namespace: String,
    channels: ChannelDictionary,
    pending: PendingBuffer,
    cancel: CancellationToken,
) {
    let label_selector = format!(
        "{LABEL_NAME}=vmrunner,{LABEL_COMPONENT}={COMPONENT_RUNNER},{LABEL_MANAGED_BY}=vmoperator"
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let api: Api<Pod> = Api::namespaced(client, &namespace);
    let observer_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = observer::run(api, Some(label_selector), tx, observer_cancel).await {
            eprintln!("{}", format!("pod observer ended fatally: {err}").red());
        }
    });

    let channels = channels.read_only();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => {
                let Some(event) = event else { return };
                let pod = Arc::new(event.object);
                let Some(vm_name) = pod.labels().get(LABEL_INSTANCE).cloned() else { continue };
                let change = match event.change {
                    ObserverChange::Added => PodChangeKind::Added,
                    ObserverChange::Modified => PodChangeKind::Modified,
                    ObserverChange::Deleted => PodChangeKind::Deleted,
                    ObserverChange::Bookmark => continue,
                };

                match channels.get(&vm_name) {
                    Some(channel) => {
                        for buffered in pending.drain(&vm_name) {
                            channel.publish(VmEvent::PodChanged { change: buffered.change, pod: buffered.pod });
                        }
                        channel.publish(VmEvent::PodChanged { change, pod: pod.clone() });
                        if let Some(vm) = channel.current_vm().await {
                            channel.publish(VmEvent::VmResourceChanged {
                                change: ChangeType::Modified,
                                vm,
                                spec_changed: false,
                                pod_changed: true,
                            });
                        }
                    }
                    None => {
                        println!(
                            "{} {vm_name}",
                            "buffering pod event for not-yet-known VM:".color(FG2)
                        );
                        pending.enqueue(vm_name, change, pod);
                    }
                }
            }
        }
    }
}
