//! Watches `VirtualMachine` CRs, decorates each with runtime-derived fields,
//! and republishes as `VmResourceChanged` on the VM's own channel. Also runs
//! the startup purge that heals child-resource state left behind by a CR
//! deletion the manager missed while offline.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PersistentVolumeClaim, Secret, Service};
use kube::api::ListParams;
use kube::{Api, Client, Resource, ResourceExt};
use owo_colors::OwoColorize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use vmop_types::VirtualMachine;

use crate::bus::{ChangeType, ChannelDictionary, VmChannel, VmEvent};
use crate::model::VmDefinition;
use crate::monitors::pod_monitor::PendingBuffer;
use crate::monitors::pool_monitor::MembershipUpdate;
use crate::observer::{self, ObserverChange};
use crate::util::annotations::{LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME};
use crate::util::colors::{FG1, FG2};
use crate::util::{APP_NAME, MANAGED_BY};

/// Starts the VM Monitor. `make_handler` is invoked once per newly-created
/// VM channel to produce the handler its pump task will run; this is how
/// the reconciler's dispatcher gets wired in without `vm_monitor` needing to
/// know about sub-reconcilers.
pub async fn run<H, F>(
    client: Client,
    namespace: String,
    channels: ChannelDictionary,
    membership_tx: mpsc::UnboundedSender<MembershipUpdate>,
    pending_pod_changes: PendingBuffer,
    cancel: CancellationToken,
    make_handler: impl Fn() -> H + Send + Sync + 'static,
) where
    H: Fn(Arc<VmChannel>, VmEvent) -> F + Send + Sync + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let vms: Api<VirtualMachine> = Api::namespaced(client.clone(), &namespace);

    if let Err(err) = purge_orphans(&client, &namespace, &vms).await {
        eprintln!("{} {err}", "startup purge failed:".color(FG2));
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let api: Api<VirtualMachine> = Api::namespaced(client.clone(), &namespace);
    let observer_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = observer::run(api, None, tx, observer_cancel).await {
            eprintln!("{}", format!("VM observer ended fatally: {err}").red());
            std::process::exit(1);
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => {
                let Some(event) = event else { return };
                handle_event(&client, &pods, &channels, &membership_tx, &pending_pod_changes, event, &make_handler).await;
            }
        }
    }
}

async fn handle_event<H, F>(
    client: &Client,
    pods: &Api<Pod>,
    channels: &ChannelDictionary,
    membership_tx: &mpsc::UnboundedSender<MembershipUpdate>,
    pending_pod_changes: &PendingBuffer,
    event: observer::ObserverEvent<VirtualMachine>,
    make_handler: &(impl Fn() -> H + Send + Sync + 'static),
) where
    H: Fn(Arc<VmChannel>, VmEvent) -> F + Send + Sync + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let object = event.object;
    let Some(name) = object.metadata.name.clone() else { return };

    let mut vm_def = VmDefinition::from_object(object);
    if vm_def.is_running() {
        decorate_with_node_info(pods, &mut vm_def).await;
    }
    let vm_def = Arc::new(vm_def);

    let change = match event.change {
        ObserverChange::Added => ChangeType::Added,
        ObserverChange::Modified => ChangeType::Modified,
        ObserverChange::Deleted => ChangeType::Deleted,
        ObserverChange::Bookmark => return,
    };

    let client = client.clone();
    let channel = match channels.get_or_create_with(
        &name,
        || {
            let handler = make_handler();
            VmChannel::spawn(name.clone(), client.clone(), handler)
        },
        |created| {
            for buffered in pending_pod_changes.drain(&created.name) {
                created.publish(VmEvent::PodChanged {
                    change: buffered.change,
                    pod: buffered.pod,
                });
            }
        },
    ) {
        Some(channel) => channel,
        None => return,
    };

    let spec_changed = {
        let mut state = channel.state.lock().await;
        let spec_changed = state.last_generation != Some(vm_def.generation);
        state.last_generation = Some(vm_def.generation);
        state.vm = Some(vm_def.clone());
        spec_changed
    };

    println!(
        "{} {}/{} ({change:?}, specChanged={spec_changed})",
        "VM changed:".color(FG1),
        vm_def.namespace,
        vm_def.name
    );

    let _ = membership_tx.send(MembershipUpdate {
        change,
        vm: vm_def.clone(),
    });

    channel.publish(VmEvent::VmResourceChanged {
        change,
        vm: vm_def.clone(),
        spec_changed,
        pod_changed: false,
    });

    if matches!(change, ChangeType::Deleted) {
        let (tx, rx) = oneshot::channel();
        channel.publish(VmEvent::Drain(tx));
        let _ = rx.await;
        channels.remove(&vm_def.name);
    }
}

/// Fills in `nodeName`/`nodeAddresses` by reading the runner pod, when the
/// VM's `Running` condition is true.
async fn decorate_with_node_info(pods: &Api<Pod>, vm: &mut VmDefinition) {
    let Ok(Some(pod)) = pods.get_opt(&vm.name).await else { return };
    let Some(spec) = &pod.spec else { return };
    vm.node_name = spec.node_name.clone();
    if let Some(status) = &pod.status
        && let Some(addresses) = &status.pod_ips
    {
        vm.node_addresses = addresses.iter().filter_map(|ip| ip.ip.clone()).collect();
    }
}

/// Deletes every operator-managed child resource whose `instance` label
/// doesn't correspond to a currently-existing VM. Runs once at startup.
async fn purge_orphans(client: &Client, namespace: &str, vms: &Api<VirtualMachine>) -> Result<(), kube::Error> {
    let known: std::collections::HashSet<String> = vms
        .list(&ListParams::default())
        .await?
        .into_iter()
        .filter_map(|vm| vm.metadata.name)
        .collect();

    let selector = format!("{LABEL_MANAGED_BY}={MANAGED_BY},{LABEL_NAME}={APP_NAME}");
    let params = ListParams::default().labels(&selector);

    purge_kind::<Pod>(client, namespace, &params, &known).await?;
    purge_kind::<ConfigMap>(client, namespace, &params, &known).await?;
    purge_kind::<PersistentVolumeClaim>(client, namespace, &params, &known).await?;
    purge_kind::<Secret>(client, namespace, &params, &known).await?;
    purge_kind::<Service>(client, namespace, &params, &known).await?;
    purge_kind::<StatefulSet>(client, namespace, &params, &known).await?;
    Ok(())
}

async fn purge_kind<K>(
    client: &Client,
    namespace: &str,
    params: &ListParams,
    known_vms: &std::collections::HashSet<String>,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let items = api.list(params).await?;
    for item in items {
        let Some(instance) = item.labels().get(LABEL_INSTANCE).cloned() else { continue };
        if known_vms.contains(&instance) {
            continue;
        }
        let Some(name) = item.meta().name.clone() else { continue };
        println!("{} {name} (instance={instance})", "purging orphaned child:".color(FG2));
        let object_ref = item.object_ref(&());
        let _ = api.delete(&name, &Default::default()).await;
        crate::events::orphan_purged(client, object_ref, &kind, &name).await;
    }
    Ok(())
}
