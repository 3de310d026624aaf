//! Watches display secrets and bumps the owning runner pod's `dpVersion`
//! annotation so the pod re-reads the mounted secret without waiting on the
//! kubelet's periodic refresh.

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use owo_colors::OwoColorize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::ChannelDictionary;
use crate::observer;
use crate::util::annotations::{ANNOTATION_DP_VERSION, COMPONENT_DISPLAY_SECRET, LABEL_COMPONENT, LABEL_INSTANCE};
use crate::util::colors::FG2;
use crate::util::{Error, FIELD_MANAGER};

pub async fn run(client: Client, namespace: String, channels: ChannelDictionary, cancel: CancellationToken) {
    let channels = channels.read_only();
    let label_selector = format!("{LABEL_COMPONENT}={COMPONENT_DISPLAY_SECRET}");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let observer_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = observer::run(api, Some(label_selector), tx, observer_cancel).await {
            eprintln!("{}", format!("display-secret observer ended fatally: {err}").red());
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => {
                let Some(event) = event else { return };
                let secret = event.object;
                let Some(vm_name) = secret.labels().get(LABEL_INSTANCE).cloned() else { continue };
                if channels.get(&vm_name).is_none() {
                    continue;
                }
                let Some(resource_version) = secret.resource_version() else { continue };
                if let Err(err) = bump_pod_annotation(&client, &namespace, &vm_name, &resource_version).await {
                    eprintln!(
                        "{} {vm_name}: {err}",
                        "failed to bump dpVersion annotation for".color(FG2)
                    );
                }
            }
        }
    }
}

async fn bump_pod_annotation(
    client: &Client,
    namespace: &str,
    vm_name: &str,
    resource_version: &str,
) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    if pods.get_opt(vm_name).await?.is_none() {
        return Ok(());
    }
    let patch = json!({
        "metadata": {
            "annotations": {
                ANNOTATION_DP_VERSION: resource_version,
            }
        }
    });
    pods.patch(
        vm_name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}
