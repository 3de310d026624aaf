use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;

use super::render::RenderModel;
use crate::bus::VmChannel;
use crate::util::annotations::{COMPONENT_DISK, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME};
use crate::util::{APP_NAME, Error, FIELD_MANAGER, MANAGED_BY};

const ASSOCIATED_KEY: &str = "pvc";

/// Caches the resolved claim names `pod::render_pod` mounts, so it never has
/// to re-derive the legacy-vs-current naming this module computes.
pub(crate) const RESOLVED_NAMES_KEY: &str = "pvc:resolved-names";

fn encode_resolved_names(runner_data: &str, disks: &[(usize, String)]) -> Vec<String> {
    let mut encoded = vec![format!("runner-data={runner_data}")];
    encoded.extend(disks.iter().map(|(index, name)| format!("disk:{index}={name}")));
    encoded
}

/// Looks up the resolved `runner-data` claim name cached by [`reconcile`].
pub fn runner_data_claim_name(encoded: &[String]) -> Option<&str> {
    encoded.iter().find_map(|entry| entry.strip_prefix("runner-data="))
}

/// Looks up the resolved claim name for `disks[index]`, if that disk is
/// backed by a PVC (cdrom-only disks are absent from the cache).
pub fn disk_claim_name(encoded: &[String], index: usize) -> Option<&str> {
    let prefix = format!("disk:{index}=");
    encoded.iter().find_map(|entry| entry.strip_prefix(prefix.as_str()))
}

pub async fn reconcile(
    client: &Client,
    channel: &Arc<VmChannel>,
    model: &RenderModel<'_>,
    spec_changed: bool,
) -> Result<(), Error> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), model.namespace());

    let known_names = if spec_changed {
        let selector = format!(
            "{LABEL_MANAGED_BY}={MANAGED_BY},{LABEL_NAME}={APP_NAME},{LABEL_INSTANCE}={}",
            model.vm_name()
        );
        let listed = pvcs.list(&ListParams::default().labels(&selector)).await?;
        let names: Vec<String> = listed.iter().filter_map(|pvc| pvc.metadata.name.clone()).collect();
        let mut state = channel.state.lock().await;
        state.associated.set(ASSOCIATED_KEY, names.clone());
        names
    } else {
        let state = channel.state.lock().await;
        state.associated.get(ASSOCIATED_KEY).map(<[String]>::to_vec).unwrap_or_default()
    };

    let runner_data_name = reconcile_runner_data_pvc(&pvcs, model, &known_names, spec_changed).await?;

    let mut disk_names = Vec::new();
    for (index, disk) in model.vm.object.spec.vm.disks.iter().enumerate() {
        let Some(template) = &disk.volume_claim_template else {
            continue; // cdrom-only disks have nothing to provision
        };
        let name = reconcile_disk_pvc(&pvcs, model, &known_names, index, template, spec_changed).await?;
        disk_names.push((index, name));
    }

    let mut state = channel.state.lock().await;
    state
        .associated
        .set(RESOLVED_NAMES_KEY, encode_resolved_names(&runner_data_name, &disk_names));

    Ok(())
}

async fn reconcile_runner_data_pvc(
    pvcs: &Api<PersistentVolumeClaim>,
    model: &RenderModel<'_>,
    known_names: &[String],
    spec_changed: bool,
) -> Result<String, Error> {
    let legacy_name = format!("runner-data-{}-0", model.vm_name());
    let name = if known_names.iter().any(|n| n == &legacy_name) {
        legacy_name
    } else {
        format!("{}-runner-data", model.vm_name())
    };

    if !spec_changed {
        return Ok(name);
    }

    let mut pvc = base_pvc(model, &name, "1Gi");
    if let Some(class) = &model.config.runner_data_pvc_storage_class_name {
        pvc.spec.as_mut().unwrap().storage_class_name = Some(class.clone());
    }
    apply_full(pvcs, &name, &pvc).await?;
    Ok(name)
}

async fn reconcile_disk_pvc(
    pvcs: &Api<PersistentVolumeClaim>,
    model: &RenderModel<'_>,
    known_names: &[String],
    index: usize,
    template: &vmop_types::VolumeClaimTemplate,
    spec_changed: bool,
) -> Result<String, Error> {
    let generated_disk_name = template
        .metadata
        .name
        .as_ref()
        .map(|n| format!("{n}-disk"))
        .unwrap_or_else(|| format!("disk-{index}"));

    let legacy_name = format!("{generated_disk_name}-{}-0", model.vm_name());
    let name = if known_names.iter().any(|n| n == &legacy_name) {
        legacy_name
    } else {
        format!("{}-{generated_disk_name}", model.vm_name())
    };

    let storage = template
        .spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone())
        .unwrap_or_else(|| "10Gi".to_string());

    let existing = pvcs.get_opt(&name).await?;
    let is_bound = existing
        .as_ref()
        .and_then(|pvc| pvc.status.as_ref())
        .and_then(|s| s.phase.as_deref())
        == Some("Bound");

    if !is_bound {
        if !spec_changed && existing.is_some() {
            return Ok(name);
        }
        let mut pvc = base_pvc(model, &name, &storage);
        pvc.spec = Some(template.spec.clone());
        if pvc.spec.as_ref().unwrap().resources.is_none() {
            pvc.spec.as_mut().unwrap().resources = template.spec.resources.clone();
        }
        apply_full(pvcs, &name, &pvc).await?;
        Ok(name)
    } else {
        // Bound PVCs are otherwise immutable; only storage size and the
        // volume-attributes-class can still change.
        let patch = json!({
            "spec": {
                "resources": { "requests": { "storage": storage } },
            }
        });
        pvcs.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(name)
    }
}

fn base_pvc(model: &RenderModel<'_>, name: &str, storage: &str) -> PersistentVolumeClaim {
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    PersistentVolumeClaim {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(model.namespace().to_string()),
            labels: Some(model.labels(COMPONENT_DISK)),
            owner_references: Some(vec![model.owner_reference()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(storage.to_string()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

async fn apply_full(pvcs: &Api<PersistentVolumeClaim>, name: &str, pvc: &PersistentVolumeClaim) -> Result<(), Error> {
    pvcs.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(pvc))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    use crate::bus::VmChannel;
    use crate::reconcile::render::RenderModel;
    use crate::testutil::{self, expect, json_response};

    /// With no spec change and no PVC-backed disks, a second reconcile has
    /// nothing left to look up or apply: everything it needs came from the
    /// first pass's cache, so it must issue no further requests at all.
    #[tokio::test]
    async fn second_reconcile_without_spec_change_issues_no_requests() {
        let (client, handle) = testutil::mock_client();
        let vm = testutil::sample_vm("vm-test");
        let config = testutil::sample_config();
        let model = RenderModel::new(&vm, &config);
        let channel = VmChannel::spawn("vm-test".to_string(), client.clone(), |_, _| async {});

        let empty_list = serde_json::json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaimList",
            "items": [],
        });
        let verifier = testutil::run_script(
            handle,
            vec![
                expect(Method::GET, "persistentvolumeclaims", json_response(&empty_list)),
                expect(
                    Method::PATCH,
                    "persistentvolumeclaims/vm-test-runner-data",
                    json_response(&base_pvc(&model, "vm-test-runner-data", "1Gi")),
                ),
            ],
        );

        testutil::with_timeout(reconcile(&client, &channel, &model, true)).await.unwrap();
        testutil::await_script(verifier).await;

        // The mock service has no handler left; any further request here
        // would fail the call instead of silently succeeding.
        testutil::with_timeout(reconcile(&client, &channel, &model, false)).await.unwrap();
    }
}
