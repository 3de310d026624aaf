use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Volume, VolumeMount};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use super::pvc;
use super::render::{RenderModel, scaled_ram_mib};
use crate::bus::VmChannel;
use crate::util::annotations::{ANNOTATION_CM_VERSION, ANNOTATION_DP_VERSION, COMPONENT_RUNNER};
use crate::util::{Error, FIELD_MANAGER};
use vmop_types::VmState;

/// Renders and applies `runnerPod`, unless a StatefulSet still owns the VM
/// (see the eviction sub-reconciler) or the pod is already up and running.
pub async fn reconcile(
    client: &Client,
    channel: &Arc<VmChannel>,
    model: &RenderModel<'_>,
    using_sts: bool,
) -> Result<(), Error> {
    if using_sts {
        return Ok(());
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), model.namespace());
    let existing = pods.get_opt(model.vm_name()).await?;
    let state = model.vm.object.spec.vm.state;

    match (existing, state) {
        (Some(_), VmState::Running) => Ok(()),
        (Some(_), VmState::Stopped) => {
            pods.delete(model.vm_name(), &Default::default()).await?;
            crate::events::pod_deleted(client, &model.vm.object).await;
            Ok(())
        }
        (None, VmState::Stopped) => Ok(()),
        (None, VmState::Running) => {
            let resolved_names = {
                let state = channel.state.lock().await;
                state.associated.get(pvc::RESOLVED_NAMES_KEY).map(<[String]>::to_vec).unwrap_or_default()
            };
            let pod = render_pod(model, &resolved_names)?;
            pods.patch(
                model.vm_name(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&pod),
            )
            .await?;
            crate::events::pod_created(client, &model.vm.object).await;
            Ok(())
        }
    }
}

pub fn statefulset_api(client: &Client, namespace: &str) -> Api<StatefulSet> {
    Api::namespaced(client.clone(), namespace)
}

fn render_pod(model: &RenderModel<'_>, resolved_names: &[String]) -> Result<Pod, Error> {
    let vm = &model.vm.object.spec.vm;
    let ram_mib = scaled_ram_mib(&vm.current_ram, model.config.ram_overcommit)?;

    let mut volume_mounts = vec![VolumeMount {
        name: "runner-config".to_string(),
        mount_path: "/etc/vmrunner".to_string(),
        read_only: Some(true),
        ..Default::default()
    }];
    let mut volumes = vec![Volume {
        name: "runner-config".to_string(),
        config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
            name: model.vm_name().to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }];

    if vm.display.spice.generate_secret {
        volume_mounts.push(VolumeMount {
            name: "display-secret".to_string(),
            mount_path: "/etc/vmrunner/display".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "display-secret".to_string(),
            secret: Some(k8s_openapi::api::core::v1::SecretVolumeSource {
                secret_name: Some(format!("{}-display-secret", model.vm_name())),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let runner_data_claim = pvc::runner_data_claim_name(resolved_names)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-runner-data", model.vm_name()));
    volume_mounts.push(VolumeMount {
        name: "runner-data".to_string(),
        mount_path: "/var/lib/vmrunner".to_string(),
        ..Default::default()
    });
    volumes.push(Volume {
        name: "runner-data".to_string(),
        persistent_volume_claim: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
            claim_name: runner_data_claim,
            ..Default::default()
        }),
        ..Default::default()
    });

    for (index, disk) in vm.disks.iter().enumerate() {
        if disk.volume_claim_template.is_none() {
            continue; // cdrom-only disks are not backed by a PVC
        }
        let Some(claim_name) = pvc::disk_claim_name(resolved_names, index) else {
            continue; // not yet provisioned; the next reconcile picks it up
        };
        let volume_name = format!("disk-{index}");
        volume_mounts.push(VolumeMount {
            name: volume_name.clone(),
            mount_path: format!("/var/lib/vmrunner/disks/{index}"),
            ..Default::default()
        });
        volumes.push(Volume {
            name: volume_name,
            persistent_volume_claim: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(ANNOTATION_CM_VERSION.to_string(), String::new());
    annotations.insert(ANNOTATION_DP_VERSION.to_string(), String::new());

    Ok(Pod {
        metadata: kube::api::ObjectMeta {
            name: Some(model.vm_name().to_string()),
            namespace: Some(model.namespace().to_string()),
            labels: Some(model.labels(COMPONENT_RUNNER)),
            annotations: Some(annotations),
            owner_references: Some(vec![model.owner_reference()]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "vmrunner".to_string(),
                image: Some("vmrunner:latest".to_string()),
                env: Some(vec![
                    k8s_openapi::api::core::v1::EnvVar {
                        name: "VMRUNNER_RAM_MIB".to_string(),
                        value: Some(ram_mib.to_string()),
                        ..Default::default()
                    },
                    k8s_openapi::api::core::v1::EnvVar {
                        name: "VMRUNNER_CPUS".to_string(),
                        value: Some(vm.current_cpus.to_string()),
                        ..Default::default()
                    },
                ]),
                volume_mounts: Some(volume_mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use kube::api::ObjectMeta;

    use crate::bus::VmChannel;
    use crate::reconcile::render::RenderModel;
    use crate::testutil::{self, expect, json_response};

    fn running_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A VM whose pod is already up stays untouched: each reconcile is just
    /// a GET, never a PATCH, whether it's the first call this process has
    /// made or the tenth.
    #[tokio::test]
    async fn running_pod_already_present_is_never_patched() {
        let (client, handle) = testutil::mock_client();
        let vm = testutil::sample_vm("vm-test");
        let config = testutil::sample_config();
        let model = RenderModel::new(&vm, &config);
        let channel = VmChannel::spawn("vm-test".to_string(), client.clone(), |_, _| async {});

        let verifier = testutil::run_script(
            handle,
            vec![
                expect(Method::GET, "pods/vm-test", json_response(&running_pod("vm-test"))),
                expect(Method::GET, "pods/vm-test", json_response(&running_pod("vm-test"))),
            ],
        );

        testutil::with_timeout(reconcile(&client, &channel, &model, false)).await.unwrap();
        testutil::with_timeout(reconcile(&client, &channel, &model, false)).await.unwrap();
        testutil::await_script(verifier).await;
    }
}
