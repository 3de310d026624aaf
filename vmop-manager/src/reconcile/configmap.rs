use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;

use super::render::RenderModel;
use crate::util::annotations::{ANNOTATION_CM_VERSION, COMPONENT_RUNNER};
use crate::util::{Error, FIELD_MANAGER};

/// Renders `runnerConfig` and server-side applies it. If the resulting
/// `resourceVersion` changed and a runner pod already exists, bumps the
/// pod's `cmVersion` annotation so its mount reflects the new content
/// without waiting for the kubelet's periodic refresh.
pub async fn reconcile(client: &Client, model: &RenderModel<'_>) -> Result<(), Error> {
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), model.namespace());

    let previous_version = config_maps
        .get_opt(model.vm_name())
        .await?
        .and_then(|cm| cm.metadata.resource_version);

    let config_map = ConfigMap {
        metadata: kube::api::ObjectMeta {
            name: Some(model.vm_name().to_string()),
            namespace: Some(model.namespace().to_string()),
            labels: Some(model.labels(COMPONENT_RUNNER)),
            owner_references: Some(vec![model.owner_reference()]),
            ..Default::default()
        },
        data: Some(render_data(model)?),
        ..Default::default()
    };

    let applied = config_maps
        .patch(
            model.vm_name(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        )
        .await?;

    let new_version = applied.metadata.resource_version;
    if new_version != previous_version
        && let Some(new_version) = new_version
    {
        bump_pod_cm_version(client, model, &new_version).await?;
    }

    Ok(())
}

fn render_data(model: &RenderModel<'_>) -> Result<BTreeMap<String, String>, Error> {
    let vm = &model.vm.object.spec.vm;
    let mut data = BTreeMap::new();
    data.insert("currentRam".to_string(), vm.current_ram.clone());
    data.insert("currentCpus".to_string(), vm.current_cpus.to_string());
    data.insert("resetCount".to_string(), model.vm.reset_count.to_string());
    if let Some(props) = &model.config.logging_properties {
        data.insert("logging.properties".to_string(), props.clone());
    }
    if let Some(meta_data) = &model.vm.object.spec.cloud_init.meta_data {
        data.insert("meta-data".to_string(), meta_data.clone());
    }
    Ok(data)
}

async fn bump_pod_cm_version(client: &Client, model: &RenderModel<'_>, new_version: &str) -> Result<(), Error> {
    use k8s_openapi::api::core::v1::Pod;
    let pods: Api<Pod> = Api::namespaced(client.clone(), model.namespace());
    if pods.get_opt(model.vm_name()).await?.is_none() {
        return Ok(());
    }
    let patch = json!({
        "metadata": { "annotations": { ANNOTATION_CM_VERSION: new_version } }
    });
    pods.patch(
        model.vm_name(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use kube::api::ObjectMeta;

    use crate::reconcile::render::RenderModel;
    use crate::testutil::{self, expect, json_response, not_found_response};

    fn applied_config_map(name: &str, resource_version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// The ConfigMap is always re-applied (the runner must re-read
    /// `resetCount` even without a spec change), but a second reconcile
    /// against an unchanged `resourceVersion` must not also touch the pod.
    #[tokio::test]
    async fn second_reconcile_skips_the_pod_bump() {
        let (client, handle) = testutil::mock_client();
        let vm = testutil::sample_vm("vm-test");
        let config = testutil::sample_config();
        let model = RenderModel::new(&vm, &config);

        let verifier = testutil::run_script(
            handle,
            vec![
                expect(Method::GET, "configmaps/vm-test", not_found_response()),
                expect(
                    Method::PATCH,
                    "configmaps/vm-test",
                    json_response(&applied_config_map("vm-test", "1")),
                ),
                expect(Method::GET, "pods/vm-test", not_found_response()),
                expect(
                    Method::GET,
                    "configmaps/vm-test",
                    json_response(&applied_config_map("vm-test", "1")),
                ),
                expect(
                    Method::PATCH,
                    "configmaps/vm-test",
                    json_response(&applied_config_map("vm-test", "1")),
                ),
            ],
        );

        testutil::with_timeout(reconcile(&client, &model)).await.unwrap();
        testutil::with_timeout(reconcile(&client, &model)).await.unwrap();
        testutil::await_script(verifier).await;
    }
}
