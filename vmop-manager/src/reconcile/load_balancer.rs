use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use super::render::RenderModel;
use crate::config::LoadBalancerDefault;
use crate::util::annotations::COMPONENT_RUNNER;
use crate::util::{Error, FIELD_MANAGER};
use vmop_types::LoadBalancerServiceSpec;

/// Renders and applies `runnerLoadBalancer`, unless neither the reconciler
/// config nor the VM asks for one, or the VM explicitly opts out with an
/// empty `spec.loadBalancerService` override.
pub async fn reconcile(client: &Client, model: &RenderModel<'_>) -> Result<(), Error> {
    let empty = BTreeMap::new();
    let (default_labels, default_annotations) = match &model.config.load_balancer_service {
        LoadBalancerDefault::None | LoadBalancerDefault::Bool(false) => return Ok(()),
        LoadBalancerDefault::Bool(true) => (&empty, &empty),
        LoadBalancerDefault::Enabled { labels, annotations } => (labels, annotations),
    };

    let (label_overrides, annotation_overrides) = match &model.vm.object.spec.load_balancer_service {
        LoadBalancerServiceSpec::Enabled(false) => return Ok(()),
        LoadBalancerServiceSpec::Enabled(true) => (None, None),
        LoadBalancerServiceSpec::Overrides { labels, annotations } => {
            if labels.is_none() && annotations.is_none() {
                return Ok(()); // `{}` opts this VM out of the reconciler default
            }
            (labels.clone(), annotations.clone())
        }
    };

    let mut labels = model.labels(COMPONENT_RUNNER);
    apply_overrides(&mut labels, label_overrides);
    fill_defaults(&mut labels, default_labels);

    let mut annotations = BTreeMap::new();
    apply_overrides(&mut annotations, annotation_overrides);
    fill_defaults(&mut annotations, default_annotations);

    let service = Service {
        metadata: kube::api::ObjectMeta {
            name: Some(format!("{}-lb", model.vm_name())),
            namespace: Some(model.namespace().to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![model.owner_reference()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(model.labels(COMPONENT_RUNNER)),
            ports: Some(vec![ServicePort {
                name: Some("spice".to_string()),
                port: model.vm.object.spec.vm.display.spice.port as i32,
                target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
                    model.vm.object.spec.vm.display.spice.port as i32,
                )),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    };

    let services: Api<Service> = Api::namespaced(client.clone(), model.namespace());
    services
        .patch(
            &format!("{}-lb", model.vm_name()),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&service),
        )
        .await?;
    Ok(())
}

/// Applies per-VM overrides onto an already-rendered map: `Some(v)` sets the
/// key, `None` removes it.
fn apply_overrides(target: &mut BTreeMap<String, String>, overrides: Option<BTreeMap<String, Option<String>>>) {
    let Some(overrides) = overrides else { return };
    for (key, value) in overrides {
        match value {
            Some(value) => {
                target.insert(key, value);
            }
            None => {
                target.remove(&key);
            }
        }
    }
}

/// Merges reconciler-wide defaults into the rendered map, without clobbering
/// keys the render or a per-VM override already set.
fn fill_defaults(target: &mut BTreeMap<String, String>, defaults: &BTreeMap<String, String>) {
    for (key, value) in defaults {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::render::RenderModel;
    use crate::testutil;

    /// Neither the reconciler default nor the VM opts into a load balancer,
    /// so the sub-reconciler must never touch the API, on the first pass or
    /// any later one.
    #[tokio::test]
    async fn disabled_load_balancer_never_touches_the_api() {
        let (client, handle) = testutil::mock_client();
        drop(handle); // any HTTP call here fails fast instead of silently hanging

        let vm = testutil::sample_vm("vm-test");
        let config = testutil::sample_config();
        let model = RenderModel::new(&vm, &config);

        reconcile(&client, &model).await.unwrap();
        reconcile(&client, &model).await.unwrap();
    }
}
