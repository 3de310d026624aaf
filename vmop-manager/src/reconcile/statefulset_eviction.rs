//! Evicts the legacy StatefulSet-managed runner in favour of a bare Pod.
//! Runs before the Pod sub-reconciler and feeds it `usingSts` so the two
//! never fight over the same runner.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;

use super::render::RenderModel;
use crate::util::{Error, FIELD_MANAGER};
use vmop_types::VmState;

/// Returns `usingSts`: whether the Pod sub-reconciler should stay idle this
/// round because a StatefulSet still owns the runner.
pub async fn reconcile(client: &Client, model: &RenderModel<'_>) -> Result<bool, Error> {
    let sts: Api<StatefulSet> = Api::namespaced(client.clone(), model.namespace());
    let Some(existing) = sts.get_opt(model.vm_name()).await? else {
        return Ok(false);
    };

    let replicas = existing.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    if replicas == 0 {
        sts.delete(model.vm_name(), &Default::default()).await?;
        crate::events::statefulset_evicted(client, &model.vm.object).await;
        return Ok(false);
    }

    if model.vm.object.spec.vm.state == VmState::Stopped {
        let patch = json!({ "spec": { "replicas": 0 } });
        sts.patch(
            model.vm_name(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch),
        )
        .await?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    use crate::reconcile::render::RenderModel;
    use crate::testutil::{self, expect, not_found_response};

    /// A VM that was never managed by the legacy StatefulSet has nothing to
    /// evict: every reconcile is a single GET that comes back empty, never a
    /// write.
    #[tokio::test]
    async fn no_statefulset_is_a_repeatable_no_op() {
        let (client, handle) = testutil::mock_client();
        let vm = testutil::sample_vm("vm-test");
        let config = testutil::sample_config();
        let model = RenderModel::new(&vm, &config);

        let verifier = testutil::run_script(
            handle,
            vec![
                expect(Method::GET, "statefulsets/vm-test", not_found_response()),
                expect(Method::GET, "statefulsets/vm-test", not_found_response()),
            ],
        );

        assert!(!testutil::with_timeout(reconcile(&client, &model)).await.unwrap());
        assert!(!testutil::with_timeout(reconcile(&client, &model)).await.unwrap());
        testutil::await_script(verifier).await;
    }
}
