use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use rand::RngCore;
use tokio::sync::oneshot;
use tokio::time::timeout;

use super::render::RenderModel;
use crate::bus::VmChannel;
use crate::model::PendingConsoleRequest;
use crate::util::annotations::COMPONENT_DISPLAY_SECRET;
use crate::util::patch::patch_status;
use crate::util::{DISPLAY_SECRET_ROTATION_TIMEOUT, Error, FIELD_MANAGER};
use vmop_types::{VirtualMachine, VirtualMachineStatus};

fn secret_name(vm_name: &str) -> String {
    format!("{vm_name}-display-secret")
}

/// Reactive path: only runs on `specChanged`. Creates the secret with
/// `expiry=now` if none exists yet; a subsequent rotation is required
/// before console access works.
pub async fn reconcile(client: &Client, model: &RenderModel<'_>) -> Result<(), Error> {
    let spice = &model.vm.object.spec.vm.display.spice;
    if !spice.generate_secret {
        return Ok(());
    }

    let secrets: Api<Secret> = Api::namespaced(client.clone(), model.namespace());
    let name = secret_name(model.vm_name());
    if secrets.get_opt(&name).await?.is_some() {
        return Ok(());
    }

    let password = random_password();
    let secret = Secret {
        metadata: kube::api::ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(model.namespace().to_string()),
            labels: Some(model.labels(COMPONENT_DISPLAY_SECRET)),
            owner_references: Some(vec![model.owner_reference()]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("password".to_string(), ByteString(password.into_bytes())),
            ("expiry".to_string(), ByteString(b"now".to_vec())),
        ])),
        ..Default::default()
    };

    secrets
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
    Ok(())
}

/// `GetDisplaySecret` handler. Returns `None` if the VM isn't `Running`.
pub async fn rotate(
    client: &Client,
    channel: &Arc<VmChannel>,
    model: &RenderModel<'_>,
    user: &str,
) -> Result<Option<String>, Error> {
    if !model.vm.is_running() {
        return Ok(None);
    }

    patch_status::<VirtualMachine>(client, model.namespace(), model.vm_name(), |vm| {
        vm.status.get_or_insert_with(VirtualMachineStatus::default).console_user = Some(user.to_string());
    })
    .await?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), model.namespace());
    let name = secret_name(model.vm_name());
    let existing = secrets.get(&name).await?;

    if let Some(password) = still_valid_password(&existing, model.config.password_validity_secs) {
        return Ok(Some(password));
    }

    let new_password = random_password();
    let expiry = (Utc::now() + chrono::Duration::seconds(model.config.password_validity_secs as i64))
        .to_rfc3339();

    let current_serial = model
        .vm
        .object
        .status
        .as_ref()
        .map(|s| s.display_password_serial)
        .unwrap_or(0);
    let expected_serial = current_serial + 1;

    let (tx, rx) = oneshot::channel();
    {
        let mut state = channel.state.lock().await;
        state.pending_console.push(PendingConsoleRequest {
            expected_serial,
            completion: Some(tx),
        });
    }

    let mut secret_patch = existing.clone();
    secret_patch.data.get_or_insert_with(BTreeMap::new).insert(
        "password".to_string(),
        ByteString(new_password.clone().into_bytes()),
    );
    secret_patch
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert("expiry".to_string(), ByteString(expiry.into_bytes()));

    secrets
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret_patch),
        )
        .await?;

    // The event completes either way: on confirmation, or once the 1500ms
    // deadline elapses with whatever value was already set.
    let _ = timeout(DISPLAY_SECRET_ROTATION_TIMEOUT, rx).await;

    crate::events::display_secret_rotated(client, &model.vm.object, user).await;
    Ok(Some(new_password))
}

fn random_password() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn still_valid_password(secret: &Secret, validity_secs: u64) -> Option<String> {
    let data = secret.data.as_ref()?;
    let expiry = String::from_utf8(data.get("expiry")?.0.clone()).ok()?;
    let password = String::from_utf8(data.get("password")?.0.clone()).ok()?;

    if expiry == "never" {
        return Some(password);
    }
    let expiry_time: DateTime<Utc> = expiry.parse().ok()?;
    let horizon = Utc::now() + chrono::Duration::seconds(validity_secs as i64);
    if expiry_time > horizon { Some(password) } else { None }
}

/// Called from the reconciler's `VmResourceChanged` handling whenever the
/// status carries a new `displayPasswordSerial`, to release any pending
/// rotation whose expectation has now been met.
pub async fn notify_serial_advanced(channel: &Arc<VmChannel>, serial: u64) {
    let mut state = channel.state.lock().await;
    state.pending_console.retain_mut(|pending| {
        if serial >= pending.expected_serial {
            if let Some(tx) = pending.completion.take() {
                let _ = tx.send(());
            }
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use kube::api::ObjectMeta;

    use crate::reconcile::render::RenderModel;
    use crate::testutil::{self, expect, json_response, not_found_response};

    fn existing_secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("password".to_string(), ByteString(b"hunter2".to_vec())),
                ("expiry".to_string(), ByteString(b"now".to_vec())),
            ])),
            ..Default::default()
        }
    }

    /// Once the secret exists, a second reconcile must not re-apply it: the
    /// secret's password is only ever changed through `rotate`.
    #[tokio::test]
    async fn second_reconcile_against_an_existing_secret_is_a_no_op() {
        let (client, handle) = testutil::mock_client();
        let vm = testutil::sample_vm("vm-test");
        let config = testutil::sample_config();
        let model = RenderModel::new(&vm, &config);

        let verifier = testutil::run_script(
            handle,
            vec![
                expect(Method::GET, "secrets/vm-test-display-secret", not_found_response()),
                expect(
                    Method::PATCH,
                    "secrets/vm-test-display-secret",
                    json_response(&existing_secret("vm-test-display-secret")),
                ),
                expect(
                    Method::GET,
                    "secrets/vm-test-display-secret",
                    json_response(&existing_secret("vm-test-display-secret")),
                ),
            ],
        );

        testutil::with_timeout(reconcile(&client, &model)).await.unwrap();
        testutil::with_timeout(reconcile(&client, &model)).await.unwrap();
        testutil::await_script(verifier).await;
    }
}
