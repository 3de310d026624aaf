//! The reconciler dispatcher: wires the six sub-reconcilers together and
//! answers the in-memory control events that enter a VM's channel.

pub mod configmap;
pub mod display_secret;
pub mod load_balancer;
pub mod pod;
pub mod pvc;
pub mod render;
pub mod statefulset_eviction;

use std::sync::Arc;

use owo_colors::OwoColorize;

use crate::bus::{ChangeType, VmChannel, VmEvent};
use crate::context::ManagerContext;
use crate::util::colors::FG2;
use render::RenderModel;

/// Builds the handler every VM channel's pump task runs. One instance of
/// this closure is created per VM by the VM Monitor.
pub fn make_handler(ctx: ManagerContext) -> impl Fn(Arc<VmChannel>, VmEvent) -> futures::future::BoxFuture<'static, ()> + Clone {
    move |channel, event| {
        let ctx = ctx.clone();
        Box::pin(async move { dispatch(channel, event, ctx).await })
    }
}

async fn dispatch(channel: Arc<VmChannel>, event: VmEvent, ctx: ManagerContext) {
    match event {
        VmEvent::VmResourceChanged {
            change,
            vm,
            spec_changed,
            pod_changed,
        } => {
            if change == ChangeType::Deleted {
                return;
            }
            let serial = vm.object.status.as_ref().map(|s| s.display_password_serial).unwrap_or(0);
            display_secret::notify_serial_advanced(&channel, serial).await;

            let model = RenderModel::new(&vm, &ctx.config);
            if let Err(err) = run_pipeline(&channel, &ctx, &model, spec_changed, pod_changed).await {
                eprintln!(
                    "{} {}/{}: {err}",
                    "reconcile failed for".color(FG2),
                    model.namespace(),
                    model.vm_name()
                );
                #[cfg(feature = "metrics")]
                ctx.metrics.record_reconcile(model.namespace(), model.vm_name(), "error");
            } else {
                #[cfg(feature = "metrics")]
                ctx.metrics.record_reconcile(model.namespace(), model.vm_name(), "ok");
            }
        }
        VmEvent::PodChanged { .. } => {
            // The VM Monitor always follows this with a VmResourceChanged
            // carrying podChanged=true; the actual pipeline runs there.
        }
        VmEvent::GetDisplaySecret { user, reply } => {
            let result = handle_get_display_secret(&channel, &ctx, &user).await;
            let _ = reply.send(result);
        }
        VmEvent::PrepareConsole { user, login_user, reply } => {
            let result = handle_prepare_console(&channel, &ctx, &user, login_user).await;
            let _ = reply.send(result);
        }
        VmEvent::ResetVm => {
            handle_reset_vm(&channel, &ctx).await;
        }
        VmEvent::Drain(completion) => {
            let _ = completion.send(());
        }
    }
}

async fn run_pipeline(
    channel: &Arc<VmChannel>,
    ctx: &ManagerContext,
    model: &RenderModel<'_>,
    spec_changed: bool,
    pod_changed: bool,
) -> Result<(), crate::util::Error> {
    configmap::reconcile(&ctx.client, model).await?;
    #[cfg(feature = "metrics")]
    ctx.metrics.record_action(model.namespace(), model.vm_name(), "configmap");

    if !spec_changed && !pod_changed {
        return Ok(());
    }

    if spec_changed {
        display_secret::reconcile(&ctx.client, model).await?;
    }
    pvc::reconcile(&ctx.client, channel, model, spec_changed).await?;
    let using_sts = statefulset_eviction::reconcile(&ctx.client, model).await?;
    pod::reconcile(&ctx.client, channel, model, using_sts).await?;
    load_balancer::reconcile(&ctx.client, model).await?;

    #[cfg(feature = "metrics")]
    ctx.metrics.record_action(model.namespace(), model.vm_name(), "pipeline");

    Ok(())
}

async fn handle_get_display_secret(channel: &Arc<VmChannel>, ctx: &ManagerContext, user: &str) -> Option<String> {
    let vm = channel.current_vm().await?;
    let model = RenderModel::new(&vm, &ctx.config);
    match display_secret::rotate(&ctx.client, channel, &model, user).await {
        Ok(result) => result,
        Err(err) => {
            eprintln!("{} {user}: {err}", "display secret rotation failed for".color(FG2));
            None
        }
    }
}

/// Whether `PrepareConsole` requires only `Running=True` is left open by the
/// source material; this implementation requires exactly that and nothing
/// stronger (e.g. `Booted=True`).
async fn handle_prepare_console(
    channel: &Arc<VmChannel>,
    ctx: &ManagerContext,
    user: &str,
    login_user: Option<String>,
) -> bool {
    let Some(vm) = channel.current_vm().await else { return false };
    if !vm.is_running() {
        return false;
    }
    let result = crate::util::patch::patch_status::<vmop_types::VirtualMachine>(
        &ctx.client,
        &vm.namespace,
        &vm.name,
        |object| {
            let status = object.status.get_or_insert_with(vmop_types::VirtualMachineStatus::default);
            status.console_client = Some(user.to_string());
            status.logged_in_user = login_user.clone().or_else(|| Some(user.to_string()));
        },
    )
    .await;
    result.is_ok()
}

async fn handle_reset_vm(channel: &Arc<VmChannel>, ctx: &ManagerContext) {
    let Some(vm) = channel.current_vm().await else { return };
    let mut bumped = (*vm).clone();
    bumped.reset_count += 1;
    let bumped = Arc::new(bumped);
    {
        let mut state = channel.state.lock().await;
        state.vm = Some(bumped.clone());
    }
    let model = RenderModel::new(&bumped, &ctx.config);
    if let Err(err) = configmap::reconcile(&ctx.client, &model).await {
        eprintln!(
            "{} {}/{}: {err}",
            "reset reconcile failed for".color(FG2),
            model.namespace(),
            model.vm_name()
        );
    }
}
