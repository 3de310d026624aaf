use std::sync::Arc;

use crate::model::VmDefinition;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::oneshot;

/// Watch response kind, mirrored from the Kubernetes watch protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Bookmark,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One event delivered on a per-VM channel. Handlers run to completion
/// before the next event in the same channel is dispatched.
pub enum VmEvent {
    VmResourceChanged {
        change: ChangeType,
        vm: Arc<VmDefinition>,
        spec_changed: bool,
        pod_changed: bool,
    },
    PodChanged {
        change: PodChangeKind,
        pod: Arc<Pod>,
    },
    GetDisplaySecret {
        user: String,
        reply: oneshot::Sender<Option<String>>,
    },
    PrepareConsole {
        user: String,
        login_user: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    ResetVm,
    /// Sentinel enqueued after a `DELETED` event: signals the sender once
    /// every event ahead of it in this channel has finished handling, so
    /// the Channel Dictionary entry can be dropped only after handlers
    /// drain rather than racing them.
    Drain(oneshot::Sender<()>),
    /// A pool CR's spec or defined/undefined state changed. Constructed and
    /// handled inline within the Pool Monitor's own serialized event loop,
    /// not on any per-VM channel, so pool state changes never interleave
    /// with VM reconciliation.
    VmPoolChanged { pool: String },
}

impl VmEvent {
    pub fn label(&self) -> &'static str {
        match self {
            VmEvent::VmResourceChanged { .. } => "vm_resource_changed",
            VmEvent::PodChanged { .. } => "pod_changed",
            VmEvent::GetDisplaySecret { .. } => "get_display_secret",
            VmEvent::PrepareConsole { .. } => "prepare_console",
            VmEvent::ResetVm => "reset_vm",
            VmEvent::Drain(_) => "drain",
            VmEvent::VmPoolChanged { .. } => "vm_pool_changed",
        }
    }
}
