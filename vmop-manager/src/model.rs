//! In-memory entities layered on top of the `VirtualMachine` and `VmPool` CRs:
//! the decorated VM view the reconciler works from, pool membership, and the
//! bookkeeping records the display-secret and pod-buffering logic need.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::oneshot;
use vmop_types::{VirtualMachine, VmPoolSpec};

/// The observed `VirtualMachine` CR plus fields derived at watch time.
#[derive(Clone, Debug)]
pub struct VmDefinition {
    pub namespace: String,
    pub name: String,
    pub generation: i64,
    pub resource_version: String,
    pub object: VirtualMachine,

    /// Count of `ResetVm` requests served since process start. Does not
    /// survive a controller restart.
    pub reset_count: u64,
    pub node_name: Option<String>,
    pub node_addresses: Vec<String>,
}

impl VmDefinition {
    pub fn from_object(object: VirtualMachine) -> Self {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        let generation = object.metadata.generation.unwrap_or_default();
        let resource_version = object.metadata.resource_version.clone().unwrap_or_default();
        Self {
            namespace,
            name,
            generation,
            resource_version,
            object,
            reset_count: 0,
            node_name: None,
            node_addresses: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.object
            .status
            .as_ref()
            .map(|s| s.is_running())
            .unwrap_or(false)
    }
}

/// One named pool of VMs, mirrored from `VmPool` CRs plus membership claims
/// made by VMs that list the pool in `spec.pools`.
#[derive(Clone, Debug, Default)]
pub struct VmPool {
    pub name: String,
    pub spec: Option<VmPoolSpec>,
    pub members: BTreeSet<String>,
    /// False once the CR has been deleted but membership hasn't drained yet.
    pub defined: bool,
}

impl VmPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: None,
            members: BTreeSet::new(),
            defined: false,
        }
    }

    pub fn is_empty_and_undefined(&self) -> bool {
        !self.defined && self.members.is_empty()
    }
}

/// A pending `GetDisplaySecret` rotation waiting for the runner to confirm
/// the new password by bumping `status.displayPasswordSerial`.
pub struct PendingConsoleRequest {
    pub expected_serial: u64,
    pub completion: Option<oneshot::Sender<()>>,
}

/// A pod change event that arrived before its VM was known to the Channel
/// Dictionary, held until the VM shows up or the entry ages out.
pub struct PendingPodChange {
    pub vm_name: String,
    pub change: crate::bus::event::PodChangeKind,
    pub pod: Arc<Pod>,
    pub enqueued_at: Instant,
}

/// Scratch-pad of values a sub-reconciler wants to remember between
/// reconciles of the same VM, keyed by the sub-reconciler's own identity so
/// unrelated sub-reconcilers never collide.
#[derive(Default)]
pub struct AssociatedObjects {
    values: HashMap<&'static str, Vec<String>>,
}

impl AssociatedObjects {
    pub fn get(&self, key: &'static str) -> Option<&[String]> {
        self.values.get(key).map(Vec::as_slice)
    }

    pub fn set(&mut self, key: &'static str, values: Vec<String>) {
        self.values.insert(key, values);
    }
}
