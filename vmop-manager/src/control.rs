//! The operator's main channel: answers `GetVms`/`GetPools` requests from
//! the console UI. These requests don't target one VM's own channel — they
//! read across every known VM and pool — so they get a dedicated queue
//! instead of riding a per-VM channel like `GetDisplaySecret` does.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bus::ChannelDictionary;
use crate::model::{VmDefinition, VmPool};
use crate::monitors::PoolMap;

pub struct GetVmsFilter {
    pub name: Option<String>,
    pub user: Option<String>,
    pub role: Option<String>,
}

pub struct GetPoolsFilter {
    pub name: Option<String>,
    pub user: Option<String>,
    pub role: Option<String>,
}

enum ControlRequest {
    GetVms {
        filter: GetVmsFilter,
        reply: oneshot::Sender<Vec<Arc<VmDefinition>>>,
    },
    GetPools {
        filter: GetPoolsFilter,
        reply: oneshot::Sender<Vec<VmPool>>,
    },
}

/// Cheaply `Clone`-able handle for submitting `GetVms`/`GetPools` requests.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl ControlHandle {
    pub async fn get_vms(&self, filter: GetVmsFilter) -> Vec<Arc<VmDefinition>> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ControlRequest::GetVms { filter, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get_pools(&self, filter: GetPoolsFilter) -> Vec<VmPool> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ControlRequest::GetPools { filter, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Spawns the main channel's pump task and returns a handle to it.
pub fn spawn(channels: ChannelDictionary, pools: PoolMap, cancel: CancellationToken) -> ControlHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                request = rx.recv() => {
                    let Some(request) = request else { return };
                    handle(&channels, &pools, request).await;
                }
            }
        }
    });

    ControlHandle { tx }
}

async fn handle(channels: &ChannelDictionary, pools: &PoolMap, request: ControlRequest) {
    match request {
        ControlRequest::GetVms { filter, reply } => {
            let vms = query_vms(channels, pools, &filter).await;
            let _ = reply.send(vms);
        }
        ControlRequest::GetPools { filter, reply } => {
            let result = pools.query(filter.name.as_deref(), filter.user.as_deref(), filter.role.as_deref());
            let _ = reply.send(result);
        }
    }
}

async fn query_vms(channels: &ChannelDictionary, pools: &PoolMap, filter: &GetVmsFilter) -> Vec<Arc<VmDefinition>> {
    let mut result = Vec::new();
    for channel in channels.snapshot() {
        let Some(vm) = channel.current_vm().await else { continue };

        if filter.name.as_deref().is_some_and(|name| vm.name != name) {
            continue;
        }
        if let Some(user) = filter.user.as_deref()
            && vm.object.status.as_ref().and_then(|s| s.assignment.user.as_deref()) != Some(user)
        {
            continue;
        }
        if let Some(role) = filter.role.as_deref()
            && !vm.object.spec.pools.iter().any(|pool_name| pools.has_role(pool_name, role))
        {
            continue;
        }

        result.push(vm);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::VmChannel;
    use crate::testutil::mock_client;
    use std::time::Duration;
    use vmop_types::{PermissionSpec, VmPoolSpec};

    async fn seed_vm(channels: &ChannelDictionary, client: &kube::Client, name: &str, user: Option<&str>) {
        let channel = channels
            .get_or_create(name, || VmChannel::spawn(name.to_string(), client.clone(), |_, _| async {}))
            .unwrap();
        let mut object = vmop_types::VirtualMachine::new(name, Default::default());
        object.metadata.namespace = Some("default".to_string());
        if let Some(user) = user {
            let mut status = vmop_types::VirtualMachineStatus::default();
            status.assignment.user = Some(user.to_string());
            object.status = Some(status);
        }
        let mut vm_def = VmDefinition::from_object(object);
        vm_def.object.spec.pools = vec!["pool1".to_string()];
        let mut state = channel.state.lock().await;
        state.vm = Some(Arc::new(vm_def));
    }

    #[tokio::test]
    async fn get_vms_filters_by_assigned_user() {
        let (client, _handle) = mock_client();
        let channels = ChannelDictionary::new();
        seed_vm(&channels, &client, "vm1", Some("alice")).await;
        seed_vm(&channels, &client, "vm2", Some("bob")).await;

        let pools = PoolMap::new();
        let cancel = CancellationToken::new();
        let handle = spawn(channels, pools, cancel.clone());

        let result = handle
            .get_vms(GetVmsFilter { name: None, user: Some("alice".to_string()), role: None })
            .await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "vm1");
        cancel.cancel();
    }

    #[tokio::test]
    async fn get_vms_filters_by_pool_role() {
        let (client, _handle) = mock_client();
        let channels = ChannelDictionary::new();
        seed_vm(&channels, &client, "vm1", None).await;

        let pools = PoolMap::new();
        pools.upsert_spec(
            "pool1",
            VmPoolSpec {
                retention: None,
                permissions: vec![PermissionSpec { user: None, role: Some("operator".to_string()), may: vec!["access".to_string()] }],
                login_on_assignment: false,
            },
        );
        let cancel = CancellationToken::new();
        let handle = spawn(channels, pools, cancel.clone());

        let matching = handle.get_vms(GetVmsFilter { name: None, user: None, role: Some("operator".to_string()) }).await;
        assert_eq!(matching.len(), 1);

        let non_matching = handle.get_vms(GetVmsFilter { name: None, user: None, role: Some("guest".to_string()) }).await;
        assert!(non_matching.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn get_pools_delegates_to_pool_map_query() {
        let (_client, _handle) = mock_client();
        let channels = ChannelDictionary::new();
        let pools = PoolMap::new();
        pools.upsert_spec(
            "pool1",
            VmPoolSpec {
                retention: None,
                permissions: vec![PermissionSpec { user: Some("alice".to_string()), role: None, may: vec!["access".to_string()] }],
                login_on_assignment: false,
            },
        );
        pools.register_member("pool1", "vm1");

        let cancel = CancellationToken::new();
        let handle = spawn(channels, pools, cancel.clone());

        let result = handle
            .get_pools(GetPoolsFilter { name: None, user: Some("alice".to_string()), role: None })
            .await;
        assert_eq!(result.len(), 1);
        assert!(result[0].members.contains("vm1"));
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
