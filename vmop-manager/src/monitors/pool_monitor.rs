//! Watches `VmPool` CRs and mirrors VM membership claimed via each VM's
//! `spec.pools`. Pool-CR changes and VM membership changes are both drained
//! from a single task so pool observers never see interleaved updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::{Api, Client};
use owo_colors::OwoColorize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vmop_types::{VmPool as VmPoolCrd, VmPoolSpec};

use crate::bus::{ChangeType, VmEvent};
use crate::model::{VmDefinition, VmPool};
use crate::observer::{self, ObserverChange};
use crate::util::colors::FG1;

/// Concurrent, process-wide view of pool membership.
#[derive(Clone)]
pub struct PoolMap {
    inner: Arc<Mutex<HashMap<String, VmPool>>>,
}

impl PoolMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns whether the pool's spec or `defined` flag actually changed.
    pub fn upsert_spec(&self, name: &str, spec: VmPoolSpec) -> bool {
        let mut pools = self.inner.lock().unwrap();
        let pool = pools.entry(name.to_string()).or_insert_with(|| VmPool::new(name));
        let changed = pool.spec.as_ref() != Some(&spec) || !pool.defined;
        pool.spec = Some(spec);
        pool.defined = true;
        changed
    }

    /// Marks the pool CR gone; the entry survives as long as membership is
    /// non-empty. Returns whether the pool was previously defined.
    pub fn mark_undefined(&self, name: &str) -> bool {
        let mut pools = self.inner.lock().unwrap();
        let Some(pool) = pools.get_mut(name) else {
            return false;
        };
        let changed = pool.defined;
        pool.defined = false;
        if pool.is_empty_and_undefined() {
            pools.remove(name);
        }
        changed
    }

    pub fn register_member(&self, pool_name: &str, vm_name: &str) {
        let mut pools = self.inner.lock().unwrap();
        pools
            .entry(pool_name.to_string())
            .or_insert_with(|| VmPool::new(pool_name))
            .members
            .insert(vm_name.to_string());
    }

    pub fn remove_member_everywhere(&self, vm_name: &str) {
        let mut pools = self.inner.lock().unwrap();
        pools.retain(|_, pool| {
            pool.members.remove(vm_name);
            !pool.is_empty_and_undefined()
        });
    }

    /// Implements `GetPools{nameFilter?, userFilter?, rolesFilter?}`.
    pub fn query(&self, name_filter: Option<&str>, user_filter: Option<&str>, roles_filter: Option<&str>) -> Vec<VmPool> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|pool| name_filter.is_none_or(|n| pool.name == n))
            .filter(|pool| {
                user_filter.is_none_or(|user| {
                    pool.spec
                        .as_ref()
                        .map(|spec| spec.permissions.iter().any(|p| p.user.as_deref() == Some(user)))
                        .unwrap_or(false)
                })
            })
            .filter(|pool| roles_filter.is_none_or(|role| pool_has_role(pool, role)))
            .cloned()
            .collect()
    }

    /// Whether `pool_name`'s CR grants `role` permission on any entry. Used
    /// by `GetVms{rolesFilter}`, which has to reach across VM membership into
    /// pool permissions.
    pub fn has_role(&self, pool_name: &str, role: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(pool_name)
            .is_some_and(|pool| pool_has_role(pool, role))
    }
}

fn pool_has_role(pool: &VmPool, role: &str) -> bool {
    pool.spec
        .as_ref()
        .is_some_and(|spec| spec.permissions.iter().any(|p| p.role.as_deref() == Some(role)))
}

impl Default for PoolMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Membership update fed in by the VM Monitor for every `VmResourceChanged`.
pub struct MembershipUpdate {
    pub change: ChangeType,
    pub vm: Arc<VmDefinition>,
}

pub async fn run(
    client: Client,
    namespace: String,
    pools: PoolMap,
    mut membership: mpsc::UnboundedReceiver<MembershipUpdate>,
    cancel: CancellationToken,
) {
    let (tx, mut pool_events) = mpsc::unbounded_channel();
    let api: Api<VmPoolCrd> = Api::namespaced(client, &namespace);
    let observer_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = observer::run(api, None, tx, observer_cancel).await {
            eprintln!("{}", format!("pool observer ended fatally: {err}").red());
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            Some(event) = pool_events.recv() => {
                let name = event.object.metadata.name.clone().unwrap_or_default();
                let changed = match event.change {
                    ObserverChange::Added | ObserverChange::Modified => {
                        pools.upsert_spec(&name, event.object.spec)
                    }
                    ObserverChange::Deleted => pools.mark_undefined(&name),
                    ObserverChange::Bookmark => false,
                };
                if changed {
                    handle_pool_event(VmEvent::VmPoolChanged { pool: name });
                }
            }
            Some(update) = membership.recv() => {
                match update.change {
                    ChangeType::Added | ChangeType::Modified => {
                        for pool_name in &update.vm.object.spec.pools {
                            pools.register_member(pool_name, &update.vm.name);
                        }
                    }
                    ChangeType::Deleted => pools.remove_member_everywhere(&update.vm.name),
                    ChangeType::Bookmark => {}
                }
            }
        }
    }
}

/// Handles a `VmPoolChanged` event on the Pool Monitor's own pipeline. This
/// runs inline in `run`'s select loop, serialized with every other pool
/// update, so nothing here ever interleaves with a VM's own reconciliation.
fn handle_pool_event(event: VmEvent) {
    let VmEvent::VmPoolChanged { pool } = event else { return };
    println!("{} {pool}", "pool state changed:".color(FG1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmop_types::PermissionSpec;

    fn pool_spec_with_user(user: &str) -> VmPoolSpec {
        VmPoolSpec {
            retention: None,
            permissions: vec![PermissionSpec {
                user: Some(user.to_string()),
                role: None,
                may: vec!["access".to_string()],
            }],
            login_on_assignment: false,
        }
    }

    #[test]
    fn query_by_user_returns_matching_pool_with_members() {
        let pools = PoolMap::new();
        pools.upsert_spec("pool1", pool_spec_with_user("alice"));
        pools.register_member("pool1", "vm1");

        let results = pools.query(None, Some("alice"), None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "pool1");
        assert!(results[0].members.contains("vm1"));
    }

    #[test]
    fn pool_with_no_cr_and_no_members_is_dropped() {
        let pools = PoolMap::new();
        pools.upsert_spec("pool1", pool_spec_with_user("alice"));
        pools.mark_undefined("pool1");
        assert!(pools.query(Some("pool1"), None, None).is_empty());
    }

    #[test]
    fn undefined_pool_survives_while_members_remain() {
        let pools = PoolMap::new();
        pools.upsert_spec("pool1", pool_spec_with_user("alice"));
        pools.register_member("pool1", "vm1");
        pools.mark_undefined("pool1");
        assert_eq!(pools.query(Some("pool1"), None, None).len(), 1);
        pools.remove_member_everywhere("vm1");
        assert!(pools.query(Some("pool1"), None, None).is_empty());
    }
}
