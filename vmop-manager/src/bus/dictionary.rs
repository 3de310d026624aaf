use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use super::channel::VmChannel;

/// Process-wide map from VM name to its per-VM channel. Holds only weak
/// references so a channel is reclaimed once the dictionary drops it and no
/// other handle survives.
#[derive(Clone, Default)]
pub struct ChannelDictionary {
    inner: Arc<Mutex<HashMap<String, Weak<VmChannel>>>>,
    /// When true, `get_or_create` degenerates to `get` and `remove` is a
    /// no-op — the view handed to components that must not mutate the
    /// dictionary (e.g. the Display-Secret Monitor, which only verifies VMs
    /// exist).
    read_only: bool,
}

impl ChannelDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            read_only: true,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<VmChannel>> {
        self.inner.lock().unwrap().get(name).and_then(Weak::upgrade)
    }

    /// Returns the existing channel for `name`, or creates one via `factory`
    /// and registers it. No-op (falls back to `get`) on a read-only view.
    pub fn get_or_create(
        &self,
        name: &str,
        factory: impl FnOnce() -> Arc<VmChannel>,
    ) -> Option<Arc<VmChannel>> {
        self.get_or_create_with(name, factory, |_| {})
    }

    /// Like [`Self::get_or_create`], but runs `on_created` exactly once,
    /// right after a brand-new channel is registered — lets a caller replay
    /// state it buffered while the VM was still unknown.
    pub fn get_or_create_with(
        &self,
        name: &str,
        factory: impl FnOnce() -> Arc<VmChannel>,
        on_created: impl FnOnce(&Arc<VmChannel>),
    ) -> Option<Arc<VmChannel>> {
        if let Some(existing) = self.get(name) {
            return Some(existing);
        }
        if self.read_only {
            return None;
        }
        let created = factory();
        self.inner
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::downgrade(&created));
        on_created(&created);
        Some(created)
    }

    pub fn remove(&self, name: &str) {
        if self.read_only {
            return;
        }
        self.inner.lock().unwrap().remove(name);
    }

    /// Upgrades every live weak reference. Used to answer `GetVms`, which
    /// needs to inspect current state across all known VMs rather than one.
    pub fn snapshot(&self) -> Vec<Arc<VmChannel>> {
        self.inner.lock().unwrap().values().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock_client;

    fn dummy_channel(client: &kube::Client, name: &str) -> Arc<VmChannel> {
        VmChannel::spawn(name.to_string(), client.clone(), |_, _| async {})
    }

    #[tokio::test]
    async fn get_or_create_reuses_existing() {
        let (client, _handle) = mock_client();
        let dict = ChannelDictionary::new();
        let a = dict.get_or_create("vm1", || dummy_channel(&client, "vm1")).unwrap();
        let b = dict.get_or_create("vm1", || dummy_channel(&client, "vm1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn read_only_view_never_creates() {
        let (client, _handle) = mock_client();
        let dict = ChannelDictionary::new();
        let view = dict.read_only();
        assert!(view.get_or_create("vm1", || dummy_channel(&client, "vm1")).is_none());
        assert!(dict.get("vm1").is_none());
    }

    #[tokio::test]
    async fn remove_drops_the_mapping() {
        let (client, _handle) = mock_client();
        let dict = ChannelDictionary::new();
        let channel = dict.get_or_create("vm1", || dummy_channel(&client, "vm1")).unwrap();
        dict.remove("vm1");
        assert!(dict.get("vm1").is_none());
        drop(channel);
    }
}
