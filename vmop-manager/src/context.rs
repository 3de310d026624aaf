use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::bus::ChannelDictionary;
use crate::config::ReconcilerConfig;
use crate::control::{self, ControlHandle};
use crate::monitors::PoolMap;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Everything a sub-reconciler or monitor needs to talk to the cluster and
/// to the rest of the manager. Cheaply `Clone`-able; every field is itself
/// either `Clone`-cheap or already `Arc`-backed.
#[derive(Clone)]
pub struct ManagerContext {
    pub client: Client,
    pub config: ReconcilerConfig,
    pub channels: ChannelDictionary,
    pub pools: PoolMap,
    /// Answers `GetVms`/`GetPools` for the console UI, the one out-of-scope
    /// collaborator this crate still has to expose a stable entry point to.
    pub control: ControlHandle,

    #[cfg(feature = "metrics")]
    pub metrics: ControllerMetrics,
}

impl ManagerContext {
    pub fn new(client: Client, config: ReconcilerConfig, cancel: CancellationToken) -> Self {
        let channels = ChannelDictionary::new();
        let pools = PoolMap::new();
        let control = control::spawn(channels.clone(), pools.clone(), cancel);
        Self {
            client,
            config,
            channels,
            pools,
            control,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new(),
        }
    }
}
