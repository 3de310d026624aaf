use std::sync::Arc;

use kube::Client;
use owo_colors::OwoColorize;
use tokio::sync::{Mutex, mpsc};

use super::event::VmEvent;
use crate::model::{AssociatedObjects, PendingConsoleRequest, VmDefinition};
use crate::util::colors::FG2;

/// Mutable state owned by a single VM's pipeline. Only the pump task
/// (spawned in [`VmChannel::spawn`]) ever touches this directly; everything
/// else goes through the channel's `send` and read helpers.
pub struct ChannelState {
    pub vm: Option<Arc<VmDefinition>>,
    pub last_generation: Option<i64>,
    pub associated: AssociatedObjects,
    pub pending_console: Vec<PendingConsoleRequest>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            vm: None,
            last_generation: None,
            associated: AssociatedObjects::default(),
            pending_console: Vec::new(),
        }
    }
}

/// A per-VM event sub-bus. Events published on `tx` are delivered to the
/// pump task strictly in order; handlers for other VMs run concurrently on
/// their own channels.
pub struct VmChannel {
    pub name: String,
    pub client: Client,
    pub tx: mpsc::UnboundedSender<VmEvent>,
    pub state: Mutex<ChannelState>,
}

impl VmChannel {
    /// Spawns the channel's pump task and returns a handle to it. `handler`
    /// is invoked once per event, to completion, before the next event in
    /// this channel is taken off the queue.
    pub fn spawn<H, F>(name: String, client: Client, handler: H) -> Arc<Self>
    where
        H: Fn(Arc<VmChannel>, VmEvent) -> F + Send + Sync + 'static,
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            name,
            client,
            tx,
            state: Mutex::new(ChannelState::new()),
        });

        let pump_channel = channel.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(pump_channel.clone(), event).await;
            }
        });

        channel
    }

    pub fn publish(&self, event: VmEvent) {
        if self.tx.send(event).is_err() {
            eprintln!(
                "{} {}",
                "dropped event for channel with no running pump:".color(FG2),
                self.name
            );
        }
    }

    pub async fn current_vm(&self) -> Option<Arc<VmDefinition>> {
        self.state.lock().await.vm.clone()
    }
}
