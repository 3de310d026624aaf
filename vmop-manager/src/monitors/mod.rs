pub mod pod_monitor;
pub mod pool_monitor;
pub mod secret_monitor;
pub mod vm_monitor;

pub use pod_monitor::{PendingBuffer, run as run_pod_monitor};
pub use pool_monitor::{PoolMap, run as run_pool_monitor};
pub use secret_monitor::run as run_secret_monitor;
pub use vm_monitor::run as run_vm_monitor;
