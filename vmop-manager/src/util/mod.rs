use std::time::Duration;

pub mod annotations;
pub mod colors;
pub mod patch;
pub mod shutdown;

#[cfg(feature = "metrics")]
pub mod metrics;

mod error;

pub use error::*;

/// Name carried by every server-side-apply mutation the manager issues.
pub const FIELD_MANAGER: &str = "vmoperator";

/// `app.kubernetes.io/managed-by` literal on every child resource.
pub const MANAGED_BY: &str = "vmoperator";

/// `app.kubernetes.io/name` literal on every child resource.
pub const APP_NAME: &str = "vmrunner";

/// Minimum delay between watch restarts, so a server that keeps dropping
/// the connection immediately doesn't spin the observer into a hot loop.
pub const OBSERVER_MIN_RESTART_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on a display-secret rotation's wait for runner confirmation.
pub const DISPLAY_SECRET_ROTATION_TIMEOUT: Duration = Duration::from_millis(1500);

/// How long a buffered pod event is kept waiting for its VM to become known.
pub const PENDING_POD_CHANGE_TTL: Duration = Duration::from_secs(15 * 60);

/// Retry budget for `409 Conflict` on status/object updates.
pub const CONFLICT_RETRY_BUDGET: u32 = 3;
