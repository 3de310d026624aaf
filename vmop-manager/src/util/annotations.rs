//! Label and annotation keys shared by every child-resource builder.

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

pub const COMPONENT_RUNNER: &str = "runner";
pub const COMPONENT_DISK: &str = "disk";
pub const COMPONENT_DISPLAY_SECRET: &str = "display-secret";

/// Runner pod annotation bumped when the config map's `resourceVersion`
/// changes, so the kubelet's mount refresh doesn't have to be waited out.
pub const ANNOTATION_CM_VERSION: &str = "vmoperator.jdrupes.org/cmVersion";

/// Runner pod annotation bumped when the display secret's `resourceVersion`
/// changes.
pub const ANNOTATION_DP_VERSION: &str = "vmoperator.jdrupes.org/dpVersion";
