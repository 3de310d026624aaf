use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `spec.vm.state`: whether the runner pod should be present or absent.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    #[default]
    Running,
    Stopped,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VolumeClaimTemplate {
    pub metadata: VolumeClaimTemplateMeta,
    pub spec: k8s_openapi::api::core::v1::PersistentVolumeClaimSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VolumeClaimTemplateMeta {
    pub name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CdromSpec {
    pub image: String,
}

/// A single declared disk: either a managed PVC or a read-only CD-ROM image.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DiskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<VolumeClaimTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdrom: Option<CdromSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct SpiceDisplaySpec {
    #[serde(default = "default_true")]
    pub generate_secret: bool,
    #[serde(default)]
    pub port: u16,
}

impl Default for SpiceDisplaySpec {
    fn default() -> Self {
        Self {
            generate_secret: true,
            port: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DisplaySpec {
    #[serde(default)]
    pub spice: SpiceDisplaySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logged_in_user: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CloudInitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VmSpec {
    #[serde(default)]
    pub state: VmState,
    pub maximum_ram: String,
    pub current_ram: String,
    pub maximum_cpus: u32,
    pub current_cpus: u32,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub display: DisplaySpec,
}

/// `spec.loadBalancerService`: either a plain boolean or a map carrying
/// default labels/annotations for the rendered `Service`. An explicit empty
/// map (`{}`) is how a VM opts out of a reconciler-wide default.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum LoadBalancerServiceSpec {
    Enabled(bool),
    Overrides {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        labels: Option<BTreeMap<String, Option<String>>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        annotations: Option<BTreeMap<String, Option<String>>>,
    },
}

impl Default for LoadBalancerServiceSpec {
    fn default() -> Self {
        LoadBalancerServiceSpec::Enabled(false)
    }
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "vmoperator.jdrupes.org",
    version = "v1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    derive = "PartialEq",
    status = "VirtualMachineStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.conditions[?(@.type=='Running')].status\", \"name\": \"RUNNING\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.consoleUser\", \"name\": \"CONSOLE-USER\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    pub vm: VmSpec,
    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default)]
    pub load_balancer_service: LoadBalancerServiceSpec,
    #[serde(default)]
    pub cloud_init: CloudInitSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AssignmentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logged_in_user: Option<String>,
    #[serde(default)]
    pub display_password_serial: u64,
    #[serde(default)]
    pub assignment: AssignmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osinfo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_version: Option<String>,
}

pub const CONDITION_RUNNING: &str = "Running";
pub const CONDITION_BOOTED: &str = "Booted";
pub const CONDITION_CONSOLE_CONNECTED: &str = "ConsoleConnected";
pub const CONDITION_USER_LOGGED_IN: &str = "UserLoggedIn";
pub const CONDITION_VMOP_AGENT_CONNECTED: &str = "VmopAgentConnected";

impl VirtualMachineStatus {
    /// Returns the value of a condition by type, if present.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_running(&self) -> bool {
        self.condition(CONDITION_RUNNING)
            .is_some_and(|c| c.status == "True")
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PermissionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub may: Vec<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "vmoperator.jdrupes.org",
    version = "v1",
    kind = "VmPool",
    plural = "vmpools",
    derive = "PartialEq",
    namespaced
)]
#[kube(derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct VmPoolSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
    #[serde(default)]
    pub permissions: Vec<PermissionSpec>,
    #[serde(default)]
    pub login_on_assignment: bool,
}
