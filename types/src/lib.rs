use k8s_openapi::{
    api::core::v1::{Affinity, ResourceRequirements},
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{Condition, ObjectMeta, Time},
    },
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

pub mod quantity;
pub mod retention;
pub mod runner;

pub use quantity::parse_quantity;
pub use retention::Retention;

/// Condition type reporting whether the VM's QEMU process is running.
pub const CONDITION_RUNNING: &str = "Running";

/// Condition type reporting a terminal reconciliation failure.
pub const CONDITION_RECONCILE_FAILED: &str = "ReconcileFailed";

/// Condition type for non-fatal spec problems (e.g. clamped values).
pub const CONDITION_WARNING: &str = "Warning";

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "vmoperator.jdrupes.org",
    version = "v1",
    kind = "VirtualMachine",
    plural = "vms",
    singular = "vm",
    derive = "PartialEq",
    status = "VmStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.vm.state\", \"name\": \"STATE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.assignment.user\", \"name\": \"ASSIGNED-TO\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".metadata.creationTimestamp\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    /// Runner container image that hosts the QEMU process for this VM.
    pub image: String,

    pub vm: VmConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,

    /// When true, a guest-initiated shutdown flips `spec.vm.state` to
    /// Stopped instead of the Pod being restarted.
    #[serde(default)]
    pub guest_shutdown_stops: bool,

    /// Names of the [`VmPool`]s this VM is a member of.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pools: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,

    /// Incremented by a client to request a hard reset of the guest.
    #[serde(default)]
    pub reset_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_template: Option<RunnerTemplate>,

    /// Resource requirements of the runner container. QEMU's own memory
    /// demand is derived from `vm.maximumRam` when this is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// When present, a LoadBalancer Service exposing the SPICE port is
    /// maintained with these labels and annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_service: Option<LoadBalancerService>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,

    #[serde(default = "default_maximum_cpus")]
    pub maximum_cpus: u32,

    /// Desired number of online CPUs. Clamped to `maximumCpus`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_cpus: Option<u32>,

    pub maximum_ram: Quantity,

    /// Desired guest-visible RAM. Defaults to `maximumRam`; differences
    /// are applied through the balloon device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_ram: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_topology: Option<CpuTopology>,

    #[serde(default)]
    pub firmware: Firmware,

    #[serde(default)]
    pub boot_menu: bool,

    #[serde(default)]
    pub use_tpm: bool,

    #[serde(default = "default_rtc_base")]
    pub rtc_base: String,

    #[serde(default = "default_rtc_clock")]
    pub rtc_clock: String,

    /// Seconds the guest is given to power down before QEMU is killed.
    #[serde(default = "default_powerdown_timeout")]
    pub powerdown_timeout: u64,

    #[serde(default)]
    pub state: VmState,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<Display>,
}

impl Default for VmConfig {
    /// Matches the deserialization defaults, so programmatic and parsed
    /// configurations behave the same.
    fn default() -> Self {
        VmConfig {
            machine_uuid: None,
            cpu_model: None,
            maximum_cpus: default_maximum_cpus(),
            current_cpus: None,
            maximum_ram: Quantity::default(),
            current_ram: None,
            cpu_topology: None,
            firmware: Firmware::default(),
            boot_menu: false,
            use_tpm: false,
            rtc_base: default_rtc_base(),
            rtc_clock: default_rtc_clock(),
            powerdown_timeout: default_powerdown_timeout(),
            state: VmState::default(),
            networks: Vec::new(),
            disks: Vec::new(),
            display: None,
        }
    }
}

impl VmConfig {
    /// Number of CPUs the guest should have online, clamped to the maximum.
    pub fn current_cpus(&self) -> u32 {
        self.current_cpus
            .unwrap_or(self.maximum_cpus)
            .clamp(1, self.maximum_cpus)
    }

    /// Desired guest-visible RAM, defaulting to the maximum.
    pub fn current_ram(&self) -> &Quantity {
        self.current_ram.as_ref().unwrap_or(&self.maximum_ram)
    }
}

fn default_maximum_cpus() -> u32 {
    1
}

fn default_rtc_base() -> String {
    "utc".to_owned()
}

fn default_rtc_clock() -> String {
    "rt".to_owned()
}

fn default_powerdown_timeout() -> u64 {
    900
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum VmState {
    #[default]
    Stopped,

    Running,
}

impl FromStr for VmState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Stopped" => Ok(VmState::Stopped),
            "Running" => Ok(VmState::Running),
            _ => Err(()),
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Stopped => write!(f, "Stopped"),
            VmState::Running => write!(f, "Running"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub enum Firmware {
    #[default]
    Uefi,

    Bios,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CpuTopology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dies: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}

/// A NIC definition. Exactly one of the variants is expected to be set;
/// a fully empty entry behaves like `user: {}`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<TapNetwork>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserNetwork>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TapNetwork {
    pub bridge: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserNetwork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// When set, the operator creates (and never deletes) a PVC named
    /// `<vm>-<disk>-disk` from this template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<VolumeClaimTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdrom: Option<Cdrom>,

    /// Resolved path of the backing device or medium inside the runner
    /// Pod. Filled in by the operator when rendering the runner
    /// configuration; ignored on the CR itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl Disk {
    /// Effective disk name used in PVC and device naming. Unnamed disks
    /// get a positional name so that invariant naming stays stable.
    pub fn effective_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("disk-{}", index),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    pub spec: k8s_openapi::api::core::v1::PersistentVolumeClaimSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cdrom {
    /// Path or URL of the medium. An empty string means an empty drive.
    #[serde(default)]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootindex: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Display {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spice: Option<SpiceDisplay>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpiceDisplay {
    pub port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_video: Option<String>,

    #[serde(default = "default_usb_redirects")]
    pub usb_redirects: u32,

    /// Proxy URL put into generated connection files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,

    /// Overrides the host address put into generated connection files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Set to false to suppress generation of the display secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_secret: Option<bool>,
}

fn default_usb_redirects() -> u32 {
    2
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudInit {
    /// The `meta-data` document. `instance-id` and `local-hostname` are
    /// filled in when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_config: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerTemplate {
    /// Alternative command template shipped with the runner image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// When true, template updates delivered with a new runner image are
    /// applied to existing VMs (forcing a Pod replacement).
    #[serde(default)]
    pub update: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A grant tuple. Exactly one of `user` and `role` is expected to be set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    pub may: Vec<Grant>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Grant {
    #[serde(rename = "start")]
    Start,

    #[serde(rename = "stop")]
    Stop,

    #[serde(rename = "reset")]
    Reset,

    #[serde(rename = "accessConsole")]
    AccessConsole,

    #[serde(rename = "*")]
    All,
}

impl Permission {
    pub fn allows(&self, grant: Grant) -> bool {
        self.may.contains(&Grant::All) || self.may.contains(&grant)
    }
}

/// Status object for the [`VirtualMachine`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// CPUs observed online in the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,

    /// Guest-visible RAM in bytes, as reported by the balloon device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,

    /// User logged in on the guest console, as reported by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_user: Option<String>,

    /// Address of the connected display client, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_client: Option<String>,

    /// Resets performed since the runner started. Monotonic per VM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_addresses: Vec<String>,

    /// Node the runner Pod was scheduled onto.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// A live pool assignment, stored in the VM status.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub pool: String,

    pub user: String,

    /// Last time the assignment was used; drives retention expiry.
    pub last_used: Time,
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
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.retention\", \"name\": \"RETENTION\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct VmPoolSpec {
    /// ISO-8601 duration (`PT1H`) or instant; see [`Retention`].
    #[serde(default = "default_retention")]
    pub retention: String,

    /// Request a console login for the assigned user right away.
    #[serde(default)]
    pub login_on_assignment: bool,

    pub permissions: Vec<Permission>,
}

fn default_retention() -> String {
    "PT1H".to_owned()
}

/// Replaces the condition of `cond`'s type in `conditions`, keeping the
/// previous `lastTransitionTime` when the status did not flip.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = cond;
    } else {
        conditions.push(cond);
    }
}

/// Looks up a condition by type.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn condition(type_: &str, status: &str, reason: &str) -> Condition {
        Condition {
            type_: type_.to_owned(),
            status: status.to_owned(),
            reason: reason.to_owned(),
            message: String::new(),
            last_transition_time: Time(Utc::now()),
            observed_generation: None,
        }
    }

    #[test]
    fn current_cpus_clamps_to_maximum() {
        let vm = VmConfig {
            maximum_cpus: 4,
            current_cpus: Some(8),
            ..Default::default()
        };
        assert_eq!(vm.current_cpus(), 4);
    }

    #[test]
    fn current_cpus_defaults_to_maximum() {
        let vm = VmConfig {
            maximum_cpus: 2,
            ..Default::default()
        };
        assert_eq!(vm.current_cpus(), 2);
    }

    #[test]
    fn current_ram_defaults_to_maximum() {
        let vm = VmConfig {
            maximum_ram: Quantity("4Gi".to_owned()),
            ..Default::default()
        };
        assert_eq!(vm.current_ram().0, "4Gi");
    }

    #[test]
    fn effective_disk_name_falls_back_to_position() {
        let named = Disk {
            name: Some("system".to_owned()),
            ..Default::default()
        };
        let unnamed = Disk::default();
        assert_eq!(named.effective_name(0), "system");
        assert_eq!(unnamed.effective_name(1), "disk-1");
    }

    #[test]
    fn wildcard_grant_allows_everything() {
        let perm = Permission {
            user: Some("alice".to_owned()),
            role: None,
            may: vec![Grant::All],
        };
        assert!(perm.allows(Grant::Start));
        assert!(perm.allows(Grant::AccessConsole));
    }

    #[test]
    fn set_condition_keeps_transition_time_on_same_status() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition(CONDITION_RUNNING, "True", "Booted"));
        let first = conditions[0].last_transition_time.clone();

        set_condition(
            &mut conditions,
            condition(CONDITION_RUNNING, "True", "StillRunning"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "StillRunning");
        assert_eq!(conditions[0].last_transition_time, first);

        set_condition(&mut conditions, condition(CONDITION_RUNNING, "False", "Stopped"));
        assert_eq!(conditions[0].status, "False");
    }

    #[test]
    fn grants_serialize_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&Grant::AccessConsole).unwrap(),
            "\"accessConsole\""
        );
        assert_eq!(serde_json::to_string(&Grant::All).unwrap(), "\"*\"");
    }

    #[test]
    fn vm_state_round_trips_through_str() {
        assert_eq!("Running".parse::<VmState>(), Ok(VmState::Running));
        assert_eq!(VmState::Stopped.to_string(), "Stopped");
        assert!("Paused".parse::<VmState>().is_err());
    }
}
