//! The configuration contract between the operator and the runner.
//!
//! The operator renders a [`RunnerConfigFile`] into the per-VM ConfigMap;
//! the runner Pod mounts it and re-reads it on change. Mount locations
//! are part of the contract and live here as well.

use crate::{CloudInit, VmConfig};
use serde::{Deserialize, Serialize};

/// Directory the per-VM ConfigMap is projected into.
pub const CONFIG_DIR: &str = "/etc/opt/vmrunner";

/// File name of the runner configuration inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.yaml";

/// Directory the display secret is projected into, when SPICE is enabled.
pub const DISPLAY_SECRET_DIR: &str = "/var/local/vmrunner-display";

/// Secret key carrying the SPICE password.
pub const DISPLAY_PASSWORD_KEY: &str = "display-password";

/// Secret key carrying the RFC 3339 password expiry, if bounded.
pub const PASSWORD_EXPIRY_KEY: &str = "password-expiry";

/// Mount point for filesystem-mode disk PVCs.
pub const DISK_MOUNT_DIR: &str = "/var/local/vm-disks";

/// Device path prefix for block-mode disk PVCs.
pub const DISK_DEVICE_DIR: &str = "/dev/disks";

/// Top-level document of the runner's YAML configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RunnerConfigFile {
    #[serde(rename = "/Runner")]
    pub runner: RunnerConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Where the runner keeps durable state (machine UUID). Resolved
    /// against XDG conventions when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Where sockets and the cloud-init image live. Resolved against
    /// XDG conventions when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<String>,

    /// Alternative command template shipped with the runner image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default)]
    pub update_template: bool,

    #[serde(default)]
    pub guest_shutdown_stops: bool,

    /// Mirrors `spec.resetCount`; an observed increment triggers a
    /// guest reset.
    #[serde(default)]
    pub reset_counter: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,

    /// Mirrors the CR `spec.vm`, with each disk's `resource` resolved to
    /// a path inside the Pod.
    pub vm: VmConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    #[test]
    fn config_file_round_trips_through_yaml() {
        let file = RunnerConfigFile {
            runner: RunnerConfig {
                reset_counter: 3,
                guest_shutdown_stops: true,
                vm: VmConfig {
                    maximum_cpus: 4,
                    maximum_ram: Quantity("4Gi".to_owned()),
                    ..Default::default()
                },
                ..Default::default()
            },
        };
        let yaml = serde_yaml::to_string(&file).unwrap();
        assert!(yaml.contains("/Runner"));
        assert!(yaml.contains("resetCounter: 3"));
        let parsed: RunnerConfigFile = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, file);
    }
}
