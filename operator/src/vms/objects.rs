use crate::util::{Error, hash_spec};
use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{
        Affinity, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
        HostPathVolumeSource, ObjectFieldSelector, PersistentVolumeClaim,
        PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Secret,
        SecretVolumeSource, SecurityContext, Service, ServicePort, ServiceSpec, Volume,
        VolumeDevice, VolumeMount,
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{ObjectMeta, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::Resource;
use rand::{Rng, distr::Alphanumeric};
use serde::Serialize;
use std::collections::BTreeMap;
use vmop_common::{annotations, labels};
use vmop_types::{
    CpuTopology, Disk, Firmware, Network, SpiceDisplay, VirtualMachine,
    runner::{
        CONFIG_DIR, CONFIG_FILE, DISK_DEVICE_DIR, DISK_MOUNT_DIR, DISPLAY_PASSWORD_KEY,
        DISPLAY_SECRET_DIR, PASSWORD_EXPIRY_KEY, RunnerConfig, RunnerConfigFile,
    },
};

pub fn display_secret_name(vm_name: &str) -> String {
    format!("{}-display-secret", vm_name)
}

/// PVC name for a disk backed by a volume claim template. Named disks
/// yield `<vm>-<disk>-disk`, unnamed ones `<vm>-disk-<i>`.
pub fn pvc_name(vm_name: &str, disk: &Disk, index: usize) -> String {
    match &disk.name {
        Some(name) => format!("{}-{}-disk", vm_name, name),
        None => format!("{}-disk-{}", vm_name, index),
    }
}

pub fn common_labels(vm_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED_BY.to_owned(), "vm-operator".to_owned()),
        (labels::INSTANCE.to_owned(), vm_name.to_owned()),
    ])
}

/// Owner reference back to the VM with `controller: false`, so deleting
/// the CR does not cascade into retained objects such as PVCs.
pub fn owner_reference(instance: &VirtualMachine) -> OwnerReference {
    let mut owner = instance
        .owner_ref(&())
        .expect("VirtualMachine has name and uid");
    owner.controller = Some(false);
    owner.block_owner_deletion = Some(false);
    owner
}

fn spice(instance: &VirtualMachine) -> Option<&SpiceDisplay> {
    instance
        .spec
        .vm
        .display
        .as_ref()
        .and_then(|d| d.spice.as_ref())
}

pub fn wants_display_secret(instance: &VirtualMachine) -> bool {
    spice(instance).is_some_and(|s| s.generate_secret.unwrap_or(true))
}

/// Path a disk's backing medium is visible at inside the runner Pod.
fn disk_resource(disk: &Disk, index: usize) -> Option<String> {
    if let Some(cdrom) = &disk.cdrom {
        if cdrom.image.is_empty() {
            return None;
        }
        return Some(cdrom.image.clone());
    }
    disk.volume_claim_template.as_ref().map(|vct| {
        if vct.spec.volume_mode.as_deref() == Some("Block") {
            format!("{}/{}", DISK_DEVICE_DIR, disk.effective_name(index))
        } else {
            format!("{}/{}/disk.img", DISK_MOUNT_DIR, disk.effective_name(index))
        }
    })
}

/// The configuration document consumed by the runner. Disk resources are
/// resolved to Pod-local paths and cloud-init identity defaults are
/// filled in here, so the runner itself stays free of Kubernetes
/// naming rules.
pub fn runner_config(instance: &VirtualMachine) -> RunnerConfig {
    let name = instance.meta().name.clone().unwrap_or_default();
    let mut vm = instance.spec.vm.clone();
    for (index, disk) in vm.disks.iter_mut().enumerate() {
        disk.resource = disk_resource(disk, index);
    }

    let mut cloud_init = instance.spec.cloud_init.clone();
    if let Some(ci) = cloud_init.as_mut() {
        let meta = ci
            .meta_data
            .get_or_insert_with(|| serde_json::json!({}));
        if let Some(map) = meta.as_object_mut() {
            if !map.contains_key("instance-id") {
                map.insert(
                    "instance-id".to_owned(),
                    serde_json::json!(format!(
                        "i-{}",
                        instance
                            .meta()
                            .resource_version
                            .clone()
                            .unwrap_or_else(|| "0".to_owned())
                    )),
                );
            }
            if !map.contains_key("local-hostname") {
                map.insert("local-hostname".to_owned(), serde_json::json!(name));
            }
        }
    }

    RunnerConfig {
        data_dir: None,
        runtime_dir: None,
        template: instance
            .spec
            .runner_template
            .as_ref()
            .and_then(|t| t.source.clone()),
        update_template: instance
            .spec
            .runner_template
            .as_ref()
            .map(|t| t.update)
            .unwrap_or_default(),
        guest_shutdown_stops: instance.spec.guest_shutdown_stops,
        reset_counter: instance.spec.reset_count,
        cloud_init,
        vm,
    }
}

pub fn config_map(instance: &VirtualMachine) -> Result<ConfigMap, Error> {
    let name = instance.meta().name.clone().unwrap();
    let config = RunnerConfigFile {
        runner: runner_config(instance),
    };
    let yaml = serde_yaml::to_string(&config)?;
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: instance.meta().namespace.clone(),
            labels: Some(common_labels(&name)),
            owner_references: Some(vec![owner_reference(instance)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_FILE.to_owned(), yaml)])),
        ..Default::default()
    })
}

/// The subset of a disk that cannot change without replacing QEMU.
/// The medium of a CDROM is hot-swapped and therefore excluded.
#[derive(Serialize)]
struct ColdDisk {
    name: String,
    claimed: bool,
    cdrom: bool,
}

/// Spec fields whose change requires a Pod replacement. Everything else
/// reaches the running VM through the ConfigMap and QMP.
#[derive(Serialize)]
struct ColdFields<'a> {
    image: &'a str,
    firmware: &'a Firmware,
    cpu_model: &'a Option<String>,
    maximum_cpus: u32,
    maximum_ram: &'a Quantity,
    cpu_topology: &'a Option<CpuTopology>,
    use_tpm: bool,
    rtc_base: &'a str,
    rtc_clock: &'a str,
    boot_menu: bool,
    networks: &'a [Network],
    disks: Vec<ColdDisk>,
    spice: Option<(i32, u32, Option<String>)>,
    template: Option<&'a str>,
    node_name: &'a Option<String>,
    node_selector: &'a Option<BTreeMap<String, String>>,
    affinity: &'a Option<Affinity>,
    resources: &'a Option<ResourceRequirements>,
}

pub fn cold_hash(instance: &VirtualMachine) -> String {
    let spec = &instance.spec;
    let vm = &spec.vm;
    let cold = ColdFields {
        image: &spec.image,
        firmware: &vm.firmware,
        cpu_model: &vm.cpu_model,
        maximum_cpus: vm.maximum_cpus,
        maximum_ram: &vm.maximum_ram,
        cpu_topology: &vm.cpu_topology,
        use_tpm: vm.use_tpm,
        rtc_base: &vm.rtc_base,
        rtc_clock: &vm.rtc_clock,
        boot_menu: vm.boot_menu,
        networks: &vm.networks,
        disks: vm
            .disks
            .iter()
            .enumerate()
            .map(|(index, disk)| ColdDisk {
                name: disk.effective_name(index),
                claimed: disk.volume_claim_template.is_some(),
                cdrom: disk.cdrom.is_some(),
            })
            .collect(),
        spice: spice(instance).map(|s| {
            (
                s.port,
                s.usb_redirects,
                s.streaming_video.clone(),
            )
        }),
        template: spec
            .runner_template
            .as_ref()
            .and_then(|t| t.source.as_deref()),
        node_name: &spec.node_name,
        node_selector: &spec.node_selector,
        affinity: &spec.affinity,
        resources: &spec.resources,
    };
    hash_spec(&cold)
}

pub fn pvc(instance: &VirtualMachine, disk: &Disk, index: usize) -> Option<PersistentVolumeClaim> {
    let vct = disk.volume_claim_template.as_ref()?;
    let name = instance.meta().name.clone().unwrap();
    let mut metadata = vct.metadata.clone().unwrap_or_default();
    metadata.name = Some(pvc_name(&name, disk, index));
    metadata.namespace = instance.meta().namespace.clone();
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(common_labels(&name));
    metadata.owner_references = Some(vec![owner_reference(instance)]);
    Some(PersistentVolumeClaim {
        metadata,
        spec: Some(vct.spec.clone()),
        status: None,
    })
}

pub fn display_secret(instance: &VirtualMachine) -> Secret {
    let name = instance.meta().name.clone().unwrap();
    let password: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    // Expiry starts in the past: the password is unusable until a user
    // or the console sets a fresh one. The expiry is duplicated into the
    // data because annotations are not projected into the Pod.
    let expiry = Utc::now().to_rfc3339();
    Secret {
        metadata: ObjectMeta {
            name: Some(display_secret_name(&name)),
            namespace: instance.meta().namespace.clone(),
            labels: Some(common_labels(&name)),
            annotations: Some(BTreeMap::from([(
                annotations::PASSWORD_EXPIRY.to_owned(),
                expiry.clone(),
            )])),
            owner_references: Some(vec![owner_reference(instance)]),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([
            (DISPLAY_PASSWORD_KEY.to_owned(), password),
            (PASSWORD_EXPIRY_KEY.to_owned(), expiry),
        ])),
        type_: Some("Opaque".to_owned()),
        ..Default::default()
    }
}

pub fn service(instance: &VirtualMachine) -> Option<Service> {
    let lbs = instance.spec.load_balancer_service.as_ref()?;
    let spice = spice(instance)?;
    let name = instance.meta().name.clone().unwrap();
    let mut labels = common_labels(&name);
    if let Some(extra) = &lbs.labels {
        labels.extend(extra.clone());
    }
    Some(Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: instance.meta().namespace.clone(),
            labels: Some(labels),
            annotations: lbs.annotations.clone(),
            owner_references: Some(vec![owner_reference(instance)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_owned()),
            selector: Some(common_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some("spice".to_owned()),
                port: spice.port,
                target_port: Some(IntOrString::Int(spice.port)),
                protocol: Some("TCP".to_owned()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod(instance: &VirtualMachine, config_version: &str, cold_hash: &str) -> Pod {
    let name = instance.meta().name.clone().unwrap();
    let vm = &instance.spec.vm;

    let mut volumes = vec![
        Volume {
            name: "config".to_owned(),
            config_map: Some(ConfigMapVolumeSource {
                name: name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "dev-kvm".to_owned(),
            host_path: Some(HostPathVolumeSource {
                path: "/dev/kvm".to_owned(),
                type_: Some("CharDevice".to_owned()),
            }),
            ..Default::default()
        },
    ];
    let mut volume_mounts = vec![
        VolumeMount {
            name: "config".to_owned(),
            mount_path: CONFIG_DIR.to_owned(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "dev-kvm".to_owned(),
            mount_path: "/dev/kvm".to_owned(),
            ..Default::default()
        },
    ];
    let mut volume_devices = Vec::new();

    if wants_display_secret(instance) {
        volumes.push(Volume {
            name: "display-secret".to_owned(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(display_secret_name(&name)),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "display-secret".to_owned(),
            mount_path: DISPLAY_SECRET_DIR.to_owned(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    for (index, disk) in vm.disks.iter().enumerate() {
        let Some(vct) = &disk.volume_claim_template else {
            continue;
        };
        let disk_name = disk.effective_name(index);
        let volume_name = format!("disk-{}", disk_name);
        volumes.push(Volume {
            name: volume_name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(&name, disk, index),
                ..Default::default()
            }),
            ..Default::default()
        });
        if vct.spec.volume_mode.as_deref() == Some("Block") {
            volume_devices.push(VolumeDevice {
                name: volume_name,
                device_path: format!("{}/{}", DISK_DEVICE_DIR, disk_name),
            });
        } else {
            volume_mounts.push(VolumeMount {
                name: volume_name,
                mount_path: format!("{}/{}", DISK_MOUNT_DIR, disk_name),
                ..Default::default()
            });
        }
    }

    let resources = instance.spec.resources.clone().unwrap_or_else(|| {
        // QEMU needs at least the guest's maximum RAM.
        let memory = BTreeMap::from([("memory".to_owned(), vm.maximum_ram.clone())]);
        ResourceRequirements {
            requests: Some(memory),
            limits: None,
            ..Default::default()
        }
    });

    let ports = spice(instance).map(|s| {
        vec![ContainerPort {
            name: Some("spice".to_owned()),
            container_port: s.port,
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: instance.meta().namespace.clone(),
            labels: Some(common_labels(&name)),
            annotations: Some(BTreeMap::from([
                (
                    annotations::CONFIG_VERSION.to_owned(),
                    config_version.to_owned(),
                ),
                (annotations::COLD_HASH.to_owned(), cold_hash.to_owned()),
            ])),
            owner_references: Some(vec![owner_reference(instance)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(vm.powerdown_timeout as i64 + 5),
            node_name: instance.spec.node_name.clone(),
            node_selector: instance.spec.node_selector.clone(),
            affinity: instance.spec.affinity.clone(),
            volumes: Some(volumes),
            containers: vec![Container {
                name: "runner".to_owned(),
                image: Some(instance.spec.image.clone()),
                image_pull_policy: Some("Always".to_owned()),
                env: Some(vec![
                    field_ref("VM_NAME", "metadata.name"),
                    field_ref("POD_NAMESPACE", "metadata.namespace"),
                    field_ref("NODE_NAME", "spec.nodeName"),
                    field_ref("NODE_IP", "status.hostIP"),
                ]),
                volume_mounts: Some(volume_mounts),
                volume_devices: (!volume_devices.is_empty()).then_some(volume_devices),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                resources: Some(resources),
                ports,
                ..Default::default()
            }],
            restart_policy: Some("Never".to_owned()),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta as KubeObjectMeta;
    use vmop_types::{
        Cdrom, Display, LoadBalancerService, VmConfig, VmSpec, VmState, VolumeClaimTemplate,
    };

    fn test_vm() -> VirtualMachine {
        VirtualMachine {
            metadata: KubeObjectMeta {
                name: Some("test-vm".to_owned()),
                namespace: Some("vmop-demo".to_owned()),
                uid: Some("uid-1234".to_owned()),
                resource_version: Some("42".to_owned()),
                ..Default::default()
            },
            spec: VmSpec {
                image: "ghcr.io/vmop/runner:latest".to_owned(),
                vm: VmConfig {
                    maximum_cpus: 4,
                    current_cpus: Some(2),
                    maximum_ram: Quantity("4Gi".to_owned()),
                    state: VmState::Running,
                    disks: vec![
                        Disk {
                            name: Some("system".to_owned()),
                            volume_claim_template: Some(VolumeClaimTemplate {
                                metadata: None,
                                spec: Default::default(),
                            }),
                            ..Default::default()
                        },
                        Disk {
                            cdrom: Some(Cdrom {
                                image: "/images/fedora.iso".to_owned(),
                                bootindex: None,
                            }),
                            ..Default::default()
                        },
                    ],
                    display: Some(Display {
                        spice: Some(SpiceDisplay {
                            port: 5910,
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
                load_balancer_service: Some(LoadBalancerService::default()),
                cloud_init: Some(Default::default()),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn pvc_names_follow_the_convention() {
        let named = Disk {
            name: Some("system".to_owned()),
            ..Default::default()
        };
        let unnamed = Disk::default();
        assert_eq!(pvc_name("test-vm", &named, 0), "test-vm-system-disk");
        assert_eq!(pvc_name("test-vm", &unnamed, 1), "test-vm-disk-1");
    }

    #[test]
    fn owner_reference_is_not_controlling() {
        let owner = owner_reference(&test_vm());
        assert_eq!(owner.uid, "uid-1234");
        assert_eq!(owner.controller, Some(false));
    }

    #[test]
    fn pod_carries_config_annotations_and_grace_period() {
        let vm = test_vm();
        let pod = pod(&vm, "1234", "deadbeef");
        let anns = pod.metadata.annotations.as_ref().unwrap();
        assert_eq!(anns[annotations::CONFIG_VERSION], "1234");
        assert_eq!(anns[annotations::COLD_HASH], "deadbeef");
        assert_eq!(
            pod.spec.as_ref().unwrap().termination_grace_period_seconds,
            Some(905)
        );
    }

    #[test]
    fn cold_hash_ignores_hot_fields() {
        let vm = test_vm();
        let base = cold_hash(&vm);

        let mut hot = vm.clone();
        hot.spec.vm.current_cpus = Some(4);
        hot.spec.vm.current_ram = Some(Quantity("2Gi".to_owned()));
        hot.spec.vm.disks[1].cdrom.as_mut().unwrap().image = "/images/other.iso".to_owned();
        hot.spec.reset_count = 7;
        assert_eq!(cold_hash(&hot), base);

        let mut cold = vm.clone();
        cold.spec.vm.firmware = Firmware::Bios;
        assert_ne!(cold_hash(&cold), base);

        let mut cold = vm;
        cold.spec.vm.maximum_cpus = 8;
        assert_ne!(cold_hash(&cold), base);
    }

    #[test]
    fn runner_config_resolves_disk_resources() {
        let vm = test_vm();
        let config = runner_config(&vm);
        assert_eq!(
            config.vm.disks[0].resource.as_deref(),
            Some("/var/local/vm-disks/system/disk.img")
        );
        assert_eq!(
            config.vm.disks[1].resource.as_deref(),
            Some("/images/fedora.iso")
        );
        assert_eq!(config.reset_counter, 0);
    }

    #[test]
    fn runner_config_defaults_cloud_init_identity() {
        let vm = test_vm();
        let config = runner_config(&vm);
        let meta = config.cloud_init.unwrap().meta_data.unwrap();
        assert_eq!(meta["instance-id"], "i-42");
        assert_eq!(meta["local-hostname"], "test-vm");
    }

    #[test]
    fn display_secret_expires_immediately() {
        let secret = display_secret(&test_vm());
        let anns = secret.metadata.annotations.unwrap();
        assert!(anns.contains_key(annotations::PASSWORD_EXPIRY));
        let password = &secret.string_data.unwrap()[DISPLAY_PASSWORD_KEY];
        assert_eq!(password.len(), 16);
    }

    #[test]
    fn service_requires_spice_and_policy() {
        let vm = test_vm();
        assert!(service(&vm).is_some());

        let mut without_lb = vm.clone();
        without_lb.spec.load_balancer_service = None;
        assert!(service(&without_lb).is_none());

        let mut without_spice = vm;
        without_spice.spec.vm.display = None;
        assert!(service(&without_spice).is_none());
    }
}
