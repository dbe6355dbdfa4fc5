//! Renders the QEMU invocation from the resolved settings. A pure
//! function: no filesystem access, no side effects, fully testable.

use crate::config::Settings;
use anyhow::{Result, bail};
use vmop_types::{Firmware, parse_quantity};

const QEMU_PROGRAM: &str = "qemu-system-x86_64";
const UEFI_CODE: &str = "/usr/share/OVMF/OVMF_CODE.fd";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QemuCommand {
    pub program: String,
    pub args: Vec<String>,
}

pub(crate) fn render(settings: &Settings) -> Result<QemuCommand> {
    let vm = &settings.config.vm;
    let mut args: Vec<String> = Vec::new();
    let mut arg = |flag: &str, value: String| {
        args.push(flag.to_owned());
        args.push(value);
    };

    arg(
        "-name",
        format!(
            "guest={},process=qemu-{}",
            settings.vm_name, settings.vm_name
        ),
    );
    arg("-uuid", settings.machine_uuid.to_string());
    arg("-machine", "q35".to_owned());
    arg("-accel", "kvm".to_owned());
    arg("-cpu", vm.cpu_model.clone().unwrap_or_else(|| "host".to_owned()));
    arg("-display", "none".to_owned());

    // A single-CPU machine gets no SMP options at all.
    if vm.maximum_cpus > 1 {
        let mut smp = format!("cpus={},maxcpus={}", vm.current_cpus(), vm.maximum_cpus);
        if let Some(topology) = &vm.cpu_topology {
            for (key, value) in [
                ("sockets", topology.sockets),
                ("dies", topology.dies),
                ("cores", topology.cores),
                ("threads", topology.threads),
            ] {
                if let Some(value) = value {
                    smp.push_str(&format!(",{}={}", key, value));
                }
            }
        }
        arg("-smp", smp);
    }

    let maximum_ram = parse_quantity(&vm.maximum_ram)?;
    if maximum_ram < 1 << 20 {
        bail!("maximumRam below 1 MiB: {}", vm.maximum_ram.0);
    }
    if parse_quantity(vm.current_ram())? < 1 << 20 {
        bail!("currentRam below 1 MiB: {}", vm.current_ram().0);
    }
    arg("-m", format!("{}M", maximum_ram >> 20));
    arg("-device", "virtio-balloon-pci,id=balloon0".to_owned());

    if vm.firmware == Firmware::Uefi {
        arg(
            "-drive",
            format!("if=pflash,format=raw,readonly=on,file={}", UEFI_CODE),
        );
        arg(
            "-drive",
            format!(
                "if=pflash,format=raw,file={}",
                settings.uefi_vars().display()
            ),
        );
    }

    arg("-rtc", format!("base={},clock={}", vm.rtc_base, vm.rtc_clock));
    if vm.boot_menu {
        arg("-boot", "menu=on".to_owned());
    }

    for (index, network) in vm.networks.iter().enumerate() {
        let id = format!("net{}", index);
        if let Some(tap) = &network.tap {
            arg("-netdev", format!("bridge,id={},br={}", id, tap.bridge));
            let mac = tap.mac.clone().unwrap_or_else(|| derived_mac(settings, index));
            arg(
                "-device",
                format!("virtio-net-pci,netdev={},mac={}", id, mac),
            );
        } else {
            let mac = network
                .user
                .as_ref()
                .and_then(|u| u.mac.clone())
                .unwrap_or_else(|| derived_mac(settings, index));
            arg("-netdev", format!("user,id={}", id));
            arg(
                "-device",
                format!("virtio-net-pci,netdev={},mac={}", id, mac),
            );
        }
    }

    for (index, disk) in vm.disks.iter().enumerate() {
        let node = disk.effective_name(index);
        if let Some(cdrom) = &disk.cdrom {
            if cdrom.image.is_empty() {
                // An empty tray: device without a backing drive.
                arg("-device", format!("ide-cd,id={}", node));
            } else {
                arg(
                    "-blockdev",
                    format!(
                        "driver=raw,node-name={},read-only=on,file.driver=file,file.filename={}",
                        node, cdrom.image
                    ),
                );
                let mut device = format!("ide-cd,id={},drive={}", node, node);
                if let Some(bootindex) = cdrom.bootindex {
                    device.push_str(&format!(",bootindex={}", bootindex));
                }
                arg("-device", device);
            }
            continue;
        }
        let Some(resource) = &disk.resource else {
            bail!("disk '{}' has no resolved resource path", node);
        };
        let file_driver = if resource.starts_with("/dev/") {
            "host_device"
        } else {
            "file"
        };
        arg(
            "-blockdev",
            format!(
                "driver=raw,node-name={},file.driver={},file.filename={}",
                node, file_driver, resource
            ),
        );
        arg("-device", format!("virtio-blk-pci,drive={}", node));
    }

    if let Some(spice) = vm.display.as_ref().and_then(|d| d.spice.as_ref()) {
        let mut value = format!("port={},addr=0.0.0.0", spice.port);
        if let Some(mode) = &spice.streaming_video {
            value.push_str(&format!(",streaming-video={}", mode));
        }
        if !spice.generate_secret.unwrap_or(true) {
            value.push_str(",disable-ticketing=on");
        }
        arg("-spice", value);
        arg("-vga", "qxl".to_owned());
        if spice.usb_redirects > 0 {
            arg("-device", "qemu-xhci,id=usb".to_owned());
            for i in 0..spice.usb_redirects {
                arg(
                    "-chardev",
                    format!("spicevmc,id=usbredir{},name=usbredir", i),
                );
                arg("-device", format!("usb-redir,chardev=usbredir{}", i));
            }
        }
    }

    if vm.use_tpm {
        arg(
            "-chardev",
            format!(
                "socket,id=chrtpm,path={}",
                settings.swtpm_socket().display()
            ),
        );
        arg("-tpmdev", "emulator,id=tpm0,chardev=chrtpm".to_owned());
        arg("-device", "tpm-tis,tpmdev=tpm0".to_owned());
    }

    if settings.config.cloud_init.is_some() {
        arg(
            "-drive",
            format!(
                "if=virtio,format=raw,readonly=on,file={}",
                settings.cidata_image().display()
            ),
        );
    }

    arg(
        "-qmp",
        format!(
            "unix:{},server=on,wait=off",
            settings.qmp_socket().display()
        ),
    );

    Ok(QemuCommand {
        program: QEMU_PROGRAM.to_owned(),
        args,
    })
}

/// Locally administered MAC, stable across restarts: derived from the
/// machine UUID and the NIC index.
fn derived_mac(settings: &Settings, index: usize) -> String {
    let bytes = settings.machine_uuid.as_bytes();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0],
        bytes[1],
        bytes[2].wrapping_add(index as u8)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::path::PathBuf;
    use uuid::Uuid;
    use vmop_types::{
        Cdrom, CloudInit, CpuTopology, Disk, Display, Network, SpiceDisplay, TapNetwork, VmConfig,
        runner::RunnerConfig,
    };

    fn settings(vm: VmConfig) -> Settings {
        Settings {
            config_path: PathBuf::from("/etc/opt/vmrunner/config.yaml"),
            data_dir: PathBuf::from("/data"),
            runtime_dir: PathBuf::from("/run/vmrunner"),
            machine_uuid: Uuid::nil(),
            config: RunnerConfig {
                vm,
                ..Default::default()
            },
            vm_name: "test-vm".to_owned(),
            namespace: "vmop-demo".to_owned(),
            node_name: None,
            node_ip: None,
        }
    }

    fn flag_value<'a>(command: &'a QemuCommand, flag: &str) -> Option<&'a str> {
        command
            .args
            .iter()
            .position(|a| a == flag)
            .map(|i| command.args[i + 1].as_str())
    }

    fn flag_values<'a>(command: &'a QemuCommand, flag: &str) -> Vec<&'a str> {
        command
            .args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == flag)
            .map(|(i, _)| command.args[i + 1].as_str())
            .collect()
    }

    #[test]
    fn single_cpu_machines_get_no_smp_options() {
        let command = render(&settings(VmConfig {
            maximum_cpus: 1,
            maximum_ram: Quantity("1Gi".to_owned()),
            ..Default::default()
        }))
        .unwrap();
        assert!(flag_value(&command, "-smp").is_none());
    }

    #[test]
    fn smp_includes_current_maximum_and_topology() {
        let command = render(&settings(VmConfig {
            maximum_cpus: 8,
            current_cpus: Some(2),
            maximum_ram: Quantity("1Gi".to_owned()),
            cpu_topology: Some(CpuTopology {
                sockets: Some(1),
                cores: Some(4),
                threads: Some(2),
                dies: None,
            }),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(
            flag_value(&command, "-smp"),
            Some("cpus=2,maxcpus=8,sockets=1,cores=4,threads=2")
        );
    }

    #[test]
    fn ram_is_rendered_in_mebibytes_from_the_maximum() {
        let command = render(&settings(VmConfig {
            maximum_ram: Quantity("4Gi".to_owned()),
            current_ram: Some(Quantity("2Gi".to_owned())),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(flag_value(&command, "-m"), Some("4096M"));
    }

    #[test]
    fn tiny_ram_is_rejected() {
        let result = render(&settings(VmConfig {
            maximum_ram: Quantity("512Ki".to_owned()),
            ..Default::default()
        }));
        assert!(result.is_err());
    }

    #[test]
    fn uefi_adds_pflash_and_bios_does_not() {
        let uefi = render(&settings(VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(flag_values(&uefi, "-drive").len(), 2);

        let bios = render(&settings(VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            firmware: Firmware::Bios,
            ..Default::default()
        }))
        .unwrap();
        assert!(flag_values(&bios, "-drive").is_empty());
    }

    #[test]
    fn qmp_socket_is_a_non_blocking_unix_server() {
        let command = render(&settings(VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(
            flag_value(&command, "-qmp"),
            Some("unix:/run/vmrunner/qmp.sock,server=on,wait=off")
        );
    }

    #[test]
    fn bridge_tap_and_stable_mac() {
        let command = render(&settings(VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            networks: vec![Network {
                tap: Some(TapNetwork {
                    bridge: "br0".to_owned(),
                    mac: None,
                }),
                user: None,
            }],
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(flag_value(&command, "-netdev"), Some("bridge,id=net0,br=br0"));
        let devices = flag_values(&command, "-device");
        assert!(
            devices
                .iter()
                .any(|d| d.starts_with("virtio-net-pci,netdev=net0,mac=52:54:00:"))
        );
    }

    #[test]
    fn cdrom_with_empty_image_renders_an_empty_tray() {
        let command = render(&settings(VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            disks: vec![Disk {
                name: Some("install".to_owned()),
                cdrom: Some(Cdrom {
                    image: String::new(),
                    bootindex: None,
                }),
                ..Default::default()
            }],
            ..Default::default()
        }))
        .unwrap();
        assert!(flag_values(&command, "-blockdev").is_empty());
        assert!(
            flag_values(&command, "-device")
                .iter()
                .any(|d| *d == "ide-cd,id=install")
        );
    }

    #[test]
    fn claimed_disk_uses_its_resolved_resource() {
        let command = render(&settings(VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            disks: vec![Disk {
                name: Some("system".to_owned()),
                resource: Some("/dev/disks/system".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(
            flag_value(&command, "-blockdev"),
            Some("driver=raw,node-name=system,file.driver=host_device,file.filename=/dev/disks/system")
        );
    }

    #[test]
    fn spice_display_renders_port_and_redirects() {
        let command = render(&settings(VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            display: Some(Display {
                spice: Some(SpiceDisplay {
                    port: 5910,
                    streaming_video: Some("filter".to_owned()),
                    usb_redirects: 2,
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(
            flag_value(&command, "-spice"),
            Some("port=5910,addr=0.0.0.0,streaming-video=filter")
        );
        assert_eq!(flag_value(&command, "-vga"), Some("qxl"));
        assert_eq!(flag_values(&command, "-chardev").len(), 2);
    }

    #[test]
    fn tpm_devices_appear_only_when_enabled() {
        let mut vm = VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            use_tpm: true,
            ..Default::default()
        };
        let command = render(&settings(vm.clone())).unwrap();
        assert_eq!(
            flag_value(&command, "-tpmdev"),
            Some("emulator,id=tpm0,chardev=chrtpm")
        );

        vm.use_tpm = false;
        let command = render(&settings(vm)).unwrap();
        assert!(flag_value(&command, "-tpmdev").is_none());
    }

    #[test]
    fn cloud_init_seed_is_attached_when_configured() {
        let mut settings = settings(VmConfig {
            maximum_ram: Quantity("1Gi".to_owned()),
            firmware: Firmware::Bios,
            ..Default::default()
        });
        settings.config.cloud_init = Some(CloudInit::default());
        let command = render(&settings).unwrap();
        assert_eq!(
            flag_value(&command, "-drive"),
            Some("if=virtio,format=raw,readonly=on,file=/run/vmrunner/cidata.img")
        );
    }
}
