use crate::args::Args;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use owo_colors::OwoColorize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vmop_types::parse_quantity;
use vmop_types::runner::{
    DISPLAY_PASSWORD_KEY, PASSWORD_EXPIRY_KEY, RunnerConfig, RunnerConfigFile,
};

/// Fully resolved runner settings: the parsed configuration plus the
/// directories and identity everything else hangs off.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub machine_uuid: Uuid,
    pub config: RunnerConfig,
    pub vm_name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub node_ip: Option<String>,
}

impl Settings {
    pub fn qmp_socket(&self) -> PathBuf {
        self.runtime_dir.join("qmp.sock")
    }

    pub fn swtpm_socket(&self) -> PathBuf {
        self.runtime_dir.join("swtpm.sock")
    }

    pub fn swtpm_state_dir(&self) -> PathBuf {
        self.data_dir.join("tpm")
    }

    pub fn cidata_image(&self) -> PathBuf {
        self.runtime_dir.join("cidata.img")
    }

    pub fn uefi_vars(&self) -> PathBuf {
        self.data_dir.join("OVMF_VARS.fd")
    }
}

pub(crate) fn load(args: &Args) -> Result<Settings> {
    let config = read_config(&args.config)?;
    let data_dir = resolve_data_dir(&config);
    let runtime_dir = resolve_runtime_dir(&config);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {:?}", data_dir))?;
    std::fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("Failed to create runtime dir {:?}", runtime_dir))?;
    let machine_uuid = ensure_machine_uuid(&data_dir, &config)?;
    Ok(Settings {
        config_path: args.config.clone(),
        data_dir,
        runtime_dir,
        machine_uuid,
        config,
        vm_name: args.vm_name.clone(),
        namespace: args
            .namespace
            .clone()
            .unwrap_or_else(vmop_common::namespace),
        node_name: args.node_name.clone(),
        node_ip: args.node_ip.clone(),
    })
}

pub(crate) fn read_config(path: &Path) -> Result<RunnerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration {:?}", path))?;
    let file: RunnerConfigFile = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse configuration {:?}", path))?;
    Ok(file.runner)
}

fn resolve_data_dir(config: &RunnerConfig) -> PathBuf {
    if let Some(dir) = &config.data_dir {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(dir).join("vmrunner");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/vmrunner");
    }
    PathBuf::from("/var/local/vmrunner")
}

fn resolve_runtime_dir(config: &RunnerConfig) -> PathBuf {
    if let Some(dir) = &config.runtime_dir {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("vmrunner");
    }
    std::env::temp_dir().join("vmrunner")
}

/// The machine UUID survives Pod replacements: configured value first,
/// then whatever an earlier run persisted, then a fresh one.
fn ensure_machine_uuid(data_dir: &Path, config: &RunnerConfig) -> Result<Uuid> {
    if let Some(configured) = &config.vm.machine_uuid {
        return configured
            .parse()
            .with_context(|| format!("Invalid machineUuid '{}'", configured));
    }
    let path = data_dir.join("machine-uuid");
    if let Ok(text) = std::fs::read_to_string(&path) {
        if let Ok(uuid) = text.trim().parse() {
            return Ok(uuid);
        }
    }
    let uuid = Uuid::new_v4();
    std::fs::write(&path, uuid.to_string())
        .with_context(|| format!("Failed to persist machine UUID to {:?}", path))?;
    Ok(uuid)
}

/// A change the runner can apply to the live VM.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConfigEvent {
    CurrentCpus(u32),
    CurrentRam(u64),
    CdromMedia { device: String, image: String },
    PowerdownTimeout(Duration),
    Reset(u64),
    DisplayPassword {
        password: String,
        expiry: Option<DateTime<Utc>>,
    },
}

/// Translates a configuration change into the live mutations it implies.
/// Cold fields changing here means the operator is about to replace the
/// Pod anyway, so they are ignored.
pub(crate) fn diff_events(old: &RunnerConfig, new: &RunnerConfig) -> Vec<ConfigEvent> {
    let mut events = Vec::new();

    if new.vm.current_cpus() != old.vm.current_cpus() {
        events.push(ConfigEvent::CurrentCpus(new.vm.current_cpus()));
    }

    let old_ram = parse_quantity(old.vm.current_ram()).ok();
    match parse_quantity(new.vm.current_ram()) {
        Ok(new_ram) if Some(new_ram) != old_ram => {
            events.push(ConfigEvent::CurrentRam(new_ram));
        }
        Ok(_) => {}
        Err(e) => eprintln!("{}", format!("⚠️ Ignoring unusable currentRam: {}", e).yellow()),
    }

    if new.vm.powerdown_timeout != old.vm.powerdown_timeout {
        events.push(ConfigEvent::PowerdownTimeout(Duration::from_secs(
            new.vm.powerdown_timeout,
        )));
    }

    if new.reset_counter > old.reset_counter {
        events.push(ConfigEvent::Reset(new.reset_counter));
    }

    for (index, disk) in new.vm.disks.iter().enumerate() {
        let Some(cdrom) = &disk.cdrom else { continue };
        let device = disk.effective_name(index);
        let previous = old
            .vm
            .disks
            .iter()
            .enumerate()
            .find(|(i, d)| d.cdrom.is_some() && d.effective_name(*i) == device)
            .and_then(|(_, d)| d.cdrom.as_ref())
            .map(|c| c.image.as_str());
        if previous != Some(cdrom.image.as_str()) {
            events.push(ConfigEvent::CdromMedia {
                device,
                image: cdrom.image.clone(),
            });
        }
    }

    events
}

/// Mutations to bring a freshly booted guest from its command-line
/// defaults to the configured targets.
pub(crate) fn initial_events(config: &RunnerConfig) -> Vec<ConfigEvent> {
    let mut events = vec![ConfigEvent::CurrentCpus(config.vm.current_cpus())];
    match (
        parse_quantity(config.vm.current_ram()),
        parse_quantity(&config.vm.maximum_ram),
    ) {
        (Ok(current), Ok(maximum)) if current != maximum => {
            events.push(ConfigEvent::CurrentRam(current));
        }
        _ => {}
    }
    events
}

/// Reads the projected display secret, if mounted.
pub(crate) fn read_display_secret(dir: &Path) -> Option<ConfigEvent> {
    let password = std::fs::read_to_string(dir.join(DISPLAY_PASSWORD_KEY)).ok()?;
    let expiry = std::fs::read_to_string(dir.join(PASSWORD_EXPIRY_KEY))
        .ok()
        .and_then(|text| DateTime::parse_from_rfc3339(text.trim()).ok())
        .map(|t| t.with_timezone(&Utc));
    Some(ConfigEvent::DisplayPassword {
        password: password.trim().to_owned(),
        expiry,
    })
}

/// Watches a directory and pokes `tx` on every change. Kubernetes swaps
/// projected volumes atomically via symlinks, so any event is a cue to
/// re-read rather than something to interpret.
pub(crate) fn spawn_dir_watch(dir: PathBuf, tx: mpsc::Sender<()>, cancel: CancellationToken) {
    tokio::task::spawn(async move {
        let res: Result<()> = async {
            let mut watcher: RecommendedWatcher = RecommendedWatcher::new(
                move |res: Result<Event, notify::Error>| match res {
                    Ok(_event) => {
                        let _ = tx.try_send(());
                    }
                    Err(err) => {
                        eprintln!("watch error: {err}");
                    }
                },
                Default::default(),
            )?;
            watcher.watch(&dir, RecursiveMode::Recursive)?;
            // Keep this task alive; watcher is driven by the callback
            cancel.cancelled().await;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            eprintln!("watcher task error: {e:?}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use vmop_types::{Cdrom, Disk, VmConfig};

    fn base_config() -> RunnerConfig {
        RunnerConfig {
            vm: VmConfig {
                maximum_cpus: 4,
                current_cpus: Some(2),
                maximum_ram: Quantity("4Gi".to_owned()),
                current_ram: Some(Quantity("4Gi".to_owned())),
                powerdown_timeout: 900,
                disks: vec![Disk {
                    name: Some("install".to_owned()),
                    cdrom: Some(Cdrom {
                        image: "/images/debian.iso".to_owned(),
                        bootindex: None,
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn parses_the_runner_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            concat!(
                "\"/Runner\":\n",
                "  guestShutdownStops: true\n",
                "  resetCounter: 2\n",
                "  vm:\n",
                "    maximumCpus: 2\n",
                "    maximumRam: 2Gi\n",
                "    state: Running\n",
            ),
        )
        .unwrap();
        let config = read_config(&path).unwrap();
        assert!(config.guest_shutdown_stops);
        assert_eq!(config.reset_counter, 2);
        assert_eq!(config.vm.maximum_cpus, 2);
    }

    #[test]
    fn machine_uuid_is_persisted_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config();
        let first = ensure_machine_uuid(dir.path(), &config).unwrap();
        let second = ensure_machine_uuid(dir.path(), &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn configured_machine_uuid_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config();
        let configured = Uuid::new_v4();
        config.vm.machine_uuid = Some(configured.to_string());
        assert_eq!(ensure_machine_uuid(dir.path(), &config).unwrap(), configured);
    }

    #[test]
    fn diff_detects_hot_changes() {
        let old = base_config();
        let mut new = base_config();
        new.vm.current_cpus = Some(3);
        new.vm.current_ram = Some(Quantity("2Gi".to_owned()));
        new.vm.powerdown_timeout = 10;
        new.reset_counter = 1;
        new.vm.disks[0].cdrom.as_mut().unwrap().image = "/images/fedora.iso".to_owned();

        let events = diff_events(&old, &new);
        assert!(events.contains(&ConfigEvent::CurrentCpus(3)));
        assert!(events.contains(&ConfigEvent::CurrentRam(2 << 30)));
        assert!(events.contains(&ConfigEvent::PowerdownTimeout(Duration::from_secs(10))));
        assert!(events.contains(&ConfigEvent::Reset(1)));
        assert!(events.contains(&ConfigEvent::CdromMedia {
            device: "install".to_owned(),
            image: "/images/fedora.iso".to_owned(),
        }));
    }

    #[test]
    fn diff_is_empty_for_identical_configs() {
        let config = base_config();
        assert!(diff_events(&config, &config).is_empty());
    }

    #[test]
    fn initial_events_skip_idle_balloon() {
        let mut config = base_config();
        config.vm.current_ram = Some(Quantity("4Gi".to_owned()));
        let events = initial_events(&config);
        assert_eq!(events, vec![ConfigEvent::CurrentCpus(2)]);

        config.vm.current_ram = Some(Quantity("2Gi".to_owned()));
        let events = initial_events(&config);
        assert!(events.contains(&ConfigEvent::CurrentRam(2 << 30)));
    }

    #[test]
    fn display_secret_is_read_from_mounted_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DISPLAY_PASSWORD_KEY), "s3cret\n").unwrap();
        std::fs::write(
            dir.path().join(PASSWORD_EXPIRY_KEY),
            "2030-01-01T00:00:00+00:00",
        )
        .unwrap();
        let Some(ConfigEvent::DisplayPassword { password, expiry }) =
            read_display_secret(dir.path())
        else {
            panic!("expected a display password event");
        };
        assert_eq!(password, "s3cret");
        assert!(expiry.is_some());

        assert!(read_display_secret(&dir.path().join("missing")).is_none());
    }
}
