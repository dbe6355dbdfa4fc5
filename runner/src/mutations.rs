//! Live-mutation sub-controllers: CPU hot-plug, balloon resize, CDROM
//! media changes and display password refresh. Driven by configuration
//! events on one side and QMP events on the other.

use crate::config::ConfigEvent;
use crate::qmp::{HotpluggableCpu, QmpError, QmpEvent, QmpMonitor};
use crate::status::StatusUpdate;
use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;
use serde_json::json;
use std::{collections::HashMap, time::Duration};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub(crate) struct Mutations {
    monitor: QmpMonitor,
    cpu: CpuHotplug,
    tray: PendingTray,
    powerdown_timeout: watch::Sender<Duration>,
    status_tx: mpsc::Sender<StatusUpdate>,
}

impl Mutations {
    pub fn new(
        monitor: QmpMonitor,
        powerdown_timeout: watch::Sender<Duration>,
        status_tx: mpsc::Sender<StatusUpdate>,
    ) -> Self {
        Self {
            monitor,
            cpu: CpuHotplug::default(),
            tray: PendingTray::default(),
            powerdown_timeout,
            status_tx,
        }
    }

    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<ConfigEvent>,
        cancel: CancellationToken,
    ) {
        let mut qmp_events = self.monitor.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.apply(event).await;
                }
                event = qmp_events.recv() => {
                    match event {
                        Ok(event) => self.on_qmp_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(_) => {}
                    }
                }
            }
        }
    }

    async fn apply(&mut self, event: ConfigEvent) {
        let result = match &event {
            ConfigEvent::CurrentCpus(target) => self.cpu.apply(&self.monitor, *target).await,
            ConfigEvent::CurrentRam(bytes) => balloon(&self.monitor, *bytes).await,
            ConfigEvent::CdromMedia { device, image } => {
                self.change_medium(device.clone(), image.clone()).await
            }
            ConfigEvent::PowerdownTimeout(timeout) => {
                let _ = self.powerdown_timeout.send(*timeout);
                Ok(())
            }
            ConfigEvent::Reset(counter) => {
                let result = self.monitor.execute("system_reset", None).await.map(|_| ());
                if result.is_ok() {
                    let _ = self
                        .status_tx
                        .send(StatusUpdate::ResetPerformed(*counter))
                        .await;
                }
                result
            }
            ConfigEvent::DisplayPassword { password, expiry } => {
                set_display_password(&self.monitor, password, *expiry).await
            }
        };
        match result {
            Ok(()) => println!(
                "{}{}",
                "🔧 Applied live change • ".green(),
                event_kind(&event).green().dimmed(),
            ),
            Err(e) => eprintln!(
                "{}",
                format!("❌ Live change {} failed: {}", event_kind(&event), e).red()
            ),
        }
    }

    async fn on_qmp_event(&mut self, event: QmpEvent) {
        if let Some((device, image)) = self.tray.take_on_open(&event) {
            let result = self
                .monitor
                .execute(
                    "blockdev-change-medium",
                    Some(json!({"id": device, "filename": image, "format": "raw"})),
                )
                .await;
            if let Err(e) = result {
                eprintln!(
                    "{}",
                    format!("❌ Deferred medium change for {} failed: {}", device, e).red()
                );
            }
        }
    }

    /// Changes CDROM media. A locked tray defers the change: the tray is
    /// asked to open and the swap happens on the observed open event.
    async fn change_medium(&mut self, device: String, image: String) -> Result<(), QmpError> {
        if image.is_empty() {
            return self
                .monitor
                .execute("eject", Some(json!({"id": device, "force": false})))
                .await
                .map(|_| ());
        }
        match self
            .monitor
            .execute(
                "blockdev-change-medium",
                Some(json!({"id": device, "filename": image, "format": "raw"})),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(QmpError::Protocol { .. }) => {
                self.monitor
                    .execute("blockdev-open-tray", Some(json!({"id": device})))
                    .await?;
                self.tray.queue(device, image);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn event_kind(event: &ConfigEvent) -> &'static str {
    match event {
        ConfigEvent::CurrentCpus(_) => "CurrentCpus",
        ConfigEvent::CurrentRam(_) => "CurrentRam",
        ConfigEvent::CdromMedia { .. } => "CdromMedia",
        ConfigEvent::PowerdownTimeout(_) => "PowerdownTimeout",
        ConfigEvent::Reset(_) => "Reset",
        ConfigEvent::DisplayPassword { .. } => "DisplayPassword",
    }
}

/// CPU hot-plug bookkeeping. Only CPUs added by this process can be
/// removed again; boot CPUs have no device id to delete by.
#[derive(Default)]
struct CpuHotplug {
    next_id: u64,
    added: Vec<String>,
}

impl CpuHotplug {
    async fn apply(&mut self, monitor: &QmpMonitor, target: u32) -> Result<(), QmpError> {
        let cpus = monitor.query_hotpluggable_cpus().await?;
        let plugged = count_plugged(&cpus);
        if target > plugged {
            let mut need = target - plugged;
            for slot in free_slots(&cpus) {
                if need == 0 {
                    break;
                }
                let id = format!("cpu-{}", self.next_id);
                self.next_id += 1;
                let mut arguments = json!({"driver": slot.driver, "id": id});
                if let Some(props) = slot.props.as_object() {
                    for (key, value) in props {
                        arguments[key] = value.clone();
                    }
                }
                monitor.execute("device_add", Some(arguments)).await?;
                self.added.push(id);
                need = need.saturating_sub(slot.vcpus_count.max(1));
            }
        } else if target < plugged {
            let mut excess = plugged - target;
            while excess > 0 {
                let Some(id) = self.added.pop() else {
                    eprintln!(
                        "{}",
                        "⚠️ Cannot unplug boot CPUs; lower target ignored".yellow()
                    );
                    break;
                };
                monitor.execute("device_del", Some(json!({"id": id}))).await?;
                excess -= 1;
            }
        }
        Ok(())
    }
}

fn count_plugged(cpus: &[HotpluggableCpu]) -> u32 {
    cpus.iter()
        .filter(|c| c.qom_path.is_some())
        .map(|c| c.vcpus_count.max(1))
        .sum()
}

fn free_slots(cpus: &[HotpluggableCpu]) -> impl Iterator<Item = &HotpluggableCpu> {
    cpus.iter().filter(|c| c.qom_path.is_none())
}

/// Balloon to the target guest size. One retry covers the window where
/// the guest driver is still settling.
async fn balloon(monitor: &QmpMonitor, bytes: u64) -> Result<(), QmpError> {
    let arguments = json!({"value": bytes});
    match monitor.execute("balloon", Some(arguments.clone())).await {
        Ok(_) => Ok(()),
        Err(QmpError::Disconnected) => Err(QmpError::Disconnected),
        Err(_) => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            monitor.execute("balloon", Some(arguments)).await.map(|_| ())
        }
    }
}

async fn set_display_password(
    monitor: &QmpMonitor,
    password: &str,
    expiry: Option<DateTime<Utc>>,
) -> Result<(), QmpError> {
    monitor
        .execute(
            "set_password",
            Some(json!({"protocol": "spice", "password": password, "connected": "keep"})),
        )
        .await?;
    if let Some(expiry) = expiry {
        monitor
            .execute(
                "expire_password",
                Some(json!({"protocol": "spice", "time": expiry.timestamp().to_string()})),
            )
            .await?;
    }
    Ok(())
}

/// Media changes waiting for the guest to release a locked tray. The
/// latest queued image per device wins.
#[derive(Default)]
struct PendingTray {
    pending: HashMap<String, String>,
}

impl PendingTray {
    fn queue(&mut self, device: String, image: String) {
        self.pending.insert(device, image);
    }

    /// Consumes the pending change for a tray that just opened.
    fn take_on_open(&mut self, event: &QmpEvent) -> Option<(String, String)> {
        if event.event != "DEVICE_TRAY_MOVED" {
            return None;
        }
        if !event.data["tray-open"].as_bool().unwrap_or(false) {
            return None;
        }
        let device = event.data["id"]
            .as_str()
            .or_else(|| event.data["device"].as_str())?;
        let image = self.pending.remove(device)?;
        Some((device.to_owned(), image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn slot(qom_path: Option<&str>, count: u32) -> HotpluggableCpu {
        HotpluggableCpu {
            driver: "host-x86_64-cpu".to_owned(),
            vcpus_count: count,
            qom_path: qom_path.map(str::to_owned),
            props: json!({"core-id": 0, "socket-id": 0, "thread-id": 0}),
        }
    }

    #[test]
    fn plugged_count_sums_occupied_slots() {
        let cpus = vec![
            slot(Some("/machine/unattached/device[0]"), 1),
            slot(Some("/machine/peripheral/cpu-0"), 1),
            slot(None, 1),
            slot(None, 1),
        ];
        assert_eq!(count_plugged(&cpus), 2);
        assert_eq!(free_slots(&cpus).count(), 2);
    }

    fn tray_event(id: &str, open: bool) -> QmpEvent {
        QmpEvent {
            event: "DEVICE_TRAY_MOVED".to_owned(),
            data: json!({"id": id, "tray-open": open}),
        }
    }

    #[test]
    fn pending_tray_fires_only_on_open() {
        let mut tray = PendingTray::default();
        tray.queue("install".to_owned(), "/images/fedora.iso".to_owned());

        assert!(tray.take_on_open(&tray_event("install", false)).is_none());
        assert!(tray.take_on_open(&tray_event("other", true)).is_none());
        assert_eq!(
            tray.take_on_open(&tray_event("install", true)),
            Some(("install".to_owned(), "/images/fedora.iso".to_owned()))
        );
        // Consumed: a second open is a no-op.
        assert!(tray.take_on_open(&tray_event("install", true)).is_none());
    }

    #[test]
    fn latest_queued_medium_wins() {
        let mut tray = PendingTray::default();
        tray.queue("install".to_owned(), "/images/a.iso".to_owned());
        tray.queue("install".to_owned(), "/images/b.iso".to_owned());
        assert_eq!(
            tray.take_on_open(&tray_event("install", true)),
            Some(("install".to_owned(), "/images/b.iso".to_owned()))
        );
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let mut tray = PendingTray::default();
        tray.queue("install".to_owned(), "/images/a.iso".to_owned());
        let event = QmpEvent {
            event: "BLOCK_IO_ERROR".to_owned(),
            data: Value::Null,
        };
        assert!(tray.take_on_open(&event).is_none());
    }
}
