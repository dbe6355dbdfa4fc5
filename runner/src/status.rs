//! Status reporter: aggregates runner-side observations and patches the
//! VM's status subresource with server-side apply. Patches are diffed
//! against the last applied document, so a steady state produces no
//! API traffic.

use crate::qmp::{QmpEvent, QmpMonitor};
use chrono::{DateTime, Utc};
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};
use owo_colors::OwoColorize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vmop_types::{CONDITION_RUNNING, VirtualMachine};

const FIELD_MANAGER: &str = "vmrunner";

#[derive(Debug)]
pub(crate) enum StatusUpdate {
    /// The monitor is open; the guest is up.
    Booted,

    ResetPerformed(u64),
}

/// What the reporter currently believes about the VM.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Observed {
    pub running: bool,
    pub reason: String,
    pub since: DateTime<Utc>,
    pub cpus: Option<u32>,
    pub ram: Option<u64>,
    pub reset_count: Option<u64>,
    pub console_client: Option<String>,
    pub node_name: Option<String>,
    pub node_ip: Option<String>,
}

impl Observed {
    fn new(node_name: Option<String>, node_ip: Option<String>) -> Self {
        Self {
            running: false,
            reason: "Starting".to_owned(),
            since: Utc::now(),
            cpus: None,
            ram: None,
            reset_count: None,
            console_client: None,
            node_name,
            node_ip,
        }
    }

    fn set_running(&mut self, running: bool, reason: &str) {
        if self.running != running {
            self.since = Utc::now();
        }
        self.running = running;
        self.reason = reason.to_owned();
    }
}

/// Renders the server-side-apply document for the observed state.
pub(crate) fn build_status(vm_name: &str, observed: &Observed) -> Value {
    let mut status = json!({
        "conditions": [{
            "type": CONDITION_RUNNING,
            "status": if observed.running { "True" } else { "False" },
            "reason": observed.reason,
            "message": format!("Reported by the runner for '{}'.", vm_name),
            "lastTransitionTime": observed.since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }],
    });
    if let Some(cpus) = observed.cpus {
        status["cpus"] = json!(cpus);
    }
    if let Some(ram) = observed.ram {
        status["ram"] = json!(ram.to_string());
    }
    if let Some(reset_count) = observed.reset_count {
        status["resetCount"] = json!(reset_count);
    }
    if let Some(client) = &observed.console_client {
        status["consoleClient"] = json!(client);
    }
    if let Some(node_name) = &observed.node_name {
        status["nodeName"] = json!(node_name);
    }
    if let Some(node_ip) = &observed.node_ip {
        status["nodeAddresses"] = json!([node_ip]);
    }
    json!({
        "apiVersion": "vmoperator.jdrupes.org/v1",
        "kind": "VirtualMachine",
        "status": status,
    })
}

pub(crate) struct StatusReporter {
    client: Option<Client>,
    namespace: String,
    vm_name: String,
    monitor: QmpMonitor,
    guest_shutdown_stops: bool,
    observed: Observed,
    last_applied: Option<Value>,
}

impl StatusReporter {
    pub fn new(
        client: Option<Client>,
        namespace: String,
        vm_name: String,
        monitor: QmpMonitor,
        guest_shutdown_stops: bool,
        node_name: Option<String>,
        node_ip: Option<String>,
    ) -> Self {
        Self {
            client,
            namespace,
            vm_name,
            monitor,
            guest_shutdown_stops,
            observed: Observed::new(node_name, node_ip),
            last_applied: None,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<StatusUpdate>, cancel: CancellationToken) {
        let mut events = self.monitor.subscribe();
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.refresh_guest_figures().await;
                    self.patch().await;
                }
                update = rx.recv() => {
                    let Some(update) = update else { break };
                    match update {
                        StatusUpdate::Booted => {
                            self.observed.set_running(true, "Running");
                            self.refresh_guest_figures().await;
                        }
                        StatusUpdate::ResetPerformed(counter) => {
                            self.observed.reset_count = Some(counter);
                        }
                    }
                    self.patch().await;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            self.on_qmp_event(event).await;
                            self.patch().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(_) => {}
                    }
                }
            }
        }
    }

    async fn on_qmp_event(&mut self, event: QmpEvent) {
        match event.event.as_str() {
            "SHUTDOWN" => {
                let guest = event.data["guest"].as_bool().unwrap_or(false);
                let reason = if guest { "GuestShutdown" } else { "Stopped" };
                self.observed.set_running(false, reason);
                self.observed.cpus = None;
                self.observed.ram = None;
                self.observed.console_client = None;
                if guest && self.guest_shutdown_stops {
                    self.stop_vm().await;
                }
            }
            "SPICE_CONNECTED" => {
                self.observed.console_client = event.data["client"]["host"]
                    .as_str()
                    .map(str::to_owned);
            }
            "SPICE_DISCONNECTED" => {
                self.observed.console_client = None;
            }
            _ => {}
        }
    }

    async fn refresh_guest_figures(&mut self) {
        if !self.observed.running {
            return;
        }
        if let Ok(cpus) = self.monitor.query_cpus_fast().await {
            self.observed.cpus = Some(cpus.len() as u32);
        }
        match self.monitor.query_balloon().await {
            Ok(balloon) => self.observed.ram = Some(balloon.actual),
            // No balloon device: fall back to the static size.
            Err(_) => {
                if let Ok(memory) = self.monitor.query_memory().await {
                    self.observed.ram = Some(memory.base_memory);
                }
            }
        }
    }

    /// Flips `spec.vm.state` to Stopped after a guest-initiated shutdown,
    /// so the operator does not restart the Pod.
    async fn stop_vm(&self) {
        let Some(client) = &self.client else { return };
        let api: Api<VirtualMachine> = Api::namespaced(client.clone(), &self.namespace);
        let patch = json!({"spec": {"vm": {"state": "Stopped"}}});
        if let Err(e) = api
            .patch(&self.vm_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            eprintln!("{}", format!("❌ Failed to stop VM after guest shutdown: {}", e).red());
        } else {
            println!(
                "{}{}",
                "🛑 Guest shut down; stopping ".red(),
                self.vm_name.red().dimmed(),
            );
        }
    }

    async fn patch(&mut self) {
        let document = build_status(&self.vm_name, &self.observed);
        if self.last_applied.as_ref() == Some(&document) {
            return;
        }
        let Some(client) = &self.client else {
            self.last_applied = Some(document);
            return;
        };
        let api: Api<VirtualMachine> = Api::namespaced(client.clone(), &self.namespace);
        match api
            .patch_status(
                &self.vm_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&document),
            )
            .await
        {
            Ok(_) => self.last_applied = Some(document),
            Err(e) => eprintln!("{}", format!("❌ Status patch failed: {}", e).red()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_status_reports_running_figures() {
        let mut observed = Observed::new(Some("node-1".to_owned()), Some("10.0.0.5".to_owned()));
        observed.set_running(true, "Running");
        observed.cpus = Some(2);
        observed.ram = Some(4 << 30);
        observed.reset_count = Some(1);

        let document = build_status("test-vm", &observed);
        let status = &document["status"];
        assert_eq!(status["conditions"][0]["type"], "Running");
        assert_eq!(status["conditions"][0]["status"], "True");
        assert_eq!(status["cpus"], 2);
        assert_eq!(status["ram"], "4294967296");
        assert_eq!(status["resetCount"], 1);
        assert_eq!(status["nodeAddresses"][0], "10.0.0.5");
        assert_eq!(status["nodeName"], "node-1");
    }

    #[test]
    fn build_status_is_stable_for_identical_observations() {
        let mut observed = Observed::new(None, None);
        observed.set_running(true, "Running");
        let first = build_status("test-vm", &observed);
        let second = build_status("test-vm", &observed);
        assert_eq!(first, second);
    }

    #[test]
    fn transition_time_only_moves_on_flips() {
        let mut observed = Observed::new(None, None);
        observed.set_running(true, "Running");
        let since = observed.since;
        observed.set_running(true, "Running");
        assert_eq!(observed.since, since);
        observed.set_running(false, "Stopped");
        assert!(observed.since >= since);
    }

    #[test]
    fn absent_figures_are_omitted_from_the_patch() {
        let observed = Observed::new(None, None);
        let document = build_status("test-vm", &observed);
        let status = &document["status"];
        assert!(status.get("cpus").is_none());
        assert!(status.get("ram").is_none());
        assert!(status.get("nodeAddresses").is_none());
        assert_eq!(status["conditions"][0]["status"], "False");
    }
}
