//! Process supervisor: orders swTPM and QEMU startup, connects the QMP
//! monitor, wires the live-mutation and status tasks, and drives the
//! powerdown sequence on termination.

use crate::{
    cloudinit,
    config::{self, Settings},
    mutations::Mutations,
    qmp::{PowerdownResult, QmpMonitor},
    status::{StatusReporter, StatusUpdate},
    template::QemuCommand,
};
use anyhow::{Context, anyhow};
use kube::Client;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use owo_colors::OwoColorize;
use std::{
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};
use tokio::{
    process::{Child, Command},
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use vmop_types::runner::DISPLAY_SECRET_DIR;

const SWTPM_PROGRAM: &str = "swtpm";
const UEFI_VARS_TEMPLATE: &str = "/usr/share/OVMF/OVMF_VARS.fd";

/// How long a child gets to create its socket before startup fails.
const SOCKET_WAIT: Duration = Duration::from_secs(20);

/// Grace between SIGTERM and SIGKILL when escalating.
const TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunnerState {
    Started,
    TpmStarting,
    QemuStarting,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateEvent {
    ConfigLoaded { use_tpm: bool },
    TpmReady,
    MonitorOpen,
    PowerdownIntent,
    QemuExited,
}

/// The legal transitions. Anything else is a programming error and is
/// ignored with a warning rather than corrupting the machine.
pub(crate) fn transition(state: RunnerState, event: StateEvent) -> Option<RunnerState> {
    use RunnerState::*;
    use StateEvent::*;
    match (state, event) {
        (Started, ConfigLoaded { use_tpm: true }) => Some(TpmStarting),
        (Started, ConfigLoaded { use_tpm: false }) => Some(QemuStarting),
        (TpmStarting, TpmReady) => Some(QemuStarting),
        (QemuStarting, MonitorOpen) => Some(Running),
        (Running, PowerdownIntent) => Some(ShuttingDown),
        (QemuStarting, QemuExited) => Some(Terminated),
        (Running, QemuExited) => Some(Terminated),
        (ShuttingDown, QemuExited) => Some(Terminated),
        _ => None,
    }
}

fn advance(state: &mut RunnerState, event: StateEvent) {
    match transition(*state, event) {
        Some(next) => {
            println!(
                "{}{:?}{}{:?}",
                "⚙️ ".green(),
                state,
                " → ".green(),
                next,
            );
            *state = next;
        }
        None => eprintln!(
            "{}",
            format!("⚠️ Ignoring {:?} in state {:?}", event, state).yellow()
        ),
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum Fatal {
    #[error("swTPM failure: {0}")]
    Tpm(#[source] anyhow::Error),

    #[error("QEMU failed to start: {0}")]
    QemuStart(#[source] anyhow::Error),

    #[error("QEMU exited during startup with code {0}")]
    QemuEarlyExit(i32),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
    /// The guest was shut down on request.
    Clean,

    /// QEMU exited on its own with a non-zero code.
    QemuExit(i32),
}

enum LoopEvent {
    Shutdown,
    QemuExited(std::io::Result<ExitStatus>),
    TpmExited,
    ConfigChanged,
    SecretChanged,
}

pub(crate) async fn run(
    settings: Settings,
    command: QemuCommand,
    client: Option<Client>,
) -> Result<Outcome, Fatal> {
    let mut state = RunnerState::Started;
    let cancel = CancellationToken::new();
    let _cancel_on_return = cancel.clone().drop_guard();

    prepare_uefi_vars(&settings)?;
    if let Some(cloud_init) = &settings.config.cloud_init {
        let seed_dir = settings.runtime_dir.join("cidata");
        let files = cloudinit::write_seed_files(&seed_dir, cloud_init)?;
        cloudinit::build_image(&settings.cidata_image(), &files).await?;
    }

    advance(
        &mut state,
        StateEvent::ConfigLoaded {
            use_tpm: settings.config.vm.use_tpm,
        },
    );

    let mut swtpm: Option<Child> = None;
    if settings.config.vm.use_tpm {
        swtpm = Some(start_swtpm(&settings, &cancel).await?);
        advance(&mut state, StateEvent::TpmReady);
    }

    let qmp_socket = settings.qmp_socket();
    let _ = std::fs::remove_file(&qmp_socket);
    println!(
        "{}{}",
        "🚀 Starting QEMU • ".green(),
        command.program.green().dimmed(),
    );
    let mut qemu = Command::new(&command.program)
        .args(&command.args)
        .spawn()
        .map_err(|e| Fatal::QemuStart(anyhow!("failed to spawn {}: {}", command.program, e)))?;

    match wait_for_socket(&qmp_socket, &mut qemu, &cancel).await {
        Ok(()) => {}
        Err(SocketWait::Exited(code)) => {
            advance(&mut state, StateEvent::QemuExited);
            return Err(Fatal::QemuEarlyExit(code));
        }
        Err(SocketWait::TimedOut) => {
            let _ = qemu.kill().await;
            return Err(Fatal::QemuStart(anyhow!("QMP socket did not appear")));
        }
    }

    let monitor = QmpMonitor::connect(&qmp_socket)
        .await
        .map_err(|e| Fatal::QemuStart(anyhow!("QMP connect failed: {}", e)))?;
    advance(&mut state, StateEvent::MonitorOpen);

    let (powerdown_tx, powerdown_rx) = watch::channel(Duration::from_secs(
        settings.config.vm.powerdown_timeout,
    ));
    let (status_tx, status_rx) = mpsc::channel(16);
    let (mutation_tx, mutation_rx) = mpsc::channel(16);

    let reporter = StatusReporter::new(
        client,
        settings.namespace.clone(),
        settings.vm_name.clone(),
        monitor.clone(),
        settings.config.guest_shutdown_stops,
        settings.node_name.clone(),
        settings.node_ip.clone(),
    );
    tokio::spawn(reporter.run(status_rx, cancel.child_token()));
    tokio::spawn(
        Mutations::new(monitor.clone(), powerdown_tx, status_tx.clone())
            .run(mutation_rx, cancel.child_token()),
    );

    let _ = status_tx.send(StatusUpdate::Booted).await;
    // Bring the fresh guest from its boot defaults to the configured
    // targets (ballooned RAM, plugged CPUs).
    for event in config::initial_events(&settings.config) {
        let _ = mutation_tx.send(event).await;
    }
    let secret_dir = PathBuf::from(DISPLAY_SECRET_DIR);
    if let Some(event) = config::read_display_secret(&secret_dir) {
        let _ = mutation_tx.send(event).await;
    }

    let (config_poke_tx, mut config_poke_rx) = mpsc::channel(4);
    if let Some(parent) = settings.config_path.parent() {
        config::spawn_dir_watch(parent.to_path_buf(), config_poke_tx, cancel.child_token());
    }
    let (secret_poke_tx, mut secret_poke_rx) = mpsc::channel(4);
    if secret_dir.is_dir() {
        config::spawn_dir_watch(secret_dir.clone(), secret_poke_tx, cancel.child_token());
    }

    let mut current_config = settings.config.clone();
    let mut shutdown = Box::pin(vmop_common::shutdown::shutdown_signal());
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => LoopEvent::Shutdown,
            exit = qemu.wait() => LoopEvent::QemuExited(exit),
            _ = async {
                match swtpm.as_mut() {
                    Some(child) => {
                        let _ = child.wait().await;
                    }
                    None => std::future::pending().await,
                }
            } => LoopEvent::TpmExited,
            _ = config_poke_rx.recv() => LoopEvent::ConfigChanged,
            _ = secret_poke_rx.recv() => LoopEvent::SecretChanged,
        };
        match event {
            LoopEvent::Shutdown => {
                advance(&mut state, StateEvent::PowerdownIntent);
                println!(
                    "{}{}",
                    "⏻ Powering down guest • timeout=".green(),
                    humantime::format_duration(*powerdown_rx.borrow())
                        .to_string()
                        .green()
                        .dimmed(),
                );
                let outcome = graceful_stop(&monitor, powerdown_rx.clone(), &mut qemu).await?;
                advance(&mut state, StateEvent::QemuExited);
                stop_swtpm(&mut swtpm).await;
                return Ok(outcome);
            }
            LoopEvent::QemuExited(exit) => {
                advance(&mut state, StateEvent::QemuExited);
                stop_swtpm(&mut swtpm).await;
                let status = exit.context("waiting for QEMU")?;
                let code = exit_code(&status);
                println!(
                    "{}{}",
                    "⏹ QEMU exited • code=".red(),
                    code.to_string().red().dimmed(),
                );
                return Ok(if code == 0 {
                    Outcome::Clean
                } else {
                    Outcome::QemuExit(code)
                });
            }
            LoopEvent::TpmExited => {
                // The TPM backend is gone; the guest cannot continue.
                let _ = qemu.kill().await;
                return Err(Fatal::Tpm(anyhow!("swTPM exited unexpectedly")));
            }
            LoopEvent::ConfigChanged => match config::read_config(&settings.config_path) {
                Ok(new_config) => {
                    for event in config::diff_events(&current_config, &new_config) {
                        let _ = mutation_tx.send(event).await;
                    }
                    current_config = new_config;
                }
                Err(e) => eprintln!(
                    "{}",
                    format!("⚠️ Ignoring unreadable configuration: {}", e).yellow()
                ),
            },
            LoopEvent::SecretChanged => {
                if let Some(event) = config::read_display_secret(&secret_dir) {
                    let _ = mutation_tx.send(event).await;
                }
            }
        }
    }
}

/// UEFI variable store is per-VM mutable state; seed it from the
/// template shipped with the image on first boot.
fn prepare_uefi_vars(settings: &Settings) -> Result<(), Fatal> {
    if settings.config.vm.firmware != vmop_types::Firmware::Uefi {
        return Ok(());
    }
    let vars = settings.uefi_vars();
    if vars.exists() {
        return Ok(());
    }
    std::fs::copy(UEFI_VARS_TEMPLATE, &vars)
        .map(|_| ())
        .map_err(|e| {
            Fatal::Internal(anyhow!(
                "failed to seed UEFI vars from {}: {}",
                UEFI_VARS_TEMPLATE,
                e
            ))
        })
}

async fn start_swtpm(settings: &Settings, cancel: &CancellationToken) -> Result<Child, Fatal> {
    let state_dir = settings.swtpm_state_dir();
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| Fatal::Tpm(anyhow!("cannot create TPM state dir: {}", e)))?;
    let socket = settings.swtpm_socket();
    let _ = std::fs::remove_file(&socket);
    let mut child = Command::new(SWTPM_PROGRAM)
        .args(["socket", "--tpm2"])
        .arg("--ctrl")
        .arg(format!("type=unixio,path={}", socket.display()))
        .arg("--tpmstate")
        .arg(format!("dir={}", state_dir.display()))
        .spawn()
        .map_err(|e| Fatal::Tpm(anyhow!("failed to spawn {}: {}", SWTPM_PROGRAM, e)))?;
    match wait_for_socket(&socket, &mut child, cancel).await {
        Ok(()) => Ok(child),
        Err(SocketWait::Exited(code)) => {
            Err(Fatal::Tpm(anyhow!("swTPM exited with code {}", code)))
        }
        Err(SocketWait::TimedOut) => {
            let _ = child.kill().await;
            Err(Fatal::Tpm(anyhow!("swTPM socket did not appear")))
        }
    }
}

async fn stop_swtpm(swtpm: &mut Option<Child>) {
    let Some(child) = swtpm.as_mut() else { return };
    signal_child(child, Signal::SIGTERM);
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

enum SocketWait {
    Exited(i32),
    TimedOut,
}

/// Waits for a child to create its UNIX socket: file-watch on the parent
/// directory plus a coarse poll as a safety net.
async fn wait_for_socket(
    path: &Path,
    child: &mut Child,
    cancel: &CancellationToken,
) -> Result<(), SocketWait> {
    let (tx, mut rx) = mpsc::channel(4);
    if let Some(parent) = path.parent() {
        config::spawn_dir_watch(parent.to_path_buf(), tx, cancel.child_token());
    }
    let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
    loop {
        if path.exists() {
            return Ok(());
        }
        tokio::select! {
            exit = child.wait() => {
                let code = exit.map(|status| exit_code(&status)).unwrap_or(-1);
                return Err(SocketWait::Exited(code));
            }
            _ = rx.recv() => {}
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            _ = tokio::time::sleep_until(deadline) => return Err(SocketWait::TimedOut),
        }
    }
}

/// The powerdown ladder: QMP first, then SIGTERM, then SIGKILL.
async fn graceful_stop(
    monitor: &QmpMonitor,
    powerdown_timeout: watch::Receiver<Duration>,
    qemu: &mut Child,
) -> Result<Outcome, Fatal> {
    match monitor.powerdown(powerdown_timeout).await {
        PowerdownResult::Down => {
            let _ = tokio::time::timeout(TERM_GRACE, qemu.wait()).await;
            Ok(Outcome::Clean)
        }
        PowerdownResult::Unresponsive | PowerdownResult::TimedOut => {
            eprintln!("{}", "⚠️ Guest did not power down; escalating".yellow());
            signal_child(qemu, Signal::SIGTERM);
            if tokio::time::timeout(TERM_GRACE, qemu.wait()).await.is_err() {
                let _ = qemu.kill().await;
                let _ = qemu.wait().await;
            }
            Ok(Outcome::Clean)
        }
    }
}

fn signal_child(child: &Child, signal: Signal) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), signal);
    }
}

fn exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
