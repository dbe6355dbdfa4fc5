//! QMP monitor: line-delimited JSON over the QEMU monitor socket.
//!
//! Commands are serialised through a single writer and paired with
//! replies strictly in issue order; asynchronous event frames are fanned
//! out to subscribers and can never steal a command's reply.

use serde::Deserialize;
use serde_json::{Value, json};
use std::{collections::VecDeque, path::Path, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{broadcast, mpsc, oneshot, watch},
    time::Instant,
};

/// How long the guest gets to acknowledge `system_powerdown` before it
/// is considered wedged.
pub(crate) const POWERDOWN_CONFIRMATION: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub(crate) enum QmpError {
    #[error("monitor disconnected")]
    Disconnected,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("{command} failed: {class}: {desc}")]
    Protocol {
        command: String,
        class: String,
        desc: String,
    },

    #[error("unexpected reply to {command}: {source}")]
    Decode {
        command: String,
        source: serde_json::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// An asynchronous event frame (`POWERDOWN`, `SHUTDOWN`,
/// `DEVICE_TRAY_MOVED`, ...).
#[derive(Debug, Clone)]
pub(crate) struct QmpEvent {
    pub event: String,
    pub data: Value,
}

struct PendingCommand {
    command: String,
    arguments: Option<Value>,
    reply: oneshot::Sender<Result<Value, QmpError>>,
}

#[derive(Clone, Debug)]
pub(crate) struct QmpMonitor {
    cmd_tx: mpsc::Sender<PendingCommand>,
    events_tx: broadcast::Sender<QmpEvent>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PowerdownResult {
    /// The guest is down: `SHUTDOWN` observed or the monitor closed.
    Down,

    /// No reply to `system_powerdown` within the confirmation window.
    Unresponsive,

    /// The guest acknowledged but did not shut down within the timeout.
    TimedOut,
}

impl QmpMonitor {
    pub async fn connect(path: &Path) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path).await?;
        Self::from_stream(stream).await
    }

    /// Performs the greeting / `qmp_capabilities` handshake and starts
    /// the I/O task.
    pub async fn from_stream(stream: UnixStream) -> Result<Self, QmpError> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let greeting = lines.next_line().await?.ok_or(QmpError::Disconnected)?;
        let value: Value =
            serde_json::from_str(&greeting).map_err(|e| QmpError::Handshake(e.to_string()))?;
        if value.get("QMP").is_none() {
            return Err(QmpError::Handshake(greeting));
        }

        write
            .write_all(b"{\"execute\":\"qmp_capabilities\"}\n")
            .await?;
        loop {
            let line = lines.next_line().await?.ok_or(QmpError::Disconnected)?;
            let value: Value =
                serde_json::from_str(&line).map_err(|e| QmpError::Handshake(e.to_string()))?;
            if value.get("return").is_some() {
                break;
            }
            if value.get("error").is_some() {
                return Err(QmpError::Handshake(line));
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (events_tx, _) = broadcast::channel(64);
        tokio::spawn(io_task(lines, write, cmd_rx, events_tx.clone()));
        Ok(Self { cmd_tx, events_tx })
    }

    /// Sends a command and awaits its reply. Replies arrive in issue
    /// order; a closed socket fails all outstanding commands.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, QmpError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PendingCommand {
                command: command.to_owned(),
                arguments,
                reply,
            })
            .await
            .map_err(|_| QmpError::Disconnected)?;
        rx.await.map_err(|_| QmpError::Disconnected)?
    }

    async fn query<T: serde::de::DeserializeOwned>(&self, command: &str) -> Result<T, QmpError> {
        let value = self.execute(command, None).await?;
        serde_json::from_value(value).map_err(|source| QmpError::Decode {
            command: command.to_owned(),
            source,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QmpEvent> {
        self.events_tx.subscribe()
    }

    pub async fn query_status(&self) -> Result<StatusInfo, QmpError> {
        self.query("query-status").await
    }

    pub async fn query_cpus_fast(&self) -> Result<Vec<CpuInfoFast>, QmpError> {
        self.query("query-cpus-fast").await
    }

    pub async fn query_memory(&self) -> Result<MemoryInfo, QmpError> {
        self.query("query-memory-size-summary").await
    }

    pub async fn query_balloon(&self) -> Result<BalloonInfo, QmpError> {
        self.query("query-balloon").await
    }

    pub async fn query_name(&self) -> Result<NameInfo, QmpError> {
        self.query("query-name").await
    }

    pub async fn query_hotpluggable_cpus(&self) -> Result<Vec<HotpluggableCpu>, QmpError> {
        self.query("query-hotpluggable-cpus").await
    }

    /// The powerdown sequence: dispatch `system_powerdown` with a 5 s
    /// confirmation window, then wait for the guest to go down within
    /// `timeout`. The timeout is re-read on change while the wait is
    /// pending.
    pub async fn powerdown(&self, mut timeout: watch::Receiver<Duration>) -> PowerdownResult {
        let mut events = self.subscribe();
        let started_at = Instant::now();

        match tokio::time::timeout(POWERDOWN_CONFIRMATION, self.execute("system_powerdown", None))
            .await
        {
            Err(_) => return PowerdownResult::Unresponsive,
            Ok(Err(QmpError::Disconnected)) => return PowerdownResult::Down,
            Ok(Err(_)) => return PowerdownResult::Unresponsive,
            Ok(Ok(_)) => {}
        }

        loop {
            let deadline = started_at + *timeout.borrow();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return PowerdownResult::TimedOut,
                changed = timeout.changed() => {
                    if changed.is_err() {
                        // Timeout source gone; keep the last value.
                        return wait_down(deadline, &mut events).await;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(e) if e.event == "SHUTDOWN" => return PowerdownResult::Down,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Closed) => return PowerdownResult::Down,
                        Err(_) => {}
                    }
                }
            }
        }
    }
}

async fn wait_down(
    deadline: Instant,
    events: &mut broadcast::Receiver<QmpEvent>,
) -> PowerdownResult {
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return PowerdownResult::TimedOut,
            event = events.recv() => {
                match event {
                    Ok(e) if e.event == "SHUTDOWN" => return PowerdownResult::Down,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => return PowerdownResult::Down,
                    Err(_) => {}
                }
            }
        }
    }
}

async fn io_task(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut write: OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<PendingCommand>,
    events_tx: broadcast::Sender<QmpEvent>,
) {
    let mut pending: VecDeque<PendingCommand> = VecDeque::new();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let mut frame = json!({"execute": cmd.command});
                if let Some(arguments) = &cmd.arguments {
                    frame["arguments"] = arguments.clone();
                }
                let mut text = frame.to_string();
                text.push('\n');
                if write.write_all(text.as_bytes()).await.is_err() {
                    let _ = cmd.reply.send(Err(QmpError::Disconnected));
                    break;
                }
                pending.push_back(cmd);
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(&line, &mut pending, &events_tx),
                    _ => break,
                }
            }
        }
    }
    // A closed socket fails outstanding commands instead of hanging them.
    for cmd in pending.drain(..) {
        let _ = cmd.reply.send(Err(QmpError::Disconnected));
    }
}

fn handle_line(
    line: &str,
    pending: &mut VecDeque<PendingCommand>,
    events_tx: &broadcast::Sender<QmpEvent>,
) {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return;
    };
    if let Some(event) = value.get("event").and_then(Value::as_str) {
        let _ = events_tx.send(QmpEvent {
            event: event.to_owned(),
            data: value.get("data").cloned().unwrap_or(Value::Null),
        });
        return;
    }
    if value.get("return").is_some() || value.get("error").is_some() {
        // Replies pair with the head of the queue: issue order.
        let Some(cmd) = pending.pop_front() else {
            return;
        };
        let result = match value.get("return") {
            Some(ret) => Ok(ret.clone()),
            None => {
                let class = value["error"]["class"]
                    .as_str()
                    .unwrap_or("GenericError")
                    .to_owned();
                let desc = value["error"]["desc"].as_str().unwrap_or("").to_owned();
                Err(QmpError::Protocol {
                    command: cmd.command.clone(),
                    class,
                    desc,
                })
            }
        };
        let _ = cmd.reply.send(result);
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusInfo {
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CpuInfoFast {
    #[serde(rename = "cpu-index")]
    pub cpu_index: u64,
    #[serde(rename = "qom-path", default)]
    pub qom_path: Option<String>,
    #[serde(rename = "thread-id", default)]
    pub thread_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MemoryInfo {
    #[serde(rename = "base-memory")]
    pub base_memory: u64,
    #[serde(rename = "plugged-memory", default)]
    pub plugged_memory: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BalloonInfo {
    pub actual: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NameInfo {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HotpluggableCpu {
    #[serde(rename = "type")]
    pub driver: String,

    #[serde(rename = "vcpus-count")]
    pub vcpus_count: u32,

    /// Set when the CPU is currently plugged.
    #[serde(rename = "qom-path", default)]
    pub qom_path: Option<String>,

    #[serde(default)]
    pub props: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    const GREETING: &str =
        "{\"QMP\": {\"version\": {\"qemu\": {\"major\": 9}}, \"capabilities\": []}}\n";

    /// Completes the server side of the handshake and returns the framed
    /// stream halves.
    async fn serve_handshake(
        stream: UnixStream,
    ) -> (
        Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        tokio::net::unix::OwnedWriteHalf,
    ) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write.write_all(GREETING.as_bytes()).await.unwrap();
        let capabilities = lines.next_line().await.unwrap().unwrap();
        assert!(capabilities.contains("qmp_capabilities"));
        write.write_all(b"{\"return\": {}}\n").await.unwrap();
        (lines, write)
    }

    #[tokio::test]
    async fn replies_pair_with_commands_in_issue_order() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = tokio::spawn(async move {
            let (mut lines, mut write) = serve_handshake(server).await;
            for i in 0..3u32 {
                let line = lines.next_line().await.unwrap().unwrap();
                let frame: Value = serde_json::from_str(&line).unwrap();
                assert_eq!(frame["execute"], format!("cmd-{}", i));
                // Events interleave but never steal a reply.
                write
                    .write_all(b"{\"event\": \"NOISE\", \"data\": {}, \"timestamp\": {}}\n")
                    .await
                    .unwrap();
                write
                    .write_all(format!("{{\"return\": {{\"n\": {}}}}}\n", i).as_bytes())
                    .await
                    .unwrap();
            }
        });

        let monitor = QmpMonitor::from_stream(client).await.unwrap();
        let mut events = monitor.subscribe();
        for i in 0..3u32 {
            let reply = monitor
                .execute(&format!("cmd-{}", i), None)
                .await
                .unwrap();
            assert_eq!(reply["n"], i);
        }
        for _ in 0..3 {
            assert_eq!(events.recv().await.unwrap().event, "NOISE");
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn errors_carry_the_command_identity() {
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (mut lines, mut write) = serve_handshake(server).await;
            lines.next_line().await.unwrap().unwrap();
            write
                .write_all(
                    b"{\"error\": {\"class\": \"DeviceNotFound\", \"desc\": \"no such device\"}}\n",
                )
                .await
                .unwrap();
        });

        let monitor = QmpMonitor::from_stream(client).await.unwrap();
        let err = monitor
            .execute("device_del", Some(json!({"id": "cpu-9"})))
            .await
            .unwrap_err();
        match err {
            QmpError::Protocol {
                command,
                class,
                desc,
            } => {
                assert_eq!(command, "device_del");
                assert_eq!(class, "DeviceNotFound");
                assert_eq!(desc, "no such device");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_fails_outstanding_commands() {
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (mut lines, write) = serve_handshake(server).await;
            lines.next_line().await.unwrap().unwrap();
            drop(write);
            drop(lines);
        });

        let monitor = QmpMonitor::from_stream(client).await.unwrap();
        let err = monitor.execute("query-status", None).await.unwrap_err();
        assert!(matches!(err, QmpError::Disconnected));
    }

    #[tokio::test]
    async fn rejects_a_peer_without_greeting() {
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (_read, mut write) = server.into_split();
            write.write_all(b"{\"return\": {}}\n").await.unwrap();
        });
        let err = QmpMonitor::from_stream(client).await.unwrap_err();
        assert!(matches!(err, QmpError::Handshake(_)));
    }

    fn timeout_watch(secs: u64) -> watch::Receiver<Duration> {
        let (tx, rx) = watch::channel(Duration::from_secs(secs));
        // Leak the sender so the watch stays alive for the test.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn powerdown_resolves_on_shutdown_event() {
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (mut lines, mut write) = serve_handshake(server).await;
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("system_powerdown"));
            write.write_all(b"{\"return\": {}}\n").await.unwrap();
            write
                .write_all(b"{\"event\": \"SHUTDOWN\", \"data\": {\"guest\": true}}\n")
                .await
                .unwrap();
            // Keep the socket open until the client is done.
            lines.next_line().await.ok();
        });

        let monitor = QmpMonitor::from_stream(client).await.unwrap();
        let result = monitor.powerdown(timeout_watch(600)).await;
        assert_eq!(result, PowerdownResult::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn powerdown_reports_a_wedged_guest() {
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (mut lines, _write) = serve_handshake(server).await;
            // Swallow the command, never reply.
            lines.next_line().await.ok();
            std::future::pending::<()>().await;
        });

        let monitor = QmpMonitor::from_stream(client).await.unwrap();
        let result = monitor.powerdown(timeout_watch(600)).await;
        assert_eq!(result, PowerdownResult::Unresponsive);
    }

    #[tokio::test(start_paused = true)]
    async fn powerdown_times_out_without_shutdown() {
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (mut lines, mut write) = serve_handshake(server).await;
            lines.next_line().await.unwrap().unwrap();
            write.write_all(b"{\"return\": {}}\n").await.unwrap();
            // Guest acknowledged but never powers down.
            std::future::pending::<()>().await;
        });

        let monitor = QmpMonitor::from_stream(client).await.unwrap();
        let result = monitor.powerdown(timeout_watch(10)).await;
        assert_eq!(result, PowerdownResult::TimedOut);
    }
}
