//! Spawning real worker OS processes and bridging their stdio pipes onto
//! the manager's channels.
//!
//! Each worker gets two background tasks: a stdin writer that frames work
//! orders as line-delimited JSON envelopes, and a stdout reader that decodes
//! worker reports and forwards them onto the manager's shared report channel.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use flowrun_ipc::{decode_line, encode_line, IpcError, MessageEnvelope, WorkOrder, WorkerReport};

use crate::error::PoolError;
use crate::handle::{WorkerLink, WorkerReportMessage, WorkerSpawner};

/// Spawns worker processes by re-invoking a binary with worker arguments.
/// The usual setup points it at the current executable's hidden worker mode.
pub struct ProcessSpawner {
    command: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Re-invoke the running binary with the given arguments
    pub fn current_exe(args: Vec<String>) -> Result<Self, PoolError> {
        let exe = std::env::current_exe()
            .map_err(|e| PoolError::Spawn(format!("cannot resolve current executable: {e}")))?;
        Ok(Self::new(exe, args))
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        worker_id: &str,
        report_tx: mpsc::UnboundedSender<WorkerReportMessage>,
    ) -> Result<Box<dyn WorkerLink>, PoolError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg("--worker-id")
            .arg(worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("failed to spawn worker {worker_id}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn(format!("worker {worker_id} has no stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn(format!("worker {worker_id} has no stdout pipe")))?;

        let (order_tx, order_rx) = mpsc::unbounded_channel();
        tokio::spawn(stdin_writer_task(worker_id.to_string(), stdin, order_rx));
        tokio::spawn(stdout_reader_task(worker_id.to_string(), stdout, report_tx));

        debug!(worker_id = %worker_id, pid = ?child.id(), "spawned worker process");

        Ok(Box::new(ProcessLink {
            worker_id: worker_id.to_string(),
            child,
            order_tx: Some(order_tx),
        }))
    }
}

async fn stdin_writer_task(
    worker_id: String,
    mut stdin: tokio::process::ChildStdin,
    mut order_rx: mpsc::UnboundedReceiver<WorkOrder>,
) {
    while let Some(order) = order_rx.recv().await {
        let line = match encode_line(&MessageEnvelope::new(order)) {
            Ok(line) => line,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "failed to encode work order");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            // Worker already gone; the monitor loop will notice and clean up
            debug!(worker_id = %worker_id, error = %e, "worker stdin closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!(worker_id = %worker_id, error = %e, "worker stdin flush failed");
            break;
        }
    }
}

async fn stdout_reader_task(
    worker_id: String,
    stdout: tokio::process::ChildStdout,
    report_tx: mpsc::UnboundedSender<WorkerReportMessage>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(worker_id = %worker_id, "worker stdout closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match decode_line::<WorkerReport>(trimmed) {
                    Ok(envelope) => {
                        let msg = WorkerReportMessage {
                            worker_id: worker_id.clone(),
                            report: envelope.message,
                        };
                        if report_tx.send(msg).is_err() {
                            // Manager shut down; stop reading
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "discarding malformed worker report");
                    }
                }
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "error reading worker stdout");
                break;
            }
        }
    }
}

/// Live channel pair to one worker OS process
struct ProcessLink {
    worker_id: String,
    child: Child,
    order_tx: Option<mpsc::UnboundedSender<WorkOrder>>,
}

#[async_trait]
impl WorkerLink for ProcessLink {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn memory_mb(&self) -> Option<u64> {
        #[cfg(target_os = "linux")]
        {
            // statm reports pages; assumes 4 KiB pages
            let pid = self.child.id()?;
            let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
            let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
            Some(resident_pages * 4096 / (1024 * 1024))
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    async fn send(&mut self, order: WorkOrder) -> Result<(), IpcError> {
        match &self.order_tx {
            Some(tx) => tx.send(order).map_err(|_| IpcError::ChannelClosed),
            None => Err(IpcError::ChannelClosed),
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => false,
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        // Graceful phase: ask nicely on the work channel, then close stdin
        if let Some(tx) = &self.order_tx {
            let _ = tx.send(WorkOrder::Shutdown);
        }
        self.order_tx = None;

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(worker_id = %self.worker_id, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker_id = %self.worker_id, status = %status, "worker exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(worker_id = %self.worker_id, error = %e, "error waiting for worker exit");
            }
            Err(_) => {
                // Forceful phase: SIGKILL and reap
                warn!(worker_id = %self.worker_id, "worker did not exit within grace period, killing");
                if let Err(e) = self.child.kill().await {
                    error!(worker_id = %self.worker_id, error = %e, "failed to kill worker");
                }
                let _ = self.child.wait().await;
            }
        }
    }
}
