//! Process bridge: external commands launched by scripts.
//!
//! Children are spawned with `kill_on_drop`, so clearing the bridge tears
//! down every child it started. Exit events wait for queue capacity and are
//! never dropped.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{lock, next_operation_id, BridgeError, EventSink, ScriptEvent};

const MODULE: &str = "process";

/// How a script asked for a command to be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessCommand {
    /// Run through the platform shell.
    Shell(String),
    /// Program followed by its arguments.
    Argv(Vec<String>),
}

impl ProcessCommand {
    fn to_command(&self) -> Result<Command, BridgeError> {
        match self {
            ProcessCommand::Shell(line) => {
                if line.trim().is_empty() {
                    return Err(invalid("command must not be empty"));
                }
                #[cfg(windows)]
                let mut cmd = {
                    let mut cmd = Command::new("cmd");
                    cmd.arg("/C");
                    cmd
                };
                #[cfg(not(windows))]
                let mut cmd = {
                    let mut cmd = Command::new("sh");
                    cmd.arg("-c");
                    cmd
                };
                cmd.arg(line);
                Ok(cmd)
            }
            ProcessCommand::Argv(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(invalid("argv must not be empty"));
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
        }
    }
}

fn invalid(reason: &str) -> BridgeError {
    BridgeError::InvalidArgument {
        module: MODULE,
        reason: reason.to_string(),
    }
}

struct ProcessEntry {
    id: u64,
    callback: String,
    kill: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Process bridge for one host.
#[derive(Clone)]
pub struct ProcessBridge {
    processes: Arc<Mutex<HashMap<String, ProcessEntry>>>,
    sink: EventSink,
}

impl ProcessBridge {
    pub fn new(sink: EventSink) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    /// Launch `command` under `name`. A live name cannot be reused.
    pub fn spawn(
        &self,
        name: &str,
        command: ProcessCommand,
        callback: &str,
    ) -> Result<(), BridgeError> {
        let mut processes = lock(&self.processes);
        if processes.contains_key(name) {
            return Err(BridgeError::DuplicateTag {
                module: MODULE,
                tag: name.to_string(),
            });
        }

        let mut cmd = command.to_command()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| BridgeError::InvalidArgument {
            module: MODULE,
            reason: format!("spawn failed: {}", e),
        })?;

        let pid = child.id();
        let id = next_operation_id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let task = tokio::spawn(watch_child(
            self.sink.clone(),
            name.to_string(),
            id,
            child,
            kill_rx,
        ));

        info!(name, pid = ?pid, command = %command_label(&command), "Process spawned");
        processes.insert(
            name.to_string(),
            ProcessEntry {
                id,
                callback: callback.to_string(),
                kill: Some(kill_tx),
                task,
            },
        );
        Ok(())
    }

    /// Ask a running process to terminate. Its exit event is still delivered.
    pub fn kill(&self, name: &str) -> bool {
        let mut processes = lock(&self.processes);
        match processes.get_mut(name).and_then(|entry| entry.kill.take()) {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }

    /// True while the process is tracked (until its exit event is drained).
    pub fn running(&self, name: &str) -> bool {
        lock(&self.processes).contains_key(name)
    }

    /// Retire a drained exit event, returning the callback to invoke.
    pub fn on_drained(&self, name: &str, id: u64) -> Option<String> {
        let mut processes = lock(&self.processes);
        match processes.get(name) {
            Some(entry) if entry.id == id => processes.remove(name).map(|e| e.callback),
            _ => None,
        }
    }

    /// Stop watching every child. Dropping the watcher kills the child.
    pub fn clear(&self) {
        for (name, entry) in lock(&self.processes).drain() {
            debug!(name = %name, "Killing process on clear");
            entry.task.abort();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.processes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn command_label(command: &ProcessCommand) -> &str {
    match command {
        ProcessCommand::Shell(line) => line,
        ProcessCommand::Argv(argv) => argv.first().map(String::as_str).unwrap_or_default(),
    }
}

async fn watch_child(
    sink: EventSink,
    name: String,
    id: u64,
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!(name = %name, error = %e, "Failed to kill process");
            }
            child.wait().await
        }
    };

    let event = match status {
        Ok(status) => ScriptEvent::Process {
            name: name.clone(),
            id,
            code: status.code(),
            success: status.success(),
            error: None,
        },
        Err(e) => ScriptEvent::Process {
            name: name.clone(),
            id,
            code: None,
            success: false,
            error: Some(e.to_string()),
        },
    };

    if !sink.post(event).await {
        debug!(name = %name, "Event queue closed, process exit discarded");
    }
}
