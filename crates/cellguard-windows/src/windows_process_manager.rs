use async_trait::async_trait;
use cellguard_core::{
    BoxFuture, OutputCallback, ProcessError, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessRunSpec, ProcessStatus, ProcessTermination, TerminationResult, pump_lines,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Use taskkill to terminate a single process
async fn taskkill(pid: ProcessId, force: bool) -> Result<bool, ProcessError> {
    let pid_string = pid.to_string();
    let mut args = vec!["/PID", &pid_string];
    if force {
        args.push("/F");
    }

    let output = Command::new("taskkill").args(&args).output().await?;
    debug!(pid, force, success = output.status.success(), "taskkill finished");
    Ok(output.status.success())
}

fn process_alive(pid: ProcessId) -> bool {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::default(),
    );
    system.process(Pid::from_u32(pid)).is_some()
}

/// Recursively find all child processes, deepest first
fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
    for (pid, process) in system.processes() {
        if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
            let child_pid = pid.as_u32();
            find_children_recursive(system, child_pid, result);
            if !result.contains(&child_pid) {
                result.push(child_pid);
            }
        }
    }
}

fn spawn_pump<R>(
    pid: ProcessId,
    stream: &'static str,
    reader: Option<R>,
    callback: Option<OutputCallback>,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = reader?;
    let callback = callback.unwrap_or_else(|| {
        Arc::new(|_: String| -> BoxFuture<'static, ()> { Box::pin(async {}) })
    });
    Some(tokio::spawn(async move {
        if let Err(e) = pump_lines(reader, callback).await {
            warn!(pid, stream, "Output pump failed: {e}");
        }
    }))
}

/// Handle to a process spawned by [`WindowsProcessManager`]
pub struct WindowsProcessHandle {
    pid: ProcessId,
    command: String,
    environment: HashMap<String, String>,
    exit: watch::Receiver<Option<ProcessStatus>>,
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
    fn get_pid(&self) -> ProcessId {
        self.pid
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    fn environment(&self) -> HashMap<String, String> {
        self.environment.clone()
    }

    async fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    async fn request_exit(&self) -> Result<(), ProcessError> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        // a close request; console processes without a window may ignore it
        taskkill(self.pid, false).await.map(|_| ())
    }

    async fn wait_for_exit(&self, timeout: Duration) -> Result<ProcessStatus, ProcessError> {
        let mut exit = self.exit.clone();
        match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(status)) => Ok(status.unwrap_or(ProcessStatus::Terminated)),
            Ok(Err(_)) => Ok(ProcessStatus::Terminated),
            Err(_) => Ok(ProcessStatus::Running),
        }
    }

    async fn kill(&self) -> Result<(), ProcessError> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        match taskkill(self.pid, true).await? {
            true => Ok(()),
            false if !process_alive(self.pid) => Ok(()),
            false => Err(ProcessError::Other(format!("taskkill /F failed for {}", self.pid))),
        }
    }
}

/// Handle to a process found by id; its exit code is not observable
struct AttachedProcessHandle {
    pid: ProcessId,
    command: String,
}

#[async_trait]
impl ProcessHandle for AttachedProcessHandle {
    fn get_pid(&self) -> ProcessId {
        self.pid
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    fn environment(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn is_running(&self) -> bool {
        process_alive(self.pid)
    }

    async fn request_exit(&self) -> Result<(), ProcessError> {
        taskkill(self.pid, false).await.map(|_| ())
    }

    async fn wait_for_exit(&self, timeout: Duration) -> Result<ProcessStatus, ProcessError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !process_alive(self.pid) {
                return Ok(ProcessStatus::Terminated);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(ProcessStatus::Running);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn kill(&self) -> Result<(), ProcessError> {
        taskkill(self.pid, true).await.map(|_| ())
    }
}

/// Windows-specific process manager
pub struct WindowsProcessManager {
    system: Mutex<System>,
}

impl Default for WindowsProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsProcessManager {
    pub fn new() -> Self {
        info!("Initializing Windows process manager");
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
    async fn spawn_process(
        &self,
        spec: ProcessRunSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ProcessError> {
        let display = spec.display_command();
        let mut cmd = Command::new(&spec.executable_path);
        cmd.args(&spec.arguments)
            .env_clear()
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{display}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::SpawnFailed(format!("{display}: exited before start")))?;
        info!(pid, command = %display, "Spawned Windows process");

        let pumps = [
            spawn_pump(pid, "stdout", child.stdout.take(), spec.output_callback),
            spawn_pump(pid, "stderr", child.stderr.take(), spec.error_callback),
        ];

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ProcessStatus::Exited(status.code().unwrap_or(-1)),
                Err(e) => {
                    warn!(pid, "Failed to wait for process: {e}");
                    ProcessStatus::Terminated
                }
            };
            for pump in pumps.into_iter().flatten() {
                if tokio::time::timeout(OUTPUT_DRAIN_GRACE, pump).await.is_err() {
                    debug!(pid, "Output still open after exit, not waiting for it");
                }
            }
            info!(pid, ?status, "Process exited");
            exit_tx.send_replace(Some(status));
        });

        Ok(Arc::new(WindowsProcessHandle {
            pid,
            command: display,
            environment: spec.environment,
            exit: exit_rx,
        }))
    }

    async fn find_process(&self, pid: ProcessId) -> Option<Arc<dyn ProcessHandle>> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::default(),
        );
        let process = system.process(Pid::from_u32(pid))?;
        Some(Arc::new(AttachedProcessHandle {
            pid,
            command: process.name().to_string_lossy().into_owned(),
        }))
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>, ProcessError> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::default(),
        );

        let mut children = Vec::new();
        find_children_recursive(&system, parent_pid, &mut children);
        Ok(children)
    }

    async fn terminate_processes(&self, pids: &[ProcessId]) -> TerminationResult {
        let mut failure = None;
        for pid in pids {
            match taskkill(*pid, true).await {
                Ok(true) => {}
                Ok(false) if !process_alive(*pid) => {}
                Ok(false) => {
                    failure.get_or_insert(TerminationResult::Failed(format!(
                        "taskkill /F failed for {pid}"
                    )));
                }
                Err(e) => {
                    failure.get_or_insert(TerminationResult::Failed(e.to_string()));
                }
            }
        }
        failure.unwrap_or(TerminationResult::Success)
    }
}

impl ProcessManager for WindowsProcessManager {
    fn platform_name(&self) -> &'static str {
        "Windows"
    }
}
