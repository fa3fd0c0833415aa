use async_trait::async_trait;
use cellguard_core::{
    BoxFuture, OutputCallback, ProcessError, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessRunSpec, ProcessStatus, ProcessTermination, TerminationResult, pump_lines,
};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long exit reporting waits for the output pumps after the process is gone
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Polling interval for processes this manager cannot `wait` on
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn to_nix_pid(pid: ProcessId) -> Result<NixPid, ProcessError> {
    i32::try_from(pid)
        .map(NixPid::from_raw)
        .map_err(|_| ProcessError::ProcessNotFound(pid))
}

/// Send `signal` to `pid`; a process that is already gone counts as success
pub(crate) fn send_signal(pid: ProcessId, signal: Signal) -> Result<(), ProcessError> {
    match signal::kill(to_nix_pid(pid)?, signal) {
        Ok(()) => {
            info!(pid, signal = signal.as_str(), "Sent signal");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!(pid, "Process not found (already terminated)");
            Ok(())
        }
        Err(Errno::EPERM) => Err(ProcessError::PermissionDenied(format!(
            "cannot send {} to process {pid}",
            signal.as_str()
        ))),
        Err(e) => Err(ProcessError::Other(format!(
            "{} failed for process {pid}: {e}",
            signal.as_str()
        ))),
    }
}

/// Force kill a single process by id
pub(crate) fn kill_pid(pid: ProcessId) -> TerminationResult {
    let Ok(nix_pid) = to_nix_pid(pid) else {
        return TerminationResult::ProcessNotFound;
    };
    match signal::kill(nix_pid, Signal::SIGKILL) {
        Ok(()) => {
            info!(pid, "Sent SIGKILL");
            TerminationResult::Success
        }
        Err(Errno::ESRCH) => TerminationResult::ProcessNotFound,
        Err(Errno::EPERM) => {
            warn!(pid, "Permission denied to kill process");
            TerminationResult::AccessDenied
        }
        Err(e) => {
            warn!(pid, "Failed to send SIGKILL: {e}");
            TerminationResult::Failed(format!("SIGKILL failed: {e}"))
        }
    }
}

fn is_zombie(system: &System, pid: ProcessId) -> bool {
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() == sysinfo::ProcessStatus::Zombie)
}

/// Whether `pid` names a live, non-zombie process
pub(crate) fn process_alive(pid: ProcessId) -> bool {
    let Ok(nix_pid) = to_nix_pid(pid) else {
        return false;
    };
    match signal::kill(nix_pid, None) {
        Ok(()) | Err(Errno::EPERM) => {
            let mut system = System::new();
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
                true,
                ProcessRefreshKind::default(),
            );
            !is_zombie(&system, pid)
        }
        Err(_) => false,
    }
}

/// Recursively find all live descendants of `parent_pid`, deepest first.
///
/// Threads are listed by sysinfo as tasks of their process on Linux and are skipped.
pub(crate) fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
    for (pid, process) in system.processes() {
        if process.thread_kind().is_some() {
            continue;
        }
        if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
            let child_pid = pid.as_u32();
            // Recursively find grandchildren first
            find_children_recursive(system, child_pid, result);
            if process.status() != sysinfo::ProcessStatus::Zombie && !result.contains(&child_pid) {
                result.push(child_pid);
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn discard_output() -> OutputCallback {
    Arc::new(|_: String| -> BoxFuture<'static, ()> { Box::pin(async {}) })
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
    let callback = callback.unwrap_or_else(discard_output);
    Some(tokio::spawn(async move {
        if let Err(e) = pump_lines(reader, callback).await {
            warn!(pid, stream, "Output pump failed: {e}");
        }
    }))
}

/// Handle to a process spawned by [`UnixProcessManager`].
///
/// A background task owns the child, reaps it and publishes its exit status.
pub struct UnixProcessHandle {
    pid: ProcessId,
    command: String,
    environment: HashMap<String, String>,
    exit: watch::Receiver<Option<ProcessStatus>>,
}

impl UnixProcessHandle {
    fn exit_status(&self) -> Option<ProcessStatus> {
        *self.exit.borrow()
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
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
        self.exit_status().is_none()
    }

    async fn request_exit(&self) -> Result<(), ProcessError> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        send_signal(self.pid, Signal::SIGTERM)
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
        if self.exit_status().is_some() {
            return Ok(());
        }
        send_signal(self.pid, Signal::SIGKILL)
    }
}

/// Handle to a process this manager found by id rather than spawned.
///
/// Its exit code is not observable, so an exit is reported as [`ProcessStatus::Terminated`].
pub struct AttachedProcessHandle {
    pid: ProcessId,
    command: String,
    environment: HashMap<String, String>,
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
        self.environment.clone()
    }

    async fn is_running(&self) -> bool {
        process_alive(self.pid)
    }

    async fn request_exit(&self) -> Result<(), ProcessError> {
        send_signal(self.pid, Signal::SIGTERM)
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
        send_signal(self.pid, Signal::SIGKILL)
    }
}

/// Unix-specific process manager with process tree management
pub struct UnixProcessManager {
    system: Mutex<System>,
}

impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixProcessManager {
    pub fn new() -> Self {
        info!("Initializing Unix process manager with system monitoring");
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

#[async_trait]
impl ProcessLifecycle for UnixProcessManager {
    async fn spawn_process(
        &self,
        spec: ProcessRunSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ProcessError> {
        let command_line = spec.display_command();
        let mut cmd = Command::new(&spec.executable_path);
        cmd.args(&spec.arguments)
            .env_clear()
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group so signals aimed at the worker do not reach it
            .process_group(0);
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{command_line}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| {
                ProcessError::SpawnFailed(format!("{command_line}: exited before start"))
            })?;
        info!(pid, command = %command_line, "Spawned Unix process");

        let pumps = [
            spawn_pump(pid, "stdout", child.stdout.take(), spec.output_callback),
            spawn_pump(pid, "stderr", child.stderr.take(), spec.error_callback),
        ];

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ProcessStatus::Exited(exit_code(status)),
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

        Ok(Arc::new(UnixProcessHandle {
            pid,
            command: command_line,
            environment: spec.environment,
            exit: exit_rx,
        }))
    }

    async fn find_process(&self, pid: ProcessId) -> Option<Arc<dyn ProcessHandle>> {
        if !process_alive(pid) {
            return None;
        }
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::everything(),
        );
        let process = system.process(Pid::from_u32(pid))?;
        let environment = process
            .environ()
            .iter()
            .filter_map(|entry| {
                entry
                    .to_string_lossy()
                    .split_once('=')
                    .map(|(key, value)| (key.to_string(), value.to_string()))
            })
            .collect();
        Some(Arc::new(AttachedProcessHandle {
            pid,
            command: process.name().to_string_lossy().into_owned(),
            environment,
        }))
    }
}

#[async_trait]
impl ProcessTermination for UnixProcessManager {
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
        let mut found = false;
        let mut failure = None;
        for pid in pids {
            match kill_pid(*pid) {
                TerminationResult::Success => found = true,
                TerminationResult::ProcessNotFound => {}
                other => {
                    found = true;
                    failure.get_or_insert(other);
                }
            }
        }
        match failure {
            Some(failure) => failure,
            None if found || pids.is_empty() => TerminationResult::Success,
            None => TerminationResult::ProcessNotFound,
        }
    }
}

impl ProcessManager for UnixProcessManager {
    fn platform_name(&self) -> &'static str {
        "Unix"
    }
}
