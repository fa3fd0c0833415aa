use crate::BoxFuture;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Receives one decoded output line at a time, in order
pub type OutputCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Status of a process as observed by a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited with the given exit code
    Exited(i32),
    /// Process is gone but its exit code could not be observed
    Terminated,
}

impl ProcessStatus {
    pub fn has_exited(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }

    /// Exit code, with `-1` standing in for processes whose code was not observable
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Running => None,
            ProcessStatus::Exited(code) => Some(*code),
            ProcessStatus::Terminated => Some(-1),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Every requested process was terminated
    Success,
    /// None of the processes existed any more
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Error types for process operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Containment error: {0}")]
    Containment(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Other error: {0}")]
    Other(String),
}

/// Everything needed to start one managed process
#[derive(Clone)]
pub struct ProcessRunSpec {
    pub executable_path: String,
    pub arguments: Vec<String>,
    /// Effective environment; the child does not inherit anything beyond this
    pub environment: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub output_callback: Option<OutputCallback>,
    pub error_callback: Option<OutputCallback>,
}

impl ProcessRunSpec {
    pub fn new(executable_path: impl Into<String>) -> Self {
        Self {
            executable_path: executable_path.into(),
            arguments: Vec::new(),
            environment: HashMap::new(),
            working_directory: None,
            output_callback: None,
            error_callback: None,
        }
    }

    pub fn arguments<S: ToString, I: IntoIterator<Item = S>>(mut self, iter: I) -> Self {
        self.arguments = iter.into_iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn working_directory(mut self, dir: Option<PathBuf>) -> Self {
        self.working_directory = dir;
        self
    }

    pub fn on_output(mut self, callback: OutputCallback) -> Self {
        self.output_callback = Some(callback);
        self
    }

    pub fn on_error(mut self, callback: OutputCallback) -> Self {
        self.error_callback = Some(callback);
        self
    }

    /// Command line used in logs
    pub fn display_command(&self) -> String {
        std::iter::once(self.executable_path.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Trait representing a handle to a managed process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn get_pid(&self) -> ProcessId;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Environment the process was started with, as far as it is known
    fn environment(&self) -> HashMap<String, String>;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool;

    /// Ask the process to exit (SIGTERM on Unix, a close request on Windows)
    async fn request_exit(&self) -> Result<(), ProcessError>;

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Returns [`ProcessStatus::Running`] when the timeout elapses first.
    async fn wait_for_exit(&self, timeout: Duration) -> Result<ProcessStatus, ProcessError>;

    /// Forcibly terminate the process itself
    async fn kill(&self) -> Result<(), ProcessError>;

    /// Exit code if the process has already exited, without waiting
    async fn exit_code(&self) -> Option<i32> {
        self.wait_for_exit(Duration::ZERO)
            .await
            .ok()
            .and_then(|status| status.exit_code())
    }
}

/// Core trait for process lifecycle management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn a process with piped output pumped line by line into its output callbacks
    async fn spawn_process(
        &self,
        spec: ProcessRunSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ProcessError>;

    /// Attach to an already running process by id
    async fn find_process(&self, pid: ProcessId) -> Option<Arc<dyn ProcessHandle>>;
}

/// Trait for terminating process trees
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// All descendants of `pid`, deepest first
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>, ProcessError>;

    /// Forcibly terminate every listed process
    async fn terminate_processes(&self, pids: &[ProcessId]) -> TerminationResult;
}

/// High-level process manager trait that combines lifecycle and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Get the platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

/// OS-level grouping that captures a worker and every process it starts
#[async_trait]
pub trait ContainmentGroup: Send + Sync {
    fn name(&self) -> &str;

    /// Add a process; its future descendants join the group as well
    fn assign_process(&self, pid: ProcessId) -> Result<(), ProcessError>;

    /// Every live process currently in the group
    fn process_ids(&self) -> Result<Vec<ProcessId>, ProcessError>;

    /// Kill every member and wait until the group is empty
    async fn terminate_all(&self) -> Result<(), ProcessError>;
}
