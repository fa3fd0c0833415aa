//! In-memory stand-ins for the OS-facing traits used by the host tests

use super::tracker::EventPublisher;
use async_trait::async_trait;
use cellguard_core::protocol::ProcessDataEvent;
use cellguard_core::{
    ChannelError, ContainmentGroup, ProcessError, ProcessHandle, ProcessId, ProcessLifecycle,
    ProcessManager, ProcessRunSpec, ProcessStatus, ProcessTermination, TerminationResult,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

pub struct FakeProcess {
    pid: ProcessId,
    environment: HashMap<String, String>,
    exits_on_request: bool,
    waits_fail: AtomicBool,
    exit: watch::Sender<Option<ProcessStatus>>,
    requests: AtomicUsize,
    waits: AtomicUsize,
    kills: AtomicUsize,
}

impl FakeProcess {
    fn build(pid: ProcessId, exits_on_request: bool, environment: HashMap<String, String>) -> Arc<Self> {
        let (exit, _) = watch::channel(None);
        Arc::new(Self {
            pid,
            environment,
            exits_on_request,
            waits_fail: AtomicBool::new(false),
            exit,
            requests: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
        })
    }

    /// Ignores exit requests; only `kill` or `finish` ends it
    pub fn running(pid: ProcessId) -> Arc<Self> {
        Self::build(pid, false, HashMap::new())
    }

    /// Exits with code 0 as soon as it is asked to
    pub fn cooperative(pid: ProcessId) -> Arc<Self> {
        Self::build(pid, true, HashMap::new())
    }

    pub fn with_environment(pid: ProcessId, environment: HashMap<String, String>) -> Arc<Self> {
        Self::build(pid, false, environment)
    }

    /// Every later `wait_for_exit` fails instead of reporting a status
    pub fn fail_waits(&self) {
        self.waits_fail.store(true, Ordering::SeqCst);
    }

    pub fn finish(&self, code: i32) {
        self.exit.send_replace(Some(ProcessStatus::Exited(code)));
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn wait_count(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn get_pid(&self) -> ProcessId {
        self.pid
    }

    fn get_command(&self) -> &str {
        "fake"
    }

    fn environment(&self) -> HashMap<String, String> {
        self.environment.clone()
    }

    async fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    async fn request_exit(&self) -> Result<(), ProcessError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.exits_on_request {
            self.finish(0);
        }
        Ok(())
    }

    async fn wait_for_exit(&self, timeout: Duration) -> Result<ProcessStatus, ProcessError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        if self.waits_fail.load(Ordering::SeqCst) {
            return Err(ProcessError::Other("wait failed".into()));
        }
        let mut exit = self.exit.subscribe();
        match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(status)) => Ok(status.unwrap_or(ProcessStatus::Terminated)),
            Ok(Err(_)) => Ok(ProcessStatus::Terminated),
            Err(_) => Ok(ProcessStatus::Running),
        }
    }

    async fn kill(&self) -> Result<(), ProcessError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit.send_if_modified(|status| {
            if status.is_some() {
                return false;
            }
            *status = Some(ProcessStatus::Exited(137));
            true
        });
        Ok(())
    }
}

/// Spawned process as recorded by [`FakeManager`]
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub executable_path: String,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
}

pub struct FakeManager {
    next_pid: AtomicU32,
    cooperative: AtomicBool,
    output: Mutex<Vec<String>>,
    spawned: Mutex<Vec<SpawnRecord>>,
    existing: Mutex<HashMap<ProcessId, Arc<FakeProcess>>>,
    descendants: Mutex<Vec<ProcessId>>,
    terminated: Mutex<Vec<ProcessId>>,
}

impl FakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(100),
            cooperative: AtomicBool::new(false),
            output: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            existing: Mutex::new(HashMap::new()),
            descendants: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        })
    }

    /// Spawned processes exit when asked instead of ignoring the request
    pub fn spawn_cooperative(&self) {
        self.cooperative.store(true, Ordering::SeqCst);
    }

    /// Lines every spawned process writes to stdout before `spawn_process` returns
    pub fn emit_output<I: IntoIterator<Item = &'static str>>(&self, lines: I) {
        self.output
            .lock()
            .extend(lines.into_iter().map(str::to_string));
    }

    pub fn set_descendants(&self, pids: Vec<ProcessId>) {
        *self.descendants.lock() = pids;
    }

    pub fn add_existing(&self, process: Arc<FakeProcess>) {
        self.existing.lock().insert(process.get_pid(), process);
    }

    pub fn process(&self, pid: ProcessId) -> Option<Arc<FakeProcess>> {
        self.existing.lock().get(&pid).cloned()
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.spawned.lock().clone()
    }

    pub fn terminated(&self) -> Vec<ProcessId> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl ProcessLifecycle for FakeManager {
    async fn spawn_process(
        &self,
        spec: ProcessRunSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ProcessError> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let output = self.output.lock().clone();
        if let Some(callback) = &spec.output_callback {
            for line in output {
                callback(line).await;
            }
        }

        self.spawned.lock().push(SpawnRecord {
            executable_path: spec.executable_path.clone(),
            arguments: spec.arguments.clone(),
            environment: spec.environment.clone(),
        });
        let process = if self.cooperative.load(Ordering::SeqCst) {
            FakeProcess::cooperative(pid)
        } else {
            FakeProcess::with_environment(pid, spec.environment)
        };
        self.add_existing(process.clone());
        Ok(process)
    }

    async fn find_process(&self, pid: ProcessId) -> Option<Arc<dyn ProcessHandle>> {
        self.process(pid)
            .map(|process| process as Arc<dyn ProcessHandle>)
    }
}

#[async_trait]
impl ProcessTermination for FakeManager {
    async fn find_child_processes(&self, _pid: ProcessId) -> Result<Vec<ProcessId>, ProcessError> {
        Ok(self.descendants.lock().clone())
    }

    async fn terminate_processes(&self, pids: &[ProcessId]) -> TerminationResult {
        self.terminated.lock().extend_from_slice(pids);
        TerminationResult::Success
    }
}

impl ProcessManager for FakeManager {
    fn platform_name(&self) -> &'static str {
        "Fake"
    }
}

pub struct FakeContainment {
    members: Mutex<Vec<ProcessId>>,
}

impl FakeContainment {
    pub fn new() -> Arc<Self> {
        Self::with_members([])
    }

    pub fn with_members<I: IntoIterator<Item = ProcessId>>(members: I) -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(members.into_iter().collect()),
        })
    }
}

#[async_trait]
impl ContainmentGroup for FakeContainment {
    fn name(&self) -> &str {
        "fake"
    }

    fn assign_process(&self, pid: ProcessId) -> Result<(), ProcessError> {
        self.members.lock().push(pid);
        Ok(())
    }

    fn process_ids(&self) -> Result<Vec<ProcessId>, ProcessError> {
        Ok(self.members.lock().clone())
    }

    async fn terminate_all(&self) -> Result<(), ProcessError> {
        self.members.lock().clear();
        Ok(())
    }
}

pub struct RecordingPublisher {
    events: Mutex<Vec<ProcessDataEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ProcessDataEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_process_data(&self, event: ProcessDataEvent) -> Result<(), ChannelError> {
        self.events.lock().push(event);
        Ok(())
    }
}
