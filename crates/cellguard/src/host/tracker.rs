use async_trait::async_trait;
use cellguard_core::protocol::{CorrelationKey, ProcessDataEvent, ProcessDataType};
use cellguard_core::{
    BoxFuture, ChannelError, ContainmentGroup, MessageTransport, OutputCallback, ProcessHandle,
    ProcessId, ProcessManager,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outbound side of the channel used to report process output
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_process_data(&self, event: ProcessDataEvent) -> Result<(), ChannelError>;
}

#[async_trait]
impl EventPublisher for MessageTransport {
    async fn publish_process_data(&self, event: ProcessDataEvent) -> Result<(), ChannelError> {
        self.publish_event(ProcessDataEvent::TOPIC, &event).await
    }
}

/// Registry of the processes this worker started, keyed by their correlation key
pub struct ProcessTracker {
    processes: Mutex<HashMap<CorrelationKey, Arc<dyn ProcessHandle>>>,
    publisher: Arc<dyn EventPublisher>,
    containment: Arc<dyn ContainmentGroup>,
    manager: Arc<dyn ProcessManager>,
    host_pid: ProcessId,
}

impl ProcessTracker {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        containment: Arc<dyn ContainmentGroup>,
        manager: Arc<dyn ProcessManager>,
        host_pid: ProcessId,
    ) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            publisher,
            containment,
            manager,
            host_pid,
        }
    }

    pub fn manager(&self) -> &Arc<dyn ProcessManager> {
        &self.manager
    }

    pub fn is_tracked(&self, key: &CorrelationKey) -> bool {
        self.processes.lock().contains_key(key)
    }

    pub fn tracked_count(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn track_process(
        &self,
        key: CorrelationKey,
        process: Arc<dyn ProcessHandle>,
    ) -> anyhow::Result<()> {
        let mut processes = self.processes.lock();
        if processes.contains_key(&key) {
            anyhow::bail!("A process with key '{key}' is already being tracked.");
        }
        debug!(%key, pid = process.get_pid(), "Tracking process");
        processes.insert(key, process);
        Ok(())
    }

    pub fn get_process_by_key(&self, key: &CorrelationKey) -> Option<Arc<dyn ProcessHandle>> {
        self.processes.lock().get(key).cloned()
    }

    pub fn remove_process(&self, key: &CorrelationKey) -> Option<Arc<dyn ProcessHandle>> {
        self.processes.lock().remove(key)
    }

    /// The tracked process with OS id `pid`, together with its key
    pub fn get_process_by_id(
        &self,
        pid: ProcessId,
    ) -> Option<(CorrelationKey, Arc<dyn ProcessHandle>)> {
        self.processes
            .lock()
            .iter()
            .find(|(_, process)| process.get_pid() == pid)
            .map(|(key, process)| (*key, process.clone()))
    }

    /// Every process in the containment group except this worker.
    ///
    /// Tracked processes are returned through their own handles; anything else in the
    /// group (grandchildren, detached daemons) is attached by id.
    pub async fn get_all_child_processes(&self) -> anyhow::Result<Vec<Arc<dyn ProcessHandle>>> {
        let pids = self.containment.process_ids()?;
        let tracked: HashMap<ProcessId, Arc<dyn ProcessHandle>> = self
            .processes
            .lock()
            .values()
            .map(|process| (process.get_pid(), process.clone()))
            .collect();

        let mut processes = Vec::new();
        for pid in pids.into_iter().filter(|pid| *pid != self.host_pid) {
            match tracked.get(&pid) {
                Some(process) => processes.push(process.clone()),
                None => match self.manager.find_process(pid).await {
                    Some(process) => processes.push(process),
                    None => debug!(pid, "Group member exited before it could be attached"),
                },
            }
        }
        Ok(processes)
    }

    pub async fn handle_process_data(
        &self,
        key: CorrelationKey,
        data_type: ProcessDataType,
        data: String,
    ) {
        let event = ProcessDataEvent {
            key,
            data_type,
            data,
        };
        if let Err(e) = self.publisher.publish_process_data(event).await {
            warn!(%key, "Failed to publish process output: {e}");
        }
    }

    /// Output sink that forwards every line of one stream as a process data event
    pub fn output_callback(
        self: &Arc<Self>,
        key: CorrelationKey,
        data_type: ProcessDataType,
    ) -> OutputCallback {
        let tracker = self.clone();
        Arc::new(move |line: String| -> BoxFuture<'static, ()> {
            let tracker = tracker.clone();
            Box::pin(async move { tracker.handle_process_data(key, data_type, line).await })
        })
    }
}
