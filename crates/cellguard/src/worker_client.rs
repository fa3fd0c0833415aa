use cellguard_core::protocol::{
    CorrelationKey, CreateProcess, CreateProcessParams, CreateProcessResult, FindProcessById,
    FindProcessByIdParams, FindProcessByIdResult, NoParams, Ping, ProcessDataEvent,
    StopAllProcesses, StopAllProcessesParams, StopProcess, StopProcessParams, WaitForProcessExit,
    WaitForProcessExitParams, WaitForProcessExitResult, duration_to_ms,
};
use cellguard_core::{
    ChannelError, ChannelTimeouts, ContainmentGroup, MessageTransport, MessagingClient, ProcessId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Receives the output lines of one managed process
pub type ProcessDataCallback = Arc<dyn Fn(ProcessDataEvent) + Send + Sync>;

/// How the worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the worker was killed by a signal
    pub code: Option<i32>,
}

/// Orchestrator-side connection to one running worker
pub struct WorkerClient {
    pid: ProcessId,
    transport: Arc<MessageTransport>,
    messaging: Arc<MessagingClient>,
    containment: Arc<dyn ContainmentGroup>,
    data_subscribers: Arc<Mutex<HashMap<CorrelationKey, ProcessDataCallback>>>,
    timeouts: ChannelTimeouts,
    kill: CancellationToken,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerClient {
    pub(crate) fn new(
        pid: ProcessId,
        child: Child,
        transport: Arc<MessageTransport>,
        messaging: Arc<MessagingClient>,
        containment: Arc<dyn ContainmentGroup>,
        timeouts: ChannelTimeouts,
    ) -> Self {
        let data_subscribers: Arc<Mutex<HashMap<CorrelationKey, ProcessDataCallback>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let subscribers = data_subscribers.clone();
        messaging.subscribe(ProcessDataEvent::TOPIC, move |event: ProcessDataEvent| {
            let callback = subscribers.lock().get(&event.key).cloned();
            match callback {
                Some(callback) => callback(event),
                None => trace!(key = %event.key, "Dropping output of an unsubscribed process"),
            }
        });

        let kill = CancellationToken::new();
        let (exit_tx, exit) = watch::channel(None);
        tokio::spawn(supervise(
            pid,
            child,
            kill.clone(),
            Arc::downgrade(&messaging),
            exit_tx,
        ));

        Self {
            pid,
            transport,
            messaging,
            containment,
            data_subscribers,
            timeouts,
            kill,
            exit,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn containment(&self) -> &Arc<dyn ContainmentGroup> {
        &self.containment
    }

    pub fn messaging(&self) -> &Arc<MessagingClient> {
        &self.messaging
    }

    /// Ping with the configured ping timeout
    pub async fn ping(&self) -> Result<bool, ChannelError> {
        self.ping_with_timeout(self.timeouts.ping_timeout()).await
    }

    /// `Ok(false)` when the worker does not answer within `timeout`
    pub async fn ping_with_timeout(&self, timeout: Duration) -> Result<bool, ChannelError> {
        match self.messaging.call_with_timeout::<Ping>(NoParams, timeout).await {
            Ok(alive) => Ok(alive),
            Err(ChannelError::Timeout(_)) => {
                warn!(pid = self.pid, ?timeout, "Worker did not answer ping");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn create_process(
        &self,
        params: CreateProcessParams,
    ) -> Result<CreateProcessResult, ChannelError> {
        self.messaging.call::<CreateProcess>(params).await
    }

    /// Ask the process under `key` to exit, killing it after `timeout`
    pub async fn stop_process(
        &self,
        key: CorrelationKey,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        self.messaging
            .call::<StopProcess>(StopProcessParams {
                key,
                timeout: duration_to_ms(timeout),
            })
            .await
    }

    pub async fn stop_all_processes(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.messaging
            .call::<StopAllProcesses>(StopAllProcessesParams {
                timeout: duration_to_ms(timeout),
            })
            .await
    }

    pub async fn wait_for_process_exit(
        &self,
        key: CorrelationKey,
        timeout: Duration,
    ) -> Result<WaitForProcessExitResult, ChannelError> {
        self.messaging
            .call::<WaitForProcessExit>(WaitForProcessExitParams {
                key,
                timeout: duration_to_ms(timeout),
            })
            .await
    }

    pub async fn find_process_by_id(
        &self,
        id: ProcessId,
    ) -> Result<Option<FindProcessByIdResult>, ChannelError> {
        self.messaging
            .call::<FindProcessById>(FindProcessByIdParams { id })
            .await
    }

    /// Deliver output of the process under `key` to `callback`, replacing any earlier one
    pub fn subscribe_to_process_data<F>(&self, key: CorrelationKey, callback: F)
    where
        F: Fn(ProcessDataEvent) + Send + Sync + 'static,
    {
        self.data_subscribers.lock().insert(key, Arc::new(callback));
    }

    pub fn unsubscribe_from_process_data(&self, key: &CorrelationKey) -> bool {
        self.data_subscribers.lock().remove(key).is_some()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolves when the worker process is gone
    pub async fn wait_for_exit(&self) -> WorkerExit {
        let mut exit = self.exit.clone();
        let observed = match exit.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        observed.unwrap_or(WorkerExit { code: None })
    }

    /// Close the channel, tear down the containment group and reap the worker.
    ///
    /// Pending calls fail with [`ChannelError::Cancelled`].
    pub async fn shutdown(&self) -> Result<WorkerExit, ChannelError> {
        info!(pid = self.pid, group = self.containment.name(), "Shutting down worker");
        self.messaging.close();
        self.transport.stop().await;

        let teardown = self.containment.terminate_all().await;
        if let Err(e) = &teardown {
            warn!(pid = self.pid, "Containment teardown failed: {e}");
        }
        self.kill.cancel();
        let exit = self.wait_for_exit().await;
        teardown?;
        Ok(exit)
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Own the worker process until it exits or is killed
async fn supervise(
    pid: ProcessId,
    mut child: Child,
    kill: CancellationToken,
    messaging: Weak<MessagingClient>,
    exit: watch::Sender<Option<WorkerExit>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                debug!(pid, "Worker already gone: {e}");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid, "Failed to wait for worker: {e}");
            None
        }
    };
    info!(pid, ?code, "Worker exited");
    if let Some(messaging) = messaging.upgrade() {
        messaging.close();
    }
    exit.send_replace(Some(WorkerExit { code }));
}
