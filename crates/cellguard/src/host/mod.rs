//! Worker side of the channel: serves container requests arriving on a transport.

mod handlers;
#[cfg(test)]
mod testing;
mod tracker;

pub use handlers::{register_handlers, stop_all_processes, stop_with_timeout};
pub use tracker::{EventPublisher, ProcessTracker};

use cellguard_core::{
    ChannelError, ContainmentGroup, MessageDispatcher, MessageTransport, ProcessId, ProcessManager,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Request loop of one sandbox worker
pub struct ContainerHost {
    transport: Arc<MessageTransport>,
    dispatcher: Arc<MessageDispatcher>,
    tracker: Arc<ProcessTracker>,
}

impl ContainerHost {
    /// Wire the container methods to `transport`.
    ///
    /// `host_pid` is this worker's own id; it is never reported as a child process.
    pub fn new(
        transport: Arc<MessageTransport>,
        containment: Arc<dyn ContainmentGroup>,
        manager: Arc<dyn ProcessManager>,
        host_pid: ProcessId,
    ) -> Result<Self, ChannelError> {
        let tracker = Arc::new(ProcessTracker::new(
            transport.clone(),
            containment,
            manager,
            host_pid,
        ));
        let mut dispatcher = MessageDispatcher::new();
        register_handlers(&mut dispatcher, tracker.clone())?;
        let dispatcher = Arc::new(dispatcher);

        let weak_dispatcher = Arc::downgrade(&dispatcher);
        let weak_transport = Arc::downgrade(&transport);
        transport.subscribe_request(move |request| {
            let dispatcher = weak_dispatcher.upgrade();
            let transport = weak_transport.upgrade();
            async move {
                let (Some(dispatcher), Some(transport)) = (dispatcher, transport) else {
                    return Err(ChannelError::Cancelled);
                };
                let response = dispatcher.dispatch(request).await;
                transport.publish_response(&response).await
            }
        });
        transport.subscribe_error(|e| warn!("Channel error: {e}"));

        Ok(Self {
            transport,
            dispatcher,
            tracker,
        })
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn start(&self) {
        self.transport.start();
    }

    /// Resolves once the orchestrator closes the input stream
    pub async fn run_until_closed(&self) {
        self.transport.closed().await;
        info!("Input stream closed");
    }

    /// Stop reading and give every process in the group `timeout` to exit
    pub async fn shutdown(&self, timeout: Duration) {
        self.transport.stop().await;
        if let Err(e) = stop_all_processes(&self.tracker, timeout).await {
            warn!("Failed to stop processes during shutdown: {e:#}");
        }
        info!(remaining = self.tracker.tracked_count(), "Host shut down");
    }
}
