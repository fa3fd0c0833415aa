use crate::factory::PlatformFactory;
use crate::worker_client::WorkerClient;
use cellguard_core::protocol::RequestIdGenerator;
use cellguard_core::{
    ChannelError, ContainmentGroup, LauncherConfig, MessageTransport, MessagingClient, ProcessId,
};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

/// Line a worker writes to stderr once it is ready to serve requests
const READY_LINE: &str = "OK";

/// Starts `cellguard-host` workers and connects to them
pub struct WorkerLauncher {
    config: LauncherConfig,
    containment: Arc<dyn ContainmentGroup>,
    ids: Arc<RequestIdGenerator>,
}

impl WorkerLauncher {
    pub fn new(config: LauncherConfig, containment: Arc<dyn ContainmentGroup>) -> Self {
        Self {
            config,
            containment,
            ids: Arc::new(RequestIdGenerator::new()),
        }
    }

    /// Launcher using the platform's containment, in a group named after the sandbox
    pub fn with_platform_containment(config: LauncherConfig) -> Result<Self, ChannelError> {
        let name = format!("cellguard-{}", config.sandbox_id);
        let containment =
            PlatformFactory::create_containment(&name, config.cgroup_root.as_deref())?;
        Ok(Self::new(config, containment))
    }

    /// Share one id sequence across several workers
    pub fn with_request_ids(mut self, ids: Arc<RequestIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn containment(&self) -> &Arc<dyn ContainmentGroup> {
        &self.containment
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.worker_executable);
        command
            .arg(&self.config.sandbox_id)
            .arg("--containment-group")
            .arg(self.containment.name());
        if let Some(root) = &self.config.cgroup_root {
            command.arg("--cgroup-root").arg(root);
        }
        // the worker sees only the configured variables, never the orchestrator's
        command
            .env_clear()
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_directory {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        if let Some(run_as) = self.config.run_as {
            command.uid(run_as.uid).gid(run_as.gid);
        }
        #[cfg(not(unix))]
        if self.config.run_as.is_some() {
            warn!("Running the worker as another user is only supported on Unix");
        }
        command
    }

    /// Start a worker, wait for its readiness line and open the channel to it.
    ///
    /// The worker is placed into the containment group only after it reported ready,
    /// so everything it spawns afterwards is captured by the group.
    pub async fn launch(&self) -> Result<WorkerClient, ChannelError> {
        let timeouts = self.config.timeouts.clone();
        timeouts
            .validate()
            .map_err(|e| ChannelError::Launch(format!("invalid timeouts: {e}")))?;

        let executable = self.config.worker_executable.display().to_string();
        let mut child = self.command().spawn().map_err(|e| {
            ChannelError::Launch(format!("failed to start {executable}: {e}"))
        })?;
        let Some(pid) = child.id() else {
            abandon(child).await;
            return Err(ChannelError::Launch(format!(
                "{executable} exited before it could be observed"
            )));
        };
        info!(pid, sandbox = %self.config.sandbox_id, "Worker process started");

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            abandon(child).await;
            return Err(ChannelError::Launch("worker stdio was not captured".into()));
        };

        let mut diagnostics = BufReader::new(stderr).lines();
        if let Err(e) = await_handshake(&mut diagnostics, timeouts.handshake_timeout()).await {
            warn!(pid, "Worker handshake failed: {e}");
            abandon(child).await;
            return Err(e);
        }

        if let Err(e) = self.containment.assign_process(pid) {
            abandon(child).await;
            return Err(ChannelError::Launch(format!(
                "failed to place worker {pid} into containment group '{}': {e}",
                self.containment.name()
            )));
        }
        debug!(pid, group = self.containment.name(), "Worker contained");

        let transport = Arc::new(MessageTransport::with_max_line_length(
            stdout,
            stdin,
            timeouts.max_line_length,
        ));
        let messaging = Arc::new(connect(&transport, self.ids.clone()));
        attach(&transport, &messaging);
        transport.subscribe_error(move |e| warn!(worker_pid = pid, "Channel error: {e}"));
        tokio::spawn(forward_diagnostics(pid, diagnostics));
        transport.start();

        Ok(WorkerClient::new(
            pid,
            child,
            transport,
            messaging,
            self.containment.clone(),
            timeouts,
        ))
    }
}

/// Messaging client writing to `transport`, fed by its responses and events
fn connect(transport: &Arc<MessageTransport>, ids: Arc<RequestIdGenerator>) -> MessagingClient {
    let sink = Arc::downgrade(transport);
    MessagingClient::new(ids, move |request| {
        let transport = sink.upgrade();
        async move {
            match transport {
                Some(transport) => transport.publish_request(&request).await,
                None => Err(ChannelError::Cancelled),
            }
        }
    })
}

/// Route inbound responses and events into `messaging` without keeping it alive
fn attach(transport: &MessageTransport, messaging: &Arc<MessagingClient>) {
    let responses = Arc::downgrade(messaging);
    transport.subscribe_response(move |response| {
        let result = match responses.upgrade() {
            Some(messaging) => messaging.publish_response(response),
            None => Ok(()),
        };
        async move { result }
    });

    let events = Arc::downgrade(messaging);
    transport.subscribe_event(move |event| {
        let result = match events.upgrade() {
            Some(messaging) => messaging.publish_event(&event),
            None => Ok(()),
        };
        async move { result }
    });
}

async fn await_handshake(
    lines: &mut Lines<BufReader<ChildStderr>>,
    timeout: Duration,
) -> Result<(), ChannelError> {
    match tokio::time::timeout(timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) if line.trim() == READY_LINE => Ok(()),
        Ok(Ok(Some(line))) => Err(ChannelError::Launch(format!(
            "worker failed to start with the error: {line}"
        ))),
        Ok(Ok(None)) => Err(ChannelError::Launch(
            "worker exited before reporting ready".into(),
        )),
        Ok(Err(e)) => Err(ChannelError::Transport(e)),
        Err(_) => Err(ChannelError::Launch(format!(
            "worker did not report ready within {timeout:?}"
        ))),
    }
}

/// Log whatever the worker writes to stderr after the handshake
async fn forward_diagnostics(pid: ProcessId, mut lines: Lines<BufReader<ChildStderr>>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(worker_pid = pid, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(worker_pid = pid, "Stopped reading worker stderr: {e}");
                break;
            }
        }
    }
}

async fn abandon(mut child: Child) {
    if let Err(e) = child.start_kill() {
        debug!("Worker already gone: {e}");
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap worker: {e}");
    }
}
