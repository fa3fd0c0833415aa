use super::tracker::ProcessTracker;
use anyhow::{Context, anyhow};
use cellguard_core::protocol::{
    CreateProcess, CreateProcessParams, CreateProcessResult, FindProcessById,
    FindProcessByIdParams, FindProcessByIdResult, NoParams, Ping, ProcessDataType,
    StopAllProcesses, StopProcess, StopProcessParams, TimeoutParam, WaitForProcessExit,
    WaitForProcessExitParams, WaitForProcessExitResult,
};
use cellguard_core::{
    ChannelError, MessageDispatcher, ProcessHandle, ProcessRunSpec, ProcessTermination,
    TerminationResult,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Register every container method on `dispatcher`
pub fn register_handlers(
    dispatcher: &mut MessageDispatcher,
    tracker: Arc<ProcessTracker>,
) -> Result<(), ChannelError> {
    dispatcher.register::<Ping, _, _>(|_: NoParams| async { Ok(true) })?;

    let t = tracker.clone();
    dispatcher.register::<CreateProcess, _, _>(move |params| {
        let tracker = t.clone();
        async move { create_process(&tracker, params).await }
    })?;

    let t = tracker.clone();
    dispatcher.register::<StopProcess, _, _>(move |params| {
        let tracker = t.clone();
        async move { stop_process(&tracker, params).await }
    })?;

    let t = tracker.clone();
    dispatcher.register::<StopAllProcesses, _, _>(move |params| {
        let tracker = t.clone();
        async move { stop_all_processes(&tracker, params.timeout()).await }
    })?;

    let t = tracker.clone();
    dispatcher.register::<WaitForProcessExit, _, _>(move |params| {
        let tracker = t.clone();
        async move { wait_for_process_exit(&tracker, params).await }
    })?;

    dispatcher.register::<FindProcessById, _, _>(move |params| {
        let tracker = tracker.clone();
        async move { Ok(find_process_by_id(&tracker, params)) }
    })?;

    Ok(())
}

/// The environment a child starts with: exactly the requested variables, or the
/// worker's own environment when none were requested.
///
/// Worker variables that are not valid UTF-8 are skipped.
fn process_environment(requested: HashMap<String, String>) -> HashMap<String, String> {
    if !requested.is_empty() {
        return requested;
    }
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

pub async fn create_process(
    tracker: &Arc<ProcessTracker>,
    params: CreateProcessParams,
) -> anyhow::Result<CreateProcessResult> {
    let key = params.key;
    if tracker.is_tracked(&key) {
        anyhow::bail!("A process with key '{key}' is already being tracked.");
    }

    let spec = ProcessRunSpec::new(params.executable_path)
        .arguments(params.arguments)
        .environment(process_environment(params.environment))
        .working_directory(params.working_directory.map(PathBuf::from))
        .on_output(tracker.output_callback(key, ProcessDataType::Stdout))
        .on_error(tracker.output_callback(key, ProcessDataType::Stderr));
    let command = spec.display_command();

    let process = tracker
        .manager()
        .spawn_process(spec)
        .await
        .with_context(|| format!("Failed to start '{command}'"))?;
    let pid = process.get_pid();

    if let Err(e) = tracker.track_process(key, process.clone()) {
        // another request with the same key won the race
        if let Err(kill_error) = process.kill().await {
            warn!(pid, "Failed to kill untracked process: {kill_error}");
        }
        return Err(e);
    }

    info!(%key, pid, command = %command, "Process created");
    Ok(CreateProcessResult { id: pid })
}

pub async fn stop_process(
    tracker: &ProcessTracker,
    params: StopProcessParams,
) -> anyhow::Result<()> {
    let Some(process) = tracker.get_process_by_key(&params.key) else {
        debug!(key = %params.key, "Stop requested for an untracked process");
        return Ok(());
    };
    stop_with_timeout(process.as_ref(), params.timeout(), tracker.manager().as_ref()).await
}

/// Ask `process` to exit, then kill it and its descendants once `timeout` passes
pub async fn stop_with_timeout<T>(
    process: &dyn ProcessHandle,
    timeout: Duration,
    termination: &T,
) -> anyhow::Result<()>
where
    T: ProcessTermination + ?Sized,
{
    let pid = process.get_pid();
    if let Err(e) = process.request_exit().await {
        warn!(pid, "Exit request failed: {e}");
    }

    match process.wait_for_exit(timeout).await {
        Ok(status) if status.has_exited() => {
            debug!(pid, ?status, "Process exited within its grace period");
            return Ok(());
        }
        Ok(_) => {}
        Err(e) => warn!(pid, "Waiting for exit failed, killing anyway: {e}"),
    }

    // snapshot before the kill; orphans are re-parented afterwards
    let descendants = termination
        .find_child_processes(pid)
        .await
        .unwrap_or_else(|e| {
            warn!(pid, "Failed to list descendants: {e}");
            Vec::new()
        });
    info!(
        pid,
        descendants = descendants.len(),
        "Process ignored the exit request, killing it"
    );
    process
        .kill()
        .await
        .with_context(|| format!("Failed to kill process {pid}"))?;

    if !descendants.is_empty() {
        match termination.terminate_processes(&descendants).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            other => warn!(pid, ?other, "Some descendants survived"),
        }
    }
    Ok(())
}

/// Stop every process in the containment group concurrently
pub async fn stop_all_processes(
    tracker: &ProcessTracker,
    timeout: Duration,
) -> anyhow::Result<()> {
    let processes = tracker.get_all_child_processes().await?;
    info!(count = processes.len(), ?timeout, "Stopping all processes");

    let mut tasks = JoinSet::new();
    for process in processes {
        let manager = tracker.manager().clone();
        tasks.spawn(async move {
            let pid = process.get_pid();
            (
                pid,
                stop_with_timeout(process.as_ref(), timeout, manager.as_ref()).await,
            )
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((pid, Err(e))) => warn!(pid, "Failed to stop process: {e:#}"),
            Err(e) => warn!("Stop task failed: {e}"),
        }
    }
    Ok(())
}

pub async fn wait_for_process_exit(
    tracker: &ProcessTracker,
    params: WaitForProcessExitParams,
) -> anyhow::Result<WaitForProcessExitResult> {
    let key = params.key;
    let process = tracker
        .get_process_by_key(&key)
        .ok_or_else(|| anyhow!("A process with key '{key}' is not being tracked."))?;

    let status = process.wait_for_exit(params.timeout()).await?;
    match status.exit_code() {
        Some(exit_code) => {
            tracker.remove_process(&key);
            debug!(%key, exit_code, "Process exit observed");
            Ok(WaitForProcessExitResult {
                exited: true,
                exit_code,
            })
        }
        None => Ok(WaitForProcessExitResult {
            exited: false,
            exit_code: 0,
        }),
    }
}

pub fn find_process_by_id(
    tracker: &ProcessTracker,
    params: FindProcessByIdParams,
) -> Option<FindProcessByIdResult> {
    tracker
        .get_process_by_id(params.id)
        .map(|(process_key, process)| FindProcessByIdResult {
            process_key,
            id: process.get_pid(),
            environment: process.environment(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::{FakeContainment, FakeManager, FakeProcess, RecordingPublisher};
    use cellguard_core::ContainmentGroup;
    use cellguard_core::protocol::{JsonRpcRequest, RequestId, RpcMethod, duration_to_ms};
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        tracker: Arc<ProcessTracker>,
        manager: Arc<FakeManager>,
        publisher: Arc<RecordingPublisher>,
    }

    fn fixture() -> Fixture {
        fixture_with(FakeContainment::new())
    }

    fn fixture_with(containment: Arc<FakeContainment>) -> Fixture {
        let manager = FakeManager::new();
        let publisher = RecordingPublisher::new();
        let tracker = Arc::new(ProcessTracker::new(
            publisher.clone(),
            containment,
            manager.clone(),
            1,
        ));
        Fixture {
            tracker,
            manager,
            publisher,
        }
    }

    fn stop_params(key: Uuid, timeout: Duration) -> StopProcessParams {
        StopProcessParams {
            key,
            timeout: duration_to_ms(timeout),
        }
    }

    fn wait_params(key: Uuid, timeout: Duration) -> WaitForProcessExitParams {
        WaitForProcessExitParams {
            key,
            timeout: duration_to_ms(timeout),
        }
    }

    #[tokio::test]
    async fn test_create_process_uses_exactly_the_requested_environment() {
        let f = fixture();
        f.manager.emit_output(["hello", "world"]);
        let key = Uuid::new_v4();
        let params = CreateProcessParams::new(key, "/bin/echo")
            .with_arguments(["hello"])
            .with_env("CELLGUARD_TEST_VAR", "override");

        let result = create_process(&f.tracker, params).await.unwrap();

        assert!(f.tracker.is_tracked(&key));
        assert_eq!(f.tracker.get_process_by_key(&key).unwrap().get_pid(), result.id);
        let spawned = f.manager.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].executable_path, "/bin/echo");
        assert_eq!(spawned[0].arguments, vec!["hello"]);
        assert_eq!(
            spawned[0].environment,
            HashMap::from([("CELLGUARD_TEST_VAR".to_string(), "override".to_string())])
        );

        let events = f.publisher.events();
        let lines: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(lines, vec!["hello", "world"]);
        assert!(events.iter().all(|e| e.key == key && e.data_type == ProcessDataType::Stdout));
    }

    #[tokio::test]
    async fn test_create_process_without_environment_gets_the_workers() {
        let f = fixture();
        create_process(&f.tracker, CreateProcessParams::new(Uuid::new_v4(), "/bin/true"))
            .await
            .unwrap();

        let expected = process_environment(HashMap::new());
        assert_eq!(f.manager.spawned()[0].environment, expected);
    }

    #[tokio::test]
    async fn test_create_process_rejects_tracked_key_before_spawning() {
        let f = fixture();
        let key = Uuid::new_v4();
        create_process(&f.tracker, CreateProcessParams::new(key, "/bin/sleep"))
            .await
            .unwrap();

        let err = create_process(&f.tracker, CreateProcessParams::new(key, "/bin/sleep"))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            format!("A process with key '{key}' is already being tracked.")
        );
        assert_eq!(f.manager.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_kills_exactly_once_after_grace_period() {
        let f = fixture();
        let key = Uuid::new_v4();
        let result = create_process(&f.tracker, CreateProcessParams::new(key, "/bin/sleep"))
            .await
            .unwrap();
        f.manager.set_descendants(vec![501, 500]);

        stop_process(&f.tracker, stop_params(key, Duration::from_millis(50)))
            .await
            .unwrap();

        let process = f.manager.process(result.id).unwrap();
        assert_eq!(process.request_count(), 1);
        assert_eq!(process.wait_count(), 1);
        assert_eq!(process.kill_count(), 1);
        assert_eq!(f.manager.terminated(), vec![501, 500]);
        // stopping does not untrack; the exit is still observable
        assert!(f.tracker.is_tracked(&key));
    }

    #[tokio::test]
    async fn test_stop_kills_when_waiting_fails() {
        let f = fixture();
        let key = Uuid::new_v4();
        let result = create_process(&f.tracker, CreateProcessParams::new(key, "/bin/sleep"))
            .await
            .unwrap();
        f.manager.set_descendants(vec![600]);
        let process = f.manager.process(result.id).unwrap();
        process.fail_waits();

        stop_process(&f.tracker, stop_params(key, Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(process.wait_count(), 1);
        assert_eq!(process.kill_count(), 1);
        assert_eq!(f.manager.terminated(), vec![600]);
    }

    #[tokio::test]
    async fn test_stop_of_cooperative_process_does_not_kill() {
        let f = fixture();
        f.manager.spawn_cooperative();
        let key = Uuid::new_v4();
        let result = create_process(&f.tracker, CreateProcessParams::new(key, "/bin/sleep"))
            .await
            .unwrap();

        stop_process(&f.tracker, stop_params(key, Duration::from_secs(5)))
            .await
            .unwrap();

        let process = f.manager.process(result.id).unwrap();
        assert_eq!(process.kill_count(), 0);
        assert!(f.manager.terminated().is_empty());
    }

    #[tokio::test]
    async fn test_stop_of_unknown_key_is_a_no_op() {
        let f = fixture();
        stop_process(&f.tracker, stop_params(Uuid::new_v4(), Duration::from_millis(10)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_exit_reports_and_untracks() {
        let f = fixture();
        let key = Uuid::new_v4();
        let result = create_process(&f.tracker, CreateProcessParams::new(key, "/bin/false"))
            .await
            .unwrap();
        let process = f.manager.process(result.id).unwrap();
        assert_eq!(process.exit_code().await, None);
        process.finish(1);
        assert_eq!(process.exit_code().await, Some(1));

        let exit = wait_for_process_exit(&f.tracker, wait_params(key, Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(
            exit,
            WaitForProcessExitResult {
                exited: true,
                exit_code: 1
            }
        );
        assert!(!f.tracker.is_tracked(&key));

        let err = wait_for_process_exit(&f.tracker, wait_params(key, Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("A process with key '{key}' is not being tracked.")
        );
    }

    #[tokio::test]
    async fn test_wait_for_exit_times_out_without_untracking() {
        let f = fixture();
        let key = Uuid::new_v4();
        create_process(&f.tracker, CreateProcessParams::new(key, "/bin/sleep"))
            .await
            .unwrap();

        let exit = wait_for_process_exit(&f.tracker, wait_params(key, Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(!exit.exited);
        assert_eq!(exit.exit_code, 0);
        assert!(f.tracker.is_tracked(&key));
    }

    #[tokio::test]
    async fn test_stop_all_covers_untracked_group_members() {
        let containment = FakeContainment::with_members([1]);
        let f = fixture_with(containment.clone());
        let stranger = FakeProcess::running(77);
        f.manager.add_existing(stranger.clone());
        containment.assign_process(77).unwrap();

        let mut spawned = Vec::new();
        for _ in 0..2 {
            let result = create_process(
                &f.tracker,
                CreateProcessParams::new(Uuid::new_v4(), "/bin/sleep"),
            )
            .await
            .unwrap();
            containment.assign_process(result.id).unwrap();
            spawned.push(f.manager.process(result.id).unwrap());
        }

        stop_all_processes(&f.tracker, Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(stranger.kill_count(), 1);
        for process in spawned {
            assert_eq!(process.request_count(), 1);
            assert_eq!(process.kill_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_find_process_by_id() {
        let f = fixture();
        let key = Uuid::new_v4();
        let result = create_process(
            &f.tracker,
            CreateProcessParams::new(key, "/bin/sleep").with_env("MARKER", "1"),
        )
        .await
        .unwrap();

        let found = find_process_by_id(&f.tracker, FindProcessByIdParams { id: result.id }).unwrap();
        assert_eq!(found.process_key, key);
        assert_eq!(found.id, result.id);
        assert_eq!(found.environment["MARKER"], "1");

        assert!(find_process_by_id(&f.tracker, FindProcessByIdParams { id: 1 }).is_none());
    }

    #[tokio::test]
    async fn test_registered_methods_dispatch() {
        let f = fixture();
        let mut dispatcher = MessageDispatcher::new();
        register_handlers(&mut dispatcher, f.tracker.clone()).unwrap();

        let ping = dispatcher
            .dispatch(JsonRpcRequest::new(RequestId::from("1"), "container.ping", json!(null)))
            .await;
        assert!(ping.into_result::<bool>().unwrap());

        let missing = Uuid::new_v4();
        let wait = dispatcher
            .dispatch(JsonRpcRequest::new(
                RequestId::from("2"),
                WaitForProcessExit::NAME,
                json!({ "key": missing, "timeout": 10 }),
            ))
            .await;
        let err = wait.into_result::<WaitForProcessExitResult>().unwrap_err();
        assert_eq!(err.code(), -32603);
        assert!(err.to_string().contains("is not being tracked"));

        let duplicate = register_handlers(&mut dispatcher, f.tracker.clone()).unwrap_err();
        assert!(matches!(duplicate, ChannelError::DuplicateMethod(_)));
    }
}
