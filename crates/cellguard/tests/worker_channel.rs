#![cfg(unix)]

use cellguard::protocol::{CreateProcessParams, ProcessDataEvent, ProcessDataType};
use cellguard::{
    ChannelError, ChannelTimeouts, LauncherConfig, MAX_OUTPUT_CHUNK, WorkerClient, WorkerLauncher,
};
use cellguard_unix::ProcessTreeContainment;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const WORKER: &str = env!("CARGO_BIN_EXE_cellguard-host");

fn launcher(executable: &str, sandbox_id: &str, timeouts: ChannelTimeouts) -> WorkerLauncher {
    let config = LauncherConfig::builder()
        .worker_executable(executable)
        .sandbox_id(sandbox_id)
        .timeouts(timeouts)
        .build()
        .unwrap();
    let group = ProcessTreeContainment::new(format!("test-{}", Uuid::new_v4().simple()));
    WorkerLauncher::new(config, Arc::new(group))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

async fn start_worker(sandbox_id: &str) -> WorkerClient {
    init_tracing();
    launcher(WORKER, sandbox_id, ChannelTimeouts::default())
        .launch()
        .await
        .unwrap()
}

/// Shell script passed as the sandbox id, so `/bin/sh` can stand in for a broken worker
fn script(dir: &Path, body: &str) -> String {
    let path = dir.join("worker.sh");
    std::fs::write(&path, body).unwrap();
    path.display().to_string()
}

#[tokio::test]
async fn test_ping() {
    let worker = start_worker("ping").await;

    assert!(worker.ping().await.unwrap());

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_process_output_arrives_before_exit() {
    let worker = start_worker("echo").await;
    let key = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ProcessDataEvent>();
    worker.subscribe_to_process_data(key, move |event| {
        let _ = tx.send(event);
    });

    worker
        .create_process(CreateProcessParams::new(key, "/bin/echo").with_arguments(["hi"]))
        .await
        .unwrap();
    let exit = worker
        .wait_for_process_exit(key, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(exit.exited);
    assert_eq!(exit.exit_code, 0);

    let event = rx.try_recv().unwrap();
    assert_eq!(event.key, key);
    assert_eq!(event.data_type, ProcessDataType::Stdout);
    assert_eq!(event.data, "hi");

    // the exit was consumed; the key is no longer tracked
    let err = worker
        .wait_for_process_exit(key, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Remote { code: -32603, .. }));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_long_output_line_arrives_in_pieces() {
    let worker = start_worker("long-line").await;
    let key = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ProcessDataEvent>();
    worker.subscribe_to_process_data(key, move |event| {
        let _ = tx.send(event);
    });

    worker
        .create_process(
            CreateProcessParams::new(key, "/bin/sh")
                .with_arguments(["-c", "head -c 200000 /dev/zero | tr '\\0' x"])
                .with_env("PATH", "/usr/bin:/bin"),
        )
        .await
        .unwrap();
    let exit = worker
        .wait_for_process_exit(key, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(exit.exited);
    assert_eq!(exit.exit_code, 0);

    let mut output = String::new();
    let mut pieces = 0;
    while let Ok(event) = rx.try_recv() {
        assert!(event.data.len() <= MAX_OUTPUT_CHUNK);
        output.push_str(&event.data);
        pieces += 1;
    }
    assert!(pieces > 1);
    assert_eq!(output, "x".repeat(200_000));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_process_terminates_sleeper() {
    let worker = start_worker("stop").await;
    let key = Uuid::new_v4();
    worker
        .create_process(CreateProcessParams::new(key, "/bin/sleep").with_arguments(["30"]))
        .await
        .unwrap();

    worker
        .stop_process(key, Duration::from_millis(500))
        .await
        .unwrap();
    let exit = worker
        .wait_for_process_exit(key, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(exit.exited);
    assert_ne!(exit.exit_code, 0);
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_find_process_by_id_and_stop_all() {
    let worker = start_worker("find").await;
    let key = Uuid::new_v4();
    let created = worker
        .create_process(
            CreateProcessParams::new(key, "/bin/sleep")
                .with_arguments(["30"])
                .with_env("CELLGUARD_MARKER", "present"),
        )
        .await
        .unwrap();

    let found = worker.find_process_by_id(created.id).await.unwrap().unwrap();
    assert_eq!(found.process_key, key);
    assert_eq!(found.id, created.id);
    assert_eq!(found.environment["CELLGUARD_MARKER"], "present");
    assert_eq!(found.environment.len(), 1);
    assert!(worker.find_process_by_id(1).await.unwrap().is_none());

    worker
        .stop_all_processes(Duration::from_millis(500))
        .await
        .unwrap();
    let exit = worker
        .wait_for_process_exit(key, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(exit.exited);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_children_see_only_configured_environment() {
    init_tracing();
    let config = LauncherConfig::builder()
        .worker_executable(WORKER)
        .sandbox_id("environment")
        .env("CELLGUARD_WORKER", "1")
        .build()
        .unwrap();
    let group = ProcessTreeContainment::new(format!("test-{}", Uuid::new_v4().simple()));
    let worker = WorkerLauncher::new(config, Arc::new(group))
        .launch()
        .await
        .unwrap();
    let key = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ProcessDataEvent>();
    worker.subscribe_to_process_data(key, move |event| {
        let _ = tx.send(event);
    });

    // no environment requested: the child gets the worker's, which is only what was configured
    worker
        .create_process(CreateProcessParams::new(key, "/usr/bin/env"))
        .await
        .unwrap();
    let exit = worker
        .wait_for_process_exit(key, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(exit.exited);

    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        lines.push(event.data);
    }
    assert_eq!(lines, vec!["CELLGUARD_WORKER=1"]);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_further_calls() {
    let worker = start_worker("shutdown").await;
    worker
        .create_process(CreateProcessParams::new(Uuid::new_v4(), "/bin/sleep").with_arguments(["30"]))
        .await
        .unwrap();

    worker.shutdown().await.unwrap();

    assert!(worker.has_exited());
    assert!(matches!(worker.ping().await, Err(ChannelError::Cancelled)));
}

#[tokio::test]
async fn test_startup_error_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = script(dir.path(), "echo 'no sandbox for you' >&2\nexit 3\n");

    let err = launcher("/bin/sh", &sandbox, ChannelTimeouts::default())
        .launch()
        .await
        .err()
        .unwrap();

    match err {
        ChannelError::Launch(message) => {
            assert!(message.contains("failed to start with the error: no sandbox for you"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_silent_worker_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = script(dir.path(), "exec sleep 30\n");
    let timeouts = ChannelTimeouts {
        handshake_timeout_ms: 300,
        ..ChannelTimeouts::default()
    };

    let err = launcher("/bin/sh", &sandbox, timeouts)
        .launch()
        .await
        .err()
        .unwrap();

    assert!(matches!(err, ChannelError::Launch(ref m) if m.contains("did not report ready")));
}

#[tokio::test]
async fn test_missing_worker_executable() {
    let err = launcher("/nonexistent/cellguard-host", "missing", ChannelTimeouts::default())
        .launch()
        .await
        .err()
        .unwrap();

    assert!(matches!(err, ChannelError::Launch(_)));
}
