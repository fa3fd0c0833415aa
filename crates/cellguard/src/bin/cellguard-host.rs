use anyhow::Context;
use cellguard::host::ContainerHost;
use cellguard::logging::{self, LogFormat};
use cellguard::{ChannelTimeouts, MessageTransport, PlatformFactory};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Sandbox worker: runs processes for an orchestrator speaking over stdin and stdout.
#[derive(Debug, Parser)]
#[command(name = "cellguard-host", version, about)]
struct Args {
    /// Identifier of the sandbox this worker serves
    sandbox_id: String,

    /// Containment group the orchestrator created for this sandbox
    #[arg(long)]
    containment_group: String,

    /// Directory holding per-sandbox cgroups (Linux)
    #[arg(long)]
    cgroup_root: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Grace period in milliseconds given to every process when the channel closes
    #[arg(long, default_value_t = ChannelTimeouts::default().default_stop_timeout_ms)]
    stop_timeout_ms: u64,
}

/// Report to the orchestrator on stderr; only the first line is read during startup
fn report(line: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", line.replace('\n', " "));
    let _ = stderr.flush();
}

fn start_host(args: &Args) -> anyhow::Result<ContainerHost> {
    let own_pid = std::process::id();
    let containment = PlatformFactory::open_containment(
        &args.containment_group,
        args.cgroup_root.as_deref(),
        own_pid,
    )
    .with_context(|| format!("cannot open containment group '{}'", args.containment_group))?;

    let transport = Arc::new(MessageTransport::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
    ));
    let host = ContainerHost::new(
        transport,
        containment,
        PlatformFactory::process_manager(),
        own_pid,
    )?;
    host.start();
    Ok(host)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let host = match start_host(&args) {
        Ok(host) => host,
        Err(e) => {
            report(&format!("{e:#}"));
            return Err(e);
        }
    };
    report("OK");

    // stderr belongs to the handshake until it is done
    logging::init(args.log_format);
    info!(
        sandbox = %args.sandbox_id,
        group = %args.containment_group,
        platform = PlatformFactory::platform_name(),
        "Worker ready"
    );

    host.run_until_closed().await;
    host.shutdown(Duration::from_millis(args.stop_timeout_ms))
        .await;
    info!(sandbox = %args.sandbox_id, "Worker exiting");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            report(&format!("cannot start the async runtime: {e}"));
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(args));
    // a blocked stdin read must not keep the process alive
    runtime.shutdown_timeout(Duration::from_millis(500));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Worker failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
