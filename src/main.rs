use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use opswatch_rs::config::EngineConfig;
use opswatch_rs::ports::parse_port_range;
use opswatch_rs::server::{self, AppState};
use opswatch_rs::sink::{
    BroadcastAlertSink, JsonlStore, MemoryStore, PersistAlerts, Persistence, TeeStore,
};
use opswatch_rs::types::{Alert, JobId, TaskKind, TaskResults, TaskState, TaskView};
use opswatch_rs::Engine;

/// opswatch-rs: cancellable port scans and host monitors with alerting.
#[derive(Debug, Parser)]
#[command(
    name = "opswatch-rs",
    version,
    about = "Cancellable port scans and host monitors with alerting and a small HTTP status API.",
    long_about = None
)]
struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append sessions, results and alerts to this JSON-lines file.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG overrides it.
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long = "json-logs", global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// TCP connect scan of one host.
    Scan {
        /// Hostname or IP address.
        target: String,

        /// Inclusive port range, e.g. `1-1024` or `22`.
        #[arg(long)]
        ports: Option<String>,

        /// Per-port connect timeout in milliseconds.
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,

        /// Write the final job view as pretty JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Poll system metrics or the process list until Ctrl+C.
    Monitor {
        #[arg(long, value_enum, default_value_t = MonitorKind::System)]
        kind: MonitorKind,

        #[arg(long = "interval-ms")]
        interval_ms: Option<u64>,

        /// Stop after this many seconds instead of waiting for Ctrl+C.
        #[arg(long = "duration-secs")]
        duration_secs: Option<u64>,
    },
    /// Serve the HTTP job API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MonitorKind {
    System,
    Process,
}

impl From<MonitorKind> for TaskKind {
    fn from(k: MonitorKind) -> Self {
        match k {
            MonitorKind::System => TaskKind::SystemMonitor,
            MonitorKind::Process => TaskKind::ProcessMonitor,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = EngineConfig::load(cli.config.as_deref())?;
    let memory = Arc::new(MemoryStore::with_limits(
        config.alert_history_limit,
        config.result_history_limit,
    ));
    let persistence: Arc<dyn Persistence> = match cli.store.as_deref() {
        Some(path) => {
            let file = JsonlStore::open(path)
                .with_context(|| format!("failed to open store {}", path.display()))?;
            // The HTTP read side sees everything written to the file.
            Arc::new(TeeStore::new(Arc::new(file), memory.clone()))
        }
        None => memory.clone(),
    };

    let engine = Arc::new(Engine::new(config, persistence.clone()));
    engine.alerts().subscribe(Arc::new(PersistAlerts(persistence)));

    match cli.command {
        Command::Scan {
            target,
            ports,
            timeout_ms,
            output,
        } => {
            let config = engine.config();
            let (start, end) = match ports.as_deref() {
                Some(spec) => parse_port_range(spec)?,
                None => (config.default_start_port, config.default_end_port),
            };
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.scan_timeout());
            run_scan(&engine, &target, start, end, timeout, output.as_deref()).await
        }
        Command::Monitor {
            kind,
            interval_ms,
            duration_secs,
        } => {
            let console = BroadcastAlertSink::new(engine.config().alert_buffer);
            spawn_alert_printer(console.subscribe());
            engine.alerts().subscribe(Arc::new(console));
            let kind = TaskKind::from(kind);
            let config = engine.config();
            let interval = interval_ms.map(Duration::from_millis).unwrap_or(match kind {
                TaskKind::ProcessMonitor => config.process_interval(),
                _ => config.monitor_interval(),
            });
            run_monitor(&engine, kind, interval, duration_secs).await
        }
        Command::Serve { bind } => {
            let state = AppState::new(engine.clone(), Some(memory));
            println!("Serving API on http://{bind}/api (Ctrl+C to stop)");
            server::spawn_server(&bind, state, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
            engine.shutdown().await;
            Ok(())
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "opswatch_rs={},tower_http=info,hyper=warn",
            cli.log_level.to_lowercase()
        ))
    })?;

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
    Ok(())
}

async fn run_scan(
    engine: &Arc<Engine>,
    target: &str,
    start: u16,
    end: u16,
    timeout: Duration,
    output: Option<&Path>,
) -> Result<()> {
    println!("Scanning {target} ports {start}-{end} (timeout {timeout:?})...");
    let id = engine.start_port_scan(target, start, end, timeout).await?;
    let ctrlc = spawn_ctrlc_cancel(engine.clone(), id);

    let mut last = 0u8;
    let view = loop {
        let view = engine.snapshot(id).await?;
        if view.state.is_terminal() {
            break engine.wait(id).await?;
        }
        if view.progress >= last.saturating_add(10) {
            last = view.progress;
            info!(job = %id, progress = view.progress, "scan progress");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    ctrlc.abort();

    print_results_table(&view);
    if let Some(path) = output {
        if let Err(e) = write_results_json(path, &view) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }
    match view.state {
        TaskState::Failed => anyhow::bail!(
            "scan failed: {}",
            view.error.unwrap_or_else(|| "unknown error".into())
        ),
        _ => Ok(()),
    }
}

async fn run_monitor(
    engine: &Arc<Engine>,
    kind: TaskKind,
    interval: Duration,
    duration_secs: Option<u64>,
) -> Result<()> {
    let thresholds = engine.config().thresholds;
    let id = engine.start_monitor(kind, interval, thresholds).await?;
    println!("Started {kind} as {id} (interval {interval:?}); Ctrl+C to stop");

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    engine.cancel(id).await?;
    let view = engine.wait(id).await?;
    if let TaskResults::Monitor { samples_total, .. } = view.results {
        println!("{id}: {} after {samples_total} samples", view.state);
    }
    Ok(())
}

fn spawn_ctrlc_cancel(engine: Arc<Engine>, id: JobId) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = engine.cancel(id).await {
                warn!(job = %id, error = %e, "cancel on Ctrl+C failed");
            }
        }
    })
}

/// Prints alerts as they arrive on the broadcast channel.
fn spawn_alert_printer(mut rx: broadcast::Receiver<Alert>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(alert) => println!(
                    "[{}] {:<8} {:<8} {}",
                    alert.job_id, alert.severity, alert.category, alert.message
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "console fell behind, alerts dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_results_table(view: &TaskView) {
    let hits = match &view.results {
        TaskResults::Scan { hits } => hits.as_slice(),
        TaskResults::Monitor { .. } => &[][..],
    };
    let port_w = 5usize.max("port".len());
    let mut service_w = "service".len();
    for h in hits {
        service_w = service_w.max(h.service.len());
    }
    let ts_w = "discovered_at".len().max(20);

    println!(
        "\n{}: {} ({}%), open ports: {}",
        view.id,
        view.state,
        view.progress,
        hits.len()
    );
    if let Some(err) = &view.error {
        println!("error: {err}");
    }
    println!(
        "{:>port_w$}  {:<service_w$}  {:<ts_w$}",
        "port",
        "service",
        "discovered_at",
        port_w = port_w,
        service_w = service_w,
        ts_w = ts_w
    );
    println!(
        "{:-<port_w$}  {:-<service_w$}  {:-<ts_w$}",
        "",
        "",
        "",
        port_w = port_w,
        service_w = service_w,
        ts_w = ts_w
    );
    for h in hits {
        let ts = h
            .discovered_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        println!(
            "{:>port_w$}  {:<service_w$}  {:<ts_w$}",
            h.port,
            h.service,
            ts,
            port_w = port_w,
            service_w = service_w,
            ts_w = ts_w
        );
    }
}

fn write_results_json(path: &Path, view: &TaskView) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, view)?;
    Ok(())
}
