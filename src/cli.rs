use crate::engine::HttpBackend;
use crate::model::{RunReport, RunSnapshot, SyncConfig, TerminalStatus, TimelineUpdate};
use crate::orchestrator::{run_controller, TimelineCoordinator, ViewCommand};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "run-timeline",
    version,
    about = "Follow the progress timeline of a job run"
)]
pub struct Cli {
    /// Run identifier to follow
    pub run_id: Option<String>,

    /// Base URL of the job backend
    #[arg(long, default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Follow the most recently started active run
    #[arg(long, conflicts_with = "run_id")]
    pub latest: bool,

    /// Print the final timeline as JSON instead of streaming text
    #[arg(long)]
    pub json: bool,

    /// How long to wait for the live stream before falling back to polling
    #[arg(long, default_value = "5s")]
    pub grace: humantime::Duration,

    /// History polling interval while the live stream is unavailable
    #[arg(long, default_value = "3s")]
    pub poll_interval: humantime::Duration,

    /// Initial delay before the live stream reconnects
    #[arg(long, default_value = "1s")]
    pub reconnect_delay: humantime::Duration,

    /// Upper bound for the live stream reconnect backoff
    #[arg(long, default_value = "30s")]
    pub max_reconnect_delay: humantime::Duration,

    /// Keep watching after the run completes (until Ctrl-C)
    #[arg(long)]
    pub follow: bool,

    /// Read run ids from stdin to switch runs (`-` clears the view, `q` quits)
    #[arg(long, conflicts_with = "json")]
    pub interactive: bool,
}

/// Build a `SyncConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> SyncConfig {
    SyncConfig {
        base_url: args.base_url.clone(),
        grace_delay: Duration::from(args.grace),
        poll_interval: Duration::from(args.poll_interval),
        reconnect_delay: Duration::from(args.reconnect_delay),
        max_reconnect_delay: Duration::from(args.max_reconnect_delay),
        user_agent: format!("run-timeline/{}", env!("CARGO_PKG_VERSION")),
    }
}

/// Map one line of interactive input to a command.
fn parse_command(line: &str) -> ViewCommand {
    match line.trim() {
        "q" | "quit" | "exit" => ViewCommand::Quit,
        "" | "-" => ViewCommand::View(None),
        id => ViewCommand::View(Some(id.to_string())),
    }
}

fn spawn_stdin_reader(cmd_tx: mpsc::UnboundedSender<ViewCommand>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let cmd = parse_command(&line);
                    let quit = cmd == ViewCommand::Quit;
                    if cmd_tx.send(cmd).is_err() || quit {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = cmd_tx.send(ViewCommand::Quit);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    let _ = cmd_tx.send(ViewCommand::Quit);
                    break;
                }
            }
        }
    });
}

/// Print timeline updates as they arrive.
fn spawn_printer(
    mut update_rx: mpsc::UnboundedReceiver<TimelineUpdate>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = update_rx.recv().await {
            let line = match update {
                TimelineUpdate::Viewing { run_id: Some(id) } => {
                    OutputLine::Stderr(format!("== {id} =="))
                }
                TimelineUpdate::Viewing { run_id: None } => {
                    OutputLine::Stderr("== (no run selected) ==".into())
                }
                TimelineUpdate::Appended { index, event } => {
                    OutputLine::Stdout(crate::text_summary::format_event(index, &event))
                }
                TimelineUpdate::Connectivity { connected } => OutputLine::Stderr(
                    if connected { "Connected" } else { "Disconnected" }.into(),
                ),
                TimelineUpdate::Status(message) => OutputLine::Stderr(message),
                TimelineUpdate::Completed { run_id, status } => OutputLine::Stderr(
                    crate::text_summary::completion_line(&run_id, status),
                ),
            };
            if out_tx.send(line).is_err() {
                break;
            }
        }
    })
}

/// Follow the requested run(s) and return the status of the last run that finished, if any.
pub async fn run(args: Cli) -> Result<Option<TerminalStatus>> {
    let cfg = build_config(&args);
    if cfg.poll_interval.is_zero() {
        return Err(anyhow::anyhow!("--poll-interval must be greater than zero"));
    }
    let backend = HttpBackend::new(&cfg).context("failed to set up backend client")?;

    let initial = if args.latest {
        let latest = backend
            .latest_active_run()
            .await
            .context("failed to look up the latest active run")?;
        if latest.is_none() && !args.interactive {
            return Err(anyhow::anyhow!("no active run to follow"));
        }
        latest
    } else {
        args.run_id.clone()
    };
    if initial.is_none() && !args.interactive {
        return Err(anyhow::anyhow!(
            "no run to follow: pass a RUN_ID, --latest, or --interactive"
        ));
    }

    let (out_tx, out_handle) = spawn_output_writer();
    let (update_tx, update_rx) = mpsc::unbounded_channel::<TimelineUpdate>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ViewCommand>();

    let mut coordinator = TimelineCoordinator::new(backend, &cfg);
    let printer = if args.json {
        drop(update_rx);
        None
    } else {
        coordinator = coordinator.with_updates(update_tx);
        Some(spawn_printer(update_rx, out_tx.clone()))
    };
    let last_status: Arc<Mutex<Option<TerminalStatus>>> = Arc::default();
    let last_status2 = last_status.clone();
    coordinator.on_complete(move |run_id, status| {
        tracing::info!(run_id, %status, "run finished");
        if let Ok(mut last) = last_status2.lock() {
            *last = Some(status);
        }
    });

    let ctrl_tx = cmd_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_tx.send(ViewCommand::Quit);
        }
    });
    if args.interactive {
        spawn_stdin_reader(cmd_tx.clone());
    }

    coordinator.set_viewed_run(initial);
    let exit_on_complete = !args.follow && !args.interactive;
    let snapshot = run_controller(coordinator, cmd_rx, exit_on_complete).await?;
    drop(cmd_tx);

    // The coordinator (and with it the update sender) is gone; let the printer drain.
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    emit_result(&args, &cfg, snapshot, &out_tx)?;

    drop(out_tx);
    let _ = out_handle.await;
    let status = last_status.lock().map(|s| *s).unwrap_or(None);
    Ok(status)
}

fn emit_result(
    args: &Cli,
    cfg: &SyncConfig,
    snapshot: RunSnapshot,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    if args.json {
        let report = RunReport {
            config: cfg.clone(),
            snapshot,
        };
        let out = serde_json::to_string_pretty(&report).context("failed to encode report")?;
        let _ = out_tx.send(OutputLine::Stdout(out));
        return Ok(());
    }
    let summary = crate::text_summary::build_text_summary(&snapshot);
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stderr(line));
    }
    Ok(())
}
