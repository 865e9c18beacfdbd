use crate::engine::{EngineControl, RunEngine, StreamGauge};
use crate::model::{RunConfig, RunEvent};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
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
    name = "receiptctl",
    version,
    about = "Receipt-processing client with live progress streaming"
)]
pub struct Cli {
    /// Base URL of the receipt-processing backend
    #[arg(long, env = "RECEIPTCTL_BASE_URL", default_value = "http://127.0.0.1:5002")]
    pub base_url: String,

    /// Print the final run report as JSON and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Abort the start-processing call when no response arrives in time
    #[arg(long, default_value = "10m")]
    pub process_timeout: humantime::Duration,

    /// Treat the progress stream as dead after this long without a message
    #[arg(long, default_value = "90s")]
    pub stream_idle_timeout: humantime::Duration,

    /// Local receipt files to push to the backend before processing
    #[arg(long = "upload", value_name = "FILE")]
    pub upload: Vec<PathBuf>,

    /// Where to save the downloaded spreadsheet (default: download directory)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Skip the server-side folder-selection step
    #[arg(long)]
    pub no_select: bool,

    /// Fetch and save the result spreadsheet after each completed run
    #[arg(long)]
    pub download: bool,
}

pub async fn run(args: Cli) -> Result<()> {
    if args.json && args.text {
        return Err(anyhow::anyhow!("--json and --text are mutually exclusive"));
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(args).await;
        }
    }

    if args.json {
        return run_json(args).await;
    }

    run_text(args).await
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        process_timeout: args.process_timeout.into(),
        stream_idle_timeout: args.stream_idle_timeout.into(),
        user_agent: format!("receiptctl/{}", env!("CARGO_PKG_VERSION")),
        upload_paths: args.upload.clone(),
        output_dir: args.output_dir.clone(),
        skip_selection: args.no_select,
        refresh_on_complete: true,
        download_on_complete: args.download,
    }
}

/// One-shot preparation shared by text and JSON modes: selection gate, then
/// uploads. Processing must not start unless both succeed.
async fn prepare(cfg: &RunConfig, client: &crate::engine::BackendClient) -> Result<()> {
    if !cfg.skip_selection {
        client
            .select_folder()
            .await
            .context("folder selection step failed")?;
    }
    for path in &cfg.upload_paths {
        client
            .upload_file(path)
            .await
            .with_context(|| format!("upload of {} failed", path.display()))?;
    }
    Ok(())
}

async fn run_json(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let client = crate::engine::BackendClient::new(&cfg)?;
    prepare(&cfg, &client).await?;

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (_, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();

    let engine = RunEngine::new(cfg.clone());
    let run_client = client.clone();
    let handle = tokio::spawn(async move {
        engine
            .run(run_client, StreamGauge::default(), evt_tx, ctrl_rx)
            .await
    });

    // stdout stays machine-readable; failures still reach the user on stderr.
    while let Some(ev) = evt_rx.recv().await {
        if let Some(line) = json_mode_stderr(&ev) {
            let _ = out_tx.send(OutputLine::Stderr(line));
        }
    }

    let report = handle
        .await
        .context("run task failed")?
        .context("processing run failed")?;

    let out = serde_json::to_string_pretty(&report)?;
    let _ = out_tx.send(OutputLine::Stdout(out));

    if args.download {
        let path = fetch_spreadsheet(&cfg, &client).await?;
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", path.display())));
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

/// Events worth surfacing on stderr while `--json` keeps stdout clean.
fn json_mode_stderr(ev: &RunEvent) -> Option<String> {
    match ev {
        RunEvent::Notice(n) => Some(n.to_message()),
        RunEvent::RunFailed { message } => Some(message.clone()),
        _ => None,
    }
}

async fn run_text(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let client = crate::engine::BackendClient::new(&cfg)?;
    prepare(&cfg, &client).await?;

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (_, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();

    let engine = RunEngine::new(cfg.clone());
    let gauge = StreamGauge::default();
    let run_client = client.clone();
    let handle = tokio::spawn(async move { engine.run(run_client, gauge, evt_tx, ctrl_rx).await });

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            RunEvent::RunStarted => {
                let _ = out_tx.send(OutputLine::Stderr("== Processing ==".into()));
            }
            RunEvent::Progress { percent } => {
                let _ = out_tx.send(OutputLine::Stderr(format!("Progress: {percent}%")));
            }
            RunEvent::SummaryArrived { summary } => {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "Server reports {} / {} receipts processed",
                    summary.processed, summary.total
                )));
            }
            RunEvent::Notice(n) => {
                let _ = out_tx.send(OutputLine::Stderr(n.to_message()));
            }
            // Completion and list events come from the controller in TUI mode,
            // not from the engine; nothing to do for them here.
            _ => {}
        }
    }

    let report = handle
        .await
        .context("run task failed")?
        .context("processing run failed")?;

    let _ = out_tx.send(OutputLine::Stdout(format!(
        "Processed {} / {} receipts (progress {}%, {} ms)",
        report.summary.processed, report.summary.total, report.final_progress, report.duration_ms
    )));

    if args.download {
        let path = fetch_spreadsheet(&cfg, &client).await?;
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", path.display())));
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn fetch_spreadsheet(
    cfg: &RunConfig,
    client: &crate::engine::BackendClient,
) -> Result<std::path::PathBuf> {
    let bytes = client.download_spreadsheet().await?;
    let dir = crate::storage::output_dir(cfg.output_dir.as_deref());
    crate::storage::save_spreadsheet(&dir, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Notice;

    #[test]
    fn json_mode_routes_failures_to_stderr_only() {
        let notice = RunEvent::Notice(Notice::Message("progress stream error: reset".into()));
        assert_eq!(
            json_mode_stderr(&notice).as_deref(),
            Some("progress stream error: reset")
        );
        let failed = RunEvent::RunFailed {
            message: "processing could not be started: HTTP 500".into(),
        };
        assert!(json_mode_stderr(&failed).is_some());
        // Progress chatter must not pollute either channel in JSON mode.
        assert!(json_mode_stderr(&RunEvent::Progress { percent: 50 }).is_none());
        assert!(json_mode_stderr(&RunEvent::RunStarted).is_none());
    }
}
