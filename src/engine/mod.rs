mod backend;
mod progress;

pub use backend::BackendClient;
pub use progress::{StreamGauge, StreamSignal, Subscription};

use crate::error::ClientError;
use crate::model::{Notice, ProcessingRun, ProcessingSummary, RunConfig, RunEvent, RunReport};
use anyhow::{Context, Result};
use futures::{Future, FutureExt};
use std::pin::pin;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Cancel the run entirely: close the stream, abandon the trigger.
    Cancel,
}

/// Drives one processing run: opens the progress subscription, fires the
/// start-processing request, and reconciles their completion signals.
pub struct RunEngine {
    cfg: RunConfig,
}

impl RunEngine {
    pub fn new(cfg: RunConfig) -> Self {
        Self { cfg }
    }

    pub async fn run(
        self,
        client: BackendClient,
        gauge: StreamGauge,
        event_tx: mpsc::UnboundedSender<RunEvent>,
        ctrl_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<RunReport> {
        let started_at = Instant::now();
        let (sig_tx, sig_rx) = mpsc::unbounded_channel::<StreamSignal>();

        // The stream opens concurrently with the trigger request, not after
        // its response; completion signals may arrive in either order.
        let subscription = progress::subscribe(
            client.http.clone(),
            client.progress_url()?,
            self.cfg.stream_idle_timeout,
            gauge,
            sig_tx,
        );

        let outcome = reconcile(
            client.start_processing(),
            sig_rx,
            ctrl_rx,
            event_tx.clone(),
        )
        .await;

        // Idempotent; a no-op when the stream already terminated on its own.
        subscription.close();

        let run = outcome?;
        let summary = run.summary().context("run settled without a summary")?;

        Ok(RunReport {
            timestamp_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            base_url: self.cfg.base_url.clone(),
            summary,
            final_progress: run.progress(),
            duration_ms: started_at.elapsed().as_millis() as u64,
        })
    }
}

/// Merge the trigger's response with the stream's signals into one final run
/// state, accepting either arrival order.
///
/// The run returns once the trigger has settled and the stream has terminated.
/// A trigger failure ends the run immediately; a stream failure only ends the
/// stream side, the processing flag still clears when the trigger settles.
async fn reconcile<F>(
    start: F,
    mut signals: mpsc::UnboundedReceiver<StreamSignal>,
    mut ctrl_rx: mpsc::UnboundedReceiver<EngineControl>,
    event_tx: mpsc::UnboundedSender<RunEvent>,
) -> Result<ProcessingRun>
where
    F: Future<Output = Result<ProcessingSummary, ClientError>>,
{
    let mut run = ProcessingRun::start();
    let _ = event_tx.send(RunEvent::RunStarted);

    let mut start = pin!(start.fuse());
    let mut start_done = false;
    let mut stream_open = true;
    let mut ctrl_open = true;

    loop {
        tokio::select! {
            res = &mut start, if !start_done => {
                start_done = true;
                run.settle();
                match res {
                    Ok(summary) => {
                        run.finish(summary);
                        let _ = event_tx.send(RunEvent::SummaryArrived { summary });
                    }
                    Err(e) => {
                        // No partial state: summary stays unset, processing is
                        // already cleared by settle().
                        return Err(e.into());
                    }
                }
            }
            sig = signals.recv(), if stream_open => {
                match sig {
                    Some(StreamSignal::Progress(raw)) => {
                        let percent = run.observe_progress(raw);
                        let _ = event_tx.send(RunEvent::Progress { percent });
                    }
                    Some(StreamSignal::Error(e)) => {
                        stream_open = false;
                        let _ = event_tx.send(RunEvent::Notice(Notice::Message(e.to_string())));
                    }
                    Some(StreamSignal::Closed) | None => {
                        stream_open = false;
                    }
                }
            }
            cmd = ctrl_rx.recv(), if ctrl_open => {
                match cmd {
                    Some(EngineControl::Cancel) => {
                        return Err(anyhow::anyhow!("run cancelled"));
                    }
                    // Controller went away; keep the run going.
                    None => ctrl_open = false,
                }
            }
        }

        if start_done && !stream_open {
            break;
        }
    }

    Ok(run)
}
