//! Run lifecycle controller.
//!
//! Holds the single slot for the active run. A new run can only begin after
//! the previous run's task has completed, which in turn only happens once its
//! stream subscription is closed; a replacement run therefore never overlaps
//! with a prior open channel.

use crate::engine::{BackendClient, EngineControl, RunEngine, StreamGauge};
use crate::model::{Notice, RunConfig, RunEvent, RunReport};
use crate::storage;
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Commands emitted by UI/CLI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    SelectFolder,
    StartRun,
    Download,
    RefreshReceipts,
    Quit,
}

/// Handle for the active run task.
struct RunCtx {
    ctrl_tx: UnboundedSender<EngineControl>,
    handle: Option<tokio::task::JoinHandle<Result<RunReport>>>,
}

fn start_run(
    cfg: &RunConfig,
    client: &BackendClient,
    gauge: &StreamGauge,
    event_tx: UnboundedSender<RunEvent>,
) -> RunCtx {
    let (ctrl_tx, ctrl_rx) = tokio::sync::mpsc::unbounded_channel::<EngineControl>();
    let engine = RunEngine::new(cfg.clone());
    let client = client.clone();
    let gauge = gauge.clone();
    let handle = tokio::spawn(async move { engine.run(client, gauge, event_tx, ctrl_rx).await });
    RunCtx {
        ctrl_tx,
        handle: Some(handle),
    }
}

/// Process commands and own the active run until quit.
pub(crate) async fn run_controller(
    cfg: RunConfig,
    client: BackendClient,
    gauge: StreamGauge,
    event_tx: UnboundedSender<RunEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut folder_selected = cfg.skip_selection;
    let mut run_ctx: Option<RunCtx> = None;
    // Starting while a previous run is still winding down is serialized:
    // cancel first, start the replacement once completion is observed.
    let mut start_pending = false;
    let mut quit_pending = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::SelectFolder) => {
                        match client.select_folder().await {
                            Ok(()) => {
                                folder_selected = true;
                                let _ = event_tx.send(RunEvent::FolderSelected);
                            }
                            Err(e) => {
                                let _ = event_tx.send(RunEvent::Notice(Notice::Message(e.to_string())));
                            }
                        }
                    }
                    Some(UiCommand::StartRun) => {
                        if !folder_selected {
                            let _ = event_tx.send(RunEvent::Notice(Notice::SelectionRequired));
                        } else if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                            let _ = event_tx.send(RunEvent::Notice(Notice::Cancelling));
                            start_pending = true;
                        } else if upload_pending_files(&cfg, &client, &event_tx).await {
                            run_ctx = Some(start_run(&cfg, &client, &gauge, event_tx.clone()));
                        }
                    }
                    Some(UiCommand::Download) => {
                        download_spreadsheet(&cfg, &client, &event_tx).await;
                    }
                    Some(UiCommand::RefreshReceipts) => {
                        match client.fetch_receipts().await {
                            Ok(receipts) => {
                                let _ = event_tx.send(RunEvent::ReceiptsLoaded { receipts });
                            }
                            Err(e) => {
                                let _ = event_tx.send(RunEvent::Notice(Notice::Message(e.to_string())));
                            }
                        }
                    }
                    Some(UiCommand::Quit) => {
                        // Quit waits for the current run so teardown is clean.
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                            let _ = event_tx.send(RunEvent::Notice(Notice::Cancelling));
                        } else {
                            break Ok(());
                        }
                    }
                    None => {
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                        } else {
                            break Ok(());
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it
            // can be dropped if another branch is chosen and completion is
            // never observed.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(ctx) = &mut run_ctx {
                        ctx.handle.take();
                    }
                    match join_res {
                        Ok(Ok(report)) => {
                            let _ = event_tx.send(RunEvent::RunCompleted { report: Box::new(report) });
                            if cfg.refresh_on_complete {
                                if let Ok(receipts) = client.fetch_receipts().await {
                                    let _ = event_tx.send(RunEvent::ReceiptsLoaded { receipts });
                                }
                            }
                            if cfg.download_on_complete {
                                download_spreadsheet(&cfg, &client, &event_tx).await;
                            }
                        }
                        Ok(Err(e)) => {
                            let _ = event_tx.send(RunEvent::RunFailed { message: format!("{e:#}") });
                        }
                        Err(e) => {
                            let _ = event_tx.send(RunEvent::RunFailed { message: format!("run join failed: {e}") });
                        }
                    }
                    run_ctx = None;
                    if quit_pending {
                        break Ok(());
                    }
                    if start_pending {
                        start_pending = false;
                        if upload_pending_files(&cfg, &client, &event_tx).await {
                            run_ctx = Some(start_run(&cfg, &client, &gauge, event_tx.clone()));
                        }
                    }
                }
            }
        }
    }
}

/// Fetch the spreadsheet and save it to the output directory; used by the
/// explicit download command and the post-completion download.
async fn download_spreadsheet(
    cfg: &RunConfig,
    client: &BackendClient,
    event_tx: &UnboundedSender<RunEvent>,
) {
    match client.download_spreadsheet().await {
        Ok(bytes) => {
            let dir = storage::output_dir(cfg.output_dir.as_deref());
            match storage::save_spreadsheet(&dir, &bytes) {
                Ok(path) => {
                    let _ = event_tx.send(RunEvent::Downloaded { path });
                }
                Err(e) => {
                    let _ = event_tx.send(RunEvent::Notice(Notice::Message(format!(
                        "download failed: {e:#}"
                    ))));
                }
            }
        }
        Err(e) => {
            let _ = event_tx.send(RunEvent::Notice(Notice::Message(e.to_string())));
        }
    }
}

/// Push configured local files before a run. Returns false when an upload
/// fails; the run must not start on partial input.
async fn upload_pending_files(
    cfg: &RunConfig,
    client: &BackendClient,
    event_tx: &UnboundedSender<RunEvent>,
) -> bool {
    for path in &cfg.upload_paths {
        if let Err(e) = client.upload_file(path).await {
            let _ = event_tx.send(RunEvent::RunFailed {
                message: e.to_string(),
            });
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessingSummary;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    /// Minimal backend double on a local socket. `/process` replies only once
    /// released; the progress channel either terminates at 100 or stays open
    /// with a single low value, depending on `progress_terminal`.
    async fn spawn_backend(release_process: Arc<Notify>, progress_terminal: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_request(
                    sock,
                    release_process.clone(),
                    progress_terminal,
                ));
            }
        });
        format!("http://{addr}")
    }

    async fn handle_request(mut sock: TcpStream, release: Arc<Notify>, progress_terminal: bool) {
        let mut head = Vec::new();
        let mut tmp = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match sock.read(&mut tmp).await {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&tmp[..n]),
            }
        }
        let head = String::from_utf8_lossy(&head).into_owned();
        let request_line = head.lines().next().unwrap_or_default().to_string();

        if request_line.starts_with("POST /select-folder") {
            respond(&mut sock, "application/json", br#"{"success": true}"#).await;
        } else if request_line.starts_with("POST /process") {
            release.notified().await;
            respond(&mut sock, "application/json", br#"{"processed": 2, "total": 2}"#).await;
        } else if request_line.starts_with("GET /progress") {
            let header =
                b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
            if sock.write_all(header).await.is_err() {
                return;
            }
            if progress_terminal {
                let _ = sock.write_all(b"data: {\"progress\": 100}\n\n").await;
            } else {
                let _ = sock.write_all(b"data: {\"progress\": 10}\n\n").await;
                let _ = sock.flush().await;
                // Hold the channel open until the client hangs up.
                futures::future::pending::<()>().await;
            }
        } else if request_line.starts_with("GET /api/receipts") {
            respond(
                &mut sock,
                "application/json",
                br#"[{"id": "r1", "filename": "lunch.png", "status": "processed"}]"#,
            )
            .await;
        } else if request_line.starts_with("GET /download") {
            respond(&mut sock, "application/octet-stream", b"xlsx-bytes").await;
        } else {
            let _ = sock
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        }
    }

    async fn respond(sock: &mut TcpStream, content_type: &str, body: &[u8]) {
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            content_type,
            body.len()
        );
        let _ = sock.write_all(header.as_bytes()).await;
        let _ = sock.write_all(body).await;
        let _ = sock.flush().await;
    }

    fn test_config(base_url: String) -> RunConfig {
        RunConfig {
            base_url,
            process_timeout: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(10),
            user_agent: "receiptctl-test".into(),
            upload_paths: Vec::new(),
            output_dir: None,
            skip_selection: true,
            refresh_on_complete: false,
            download_on_complete: false,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> RunEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<RunEvent>, pred: F) -> RunEvent
    where
        F: Fn(&RunEvent) -> bool,
    {
        loop {
            let ev = next_event(rx).await;
            if pred(&ev) {
                return ev;
            }
        }
    }

    struct Harness {
        cmd_tx: mpsc::UnboundedSender<UiCommand>,
        evt_rx: mpsc::UnboundedReceiver<RunEvent>,
        gauge: StreamGauge,
        controller: tokio::task::JoinHandle<Result<()>>,
    }

    fn spawn_controller(cfg: RunConfig) -> Harness {
        let client = BackendClient::new(&cfg).unwrap();
        let gauge = StreamGauge::default();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(
            cfg,
            client,
            gauge.clone(),
            evt_tx,
            cmd_rx,
        ));
        Harness {
            cmd_tx,
            evt_rx,
            gauge,
            controller,
        }
    }

    async fn join_controller(h: Harness) {
        timeout(Duration::from_secs(5), h.controller)
            .await
            .expect("controller did not stop")
            .expect("controller task panicked")
            .expect("controller returned an error");
    }

    #[tokio::test]
    async fn start_requires_folder_selection() {
        let release = Arc::new(Notify::new());
        let base = spawn_backend(release, false).await;
        let mut cfg = test_config(base);
        cfg.skip_selection = false;
        let mut h = spawn_controller(cfg);

        h.cmd_tx.send(UiCommand::StartRun).unwrap();
        let ev = next_event(&mut h.evt_rx).await;
        assert!(matches!(ev, RunEvent::Notice(Notice::SelectionRequired)));
        assert_eq!(h.gauge.open_count(), 0);

        // The gate opens once selection succeeds.
        h.cmd_tx.send(UiCommand::SelectFolder).unwrap();
        let ev = next_event(&mut h.evt_rx).await;
        assert!(matches!(ev, RunEvent::FolderSelected));

        h.cmd_tx.send(UiCommand::Quit).unwrap();
        join_controller(h).await;
    }

    #[tokio::test]
    async fn restart_closes_the_previous_channel_before_opening_a_new_one() {
        let release = Arc::new(Notify::new());
        let base = spawn_backend(release, false).await;
        let mut h = spawn_controller(test_config(base));

        h.cmd_tx.send(UiCommand::StartRun).unwrap();
        wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::Progress { .. })).await;
        assert_eq!(h.gauge.open_count(), 1);

        // A second start cancels the active run and only begins the
        // replacement after its completion is observed.
        h.cmd_tx.send(UiCommand::StartRun).unwrap();
        wait_for(&mut h.evt_rx, |e| {
            matches!(e, RunEvent::Notice(Notice::Cancelling))
        })
        .await;
        wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::RunFailed { .. })).await;
        wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::RunStarted)).await;
        wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::Progress { .. })).await;
        assert_eq!(h.gauge.open_count(), 1);

        h.cmd_tx.send(UiCommand::Quit).unwrap();
        wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::RunFailed { .. })).await;
        join_controller(h).await;
    }

    #[tokio::test]
    async fn quit_waits_for_the_active_run_to_wind_down() {
        let release = Arc::new(Notify::new());
        let base = spawn_backend(release, false).await;
        let mut h = spawn_controller(test_config(base));

        h.cmd_tx.send(UiCommand::StartRun).unwrap();
        wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::Progress { .. })).await;

        h.cmd_tx.send(UiCommand::Quit).unwrap();
        // Quit cancels the run and returns only after its completion.
        wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::RunFailed { .. })).await;
        let gauge = h.gauge.clone();
        join_controller(h).await;
        assert_eq!(gauge.open_count(), 0);
    }

    #[tokio::test]
    async fn completed_run_refreshes_receipts_and_downloads_when_enabled() {
        let release = Arc::new(Notify::new());
        let base = spawn_backend(release.clone(), true).await;
        let out_dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(base);
        cfg.refresh_on_complete = true;
        cfg.download_on_complete = true;
        cfg.output_dir = Some(out_dir.path().to_path_buf());
        let mut h = spawn_controller(cfg);

        h.cmd_tx.send(UiCommand::StartRun).unwrap();
        wait_for(&mut h.evt_rx, |e| {
            matches!(e, RunEvent::Progress { percent: 100 })
        })
        .await;
        release.notify_one();

        let ev = wait_for(&mut h.evt_rx, |e| {
            matches!(e, RunEvent::SummaryArrived { .. })
        })
        .await;
        if let RunEvent::SummaryArrived { summary } = ev {
            assert_eq!(summary, ProcessingSummary { processed: 2, total: 2 });
        }

        wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::RunCompleted { .. })).await;
        let ev = wait_for(&mut h.evt_rx, |e| {
            matches!(e, RunEvent::ReceiptsLoaded { .. })
        })
        .await;
        if let RunEvent::ReceiptsLoaded { receipts } = ev {
            assert_eq!(receipts.len(), 1);
            assert_eq!(receipts[0].filename, "lunch.png");
        }
        let ev = wait_for(&mut h.evt_rx, |e| matches!(e, RunEvent::Downloaded { .. })).await;
        if let RunEvent::Downloaded { path } = ev {
            assert_eq!(
                path.file_name().and_then(|n| n.to_str()),
                Some("processed_receipts.xlsx")
            );
            assert_eq!(std::fs::read(&path).unwrap(), b"xlsx-bytes");
        }
        assert_eq!(h.gauge.open_count(), 0);

        h.cmd_tx.send(UiCommand::Quit).unwrap();
        join_controller(h).await;
    }
}
