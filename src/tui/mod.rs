use crate::cli::{build_config, Cli};
use crate::engine::{BackendClient, StreamGauge};
use crate::model::{ProcessingSummary, Receipt, ReceiptStatus, RunEvent, RunReport};
use crate::orchestrator::{self, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Tabs},
    Terminal,
};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

struct UiState {
    tab: usize,
    folder_selected: bool,
    processing: bool,
    progress: u8,
    summary: Option<ProcessingSummary>,
    last_report: Option<RunReport>,
    receipts: Vec<Receipt>,
    receipts_selected: usize,
    info: String,
    saved_path: Option<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            folder_selected: false,
            processing: false,
            progress: 0,
            summary: None,
            last_report: None,
            receipts: Vec::new(),
            receipts_selected: 0,
            info: String::new(),
            saved_path: None,
        }
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let client = BackendClient::new(&cfg)?;
    let gauge = StreamGauge::default();

    // Unbounded channels avoid backpressure between the controller and the UI.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let skip_selection = cfg.skip_selection;

    // TUI runs in a dedicated thread to keep all blocking I/O out of the
    // Tokio runtime.
    let ui_handle = std::thread::spawn(move || run_threaded(skip_selection, event_rx, cmd_tx));

    let res = orchestrator::run_controller(cfg, client, gauge, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    skip_selection: bool,
    mut event_rx: UnboundedReceiver<RunEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState {
        folder_selected: skip_selection,
        ..Default::default()
    };

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep the UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            apply_event(&mut state, ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('f')) => {
                        state.info = "Opening folder selection…".into();
                        let _ = cmd_tx.send(UiCommand::SelectFolder);
                    }
                    (_, KeyCode::Char('s')) => {
                        // Trigger control is disabled while processing; the
                        // controller enforces this too.
                        if !state.folder_selected {
                            state.info = "Select a folder first (f)".into();
                        } else if state.processing {
                            state.info = "A run is already in progress".into();
                        } else {
                            let _ = cmd_tx.send(UiCommand::StartRun);
                        }
                    }
                    (_, KeyCode::Char('d')) => {
                        state.info = "Downloading spreadsheet…".into();
                        let _ = cmd_tx.send(UiCommand::Download);
                    }
                    (_, KeyCode::Char('r')) => {
                        state.info = "Refreshing receipt list…".into();
                        let _ = cmd_tx.send(UiCommand::RefreshReceipts);
                    }
                    (_, KeyCode::Char('y')) => {
                        if let Some(ref path) = state.saved_path {
                            match copy_to_clipboard(path) {
                                Ok(()) => {
                                    state.info = format!("Copied to clipboard: {}", path);
                                }
                                Err(e) => {
                                    state.info = format!("Clipboard copy failed: {e:#}");
                                }
                            }
                        } else {
                            state.info = "Nothing downloaded yet (d)".into();
                        }
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 3;
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        if state.tab == 1 && state.receipts_selected > 0 {
                            state.receipts_selected -= 1;
                        }
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        if state.tab == 1
                            && state.receipts_selected + 1 < state.receipts.len()
                        {
                            state.receipts_selected += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn apply_event(state: &mut UiState, ev: RunEvent) {
    match ev {
        RunEvent::FolderSelected => {
            state.folder_selected = true;
            state.info = "Folder selected".into();
        }
        RunEvent::RunStarted => {
            state.processing = true;
            state.progress = 0;
            state.summary = None;
            state.info = "Processing…".into();
        }
        RunEvent::Progress { percent } => {
            state.progress = percent;
        }
        RunEvent::SummaryArrived { summary } => {
            // The start call settled; the bar may still be animating.
            state.summary = Some(summary);
            state.processing = false;
        }
        RunEvent::RunCompleted { report } => {
            state.last_report = Some(*report);
            state.processing = false;
            state.info = "Run complete".into();
        }
        RunEvent::RunFailed { message } => {
            state.processing = false;
            state.info = message;
        }
        RunEvent::ReceiptsLoaded { receipts } => {
            state.receipts = receipts;
            if state.receipts_selected >= state.receipts.len() {
                state.receipts_selected = state.receipts.len().saturating_sub(1);
            }
        }
        RunEvent::Downloaded { path } => {
            let shown = path.display().to_string();
            state.info = format!("Saved: {} (press 'y' to copy path)", shown);
            state.saved_path = Some(shown);
        }
        RunEvent::Notice(n) => {
            state.info = n.to_message();
        }
    }
}

fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new().context("open clipboard")?;
    clipboard
        .set_text(text.to_string())
        .context("copy to clipboard")?;
    Ok(())
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from("Receipts"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("receiptctl"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        1 => draw_receipts(chunks[1], f, state),
        _ => draw_help(chunks[1], f),
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3), // Progress gauge
                Constraint::Length(6), // Summary
                Constraint::Min(0),    // Keybinds
                Constraint::Length(4), // Status
            ]
            .as_ref(),
        )
        .split(area);

    let gauge_color = if state.processing {
        Color::Yellow
    } else if state.progress >= 100 {
        Color::Green
    } else {
        Color::Gray
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(gauge_color))
        .percent(u16::from(state.progress.min(100)))
        .label(format!("{}%", state.progress));
    f.render_widget(gauge, main[0]);

    let summary_lines = match state.summary {
        Some(s) => {
            let mut lines = vec![Line::from(vec![
                Span::styled("Processed: ", Style::default().fg(Color::Gray)),
                Span::styled(
                    format!("{} / {}", s.processed, s.total),
                    Style::default().fg(Color::Green),
                ),
            ])];
            if let Some(report) = state.last_report.as_ref() {
                lines.push(Line::from(vec![
                    Span::styled("Finished: ", Style::default().fg(Color::Gray)),
                    Span::raw(report.timestamp_utc.clone()),
                ]));
                lines.push(Line::from(vec![
                    Span::styled("Duration: ", Style::default().fg(Color::Gray)),
                    Span::raw(format!("{} ms", report.duration_ms)),
                ]));
            }
            lines
        }
        None if state.processing => vec![Line::from("Waiting for the server…")],
        None => vec![Line::from("No completed run yet. Press 's' to start.")],
    };
    let summary = Paragraph::new(summary_lines)
        .block(Block::default().borders(Borders::ALL).title("Results"));
    f.render_widget(summary, main[1]);

    let keybind_lines = vec![
        Line::from(vec![
            Span::raw("  "),
            Span::styled("f", Style::default().fg(Color::Magenta)),
            Span::raw("     Select folder"),
        ]),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("s", Style::default().fg(Color::Magenta)),
            Span::raw("     Start processing"),
        ]),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("d", Style::default().fg(Color::Magenta)),
            Span::raw("     Download spreadsheet"),
        ]),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("r", Style::default().fg(Color::Magenta)),
            Span::raw("     Refresh receipt list"),
        ]),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("y", Style::default().fg(Color::Magenta)),
            Span::raw("     Copy saved path"),
        ]),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("tab", Style::default().fg(Color::Magenta)),
            Span::raw("   Switch tabs"),
        ]),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw("     Quit"),
        ]),
    ];
    let keybinds = Paragraph::new(keybind_lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Keyboard Shortcuts"),
    );
    f.render_widget(keybinds, main[2]);

    let status_lines = vec![
        Line::from(vec![
            Span::styled("Folder: ", Style::default().fg(Color::Gray)),
            Span::styled(
                if state.folder_selected {
                    "selected"
                } else {
                    "not selected"
                },
                if state.folder_selected {
                    Style::default().fg(Color::Green)
                } else {
                    Style::default().fg(Color::Red)
                },
            ),
            Span::raw("   "),
            Span::styled("Processing: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}", state.processing)),
        ]),
        Line::from(vec![
            Span::styled("Info: ", Style::default().fg(Color::Gray)),
            Span::raw(state.info.clone()),
        ]),
    ];
    let status =
        Paragraph::new(status_lines).block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(status, main[3]);
}

fn draw_receipts(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    if state.receipts.is_empty() {
        let empty = Paragraph::new("No receipts loaded. Press 'r' to refresh.")
            .block(Block::default().borders(Borders::ALL).title("Receipts"));
        f.render_widget(empty, area);
        return;
    }

    let items: Vec<ListItem> = state.receipts.iter().map(receipt_item).collect();
    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("Receipts ({})", state.receipts.len())),
        )
        .highlight_style(Style::default().fg(Color::Yellow));

    let mut list_state = ListState::default();
    list_state.select(Some(state.receipts_selected));
    f.render_stateful_widget(list, area, &mut list_state);
}

fn receipt_item(r: &Receipt) -> ListItem<'_> {
    let (label, color) = match r.status {
        ReceiptStatus::Pending => ("pending  ", Color::Yellow),
        ReceiptStatus::Processed => ("processed", Color::Green),
    };
    ListItem::new(Line::from(vec![
        Span::styled(label, Style::default().fg(color)),
        Span::raw("  "),
        Span::raw(r.filename.clone()),
        Span::styled(
            r.date
                .as_deref()
                .map(|d| format!("  ({d})"))
                .unwrap_or_default(),
            Style::default().fg(Color::Gray),
        ),
    ]))
}

fn draw_help(area: Rect, f: &mut ratatui::Frame) {
    let p = Paragraph::new(vec![
        Line::from("receiptctl — receipt-processing client"),
        Line::from(""),
        Line::from("Workflow:"),
        Line::from("  1. 'f' asks the backend to open its folder dialog"),
        Line::from("  2. 's' starts processing; progress streams in live"),
        Line::from("  3. 'd' downloads processed_receipts.xlsx when done"),
        Line::from(""),
        Line::from("Keybinds:"),
        Line::from("  f       select folder"),
        Line::from("  s       start processing"),
        Line::from("  d       download spreadsheet"),
        Line::from("  r       refresh receipt list"),
        Line::from("  y       copy saved spreadsheet path"),
        Line::from("  j/k     move in the receipt list"),
        Line::from("  tab     switch tabs"),
        Line::from("  q       quit"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
