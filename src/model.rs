use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub process_timeout: Duration,
    /// Stream is treated as failed when no message arrives within this window.
    #[serde(with = "humantime_serde")]
    pub stream_idle_timeout: Duration,
    pub user_agent: String,
    /// Local files to push to the backend before processing (optional variant).
    pub upload_paths: Vec<PathBuf>,
    /// Where the downloaded spreadsheet is saved; platform download dir when unset.
    pub output_dir: Option<PathBuf>,
    /// Skip the server-side folder-selection step entirely.
    pub skip_selection: bool,
    /// Refresh the receipt list automatically after each completed run.
    pub refresh_on_complete: bool,
    /// Fetch and save the spreadsheet automatically after each completed run.
    pub download_on_complete: bool,
}

/// Terminal payload of the start-processing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub processed: u64,
    pub total: u64,
}

/// One user-initiated processing run from trigger to final state.
///
/// Reconciles the two completion signals — the synchronous response of the
/// start call and the stream's 100% terminal value — without assuming an
/// arrival order. `started` is cleared only when the start call settles; the
/// stream's progress value never touches it.
#[derive(Debug, Clone, Default)]
pub struct ProcessingRun {
    started: bool,
    progress: u8,
    summary: Option<ProcessingSummary>,
}

impl ProcessingRun {
    pub fn start() -> Self {
        Self {
            started: true,
            progress: 0,
            summary: None,
        }
    }

    /// Fold a raw stream value into the displayed progress: clamp to [0,100]
    /// and never regress. Returns the value now displayed.
    pub fn observe_progress(&mut self, raw: i64) -> u8 {
        let clamped = raw.clamp(0, 100) as u8;
        if clamped > self.progress {
            self.progress = clamped;
        }
        self.progress
    }

    /// Record the start call's terminal payload. A duplicate signal (e.g. the
    /// stream completing after the response already landed) changes nothing.
    pub fn finish(&mut self, summary: ProcessingSummary) {
        if self.summary.is_none() {
            self.summary = Some(summary);
        }
    }

    /// The start call settled (success or failure).
    pub fn settle(&mut self) {
        self.started = false;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn summary(&self) -> Option<ProcessingSummary> {
        self.summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Processed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub filename: String,
    pub status: ReceiptStatus,
    #[serde(default)]
    pub date: Option<String>,
}

/// Events emitted by the orchestrator/engine and consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    FolderSelected,
    RunStarted,
    Progress {
        percent: u8,
    },
    /// The start call resolved; shown immediately even while the stream is
    /// still animating toward 100.
    SummaryArrived {
        summary: ProcessingSummary,
    },
    RunCompleted {
        // Box to keep RunEvent small; RunReport carries owned strings.
        report: Box<RunReport>,
    },
    RunFailed {
        message: String,
    },
    ReceiptsLoaded {
        receipts: Vec<Receipt>,
    },
    Downloaded {
        path: PathBuf,
    },
    Notice(Notice),
}

/// Structured notices rendered by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum Notice {
    Message(String),
    SelectionRequired,
    RunInProgress,
    Cancelling,
}

impl Notice {
    pub fn to_message(&self) -> String {
        match self {
            Notice::Message(msg) => msg.clone(),
            Notice::SelectionRequired => "Select a folder before starting a run".to_string(),
            Notice::RunInProgress => "A run is already in progress".to_string(),
            Notice::Cancelling => "Cancelling…".to_string(),
        }
    }
}

/// Final record of one completed run; the `--json` output payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default)]
    pub timestamp_utc: String,
    pub base_url: String,
    pub summary: ProcessingSummary,
    /// Last progress value the stream delivered; may sit below 100 when the
    /// start call settled first.
    pub final_progress: u8,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped_to_bounds() {
        let mut run = ProcessingRun::start();
        assert_eq!(run.observe_progress(-5), 0);
        assert_eq!(run.observe_progress(250), 100);
    }

    #[test]
    fn progress_never_regresses() {
        let mut run = ProcessingRun::start();
        assert_eq!(run.observe_progress(40), 40);
        assert_eq!(run.observe_progress(10), 40);
        assert_eq!(run.observe_progress(70), 70);
        assert_eq!(run.progress(), 70);
    }

    #[test]
    fn duplicate_completion_keeps_first_summary() {
        let mut run = ProcessingRun::start();
        run.finish(ProcessingSummary {
            processed: 7,
            total: 10,
        });
        run.finish(ProcessingSummary {
            processed: 1,
            total: 1,
        });
        assert_eq!(
            run.summary(),
            Some(ProcessingSummary {
                processed: 7,
                total: 10
            })
        );
    }

    #[test]
    fn settle_is_independent_of_progress() {
        // Stream stuck below 100 after the start call settles is a valid
        // terminal display state.
        let mut run = ProcessingRun::start();
        run.observe_progress(60);
        run.finish(ProcessingSummary {
            processed: 3,
            total: 5,
        });
        run.settle();
        assert!(!run.started());
        assert_eq!(run.progress(), 60);
        assert!(run.summary().is_some());
    }

    #[test]
    fn failed_start_leaves_no_summary() {
        let mut run = ProcessingRun::start();
        run.observe_progress(30);
        run.settle();
        assert!(!run.started());
        assert!(run.summary().is_none());
    }

    #[test]
    fn receipt_status_uses_lowercase_wire_names() {
        let r: Receipt = serde_json::from_str(
            r#"{"id":"a1","filename":"shop.png","status":"processed","date":"2024-11-02"}"#,
        )
        .unwrap();
        assert_eq!(r.status, ReceiptStatus::Processed);
        let pending: Receipt =
            serde_json::from_str(r#"{"id":"b2","filename":"cafe.jpg","status":"pending"}"#)
                .unwrap();
        assert_eq!(pending.status, ReceiptStatus::Pending);
        assert!(pending.date.is_none());
    }
}
