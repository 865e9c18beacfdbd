//! Application-level orchestration.
//!
//! Owns the run lifecycle (start/cancel/quit), the folder-selection gate, and
//! the auxiliary backend operations (upload, receipt list, download). UI/CLI
//! layers drive it through commands and consume its events.

mod controller;

pub(crate) use controller::{run_controller, UiCommand};
