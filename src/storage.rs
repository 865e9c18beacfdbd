//! Local persistence for downloaded artifacts.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const SPREADSHEET_FILENAME: &str = "processed_receipts.xlsx";

/// Resolve the output directory: configured dir, else the platform download
/// directory, else the working directory.
pub fn output_dir(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Write the downloaded spreadsheet bytes as `processed_receipts.xlsx`,
/// replacing any previous download.
pub fn save_spreadsheet(dir: &Path, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create output dir {}", dir.display()))?;
    let path = dir.join(SPREADSHEET_FILENAME);
    std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
