// Leveled workflow log
//
// A message written at tier N is appended to the file of tier N and to every
// more verbose tier, so `all.log` holds everything and `minimal.log` only the
// milestones.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::workflow::layout::{LogDetail, WorkflowDir};

/// Line printed when a workflow run begins
pub const START_SENTINEL: &str = "STARTING WORKFLOW";
/// Line printed when a workflow run completes successfully
pub const FINISH_SENTINEL: &str = "WORKFLOW FINISHED";
/// Line printed when a workflow run was stopped by the user
pub const CANCEL_SENTINEL: &str = "WORKFLOW CANCELED";
/// Prefix of the line describing a failed run
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Append-only, tiered log for one workflow directory
#[derive(Debug)]
pub struct WorkflowLogger {
    logs_dir: PathBuf,
    layout: WorkflowDir,
    write_lock: Mutex<()>,
}

impl WorkflowLogger {
    pub fn new(layout: &WorkflowDir) -> Self {
        Self {
            logs_dir: layout.logs_dir(),
            layout: layout.clone(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append `message` at `detail` and every more verbose tier
    ///
    /// Logging never fails the caller; io problems are reported through
    /// tracing instead.
    pub fn log(&self, message: &str, detail: LogDetail) {
        tracing::debug!(target: "msflow::workflow_log", detail = ?detail, "{}", message);

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = fs::create_dir_all(&self.logs_dir) {
            tracing::warn!("Cannot create log directory {:?}: {}", self.logs_dir, e);
            return;
        }

        let mut line = message.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        for tier in LogDetail::ALL.into_iter().filter(|tier| *tier >= detail) {
            let path = self.layout.log_file(tier);
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| file.write_all(line.as_bytes()));
            if let Err(e) = written {
                tracing::warn!("Failed to append to {:?}: {}", path, e);
            }
        }
    }

    /// Contents of one tier, `None` when nothing was logged yet
    pub fn read(&self, detail: LogDetail) -> Option<String> {
        fs::read_to_string(self.layout.log_file(detail)).ok()
    }

    /// Remove all log files
    pub fn clear(&self) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        crate::utils::remove_dir_if_exists(&self.logs_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tiers_are_cumulative() {
        let temp_dir = TempDir::new().unwrap();
        let logger = WorkflowLogger::new(&WorkflowDir::new(temp_dir.path()));

        logger.log(START_SENTINEL, LogDetail::Minimal);
        logger.log("Running command:\nTool -in a", LogDetail::Commands);
        logger.log("tool chatter", LogDetail::All);

        let minimal = logger.read(LogDetail::Minimal).unwrap();
        let commands = logger.read(LogDetail::Commands).unwrap();
        let all = logger.read(LogDetail::All).unwrap();

        assert_eq!(minimal, "STARTING WORKFLOW\n");
        assert!(commands.contains("Running command:") && !commands.contains("chatter"));
        assert!(all.contains(START_SENTINEL) && all.contains("tool chatter"));
    }

    #[test]
    fn test_clear_removes_logs() {
        let temp_dir = TempDir::new().unwrap();
        let logger = WorkflowLogger::new(&WorkflowDir::new(temp_dir.path()));

        assert!(logger.read(LogDetail::Minimal).is_none());
        logger.log("something", LogDetail::Minimal);
        logger.clear().unwrap();
        assert!(logger.read(LogDetail::Minimal).is_none());
        logger.clear().unwrap();
    }
}
