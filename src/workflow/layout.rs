// Persisted layout of one workflow directory
//
// Everything durable about a workflow lives below its directory, so any
// process (interactive session, local worker, queue worker) can rebuild
// its state from the path alone.

use std::path::{Path, PathBuf};

/// Verbosity tiers of the per-workflow log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogDetail {
    /// Workflow milestones and errors
    Minimal = 0,
    /// Plus command lines and run times
    Commands = 1,
    /// Plus complete tool output
    All = 2,
}

impl LogDetail {
    /// All tiers, least verbose first
    pub const ALL: [LogDetail; 3] = [LogDetail::Minimal, LogDetail::Commands, LogDetail::All];

    /// Log file name for this tier
    pub fn file_name(self) -> &'static str {
        match self {
            LogDetail::Minimal => "minimal.log",
            LogDetail::Commands => "commands-and-run-times.log",
            LogDetail::All => "all.log",
        }
    }
}

impl std::str::FromStr for LogDetail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(' ', "-").as_str() {
            "minimal" | "0" => Ok(LogDetail::Minimal),
            "commands" | "commands-and-run-times" | "1" => Ok(LogDetail::Commands),
            "all" | "2" => Ok(LogDetail::All),
            other => Err(format!("Invalid log detail: {}", other)),
        }
    }
}

/// Paths inside a workflow directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDir {
    root: PathBuf,
}

impl WorkflowDir {
    pub const INI_DIR: &'static str = "ini";
    pub const PARAMS_FILE: &'static str = "params.json";
    pub const PIDS_DIR: &'static str = "pids";
    pub const LOGS_DIR: &'static str = "logs";
    pub const RESULTS_DIR: &'static str = "results";
    pub const CACHE_DIR: &'static str = "cache";
    pub const JOB_ID_FILE: &'static str = ".job_id";
    pub const SCRIPTS_DIR: &'static str = "scripts";

    /// Use an existing or future directory as-is
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Directory for a workflow display name inside a workspace
    /// ("Simple Workflow" -> "<workspace>/simple-workflow")
    pub fn in_workspace(workspace: &Path, workflow_name: &str) -> Self {
        let dir_name = workflow_name.trim().replace(' ', "-").to_lowercase();
        Self::new(workspace.join(dir_name))
    }

    /// Create the directory and its configuration subdirectory
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.ini_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name, used as the workflow key in the preset catalog
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn ini_dir(&self) -> PathBuf {
        self.root.join(Self::INI_DIR)
    }

    /// Defaults descriptor of a tool; tools given by path use their file name
    pub fn ini_file(&self, tool: &str) -> PathBuf {
        let name = Path::new(tool)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| tool.to_string());
        self.ini_dir().join(format!("{}.ini", name))
    }

    pub fn params_file(&self) -> PathBuf {
        self.root.join(Self::PARAMS_FILE)
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join(Self::PIDS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(Self::LOGS_DIR)
    }

    pub fn log_file(&self, detail: LogDetail) -> PathBuf {
        self.logs_dir().join(detail.file_name())
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(Self::RESULTS_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(Self::CACHE_DIR)
    }

    pub fn job_id_file(&self) -> PathBuf {
        self.root.join(Self::JOB_ID_FILE)
    }

    /// Parameter file handed to a script step while it runs
    pub fn script_params_file(&self, script: &str) -> PathBuf {
        let stem = Path::new(script)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| script.to_string());
        self.root.join(Self::SCRIPTS_DIR).join(format!("{}.json", stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_naming() {
        let dir = WorkflowDir::in_workspace(Path::new("/ws"), "Simple Workflow");
        assert_eq!(dir.root(), Path::new("/ws/simple-workflow"));
        assert_eq!(dir.name(), "simple-workflow");
        assert_eq!(dir.ini_file("IDFilter"), PathBuf::from("/ws/simple-workflow/ini/IDFilter.ini"));
        assert_eq!(dir.ini_file("/opt/bin/IDFilter"), dir.ini_file("IDFilter"));
        assert_eq!(
            dir.log_file(LogDetail::Commands),
            PathBuf::from("/ws/simple-workflow/logs/commands-and-run-times.log")
        );
        assert_eq!(
            dir.script_params_file("/opt/scripts/filter.py"),
            PathBuf::from("/ws/simple-workflow/scripts/filter.json")
        );
    }

    #[test]
    fn test_log_detail_parsing() {
        assert_eq!("commands and run times".parse::<LogDetail>().unwrap(), LogDetail::Commands);
        assert_eq!("ALL".parse::<LogDetail>().unwrap(), LogDetail::All);
        assert!("verbose".parse::<LogDetail>().is_err());
        assert!(LogDetail::Minimal < LogDetail::All);
    }
}
