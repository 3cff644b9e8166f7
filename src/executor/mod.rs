// Command execution for workflow tools
//
// Spawns external tools, streams their output into the workflow log while
// they run, tracks each live process with a marker and runs paired
// invocations concurrently under a parallelism bound.

pub mod invocation;
pub mod logger;
pub mod process;

pub use invocation::{ArgItem, ToolInvocation};
pub use logger::WorkflowLogger;
pub use process::{ProcessMarkers, Termination};

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::error::InvocationError;
use crate::executor::logger::ERROR_PREFIX;
use crate::params::ParameterManager;
use crate::workflow::layout::LogDetail;

/// Capacity of the channel between the output readers and the log writer
const LINE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Result of one finished process
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub argv: Vec<String>,
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration: Duration,
}

/// Results of a concurrent batch, in input order
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub outcomes: Vec<CommandOutcome>,
    pub duration: Duration,
}

impl BatchOutcome {
    /// Whether every command succeeded
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.success)
    }
}

/// Runs tools for one workflow directory
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    logger: Arc<WorkflowLogger>,
    markers: ProcessMarkers,
    params: Arc<ParameterManager>,
    permits: Arc<Semaphore>,
}

impl CommandExecutor {
    pub fn new(
        logger: Arc<WorkflowLogger>,
        params: Arc<ParameterManager>,
        max_parallel: usize,
    ) -> Self {
        let markers = ProcessMarkers::new(params.layout().pids_dir());
        Self {
            logger,
            markers,
            params,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    pub fn logger(&self) -> &Arc<WorkflowLogger> {
        &self.logger
    }

    pub fn markers(&self) -> &ProcessMarkers {
        &self.markers
    }

    /// Run one logical tool step. Returns whether every command succeeded.
    ///
    /// Lengths are validated before anything is spawned.
    pub async fn run_tool(&self, invocation: &ToolInvocation) -> Result<bool, InvocationError> {
        invocation.command_count()?;

        let key = invocation.parameter_key();
        if let Some(instance) = &invocation.instance {
            self.params.register_instance(&invocation.tool, instance)?;
        }

        let ini_path = self.params.layout().ini_file(&invocation.tool);
        self.params.ensure_defaults(&invocation.tool).await?;
        let overrides = self.params.overrides(key);

        let descriptor = ini_path.exists().then_some(ini_path.as_path());
        let commands = invocation.commands(&overrides, descriptor)?;

        match commands.len() {
            0 => Err(InvocationError::NoCommands {
                tool: invocation.tool.clone(),
            }),
            1 => {
                let mut commands = commands;
                let argv = commands.remove(0);
                Ok(self.run_command(argv).await?.success)
            }
            _ => Ok(self.run_batch(commands).await?.success()),
        }
    }

    /// Run a script step. The script gets a single argument: a JSON file
    /// holding `defaults`, then the stored overrides of `key`, then the
    /// bound files (a list when an argument has several).
    pub async fn run_script(
        &self,
        interpreter: &str,
        script: &str,
        key: &str,
        defaults: &BTreeMap<String, Value>,
        io: &[(String, Vec<ArgItem>)],
    ) -> Result<bool, InvocationError> {
        if !Path::new(script).is_file() {
            return Err(InvocationError::ToolNotFound {
                program: script.to_string(),
            });
        }

        let mut values = defaults.clone();
        values.extend(self.params.overrides(key));
        for (name, items) in io {
            let mut paths: Vec<Value> = items
                .iter()
                .flat_map(|item| item.paths())
                .map(|path| Value::String(path.to_string()))
                .collect();
            let value = if paths.len() == 1 {
                paths.remove(0)
            } else {
                Value::Array(paths)
            };
            values.insert(name.clone(), value);
        }

        let params_file = self.params.layout().script_params_file(script);
        let written = params_file
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| {
                let json = serde_json::to_vec_pretty(&values).map_err(std::io::Error::other)?;
                crate::utils::write_atomic(&params_file, &json)
            });
        written.map_err(|source| InvocationError::ScriptParameters {
            path: params_file.clone(),
            source,
        })?;

        let argv = vec![
            interpreter.to_string(),
            script.to_string(),
            params_file.to_string_lossy().into_owned(),
        ];
        let outcome = self.run_command(argv).await;
        if let Err(e) = std::fs::remove_file(&params_file) {
            tracing::debug!("Could not remove {:?}: {}", params_file, e);
        }
        Ok(outcome?.success)
    }

    /// Run one process to completion, streaming its output into the log.
    ///
    /// A non-zero exit is reported in the outcome, not as an error.
    pub async fn run_command(&self, argv: Vec<String>) -> Result<CommandOutcome, InvocationError> {
        let Some(program) = argv.first().cloned() else {
            return Err(InvocationError::NoCommands {
                tool: String::new(),
            });
        };

        let start = Instant::now();
        let command_line = argv.join(" ");
        self.logger.log(
            &format!("Running command:\n{}\nWaiting for command to finish...", command_line),
            LogDetail::Commands,
        );

        let mut child = Command::new(&program)
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    InvocationError::ToolNotFound {
                        program: program.clone(),
                    }
                } else {
                    InvocationError::Spawn {
                        program: program.clone(),
                        source,
                    }
                }
            })?;

        let _marker = match child.id() {
            Some(pid) => Some(self.markers.record(pid)?),
            None => None,
        };

        let (tx, mut rx) = mpsc::channel(LINE_BUFFER);
        let mut readers = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            readers.spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.spawn(forward_lines(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        // Tools report problems on stderr even when they exit cleanly
        while let Some((stream, line)) = rx.recv().await {
            match stream {
                Stream::Stdout => self.logger.log(&line, LogDetail::All),
                Stream::Stderr => self
                    .logger
                    .log(&format!("{}{}", ERROR_PREFIX, line), LogDetail::Minimal),
            }
        }
        while readers.join_next().await.is_some() {}

        let status = child.wait().await.map_err(|source| InvocationError::Spawn {
            program: program.clone(),
            source,
        })?;
        let duration = start.elapsed();

        self.logger.log(
            &format!(
                "Process finished:\n{}\nTotal time to run command: {:.2} seconds",
                command_line,
                duration.as_secs_f64()
            ),
            LogDetail::Commands,
        );

        if !status.success() {
            self.logger.log(
                &format!("ERRORS OCCURRED: {} {}", program, status),
                LogDetail::Minimal,
            );
        }

        tracing::debug!(
            "{} finished with {} after {:.2}s",
            program,
            status,
            duration.as_secs_f64()
        );

        Ok(CommandOutcome {
            argv,
            exit_code: status.code(),
            success: status.success(),
            duration,
        })
    }

    /// Run all commands concurrently, at most `max_parallel` at a time.
    ///
    /// Failing commands never abort their siblings. A missing executable
    /// is still returned as an error once the batch has drained.
    pub async fn run_batch(&self, commands: Vec<Vec<String>>) -> Result<BatchOutcome, InvocationError> {
        let start = Instant::now();
        let total = commands.len();
        self.logger.log(
            &format!("Running {} commands in parallel...", total),
            LogDetail::Commands,
        );

        let mut tasks = JoinSet::new();
        for (index, argv) in commands.into_iter().enumerate() {
            let executor = self.clone();
            tasks.spawn(async move {
                let result = match Arc::clone(&executor.permits).acquire_owned().await {
                    Ok(_permit) => executor.run_command(argv.clone()).await,
                    Err(_) => Err(InvocationError::NoCommands {
                        tool: argv.first().cloned().unwrap_or_default(),
                    }),
                };
                (index, argv, result)
            });
        }

        let mut slots: Vec<Option<CommandOutcome>> = vec![None; total];
        let mut hard_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, argv, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Command task failed: {}", e);
                    continue;
                }
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.logger
                        .log(&format!("ERRORS OCCURRED:\n{}", e), LogDetail::Minimal);
                    if matches!(e, InvocationError::ToolNotFound { .. }) && hard_error.is_none() {
                        hard_error = Some(e);
                    }
                    CommandOutcome {
                        argv,
                        exit_code: None,
                        success: false,
                        duration: Duration::ZERO,
                    }
                }
            };
            slots[index] = Some(outcome);
        }

        if let Some(e) = hard_error {
            return Err(e);
        }

        let duration = start.elapsed();
        self.logger.log(
            &format!(
                "Total time to run {} commands: {:.2} seconds",
                total,
                duration.as_secs_f64()
            ),
            LogDetail::Commands,
        );

        let outcomes = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| CommandOutcome {
                    argv: vec![format!("<command {} panicked>", index)],
                    exit_code: None,
                    success: false,
                    duration: Duration::ZERO,
                })
            })
            .collect();

        Ok(BatchOutcome { outcomes, duration })
    }

    /// Kill every marked process of this workflow and clear the markers.
    /// Returns how many processes were signaled.
    pub fn cancel(&self) -> usize {
        self.logger
            .log("Stopping all running processes...", LogDetail::Commands);
        let killed = self.markers.terminate_all(Termination::Forced);
        self.logger.log("Workflow stopped.", LogDetail::Commands);
        killed
    }
}

/// Read `stream` line by line into `tx`, decoding lossily
async fn forward_lines<R>(stream: R, kind: Stream, tx: mpsc::Sender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send((kind, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Stopped reading {:?}: {}", kind, e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::workflow::layout::WorkflowDir;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Write an executable shell script that also answers `-write_ini`
    pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"-write_ini\" ]; then\n  printf '%s' '<PARAMETERS><NODE name=\"{name}\"><NODE name=\"1\"><ITEM name=\"threads\" value=\"1\" type=\"int\"/></NODE></NODE></PARAMETERS>' > \"$2\"\n  exit 0\nfi\n{body}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn executor(temp_dir: &TempDir, max_parallel: usize) -> CommandExecutor {
        let layout = WorkflowDir::new(temp_dir.path().join("wf"));
        let params =
            Arc::new(ParameterManager::new(&layout, &temp_dir.path().join("presets.json")).unwrap());
        CommandExecutor::new(Arc::new(WorkflowLogger::new(&layout)), params, max_parallel)
    }

    #[tokio::test]
    async fn test_run_command_streams_output() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, 2);

        let outcome = executor
            .run_command(vec![
                "sh".into(),
                "-c".into(),
                "echo hello; echo oops >&2".into(),
            ])
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));

        let all = executor.logger().read(LogDetail::All).unwrap();
        assert!(all.lines().any(|line| line == "hello"));
        let minimal = executor.logger().read(LogDetail::Minimal).unwrap();
        assert!(minimal.lines().any(|line| line == "ERROR: oops"));
        assert!(!minimal.contains("hello"));
        assert!(!minimal.contains("ERRORS OCCURRED"));
        let commands = executor.logger().read(LogDetail::Commands).unwrap();
        assert!(commands.contains("Total time to run command:"));
        assert!(!commands.lines().any(|line| line == "hello"));
        assert!(!executor.markers().any());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure_not_error() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, 2);

        let outcome = executor
            .run_command(vec!["sh".into(), "-c".into(), "echo broken >&2; exit 3".into()])
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        let minimal = executor.logger().read(LogDetail::Minimal).unwrap();
        assert!(minimal.contains("ERRORS OCCURRED"));
        assert!(minimal.lines().any(|line| line == "ERROR: broken"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_hard_error() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, 2);

        let err = executor
            .run_command(vec!["msflow-no-such-tool".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_batch_keeps_input_order_and_isolates_failures() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, 2);

        let commands = vec![
            vec!["sh".into(), "-c".into(), "sleep 0.2; exit 0".into()],
            vec!["sh".into(), "-c".into(), "exit 1".into()],
            vec!["sh".into(), "-c".into(), "exit 0".into()],
        ];
        let batch = executor.run_batch(commands).await.unwrap();

        assert_eq!(batch.outcomes.len(), 3);
        assert!(batch.outcomes[0].success);
        assert!(!batch.outcomes[1].success);
        assert!(batch.outcomes[2].success);
        assert!(!batch.success());
        assert_eq!(batch.outcomes[1].argv[2], "exit 1");
    }

    #[tokio::test]
    async fn test_run_tool_rejects_mismatch_before_spawning() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, 2);
        let marker = temp_dir.path().join("spawned");
        let tool = fake_tool(
            temp_dir.path(),
            "FakeTool",
            &format!("touch {}", marker.display()),
        );

        let invocation = ToolInvocation::new(&tool.to_string_lossy())
            .arg("in", ["1", "2", "3"])
            .arg("out", ["1", "2"]);
        let err = executor.run_tool(&invocation).await.unwrap_err();
        assert!(matches!(err, InvocationError::MismatchedLengths { .. }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_run_tool_writes_paired_outputs() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, 4);
        let tool = fake_tool(temp_dir.path(), "CopyTool", "cp \"$2\" \"$4\"");

        let inputs: Vec<PathBuf> = ["a", "b"]
            .iter()
            .map(|name| {
                let path = temp_dir.path().join(format!("{name}.txt"));
                std::fs::write(&path, name).unwrap();
                path
            })
            .collect();
        let outputs: Vec<PathBuf> = ["a", "b"]
            .iter()
            .map(|name| temp_dir.path().join(format!("{name}.out")))
            .collect();

        let invocation = ToolInvocation::new(&tool.to_string_lossy())
            .arg("in", inputs.clone())
            .arg("out", outputs.clone());
        assert!(executor.run_tool(&invocation).await.unwrap());

        assert_eq!(std::fs::read_to_string(&outputs[0]).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(&outputs[1]).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_cancel_kills_running_tools() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, 2);

        let running = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .run_command(vec!["sleep".into(), "30".into()])
                    .await
            })
        };

        for _ in 0..100 {
            if executor.markers().any() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(executor.markers().any());

        assert_eq!(executor.cancel(), 1);
        assert!(!executor.markers().any());

        let outcome = running.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, None);
    }
}
