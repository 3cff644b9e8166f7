// Integration tests for msflow
//
// External tools are small shell scripts; local runs re-invoke the built
// `msflow` binary through its hidden worker subcommand.

#![cfg(unix)]

use anyhow::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use msflow::config::{EngineConfig, QueueSettings, RedisConfig};
use msflow::executor::ProcessMarkers;
use msflow::params::ParameterUpdate;
use msflow::workflow::{ExecutionMode, LogDetail, RunState, WorkerLauncher, WorkflowStatus};
use msflow::{EngineContext, QueueManager, WorkflowManager};

// Settings that would otherwise leak from the developer's shell
const OVERRIDE_VARIABLES: [&str; 11] = [
    "REDIS_MODE",
    "REDIS_URL",
    "REDIS_CLUSTER_NODES",
    "REDIS_SENTINEL_HOSTS",
    "REDIS_SENTINEL_MASTER",
    "REDIS_PASSWORD",
    "MSFLOW_CONFIG",
    "MSFLOW_WORKSPACE",
    "MSFLOW_PRESETS",
    "MSFLOW_MAX_PARALLEL",
    "MSFLOW_LOG_DIR",
];

/// A tool that answers `-write_ini` and otherwise runs `body`
fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"-write_ini\" ]; then\n  printf '%s' '<PARAMETERS><NODE name=\"{name}\"><NODE name=\"1\"><ITEM name=\"threads\" value=\"1\" type=\"int\"/></NODE></NODE></PARAMETERS>' > \"$2\"\n  exit 0\nfi\n{body}\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Setup {
    temp_dir: TempDir,
    config_file: PathBuf,
    definition: PathBuf,
    inputs: Vec<PathBuf>,
}

impl Setup {
    /// A copy step over two uploaded files, plus a configuration file
    fn new(tool_body: &str) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let tools = root.join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        let tool = fake_tool(&tools, "CopyTool", tool_body);

        let uploads = root.join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let inputs: Vec<PathBuf> = ["sample1.mzML", "sample2.mzML"]
            .iter()
            .map(|name| {
                let path = uploads.join(name);
                std::fs::write(&path, *name).unwrap();
                path
            })
            .collect();

        let definition = root.join("copy.yaml");
        std::fs::write(
            &definition,
            format!(
                r#"
name: "Copy Samples"
steps:
  - id: "copy"
    tool: "{}"
    args:
      - name: "in"
        param: "mzML-files"
      - name: "out"
        like: "in"
        file_type: "tsv"
        results_dir: "copies"
"#,
                tool.display()
            ),
        )
        .unwrap();

        let config_file = root.join("config.toml");
        std::fs::write(
            &config_file,
            format!(
                "workspace_dir = \"{}\"\npresets_file = \"{}\"\nmax_parallel = 2\n\n[queue]\npoll_interval = 0.1\n",
                root.join("workspace").display(),
                root.join("presets.json").display()
            ),
        )
        .unwrap();

        Self {
            temp_dir,
            config_file,
            definition,
            inputs,
        }
    }

    fn workflow_dir(&self) -> PathBuf {
        self.temp_dir.path().join("workspace").join("copy-samples")
    }

    fn config(&self) -> EngineConfig {
        EngineConfig {
            workspace_dir: self.temp_dir.path().join("workspace"),
            presets_file: self.temp_dir.path().join("presets.json"),
            max_parallel: 2,
            queue: QueueSettings {
                poll_interval: Duration::from_millis(100),
                ..QueueSettings::default()
            },
            ..EngineConfig::default()
        }
    }

    fn msflow(&self, args: &[&str]) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_msflow"));
        for name in OVERRIDE_VARIABLES {
            command.env_remove(name);
        }
        command.arg("--config").arg(&self.config_file).args(args);
        command
    }

    fn inputs_json(&self) -> String {
        serde_json::to_string(&self.inputs).unwrap()
    }
}

fn launcher(config_file: &Path) -> WorkerLauncher {
    WorkerLauncher::new(env!("CARGO_BIN_EXE_msflow")).with_config(Some(config_file.to_path_buf()))
}

async fn wait_until_done(workflow: &WorkflowManager) -> WorkflowStatus {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = workflow.status().await;
        if !status.running || Instant::now() > deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn result_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_cli_runs_paired_inputs_locally() {
    let setup = Setup::new(r#"cp "$2" "$4""#);
    let definition = setup.definition.to_str().unwrap();

    let saved = setup
        .msflow(&["params", definition, "set", "mzML-files", &setup.inputs_json()])
        .output()
        .unwrap();
    assert!(saved.status.success(), "{}", String::from_utf8_lossy(&saved.stderr));

    let run = setup.msflow(&["run", definition, "--wait"]).output().unwrap();
    assert!(
        run.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&run.stdout),
        String::from_utf8_lossy(&run.stderr)
    );

    let copies = setup.workflow_dir().join("results").join("copies");
    assert_eq!(result_names(&copies), vec!["sample1.tsv", "sample2.tsv"]);
    assert_eq!(
        std::fs::read_to_string(copies.join("sample2.tsv")).unwrap(),
        "sample2.mzML"
    );

    let status = setup.msflow(&["status", definition, "--json"]).output().unwrap();
    let status: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(status["status"], "finished");
    assert_eq!(status["running"], false);
}

#[test]
fn test_cli_failed_run_exits_non_zero_and_keeps_logs() {
    let setup = Setup::new("echo 'cannot read input' >&2; exit 2");
    let definition = setup.definition.to_str().unwrap();

    let saved = setup
        .msflow(&["params", definition, "set", "mzML-files", &setup.inputs_json()])
        .output()
        .unwrap();
    assert!(saved.status.success(), "{}", String::from_utf8_lossy(&saved.stderr));

    let run = setup.msflow(&["run", definition, "--wait"]).output().unwrap();
    assert_eq!(run.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&run.stdout).contains("failed"));

    let logs = setup
        .msflow(&["logs", definition, "--detail", "minimal"])
        .output()
        .unwrap();
    assert!(logs.status.success());
    let minimal = String::from_utf8_lossy(&logs.stdout);
    assert!(minimal.contains("ERROR: cannot read input"), "{minimal}");

    let bad_detail = setup
        .msflow(&["logs", definition, "--detail", "verbose"])
        .output()
        .unwrap();
    assert!(!bad_detail.status.success());
}

#[tokio::test]
async fn test_unreachable_queue_falls_back_to_local() -> Result<()> {
    let setup = Setup::new(r#"cp "$2" "$4""#);

    let mut config = setup.config();
    config.online_deployment = true;
    config.redis = Some(RedisConfig {
        url: "redis://127.0.0.1:1/0".to_string(),
        connect_timeout: Duration::from_millis(500),
        ..RedisConfig::default()
    });
    let queue = Arc::new(QueueManager::connect(&config).await);
    assert!(!queue.is_available());

    let context = EngineContext::new(config, queue, launcher(&setup.config_file));
    let workflow = WorkflowManager::open(&context, &setup.definition)?;
    workflow
        .parameters()
        .save(ParameterUpdate::new().general(
            "mzML-files",
            serde_json::to_value(&setup.inputs)?,
        ))
        .await?;

    assert_eq!(workflow.start().await?, ExecutionMode::Local);
    let status = wait_until_done(&workflow).await;
    assert_eq!(
        status.status,
        RunState::Finished,
        "{:?}",
        workflow.logger().read(LogDetail::All)
    );
    assert!(status.job_id.is_none());
    assert_eq!(
        result_names(&setup.workflow_dir().join("results").join("copies")),
        vec!["sample1.tsv", "sample2.tsv"]
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_clears_markers() -> Result<()> {
    let setup = Setup::new("sleep 30");
    let context = EngineContext::new(
        setup.config(),
        Arc::new(QueueManager::inert(QueueSettings::default())),
        launcher(&setup.config_file),
    );
    let workflow = WorkflowManager::open(&context, &setup.definition)?;
    workflow
        .parameters()
        .save(ParameterUpdate::new().general(
            "mzML-files",
            serde_json::to_value(&setup.inputs)?,
        ))
        .await?;

    workflow.start().await?;
    assert!(workflow.status().await.running);
    assert!(workflow.start().await.is_err());

    // Give the worker time to launch its tools
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(workflow.cancel().await?);

    let markers = ProcessMarkers::new(workflow.layout().pids_dir());
    assert!(!markers.any());

    let status = wait_until_done(&workflow).await;
    assert!(!status.running);
    assert_eq!(status.status, RunState::Canceled);
    Ok(())
}
