// ABOUTME: Cell execution protocol: stage the exchange directory, run the driver, interpret results
// The namespace snapshot only advances when a cell completes; failures keep the prior state

use crate::notebook::{Cell, CellState, Notebook, NotebookError, NotebookStore, Output};
use crate::sandbox::{BindMount, ExecutionRequest, ExecutionResult, Isolator, DEFAULT_TIMEOUT};
use crate::session::Environment;
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// The in-sandbox driver, shipped inside the binary and staged read-only for
/// every run.
const DRIVER_SOURCE: &str = include_str!("driver.py");

const WORKSPACE_TARGET: &str = "/workspace";
const INPUT_TARGET: &str = "/cell/in";
const OUTPUT_TARGET: &str = "/cell/out";

/// Lines of process stderr kept as the traceback when the driver dies before
/// writing results.
const STDERR_TAIL_LINES: usize = 40;

/// What the driver writes to `result.json`.
#[derive(Debug, Deserialize)]
struct DriverResult {
    success: bool,
    outputs: Vec<Output>,
    #[serde(default)]
    declarations: Vec<String>,
    #[serde(default)]
    dropped: Vec<DroppedValue>,
}

#[derive(Debug, Deserialize)]
struct DroppedValue {
    name: String,
    #[allow(dead_code)]
    type_name: String,
    #[allow(dead_code)]
    reason: String,
    #[allow(dead_code)]
    hint: String,
}

/// Runs notebook cells through the isolation primitive.
pub struct CellExecutor {
    isolator: Arc<dyn Isolator>,
    python_bin: String,
    default_timeout: Duration,
    max_text_bytes: usize,
    table_max_rows: usize,
}

impl CellExecutor {
    pub fn new(isolator: Arc<dyn Isolator>) -> Self {
        Self {
            isolator,
            python_bin: "python3".to_string(),
            default_timeout: DEFAULT_TIMEOUT,
            max_text_bytes: 64 * 1024,
            table_max_rows: 50,
        }
    }

    pub fn with_python_bin(mut self, bin: impl Into<String>) -> Self {
        self.python_bin = bin.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_output_limits(mut self, max_text_bytes: usize, table_max_rows: usize) -> Self {
        self.max_text_bytes = max_text_bytes;
        self.table_max_rows = table_max_rows;
        self
    }

    /// Appends a cell, runs it, and closes it in a terminal state. The
    /// notebook is persisted after every mutation, so a crash mid-run leaves
    /// a `Running` cell on disk rather than silent loss.
    ///
    /// Execution faults (non-zero exit, timeout, a raised error inside the
    /// cell) land in the cell's state and outputs; `Err` is reserved for
    /// storage problems on our side of the boundary.
    pub async fn execute_cell(
        &self,
        environment: &Environment,
        store: &NotebookStore,
        notebook: &mut Notebook,
        source: &str,
        timeout: Option<Duration>,
    ) -> Result<usize, NotebookError> {
        let index = notebook.append_cell(source);
        store.save(notebook)?;

        notebook.cell_mut(index)?.begin()?;
        store.save(notebook)?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let staged = self.stage_run(environment, notebook, index)?;
        let request = self.build_request(environment, &staged, index, timeout);

        let outcome = match self.isolator.run(&request).await {
            Ok(result) => self.interpret(environment, &staged, &result, timeout),
            Err(err) => {
                warn!(cell = index, "sandbox refused the cell: {}", err);
                CellOutcome {
                    state: CellState::Error,
                    outputs: vec![Output::Error {
                        ename: "ExecutionError".to_string(),
                        evalue: err.to_string(),
                        traceback: Vec::new(),
                    }],
                    declarations: Vec::new(),
                }
            }
        };

        if let Err(err) = fs::remove_dir_all(&staged.run_dir) {
            debug!(run_dir = %staged.run_dir.display(), "run dir cleanup failed: {}", err);
        }

        let execution_count = if outcome.state == CellState::Completed {
            notebook.record_declarations(outcome.declarations);
            Some(notebook.next_execution_count())
        } else {
            None
        };
        notebook
            .cell_mut(index)?
            .finish(outcome.state, outcome.outputs, execution_count)?;
        store.save(notebook)?;

        Ok(index)
    }

    /// Creates the per-run exchange directory: `in/` is staged read-only for
    /// the driver, `out/` is where it writes results and the next snapshot.
    fn stage_run(
        &self,
        environment: &Environment,
        notebook: &Notebook,
        index: usize,
    ) -> Result<StagedRun, NotebookError> {
        let run_dir = environment.runs_dir().join(Uuid::new_v4().to_string());
        let input_dir = run_dir.join("in");
        let output_dir = run_dir.join("out");
        fs::create_dir_all(&input_dir)?;
        fs::create_dir_all(&output_dir)?;

        fs::write(input_dir.join("driver.py"), DRIVER_SOURCE)?;
        fs::write(
            input_dir.join("cell.py"),
            &notebook.cell(index)?.source,
        )?;
        fs::write(
            input_dir.join("decls.json"),
            serde_json::to_vec(&notebook.declarations)?,
        )?;
        fs::write(
            input_dir.join("config.json"),
            serde_json::to_vec(&json!({
                "cell_index": index,
                "max_text_bytes": self.max_text_bytes,
                "table_max_rows": self.table_max_rows,
            }))?,
        )?;

        let snapshot = environment.namespace_snapshot_path();
        if snapshot.exists() {
            fs::copy(&snapshot, input_dir.join("namespace.pkl"))?;
        }

        Ok(StagedRun {
            run_dir,
            input_dir,
            output_dir,
        })
    }

    fn build_request(
        &self,
        environment: &Environment,
        staged: &StagedRun,
        index: usize,
        timeout: Duration,
    ) -> ExecutionRequest {
        let request = ExecutionRequest::new(vec![
            self.python_bin.clone(),
            format!("{}/driver.py", INPUT_TARGET),
            "--input".to_string(),
            INPUT_TARGET.to_string(),
            "--output".to_string(),
            OUTPUT_TARGET.to_string(),
            "--workspace".to_string(),
            WORKSPACE_TARGET.to_string(),
        ])
        .with_bind_mount(BindMount::writable(
            environment.workspace_dir(),
            WORKSPACE_TARGET,
        ))
        .with_bind_mount(BindMount::read_only(&staged.input_dir, INPUT_TARGET))
        .with_bind_mount(BindMount::writable(&staged.output_dir, OUTPUT_TARGET))
        .with_bind_mounts(environment.capability_mounts().iter().cloned())
        .with_network_isolation(environment.network_mode().isolates_network())
        .with_pid_isolation(true)
        .with_working_dir(WORKSPACE_TARGET)
        .with_timeout(timeout)
        .with_env("PYTHONDONTWRITEBYTECODE", "1")
        .with_env("PYTHONUNBUFFERED", "1")
        .with_env("MPLBACKEND", "Agg")
        .with_env("HOME", "/tmp");

        debug!(cell = index, timeout_secs = timeout.as_secs(), "cell request staged");
        environment.attach_gateway(request)
    }

    /// Turns the process result plus `result.json` into a terminal cell
    /// outcome, promoting the namespace snapshot only on success.
    fn interpret(
        &self,
        environment: &Environment,
        staged: &StagedRun,
        result: &ExecutionResult,
        timeout: Duration,
    ) -> CellOutcome {
        if result.timed_out {
            let mut outputs = process_stream_outputs(result);
            outputs.push(Output::Error {
                ename: "TimeoutError".to_string(),
                evalue: format!("cell execution exceeded {} seconds", timeout.as_secs()),
                traceback: Vec::new(),
            });
            return CellOutcome {
                state: CellState::TimedOut,
                outputs,
                declarations: Vec::new(),
            };
        }

        let result_path = staged.output_dir.join("result.json");
        let driver_result: DriverResult = match fs::read_to_string(&result_path)
            .map_err(NotebookError::from)
            .and_then(|text| serde_json::from_str(&text).map_err(NotebookError::from))
        {
            Ok(parsed) => parsed,
            Err(err) => {
                // The interpreter died (or never started) before the driver
                // could report; surface what the process left behind.
                debug!("driver result unavailable: {}", err);
                let mut outputs = process_stream_outputs(result);
                outputs.push(Output::Error {
                    ename: "ExecutionError".to_string(),
                    evalue: format!(
                        "execution process exited with status {} before reporting results",
                        result.exit_code
                    ),
                    traceback: stderr_tail(&result.stderr, STDERR_TAIL_LINES),
                });
                return CellOutcome {
                    state: CellState::Error,
                    outputs,
                    declarations: Vec::new(),
                };
            }
        };

        let mut outputs = driver_result.outputs;
        // Anything on the raw process streams bypassed the driver's capture
        // (native extensions writing to the real fds).
        outputs.extend(process_stream_outputs(result));

        if !driver_result.dropped.is_empty() {
            debug!(
                dropped = driver_result.dropped.len(),
                names = ?driver_result.dropped.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
                "non-serializable values dropped from the namespace snapshot"
            );
        }

        if driver_result.success && result.exit_code == 0 {
            let next_snapshot = staged.output_dir.join("namespace.pkl");
            if next_snapshot.exists() {
                if let Err(err) = fs::rename(&next_snapshot, environment.namespace_snapshot_path())
                {
                    warn!("failed to promote namespace snapshot: {}", err);
                }
            }
            CellOutcome {
                state: CellState::Completed,
                outputs,
                declarations: driver_result.declarations,
            }
        } else {
            CellOutcome {
                state: CellState::Error,
                outputs,
                declarations: Vec::new(),
            }
        }
    }
}

struct StagedRun {
    run_dir: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
}

struct CellOutcome {
    state: CellState,
    outputs: Vec<Output>,
    declarations: Vec<String>,
}

fn process_stream_outputs(result: &ExecutionResult) -> Vec<Output> {
    let mut outputs = Vec::new();
    if !result.stdout.trim().is_empty() {
        outputs.push(Output::stdout(result.stdout.clone()));
    }
    if !result.stderr.trim().is_empty() {
        outputs.push(Output::stderr(result.stderr.clone()));
    }
    outputs
}

fn stderr_tail(stderr: &str, lines: usize) -> Vec<String> {
    let all: Vec<&str> = stderr.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::StreamKind;
    use crate::policy::NetworkMode;
    use crate::sandbox::MockIsolator;
    use crate::session::Environment;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn ok_result() -> ExecutionResult {
        ExecutionResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            duration: Duration::from_millis(25),
        }
    }

    fn output_dir_of(request: &ExecutionRequest) -> PathBuf {
        request
            .bind_mounts
            .iter()
            .find(|m| m.target == Path::new(OUTPUT_TARGET))
            .map(|m| m.source.clone())
            .expect("request has no output mount")
    }

    async fn test_environment(dir: &TempDir) -> Environment {
        Environment::build(dir.path().join("session"), NetworkMode::Full, None, Vec::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_completed_cell_records_outputs_declarations_and_snapshot() {
        let dir = TempDir::new().unwrap();
        let env = test_environment(&dir).await;
        let store = NotebookStore::new(dir.path().join("session/notebook.json"));
        let mut notebook = Notebook::new();

        let mut mock = MockIsolator::new();
        mock.expect_run().times(1).returning(|request| {
            let out = output_dir_of(request);
            let result = serde_json::json!({
                "success": true,
                "outputs": [
                    {"type": "text", "text": "6", "stream": "result"},
                ],
                "declarations": ["import os"],
                "dropped": [],
            });
            std::fs::write(out.join("result.json"), result.to_string()).unwrap();
            std::fs::write(out.join("namespace.pkl"), b"snapshot-bytes").unwrap();
            Ok(ok_result())
        });

        let executor = CellExecutor::new(Arc::new(mock));
        let index = executor
            .execute_cell(&env, &store, &mut notebook, "x + 1", None)
            .await
            .unwrap();

        let cell = notebook.cell(index).unwrap();
        assert_eq!(cell.state, CellState::Completed);
        assert_eq!(cell.execution_count, Some(1));
        assert_eq!(
            cell.outputs[0],
            Output::Text {
                text: "6".into(),
                stream: StreamKind::Result
            }
        );
        assert_eq!(notebook.declarations, vec!["import os".to_string()]);

        // Snapshot promoted into the session state dir.
        let snapshot = std::fs::read(env.namespace_snapshot_path()).unwrap();
        assert_eq!(snapshot, b"snapshot-bytes");

        // Exchange dir cleaned up, notebook persisted.
        assert_eq!(std::fs::read_dir(env.runs_dir()).unwrap().count(), 0);
        let persisted = store.load_or_default().unwrap();
        assert_eq!(persisted.cells[0].state, CellState::Completed);
    }

    #[tokio::test]
    async fn test_failed_cell_keeps_prior_snapshot_and_declarations() {
        let dir = TempDir::new().unwrap();
        let env = test_environment(&dir).await;
        let store = NotebookStore::new(dir.path().join("session/notebook.json"));
        let mut notebook = Notebook::new();

        // Pretend an earlier cell left a snapshot behind.
        std::fs::write(env.namespace_snapshot_path(), b"old-snapshot").unwrap();

        let mut mock = MockIsolator::new();
        mock.expect_run().times(1).returning(|request| {
            let out = output_dir_of(request);
            let result = serde_json::json!({
                "success": false,
                "outputs": [
                    {"type": "error", "ename": "ZeroDivisionError",
                     "evalue": "division by zero", "traceback": ["boom"]},
                ],
                "declarations": ["import json"],
                "dropped": [],
            });
            std::fs::write(out.join("result.json"), result.to_string()).unwrap();
            Ok(ok_result())
        });

        let executor = CellExecutor::new(Arc::new(mock));
        let index = executor
            .execute_cell(&env, &store, &mut notebook, "1/0", None)
            .await
            .unwrap();

        let cell = notebook.cell(index).unwrap();
        assert_eq!(cell.state, CellState::Error);
        assert_eq!(cell.execution_count, None);
        assert!(notebook.declarations.is_empty());
        assert_eq!(
            std::fs::read(env.namespace_snapshot_path()).unwrap(),
            b"old-snapshot"
        );
    }

    #[tokio::test]
    async fn test_timeout_produces_timed_out_state_with_partial_output() {
        let dir = TempDir::new().unwrap();
        let env = test_environment(&dir).await;
        let store = NotebookStore::new(dir.path().join("session/notebook.json"));
        let mut notebook = Notebook::new();

        let mut mock = MockIsolator::new();
        mock.expect_run().times(1).returning(|_| {
            Ok(ExecutionResult {
                exit_code: -1,
                stdout: "partial progress\n".to_string(),
                stderr: String::new(),
                timed_out: true,
                duration: Duration::from_secs(2),
            })
        });

        let executor = CellExecutor::new(Arc::new(mock));
        let index = executor
            .execute_cell(
                &env,
                &store,
                &mut notebook,
                "while True: pass",
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();

        let cell = notebook.cell(index).unwrap();
        assert_eq!(cell.state, CellState::TimedOut);
        assert!(cell
            .outputs
            .iter()
            .any(|o| matches!(o, Output::Text { text, .. } if text.contains("partial progress"))));
        assert!(cell.outputs.iter().any(|o| matches!(
            o,
            Output::Error { ename, evalue, .. }
                if ename == "TimeoutError" && evalue.contains("2 seconds")
        )));
    }

    #[tokio::test]
    async fn test_process_death_reports_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let env = test_environment(&dir).await;
        let store = NotebookStore::new(dir.path().join("session/notebook.json"));
        let mut notebook = Notebook::new();

        let mut mock = MockIsolator::new();
        mock.expect_run().times(1).returning(|_| {
            Ok(ExecutionResult {
                exit_code: 137,
                stdout: String::new(),
                stderr: "panic: interpreter murdered\n".to_string(),
                timed_out: false,
                duration: Duration::from_millis(5),
            })
        });

        let executor = CellExecutor::new(Arc::new(mock));
        let index = executor
            .execute_cell(&env, &store, &mut notebook, "print('hi')", None)
            .await
            .unwrap();

        let cell = notebook.cell(index).unwrap();
        assert_eq!(cell.state, CellState::Error);
        assert!(cell.outputs.iter().any(|o| matches!(
            o,
            Output::Error { ename, evalue, traceback }
                if ename == "ExecutionError"
                    && evalue.contains("status 137")
                    && traceback.iter().any(|l| l.contains("interpreter murdered"))
        )));
    }

    #[tokio::test]
    async fn test_request_shape_for_full_network_session() {
        let dir = TempDir::new().unwrap();
        let env = test_environment(&dir).await;
        let store = NotebookStore::new(dir.path().join("session/notebook.json"));
        let mut notebook = Notebook::new();
        notebook.record_declarations(vec!["import sys".to_string()]);

        // The exchange dir is gone by the time execute_cell returns, so the
        // staged declaration file has to be captured inside the mock.
        let seen: Arc<Mutex<Option<(ExecutionRequest, String)>>> = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        let mut mock = MockIsolator::new();
        mock.expect_run().times(1).returning(move |request| {
            let input = request
                .bind_mounts
                .iter()
                .find(|m| m.target == Path::new(INPUT_TARGET))
                .expect("request has no input mount");
            let staged_decls = std::fs::read_to_string(input.source.join("decls.json")).unwrap();
            *seen_clone.lock().unwrap() = Some((request.clone(), staged_decls));
            let out = output_dir_of(request);
            std::fs::write(
                out.join("result.json"),
                serde_json::json!({"success": true, "outputs": []}).to_string(),
            )
            .unwrap();
            Ok(ok_result())
        });

        let executor = CellExecutor::new(Arc::new(mock)).with_python_bin("python3.12");
        executor
            .execute_cell(&env, &store, &mut notebook, "pass", None)
            .await
            .unwrap();

        let (request, staged_decls) = seen.lock().unwrap().take().unwrap();
        assert_eq!(request.command[0], "python3.12");
        assert!(request.command.contains(&"--workspace".to_string()));
        // Full network mode shares the host network; pid stays isolated.
        assert!(!request.isolate_network);
        assert!(request.isolate_pid);
        assert_eq!(request.working_dir, Path::new(WORKSPACE_TARGET));
        assert_eq!(request.env.get("MPLBACKEND").unwrap(), "Agg");
        assert!(!request.env.contains_key("EXECBOX_GATEWAY_SOCKET"));

        let ws = request
            .bind_mounts
            .iter()
            .find(|m| m.target == Path::new(WORKSPACE_TARGET))
            .unwrap();
        assert!(!ws.read_only);
        let input = request
            .bind_mounts
            .iter()
            .find(|m| m.target == Path::new(INPUT_TARGET))
            .unwrap();
        assert!(input.read_only);

        // The staged input dir carried the declaration set.
        let decls: Vec<String> = serde_json::from_str(&staged_decls).unwrap();
        assert_eq!(decls, vec!["import sys".to_string()]);
    }
}
