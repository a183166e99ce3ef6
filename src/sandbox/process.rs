// ABOUTME: Shared process plumbing for isolators: spawn, drain output, enforce the deadline
// Readers run concurrently with wait() so a full pipe can never wedge the child

use crate::sandbox::{ExecutionResult, SandboxError, MAX_OUTPUT_BYTES};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

/// Extra time granted to the output readers after the deadline, covering the
/// window between SIGKILL and pipe EOF (or a grandchild holding the pipe).
const IO_DRAIN_GRACE: Duration = Duration::from_secs(2);

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Runs a fully prepared command under the given wall-clock limit.
///
/// On expiry the child's whole process group is SIGKILLed and the result is
/// reported with `timed_out = true` and exit code -1; a timeout is an outcome
/// here, not an error.
pub(crate) async fn run_prepared(
    mut cmd: Command,
    timeout: Duration,
) -> Result<ExecutionResult, SandboxError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let pgid = child.id().and_then(|id| i32::try_from(id).ok());

    // Hard stop for the readers; normal runs finish well before it.
    let drain_deadline = start + timeout + IO_DRAIN_GRACE;

    let stdout_pipe = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        match stdout_pipe {
            Some(pipe) => read_capped(pipe, MAX_OUTPUT_BYTES, drain_deadline).await,
            None => String::new(),
        }
    });

    let stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        match stderr_pipe {
            Some(pipe) => read_capped(pipe, MAX_OUTPUT_BYTES, drain_deadline).await,
            None => String::new(),
        }
    });

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
        Ok(Err(err)) => return Err(SandboxError::Spawn(err)),
        Err(_) => {
            debug!("execution deadline of {:?} reached, killing process group", timeout);
            if let Some(pgid) = pgid {
                kill_process_group(pgid);
            }
            // kill() also reaps the direct child.
            let _ = child.kill().await;
            (-1, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(ExecutionResult {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

/// SIGKILL the whole group so shells cannot leave grandchildren behind.
fn kill_process_group(pgid: i32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pgid, err);
    }
}

/// Reads a stream to EOF (or the deadline), keeping at most `cap` bytes.
/// Bytes past the cap are still consumed so the writer never blocks.
async fn read_capped<R>(mut reader: R, cap: usize, deadline: Instant) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut collected: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        let read = match tokio::time::timeout_at(deadline, reader.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(n)) => n,
            Err(_) => {
                debug!("output drain deadline reached with {} bytes collected", collected.len());
                break;
            }
        };

        if collected.len() < cap {
            let take = read.min(cap - collected.len());
            collected.extend_from_slice(&chunk[..take]);
            if take < read {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    let mut text = String::from_utf8_lossy(&collected).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}
