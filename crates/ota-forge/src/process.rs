use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct CapturedOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run an external command with captured output and a hard deadline.
/// Output is staged through unnamed temp files so a chatty child cannot
/// deadlock on a full pipe while we poll for exit. Timeout kills the child
/// and is reported as a failure, never retried here.
pub fn run_with_deadline(mut cmd: Command, timeout: Duration) -> Result<CapturedOutput> {
    let mut out_file = tempfile::tempfile()
        .map_err(|e| Error::msg(format!("failed to create capture file: {e}")))?;
    let mut err_file = tempfile::tempfile()
        .map_err(|e| Error::msg(format!("failed to create capture file: {e}")))?;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(out_file.try_clone()?));
    cmd.stderr(Stdio::from(err_file.try_clone()?));

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::msg(format!("failed to run command {:?}: {e}", cmd)))?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => return Err(Error::msg(format!("failed to wait on {:?}: {e}", cmd))),
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::msg(format!(
                "command timed out after {}s: {:?}",
                timeout.as_secs(),
                cmd
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = read_back(&mut out_file)?;
    let stderr = read_back(&mut err_file)?;
    Ok(CapturedOutput {
        success: status.success(),
        code: status.code(),
        stdout,
        stderr,
    })
}

/// Run a command and fail on a nonzero exit, summarizing child output.
pub fn run_checked(cmd: Command, timeout: Duration) -> Result<CapturedOutput> {
    let out = run_with_deadline(cmd, timeout)?;
    if out.success {
        return Ok(out);
    }
    let msg = command_summary(&out);
    Err(Error::msg(format!("command failed: {msg}")))
}

pub fn command_summary(out: &CapturedOutput) -> String {
    let stderr = out.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = out.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("exit code {:?}", out.code)
}

pub fn is_not_found_text(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("not found")
        || m.contains("404")
        || m.contains("no such")
        || m.contains("does not exist")
        || m.contains("could not be found")
        || m.contains("no url matched")
}

fn read_back(file: &mut std::fs::File) -> Result<String> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::msg(format!("capture seek failed: {e}")))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)
        .map_err(|e| Error::msg(format!("capture read failed: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; exit 0");
        let out = run_with_deadline(cmd, Duration::from_secs(10)).expect("run");
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_an_error_with_stderr_summary() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo boom >&2; exit 3");
        let err = run_checked(cmd, Duration::from_secs(10)).expect_err("must fail");
        assert!(err.to_string().contains("boom"), "got: {err}");
    }

    #[test]
    fn deadline_kills_the_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let err = run_with_deadline(cmd, Duration::from_millis(200)).expect_err("must time out");
        assert!(err.to_string().contains("timed out"), "got: {err}");
    }
}
