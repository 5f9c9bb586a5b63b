//! Runs external converters with a wall-clock bound.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::RenderError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Option<JoinHandle<String>> {
    reader.map(|mut r| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = r.read_to_string(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::warn!("Failed to kill child {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

/// Runs `cmd` to completion, killing it once `timeout` has elapsed.
///
/// A missing binary is reported as [`RenderError::ToolMissing`], a
/// non-zero exit as [`RenderError::Conversion`] carrying stderr.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput, RenderError> {
    let tool = cmd.get_program().to_string_lossy().to_string();

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RenderError::ToolMissing { tool: tool.clone() },
            _ => RenderError::Transient(format!("failed to start {}: {}", tool, e)),
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                log::warn!("{} exceeded {:?}, killing pid {}", tool, timeout, child.id());
                kill(&mut child);
                return Err(RenderError::Timeout {
                    after_secs: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill(&mut child);
                return Err(RenderError::Transient(format!(
                    "waiting for {} failed: {}",
                    tool, e
                )));
            }
        }
    };

    let output = CommandOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    };

    if !output.status.success() {
        return Err(RenderError::Conversion(format!(
            "{} exited with {}: {}",
            tool,
            output.status,
            output.stderr.trim()
        )));
    }

    Ok(output)
}
