//! Blocking external-process invocation with cancellation.

use std::io::{ErrorKind, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{CompressError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Runs `cmd` to completion. A missing binary is `EncoderUnavailable`, a
/// non-zero exit is `EncoderFailure` carrying stderr, and a cancelled token
/// kills the child.
pub fn run(cmd: &mut Command, encoder: &str, cancel: &CancelToken) -> Result<ProcessOutput> {
    debug!("Running {:?}", cmd);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                CompressError::unavailable(encoder, e.to_string())
            }
            _ => CompressError::Io(e),
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Err(e) = cancel.check() {
            warn!("Killing {} (pid {}): {}", encoder, child.id(), e);
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let output = ProcessOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };
    if !status.success() {
        let reason = match output.stderr.trim() {
            "" => format!("exited with {}", status),
            msg => msg.to_string(),
        };
        return Err(CompressError::failure(encoder, reason));
    }
    Ok(output)
}

/// First line of `<program> <flag>`, or `EncoderUnavailable`.
pub fn version(program: &str, flag: &str) -> Result<String> {
    let output = Command::new(program)
        .arg(flag)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| CompressError::unavailable(program, e.to_string()))?;
    if !output.status.success() {
        return Err(CompressError::unavailable(
            program,
            format!("`{} {}` exited with {}", program, flag, output.status),
        ));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}
