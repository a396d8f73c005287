use super::SchedulerError;
use std::{
    ffi::OsStr,
    io::Read,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// Captured result of a finished scheduler CLI invocation
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Non-empty, trimmed stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|line| !line.is_empty())
    }
}

/// Read a pipe to completion on a separate thread so a chatty child never blocks on a full pipe
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();

        if let Some(mut pipe) = pipe {
            if let Err(error) = pipe.read_to_string(&mut buffer) {
                warn!(error = ?error, "Failed to read child output");
            }
        }

        buffer
    })
}

/// Run `program` with `args`, killing it once `timeout` elapsed
pub fn run<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    timeout: Duration,
) -> Result<CommandOutput, SchedulerError> {
    let start = Instant::now();
    let printable = args
        .iter()
        .map(|arg| arg.as_ref().to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    trace!("Running {program} {printable}");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| SchedulerError::Spawn(program.to_owned(), error))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match child
        .wait_timeout(timeout)
        .map_err(|error| SchedulerError::Spawn(program.to_owned(), error))?
    {
        Some(status) => status,
        None => {
            // child hasn't exited yet
            if let Err(error) = child.kill() {
                warn!(error = ?error, "Failed to kill {program}");
            }
            let _ = child.wait();

            return Err(SchedulerError::Timeout(program.to_owned(), timeout));
        }
    };

    let output = CommandOutput {
        success: status.success(),
        code: status.code(),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };

    debug!(
        "{program} finished in {} ms | status: {}",
        start.elapsed().as_millis(),
        output.success
    );

    Ok(output)
}

/// Like `run`, but a non-zero exit status is an error
pub fn run_checked<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    timeout: Duration,
) -> Result<CommandOutput, SchedulerError> {
    let output = run(program, args, timeout)?;

    if output.success {
        Ok(output)
    } else {
        Err(SchedulerError::CommandFailed {
            program: program.to_owned(),
            code: output.code,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

/// Minimal POSIX shell quoting for a single token
pub fn shell_escape(token: &str) -> String {
    if token.is_empty() {
        return "''".to_owned();
    }

    if token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@=,+".contains(c))
    {
        return token.to_owned();
    }

    format!("'{}'", token.replace('\'', "'\\''"))
}
