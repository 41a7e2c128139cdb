//! Subprocess execution helper (exec-style, no shell).
//!
//! Children are spawned directly, never through a shell. Stdin can be fed
//! from a buffer; stdout and stderr are captured into bounded buffers. Used
//! for the agent CLI and for manifest-declared functions.

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;

/// Upper bound on bytes read from each of stdout / stderr to prevent
/// unbounded memory use (10 MiB).
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// Polling interval while waiting for a child with a deadline or a
/// cancellation token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured output from a subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed (timeout or cancellation) or the
    /// OS did not report an exit code (e.g. signal termination on Unix).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandResult {
    /// Returns `true` when the process exited with code 0 and was not killed.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// How a child should be run beyond its argv.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Option<Duration>,
    pub cancel: Option<&'a CancellationToken>,
}

/// Run `program` with `args` in directory `cwd`.
///
/// Stdout and stderr are each capped at 10 MiB. The child is killed when
/// `options.timeout` elapses or `options.cancel` fires.
pub fn run_command<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    cwd: &Path,
    options: RunOptions<'_>,
) -> std::io::Result<CommandResult> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(if options.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Read both pipes on dedicated threads to avoid deadlock when both fill
    // their OS buffers. Both were set to Stdio::piped() above.
    let child_stdout = child.stdout.take().expect("stdout was piped");
    let child_stderr = child.stderr.take().expect("stderr was piped");
    let stdout_handle = std::thread::spawn(move || read_bounded(child_stdout));
    let stderr_handle = std::thread::spawn(move || read_bounded(child_stderr));

    // Written on its own thread so a child that never reads cannot block
    // the deadline and cancellation checks below.
    let stdin_handle = match (options.stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            Some(std::thread::spawn(move || pipe.write_all(&input)))
        }
        _ => None,
    };

    let outcome = wait_for_exit(&mut child, options.timeout, options.cancel)?;

    if let Some(handle) = stdin_handle {
        let written = handle
            .join()
            .map_err(|e| std::io::Error::other(format!("stdin writer thread panicked: {e:?}")))?;
        // A child that exits without reading stdin closes the pipe early.
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
    }

    let stdout = stdout_handle
        .join()
        .map_err(|e| std::io::Error::other(format!("stdout reader thread panicked: {e:?}")))??;
    let stderr = stderr_handle
        .join()
        .map_err(|e| std::io::Error::other(format!("stderr reader thread panicked: {e:?}")))??;

    Ok(CommandResult {
        stdout,
        stderr,
        exit_code: outcome.exit_code,
        timed_out: outcome.timed_out,
        cancelled: outcome.cancelled,
    })
}

struct ExitOutcome {
    exit_code: Option<i32>,
    timed_out: bool,
    cancelled: bool,
}

/// Wait for the child to exit, polling with `try_wait` when a deadline or a
/// cancellation token is present and killing the child when either trips.
///
/// A child that exits right as the deadline passes may be reported as
/// timed out.
fn wait_for_exit(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> std::io::Result<ExitOutcome> {
    if timeout.is_none() && cancel.is_none() {
        let status = child.wait()?;
        return Ok(ExitOutcome {
            exit_code: status.code(),
            timed_out: false,
            cancelled: false,
        });
    }

    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ExitOutcome {
                exit_code: status.code(),
                timed_out: false,
                cancelled: false,
            });
        }
        let cancelled = cancel.is_some_and(CancellationToken::is_cancelled);
        let timed_out = deadline.is_some_and(|d| Instant::now() >= d);
        if cancelled || timed_out {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(ExitOutcome {
                exit_code: None,
                timed_out: timed_out && !cancelled,
                cancelled,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Read up to [`MAX_OUTPUT_BYTES`] from `reader`, returning the result as a
/// (possibly lossy) UTF-8 string.
fn read_bounded(reader: impl Read) -> std::io::Result<String> {
    let mut buf = Vec::new();
    reader.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
