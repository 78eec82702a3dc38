//! Running external programs with a deadline.
//!
//! Every tool this crate drives (`php occ`, the database dump, `rsync`,
//! `aws`) is started through [run] or [stream]. The child leads its own
//! process group. Once the optional timeout expires the whole group is
//! terminated, including grandchildren still holding the pipes.

use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use derive_more::{Display, Error};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Time between SIGTERM and SIGKILL for a timed out process group.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Captured output of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Pipes of a running child handed to the closure of [stream].
///
/// A pipe is only present if the [Command] was configured with
/// [`Stdio::piped`] for it.
pub struct Pipes {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

#[derive(Debug, Display, Error)]
pub enum CommandError {
    /// The program couldn't be started at all.
    #[display("Unable to start `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    /// The program ran longer than allowed and was killed.
    #[display("`{program}` did not finish within {}s and was killed", timeout.as_secs_f32())]
    TimedOut { program: String, timeout: Duration },
    /// The program exited unsuccessfully.
    #[display("`{program}` exited with {status}: {}", stderr.trim())]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    /// Feeding or draining the pipes of the program failed.
    #[display("I/O with `{program}` failed: {source}")]
    Io { program: String, source: io::Error },
}

/// Name of the program a [Command] executes, for messages.
pub fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Runs `cmd` to completion, capturing stdout and stderr.
///
/// A non-zero exit status is reported as [`CommandError::Failed`].
pub fn run(cmd: &mut Command, timeout: Option<Duration>) -> Result<CommandOutput, CommandError> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped());
    let (stdout, status, stderr) = spawn_and_wait(cmd, timeout, |pipes| {
        let mut stdout = String::new();
        if let Some(mut pipe) = pipes.stdout {
            pipe.read_to_string(&mut stdout)?;
        }
        Ok(stdout)
    })?;

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

/// Runs `cmd` while `f` feeds its stdin and/or consumes its stdout.
///
/// The caller decides which pipes exist by configuring `cmd` before the call.
/// Pipes are closed when `f` returns, the child is then awaited.
pub fn stream<T>(
    cmd: &mut Command,
    timeout: Option<Duration>,
    f: impl FnOnce(Pipes) -> io::Result<T>,
) -> Result<T, CommandError> {
    let (value, _status, _stderr) = spawn_and_wait(cmd, timeout, f)?;
    Ok(value)
}

fn spawn_and_wait<T>(
    cmd: &mut Command,
    timeout: Option<Duration>,
    f: impl FnOnce(Pipes) -> io::Result<T>,
) -> Result<(T, ExitStatus, String), CommandError> {
    let program = program_name(cmd);
    log::trace!(target: "util::command", "Running: {cmd:?}");

    let mut child = cmd
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let pipes = Pipes {
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
    };
    let stderr_pipe = child.stderr.take();
    let stderr_reader = thread::spawn(move || {
        let mut stderr = String::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_string(&mut stderr);
        }
        stderr
    });

    let child = Arc::new(Mutex::new(child));
    let timed_out = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let watchdog = timeout.map(|timeout| {
        let child = Arc::clone(&child);
        let timed_out = Arc::clone(&timed_out);
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                timed_out.store(true, Ordering::SeqCst);
                let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                kill_group(&mut child);
            }
        })
    });

    let value = f(pipes);

    let status = loop {
        let polled = child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        match polled {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => break Err(source),
        }
    };

    drop(done_tx);
    if let Some(watchdog) = watchdog {
        let _ = watchdog.join();
    }
    let stderr = stderr_reader.join().unwrap_or_default();

    if let Some(timeout) = timeout.filter(|_| timed_out.load(Ordering::SeqCst)) {
        return Err(CommandError::TimedOut { program, timeout });
    }
    let status = status.map_err(|source| CommandError::Io {
        program: program.clone(),
        source,
    })?;
    let value = value.map_err(|source| CommandError::Io {
        program: program.clone(),
        source,
    })?;
    if !status.success() {
        return Err(CommandError::Failed {
            program,
            status,
            stderr,
        });
    }
    if !stderr.trim().is_empty() {
        log::debug!(target: "util::command", "{program}: {}", stderr.trim());
    }

    Ok((value, status, stderr))
}

/// Terminates the process group led by `child`.
fn kill_group(child: &mut Child) {
    let Ok(pid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    let group = Pid::from_raw(pid);

    log::debug!(target: "util::command", "Terminating process group {pid}");
    if killpg(group, Signal::SIGTERM).is_ok() {
        thread::sleep(KILL_GRACE);
        let _ = killpg(group, Signal::SIGKILL);
    }
    let _ = child.kill();
}

/// Returns if `program` can be executed, either as a path or through `PATH`.
pub fn is_available(program: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let is_executable = |path: &std::path::Path| {
        path.metadata()
            .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
    };

    if program.contains('/') {
        return is_executable(std::path::Path::new(program));
    }

    std::env::var_os("PATH")
        .is_some_and(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program))))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Instant;

    use super::*;

    #[test]
    fn captures_stdout() {
        let output = run(Command::new("echo").arg("hello"), None).unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn failing_command_reports_stderr() {
        let err = run(
            Command::new("sh").args(["-c", "echo broken >&2; exit 3"]),
            None,
        )
        .unwrap_err();
        match err {
            CommandError::Failed { stderr, .. } => assert_eq!(stderr.trim(), "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let err = run(&mut Command::new("nc-guard-no-such-program"), None).unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn hung_command_is_killed() {
        let start = Instant::now();
        let err = run(
            Command::new("sleep").arg("10"),
            Some(Duration::from_millis(200)),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn grandchildren_are_killed_on_timeout() {
        let start = Instant::now();
        let err = run(
            Command::new("sh").args(["-c", "sleep 8; echo done"]),
            Some(Duration::from_millis(200)),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(4), "{:?}", start.elapsed());
    }

    #[test]
    fn streaming_grandchild_is_killed_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo started; sleep 8"]).stdout(Stdio::piped());

        let start = Instant::now();
        let err = stream(&mut cmd, Some(Duration::from_millis(200)), |pipes| {
            let mut out = String::new();
            pipes.stdout.expect("stdout is piped").read_to_string(&mut out)?;
            Ok(out)
        })
        .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(4), "{:?}", start.elapsed());
    }

    #[test]
    fn stream_feeds_stdin() {
        let mut cmd = Command::new("wc");
        cmd.arg("-c").stdin(Stdio::piped()).stdout(Stdio::piped());

        let counted = stream(&mut cmd, Some(Duration::from_secs(10)), |pipes| {
            let mut stdin = pipes.stdin.expect("stdin is piped");
            stdin.write_all(b"12345")?;
            drop(stdin);

            let mut out = String::new();
            pipes.stdout.expect("stdout is piped").read_to_string(&mut out)?;
            Ok(out)
        })
        .unwrap();
        assert_eq!(counted.trim(), "5");
    }

    #[test]
    fn availability_lookup() {
        assert!(is_available("sh"));
        assert!(is_available("/bin/sh"));
        assert!(!is_available("nc-guard-no-such-program"));
    }
}
