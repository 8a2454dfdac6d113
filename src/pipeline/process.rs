//! External commands with an isolated environment and an optional deadline

use crate::core::error::{RailError, RailResult, ResultExt};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

/// How long output is still collected after a timed-out command was killed
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Result of one external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
  pub exit_code: i32,
  pub stdout: String,
  pub stderr: String,
  pub timed_out: bool,
  pub duration: Duration,
}

impl CommandOutput {
  pub fn success(&self) -> bool {
    self.exit_code == 0 && !self.timed_out
  }

  /// Last non-empty line of stderr, falling back to stdout
  pub fn summary(&self) -> String {
    self
      .stderr
      .lines()
      .rev()
      .chain(self.stdout.lines().rev())
      .find(|l| !l.trim().is_empty())
      .unwrap_or("")
      .trim()
      .to_string()
  }
}

/// Run `argv` in `working_dir` with only PATH, HOME and `env` set
///
/// The command runs in its own process group. When `timeout` elapses the
/// whole group is killed and `timed_out` is set.
pub fn run_command(
  argv: &[String],
  working_dir: &Path,
  env: &[(String, String)],
  timeout: Option<Duration>,
) -> RailResult<CommandOutput> {
  let (program, args) = argv
    .split_first()
    .ok_or_else(|| RailError::message("Cannot run an empty command"))?;

  let start = Instant::now();
  let mut command = Command::new(program);
  command.args(args).current_dir(working_dir);

  command.env_clear();
  for key in ["PATH", "HOME"] {
    if let Ok(value) = std::env::var(key) {
      command.env(key, value);
    }
  }
  command.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

  #[cfg(unix)]
  {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
  }

  let mut child = command
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .with_context(|| format!("Failed to spawn `{}`", program))?;

  // Both pipes drain while we wait
  let stdout = drain(child.stdout.take());
  let stderr = drain(child.stderr.take());

  let (exit_code, timed_out) = wait(&mut child, timeout)?;

  let stdout = collect(stdout, timed_out);
  let mut stderr = collect(stderr, timed_out);
  if timed_out && let Some(limit) = timeout {
    stderr.push_str(&format!(
      "\ncommand timed out after {}",
      humantime::format_duration(limit)
    ));
  }

  Ok(CommandOutput {
    exit_code,
    stdout,
    stderr,
    timed_out,
    duration: start.elapsed(),
  })
}

fn wait(child: &mut Child, timeout: Option<Duration>) -> RailResult<(i32, bool)> {
  let Some(limit) = timeout else {
    let status = child.wait().context("Failed to wait for command")?;
    return Ok((status.code().unwrap_or(-1), false));
  };

  let deadline = Instant::now() + limit;
  loop {
    if let Some(status) = child.try_wait().context("Failed to poll command")? {
      return Ok((status.code().unwrap_or(-1), false));
    }
    if Instant::now() >= deadline {
      kill_group(child);
      child.wait().context("Failed to reap timed-out command")?;
      return Ok((-1, true));
    }
    thread::sleep(Duration::from_millis(50));
  }
}

/// Kill the child and everything it spawned
fn kill_group(child: &mut Child) {
  #[cfg(unix)]
  {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    match killpg(pgid, Signal::SIGKILL) {
      Ok(()) => {
        tracing::debug!(pid = child.id(), "killed process group");
        return;
      }
      Err(e) => tracing::warn!(pid = child.id(), error = %e, "failed to kill process group, killing child only"),
    }
  }

  if let Err(e) = child.kill() {
    tracing::warn!(pid = child.id(), error = %e, "failed to kill command");
  }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
  pipe.map(|mut pipe| {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
      let mut buf = Vec::new();
      let _ = pipe.read_to_end(&mut buf);
      // The receiver is gone once the grace period ran out
      let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
    });
    rx
  })
}

/// Output of a drained pipe; after a timeout, whatever arrives within the grace period
fn collect(rx: Option<Receiver<String>>, timed_out: bool) -> String {
  let Some(rx) = rx else {
    return String::new();
  };
  let output = if timed_out {
    rx.recv_timeout(DRAIN_GRACE).ok()
  } else {
    rx.recv().ok()
  };
  output.unwrap_or_default()
}
