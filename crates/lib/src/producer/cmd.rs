//! Shell command producers.
//!
//! The command receives its inputs as a JSON object on stdin:
//!
//! ```text
//! { "<role>": [ { "partition": {...}, "value": ... }, ... ], ... }
//! ```
//!
//! and the output partition as `ARTI_PARTITION` (`dim=value/dim=value`, empty when
//! unpartitioned). Stdout must be a JSON array with one value per declared output; a producer
//! with a single output may print a bare value instead.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use serde_json::{Value, json};
use tracing::{debug, info};

use super::types::{BuildContext, Compute, ComputeError};

#[derive(Debug, Clone)]
pub struct CommandCompute {
  pub cmd: String,
  pub env: BTreeMap<String, String>,
  pub cwd: Option<PathBuf>,
  /// Overrides the default `/bin/sh` (Unix) or `cmd.exe` (Windows).
  pub shell: Option<String>,
  /// Number of declared outputs, used to accept a bare single value.
  pub outputs: usize,
}

impl CommandCompute {
  pub fn new(cmd: impl Into<String>, outputs: usize) -> Self {
    Self {
      cmd: cmd.into(),
      env: BTreeMap::new(),
      cwd: None,
      shell: None,
      outputs,
    }
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }

  pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
    self.cwd = Some(cwd);
    self
  }

  fn stdin_payload(ctx: &BuildContext) -> Value {
    let inputs: serde_json::Map<String, Value> = ctx
      .inputs
      .iter()
      .map(|(role, values)| {
        let items = values
          .iter()
          .map(|(key, value)| json!({ "partition": key, "value": value }))
          .collect();
        (role.clone(), Value::Array(items))
      })
      .collect();
    Value::Object(inputs)
  }

  fn parse_stdout(&self, stdout: &str) -> Result<Vec<Value>, ComputeError> {
    let parsed: Value = serde_json::from_str(stdout.trim())
      .map_err(|e| ComputeError::InvalidOutput(format!("stdout is not JSON: {}", e)))?;
    match parsed {
      Value::Array(items) if self.outputs != 1 || items.len() == 1 => Ok(items),
      other if self.outputs == 1 => Ok(vec![other]),
      other => Err(ComputeError::InvalidOutput(format!(
        "expected a JSON array of {} outputs, got {}",
        self.outputs, other
      ))),
    }
  }
}

impl Compute for CommandCompute {
  fn build(&self, ctx: &BuildContext) -> Result<Vec<Value>, ComputeError> {
    info!(producer = %ctx.producer, partition = %ctx.partition, cmd = %self.cmd, "executing command");

    let (shell, flags) = shell_invocation(self.shell.as_deref());
    let mut command = Command::new(shell);
    command
      .args(flags)
      .arg(&self.cmd)
      .env("ARTI_PRODUCER", ctx.producer.as_str())
      .env("ARTI_PARTITION", ctx.partition.canonical())
      .envs(&self.env)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    if let Some(cwd) = &self.cwd {
      command.current_dir(cwd);
    }

    debug!(shell, "spawning process");
    let mut child = command.spawn()?;

    let payload = serde_json::to_vec(&Self::stdin_payload(ctx)).map_err(ComputeError::msg)?;
    // stdin is written while stdout and stderr are drained.
    let stdin = child.stdin.take();
    let writer = thread::spawn(move || -> std::io::Result<()> {
      let Some(mut stdin) = stdin else {
        return Ok(());
      };
      match stdin.write_all(&payload) {
        // A command that ignores its input may exit before reading it.
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
        written => written,
      }
    });

    let output = child.wait_with_output()?;
    writer
      .join()
      .map_err(|_| ComputeError::msg("stdin writer panicked"))??;
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !stderr.trim().is_empty() {
      debug!(producer = %ctx.producer, %stderr, "command wrote to stderr");
    }

    if !output.status.success() {
      return Err(ComputeError::CmdFailed {
        cmd: self.cmd.clone(),
        code: output.status.code(),
        stderr,
      });
    }

    self.parse_stdout(&String::from_utf8_lossy(&output.stdout))
  }
}

#[cfg(unix)]
const DEFAULT_SHELL: &str = "/bin/sh";
#[cfg(windows)]
const DEFAULT_SHELL: &str = "cmd.exe";

/// The interpreter to run `cmd` with, and the flags that make it take a command string.
fn shell_invocation(shell: Option<&str>) -> (&str, &'static [&'static str]) {
  let shell = shell.unwrap_or(DEFAULT_SHELL);
  let file = shell.rsplit(['/', '\\']).next().unwrap_or(shell).to_ascii_lowercase();
  let name = file.strip_suffix(".exe").unwrap_or(&file);
  let flags: &'static [&'static str] = match name {
    "powershell" | "pwsh" => &["-NoProfile", "-Command"],
    "cmd" => &["/C"],
    _ => &["-c"],
  };
  (shell, flags)
}
