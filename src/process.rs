//! Thin builder over `std::process::Command` for one-shot host commands.
//!
//! A non-zero exit is an error unless [`Cmd::allow_fail`] is set, in which
//! case the caller inspects [`CmdResult::success`] itself.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
    allow_fail: bool,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            stdin: None,
            allow_fail: false,
            error_msg: None,
        }
    }

    /// Build a command from an argv vector (`argv[0]` is the program).
    pub fn from_argv<S: AsRef<OsStr>>(argv: &[S]) -> Result<Self> {
        let (program, rest) = argv
            .split_first()
            .context("cannot build a command from an empty argv")?;
        Ok(Self::new(program).args(rest))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Bytes written to the child's stdin before waiting on it.
    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Human-readable rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn run(self) -> Result<CmdResult> {
        let rendered = self.display();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", rendered))?;

        if let Some(bytes) = &self.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                // The child may exit before reading; a broken pipe is not our failure.
                let _ = stdin.write_all(bytes);
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for `{}`", rendered))?;

        let result = CmdResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("`{}` failed", rendered));
            bail!(
                "{} (exit code {}){}",
                msg,
                result.code(),
                stderr_suffix(&result.stderr)
            );
        }

        Ok(result)
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

#[derive(Debug)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or `128 + signal` when the child was killed.
    pub fn code(&self) -> i32 {
        exit_code_of(&self.status)
    }

    /// Combined output: stdout lines followed by stderr lines.
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::to_string)
            .collect()
    }
}

pub fn exit_code_of(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}
