//! The single invocation path for backend tools.
//!
//! Every `lxc`/`multipass` call, whether a lifecycle transition or a command
//! wrapped to run inside a guest, goes through [`run`] so spawn failures and
//! non-zero exits surface uniformly as [`ProviderError`].

use crate::error::{shell_join, CalledProcessError, ProviderError};
use std::borrow::Cow;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// How a command's stdout/stderr are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Streams go straight to the caller's own stdout/stderr.
    Inherit,
    /// Captured exactly as produced.
    Bytes,
    /// Captured and decoded, replacing undecodable sequences.
    Text,
}

impl Capture {
    pub fn from_flags(capture_output: bool, text: bool) -> Self {
        match (capture_output, text) {
            (false, _) => Self::Inherit,
            (true, false) => Self::Bytes,
            (true, true) => Self::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedOutput {
    Bytes(Vec<u8>),
    Text(String),
}

impl CapturedOutput {
    fn new(bytes: Vec<u8>, capture: Capture) -> Self {
        if capture == Capture::Text {
            let text = match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            };
            Self::Text(text)
        } else {
            Self::Bytes(bytes)
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::Text(s) => s.as_bytes(),
        }
    }

    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            Self::Bytes(b) => String::from_utf8_lossy(b),
            Self::Text(s) => Cow::Borrowed(s),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Outcome of one backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Full argv as handed to the host, backend wrapper included.
    pub args: Vec<String>,
    pub returncode: i32,
    /// `None` when the stream was inherited rather than captured.
    pub stdout: Option<CapturedOutput>,
    pub stderr: Option<CapturedOutput>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }

    pub fn stdout_bytes(&self) -> &[u8] {
        self.stdout.as_ref().map_or(&[], CapturedOutput::as_bytes)
    }

    pub fn stderr_bytes(&self) -> &[u8] {
        self.stderr.as_ref().map_or(&[], CapturedOutput::as_bytes)
    }

    pub fn stdout_text(&self) -> Cow<'_, str> {
        self.stdout
            .as_ref()
            .map_or(Cow::Borrowed(""), CapturedOutput::to_text)
    }

    pub fn stderr_text(&self) -> Cow<'_, str> {
        self.stderr
            .as_ref()
            .map_or(Cow::Borrowed(""), CapturedOutput::to_text)
    }

    pub fn to_called_process_error(&self) -> CalledProcessError {
        CalledProcessError {
            command: self.args.clone(),
            returncode: self.returncode,
            stdout: self.stdout.as_ref().map(|o| o.as_bytes().to_vec()),
            stderr: self.stderr.as_ref().map(|o| o.as_bytes().to_vec()),
        }
    }

    /// Turn a non-zero exit into a [`ProviderError`].
    pub fn check(self, brief: &str) -> Result<Self, ProviderError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProviderError::from_called_process_error(
                brief,
                &self.to_called_process_error(),
                None,
            ))
        }
    }
}

/// Lossy argv of a prepared command, program first.
pub fn command_args(cmd: &Command) -> Vec<String> {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect()
}

/// Exit code in the usual shell convention; death by signal N reports `-N`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

pub(crate) fn spawn_error(args: &[String], error: std::io::Error) -> ProviderError {
    let program = args.first().map_or("<empty>", String::as_str);
    let brief = if error.kind() == std::io::ErrorKind::NotFound {
        format!("{program} not found on PATH")
    } else {
        format!("failed to execute {program}: {error}")
    };
    ProviderError::new(brief)
        .with_details(format!("* Command that failed: {}", shell_join(args)))
        .with_resolution(format!(
            "Ensure {program} is installed and available on PATH."
        ))
        .with_source(error)
}

/// Run `cmd` to completion. Never fails on a non-zero exit.
pub fn run(cmd: &mut Command, capture: Capture) -> Result<ExecResult, ProviderError> {
    let args = command_args(cmd);
    debug!("executing: {}", shell_join(&args));

    if capture == Capture::Inherit {
        let status = cmd
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| spawn_error(&args, e))?;
        return Ok(ExecResult {
            args,
            returncode: exit_code(status),
            stdout: None,
            stderr: None,
        });
    }

    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_error(&args, e))?;
    let returncode = exit_code(output.status);
    if returncode != 0 {
        debug!("exit code {returncode}: {}", shell_join(&args));
    }
    Ok(ExecResult {
        args,
        returncode,
        stdout: Some(CapturedOutput::new(output.stdout, capture)),
        stderr: Some(CapturedOutput::new(output.stderr, capture)),
    })
}

/// Run `cmd` capturing bytes; a non-zero exit becomes a [`ProviderError`]
/// with `brief` and the command's full diagnostic.
pub fn run_checked(cmd: &mut Command, brief: &str) -> Result<ExecResult, ProviderError> {
    run(cmd, Capture::Bytes)?.check(brief)
}
