use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Uniform failure raised by every backend-facing operation.
///
/// The rendered form is the complete user-facing diagnostic: `brief`, then
/// `details`, then `resolution`, one block per line, in that order.
#[derive(Debug, Error)]
pub struct ProviderError {
    pub brief: String,
    pub details: Option<String>,
    pub resolution: Option<String>,
    #[source]
    source: Option<std::io::Error>,
}

impl ProviderError {
    pub fn new(brief: impl Into<String>) -> Self {
        Self {
            brief: brief.into(),
            details: None,
            resolution: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: std::io::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Build an error around a non-zero exit of a backend command.
    pub fn from_called_process_error(
        brief: impl Into<String>,
        error: &CalledProcessError,
        resolution: Option<&str>,
    ) -> Self {
        Self {
            brief: brief.into(),
            details: Some(details_from_called_process_error(error)),
            resolution: resolution.map(str::to_owned),
            source: None,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.brief)?;
        if let Some(details) = self.details.as_deref().filter(|d| !d.is_empty()) {
            write!(f, "\n{details}")?;
        }
        if let Some(resolution) = self.resolution.as_deref().filter(|r| !r.is_empty()) {
            write!(f, "\n{resolution}")?;
        }
        Ok(())
    }
}

/// A backend command that ran to completion with a non-zero exit code.
#[derive(Debug, Clone, Error)]
#[error("command '{}' returned non-zero exit status {returncode}", shell_join(.command))]
pub struct CalledProcessError {
    pub command: Vec<String>,
    pub returncode: i32,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

/// Render the diagnostic block for a failed command.
///
/// Undecodable bytes in `stdout`/`stderr` are replaced, never rejected, so
/// formatting an error cannot itself fail. Empty streams are left out.
pub fn details_from_command_error(
    command: &[String],
    returncode: i32,
    stdout: Option<&[u8]>,
    stderr: Option<&[u8]>,
) -> String {
    let mut details = vec![
        format!("* Command that failed: {}", shell_join(command)),
        format!("* Command exit code: {returncode}"),
    ];

    if let Some(stdout) = stdout.filter(|s| !s.is_empty()) {
        details.push(format!(
            "* Command output: {}",
            String::from_utf8_lossy(stdout)
        ));
    }

    if let Some(stderr) = stderr.filter(|s| !s.is_empty()) {
        details.push(format!(
            "* Command standard error output: {}",
            String::from_utf8_lossy(stderr)
        ));
    }

    details.join("\n")
}

pub fn details_from_called_process_error(error: &CalledProcessError) -> String {
    details_from_command_error(
        &error.command,
        error.returncode,
        error.stdout.as_deref(),
        error.stderr.as_deref(),
    )
}

fn is_shell_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b)
}

/// Quote one argument so a POSIX shell reads it back verbatim.
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("''");
    }
    if arg.bytes().all(is_shell_safe) {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', "'\"'\"'")))
}

/// Join a command line into a copy-pasteable shell string.
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
