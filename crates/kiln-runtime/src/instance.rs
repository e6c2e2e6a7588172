use crate::backend::{EnvVars, InstanceBackend, InstanceRef, InstanceStatus, LaunchOptions};
use crate::error::{shell_join, ProviderError};
use crate::mounts::{find_by_target, plan_mount, require_absolute, Mount, MountPlan};
use crate::process::{command_args, run, spawn_error, Capture, ExecResult};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use tracing::{debug, info, warn};

/// Options for [`Instance::execute_run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub capture_output: bool,
    /// Decode captured output as text, replacing undecodable bytes.
    pub text: bool,
    /// Fail with a [`ProviderError`] on non-zero exit.
    pub check: bool,
    pub cwd: Option<PathBuf>,
    pub env: EnvVars,
}

impl RunOptions {
    pub fn captured() -> Self {
        Self {
            capture_output: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_text(mut self) -> Self {
        self.text = true;
        self
    }

    #[must_use]
    pub fn with_check(mut self) -> Self {
        self.check = true;
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.env.insert(key.into(), value.map(str::to_owned));
        self
    }
}

/// One build environment, addressed by name and project on a backend.
///
/// Holds only identifying keys. Existence, run state and mounts are asked of
/// the backend on every call, so the answers stay correct when something
/// else changes the instance underneath us. Calls on the same instance must
/// be serialized by the caller.
pub struct Instance {
    instance: InstanceRef,
    backend: Box<dyn InstanceBackend>,
}

impl Instance {
    pub fn new(name: impl Into<String>, backend: Box<dyn InstanceBackend>) -> Self {
        Self {
            instance: InstanceRef::new(name),
            backend,
        }
    }

    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.instance.project = project.into();
        self
    }

    #[must_use]
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.instance.remote = remote.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }

    pub fn project(&self) -> &str {
        &self.instance.project
    }

    pub fn instance_ref(&self) -> &InstanceRef {
        &self.instance
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn status(&self) -> Result<InstanceStatus, ProviderError> {
        self.backend.status(&self.instance)
    }

    /// Never fails; a backend query error is logged and reported as `false`.
    pub fn exists(&self) -> bool {
        match self.status() {
            Ok(status) => status.exists(),
            Err(e) => {
                warn!("failed to query {}: {}", self.instance, e.brief);
                false
            }
        }
    }

    /// Never fails; a backend query error is logged and reported as `false`.
    pub fn is_running(&self) -> bool {
        match self.status() {
            Ok(status) => status.is_running(),
            Err(e) => {
                warn!("failed to query {}: {}", self.instance, e.brief);
                false
            }
        }
    }

    /// Create and start the instance unless it already exists.
    pub fn launch(&self, options: &LaunchOptions) -> Result<(), ProviderError> {
        if self.status()?.exists() {
            debug!("{} already exists, skipping launch", self.instance);
            return Ok(());
        }
        self.backend.launch(&self.instance, options)?;
        info!("launched {}", self.instance);
        Ok(())
    }

    pub fn start(&self) -> Result<(), ProviderError> {
        match self.status()? {
            InstanceStatus::Running => Ok(()),
            InstanceStatus::Absent => Err(self.absent_error("start")),
            _ => {
                self.backend.start(&self.instance)?;
                info!("started {}", self.instance);
                Ok(())
            }
        }
    }

    pub fn stop(&self) -> Result<(), ProviderError> {
        match self.status()? {
            InstanceStatus::Stopped => Ok(()),
            InstanceStatus::Absent => Err(self.absent_error("stop")),
            _ => {
                self.backend.stop(&self.instance)?;
                info!("stopped {}", self.instance);
                Ok(())
            }
        }
    }

    /// Delete the instance and everything mounted into it. Absent is fine.
    pub fn delete(&self) -> Result<(), ProviderError> {
        if !self.status()?.exists() {
            debug!("{} does not exist, nothing to delete", self.instance);
            return Ok(());
        }
        self.backend.delete(&self.instance)?;
        info!("deleted {}", self.instance);
        Ok(())
    }

    fn absent_error(&self, action: &str) -> ProviderError {
        ProviderError::new(format!(
            "Failed to {action} instance {:?}.",
            self.instance.name
        ))
        .with_details(format!("* Instance {} does not exist", self.instance))
        .with_resolution("Launch the instance first.")
    }

    /// Run `command` inside the instance.
    ///
    /// A non-zero exit is reported through `returncode` and only becomes an
    /// error when `options.check` is set.
    pub fn execute_run<S: AsRef<str>>(
        &self,
        command: &[S],
        options: &RunOptions,
    ) -> Result<ExecResult, ProviderError> {
        let command: Vec<String> = command.iter().map(|s| s.as_ref().to_owned()).collect();
        let mut cmd = self.backend.exec_command(
            &self.instance,
            &command,
            options.cwd.as_deref(),
            &options.env,
        )?;
        let result = run(
            &mut cmd,
            Capture::from_flags(options.capture_output, options.text),
        )?;
        if options.check && !result.success() {
            return Err(ProviderError::from_called_process_error(
                format!("Failed to run command in instance {:?}.", self.instance.name),
                &result.to_called_process_error(),
                None,
            ));
        }
        Ok(result)
    }

    /// Spawn `command` inside the instance with piped stdio, for callers
    /// that stream or feed the process themselves.
    pub fn execute_popen<S: AsRef<str>>(
        &self,
        command: &[S],
        cwd: Option<&Path>,
        env: &EnvVars,
    ) -> Result<Child, ProviderError> {
        let command: Vec<String> = command.iter().map(|s| s.as_ref().to_owned()).collect();
        let mut cmd = self
            .backend
            .exec_command(&self.instance, &command, cwd, env)?;
        let args = command_args(&cmd);
        debug!("spawning: {}", shell_join(&args));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&args, e))
    }

    fn run_checked_in_guest(&self, command: &[&str], brief: &str) -> Result<(), ProviderError> {
        let result = self.execute_run(command, &RunOptions::captured())?;
        result.check(brief)?;
        Ok(())
    }

    /// Write `content` to `destination` in the instance with the given
    /// ownership and octal permission mode.
    pub fn create_file(
        &self,
        destination: &Path,
        content: &[u8],
        file_mode: &str,
        user: &str,
        group: &str,
    ) -> Result<(), ProviderError> {
        validate_file_mode(file_mode)?;
        require_absolute(destination, "destination")?;

        let mut staged = tempfile::NamedTempFile::new().map_err(|e| {
            ProviderError::new("Failed to create temporary file.").with_source(e)
        })?;
        staged
            .write_all(content)
            .and_then(|()| staged.flush())
            .map_err(|e| {
                ProviderError::new("Failed to write temporary file.").with_source(e)
            })?;

        self.backend
            .push_file(&self.instance, staged.path(), destination)?;

        let dest = destination.to_string_lossy();
        let owner = format!("{user}:{group}");
        self.run_checked_in_guest(
            &["chown", &owner, &dest],
            &format!("Failed to set ownership of {dest}."),
        )?;
        self.run_checked_in_guest(
            &["chmod", file_mode, &dest],
            &format!("Failed to set permissions of {dest}."),
        )?;
        debug!("created {dest} ({file_mode} {owner}) in {}", self.instance);
        Ok(())
    }

    /// Copy an existing host file into the instance.
    pub fn push_file(&self, source: &Path, destination: &Path) -> Result<(), ProviderError> {
        require_absolute(source, "source")?;
        require_absolute(destination, "destination")?;
        if !source.is_file() {
            return Err(ProviderError::new(format!(
                "Source file {} does not exist.",
                source.display()
            )));
        }
        self.backend.push_file(&self.instance, source, destination)
    }

    /// Copy a file out of the instance onto the host.
    pub fn pull_file(&self, source: &Path, destination: &Path) -> Result<(), ProviderError> {
        require_absolute(source, "source")?;
        require_absolute(destination, "destination")?;
        if !destination.parent().is_some_and(Path::is_dir) {
            return Err(ProviderError::new(format!(
                "Target directory for {} does not exist.",
                destination.display()
            )));
        }
        self.backend.pull_file(&self.instance, source, destination)
    }

    pub fn mounts(&self) -> Result<Vec<Mount>, ProviderError> {
        self.backend.mounts(&self.instance)
    }

    /// Bind `host_source` into the instance at `target`.
    ///
    /// Mounting the same pair twice is a no-op. Binding a different source
    /// onto a target that is already in use is rejected.
    pub fn mount(&self, host_source: &Path, target: &Path) -> Result<(), ProviderError> {
        require_absolute(host_source, "host source")?;
        require_absolute(target, "mount target")?;

        let active = self.mounts()?;
        match plan_mount(&active, host_source, target) {
            MountPlan::AlreadyMounted => {
                debug!(
                    "{} already mounted at {}",
                    host_source.display(),
                    target.display()
                );
                return Ok(());
            }
            MountPlan::Conflict(existing) => {
                return Err(ProviderError::new(format!(
                    "Failed to mount {} to {}.",
                    host_source.display(),
                    target.display()
                ))
                .with_details(format!(
                    "* {} is already mounted at {}",
                    existing.host_source.display(),
                    target.display()
                ))
                .with_resolution("Unmount the existing mount first."));
            }
            MountPlan::Create => {}
        }

        let target_str = target.to_string_lossy();
        self.run_checked_in_guest(
            &["mkdir", "-p", &target_str],
            &format!("Failed to create mount target {target_str}."),
        )?;
        self.backend.mount(&self.instance, host_source, target)?;
        info!(
            "mounted {} at {} in {}",
            host_source.display(),
            target_str,
            self.instance
        );
        Ok(())
    }

    /// Whether exactly this `(host_source, target)` pair is mounted.
    pub fn is_mounted(&self, host_source: &Path, target: &Path) -> Result<bool, ProviderError> {
        Ok(self
            .mounts()?
            .iter()
            .any(|m| m.matches(host_source, target)))
    }

    /// Remove whatever is mounted at `target`; no-op if nothing is.
    pub fn unmount(&self, target: &Path) -> Result<(), ProviderError> {
        let active = self.mounts()?;
        match find_by_target(&active, target) {
            Some(mount) => {
                self.backend.unmount(&self.instance, mount)?;
                info!("unmounted {} in {}", target.display(), self.instance);
            }
            None => debug!("nothing mounted at {}", target.display()),
        }
        Ok(())
    }

    pub fn unmount_all(&self) -> Result<(), ProviderError> {
        for mount in self.mounts()? {
            self.backend.unmount(&self.instance, &mount)?;
            debug!("unmounted {} in {}", mount.target.display(), self.instance);
        }
        Ok(())
    }
}

/// Accept three or four octal digits, e.g. `644` or `0755`.
pub fn validate_file_mode(mode: &str) -> Result<(), ProviderError> {
    let valid = (3..=4).contains(&mode.len())
        && mode.bytes().all(|b| (b'0'..=b'7').contains(&b));
    if valid {
        Ok(())
    } else {
        Err(ProviderError::new(format!("Invalid file mode {mode:?}."))
            .with_resolution("Use an octal mode such as 644 or 0755."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    #[test]
    fn file_modes() {
        for ok in ["644", "600", "755", "0644", "1777"] {
            assert!(validate_file_mode(ok).is_ok(), "{ok}");
        }
        for bad in ["", "64", "888", "rwxr-xr-x", "06444", "-644"] {
            assert!(validate_file_mode(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn run_options_builder() {
        let opts = RunOptions::captured()
            .with_text()
            .with_check()
            .with_cwd("/root")
            .with_env("A", Some("1"))
            .with_env("B", None);
        assert!(opts.capture_output && opts.text && opts.check);
        assert_eq!(opts.cwd.as_deref(), Some(Path::new("/root")));
        assert_eq!(opts.env.get("A"), Some(&Some("1".to_owned())));
        assert_eq!(opts.env.get("B"), Some(&None));
    }

    #[test]
    fn instance_keys() {
        let dir = tempfile::tempdir().unwrap();
        let inst = Instance::new("x", Box::new(MockBackend::with_state_dir(dir.path())))
            .with_project("proj")
            .with_remote("remote");
        assert_eq!(inst.name(), "x");
        assert_eq!(inst.project(), "proj");
        assert_eq!(inst.instance_ref().remote, "remote");
        assert_eq!(inst.backend_name(), "mock");
    }

    #[test]
    fn stop_absent_instance_fails() {
        let dir = tempfile::tempdir().unwrap();
        let inst = Instance::new("ghost", Box::new(MockBackend::with_state_dir(dir.path())));
        let err = inst.stop().unwrap_err();
        assert_eq!(err.brief, "Failed to stop instance \"ghost\".");
        assert!(inst.start().is_err());
    }

    #[test]
    fn create_file_rejects_bad_input_before_invoking_backend() {
        let dir = tempfile::tempdir().unwrap();
        let inst = Instance::new("ghost", Box::new(MockBackend::with_state_dir(dir.path())));
        let err = inst
            .create_file(Path::new("/tmp/x"), b"", "9z9", "root", "root")
            .unwrap_err();
        assert!(err.brief.starts_with("Invalid file mode"));
        let err = inst
            .create_file(Path::new("tmp/x"), b"", "644", "root", "root")
            .unwrap_err();
        assert!(err.brief.contains("absolute"));
    }
}
