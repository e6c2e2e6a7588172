use crate::backend::{
    env_prefix, instance_not_found, EnvVars, InstanceBackend, InstanceRef, InstanceStatus,
    LaunchOptions,
};
use crate::error::ProviderError;
use crate::mounts::Mount;
use crate::process::run_checked;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Backend double for tests and dry runs.
///
/// Instance state lives in JSON files under a state directory so separate
/// handles and processes observe the same instances. Every load/modify/save
/// holds an exclusive lock on `state_dir/.lock`, and state files are replaced
/// atomically. Guest commands run directly on the host, which is enough to
/// exercise byte-exact execution and file metadata without a real container
/// manager. A mount replaces the (empty) target directory with a symlink to
/// the host source, so files under the source are readable at the target.
pub struct MockBackend {
    state_dir: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MockInstance {
    running: bool,
    image: String,
    #[serde(default)]
    ephemeral: bool,
    #[serde(default)]
    mounts: Vec<Mount>,
}

/// Held for the duration of one state mutation.
struct StateLock {
    lock_file: File,
}

impl StateLock {
    fn acquire(state_dir: &Path) -> Result<Self, ProviderError> {
        std::fs::create_dir_all(state_dir).map_err(|e| state_error(state_dir, e))?;
        let lock_path = state_dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| state_error(&lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| state_error(&lock_path, e))?;
        Ok(Self { lock_file: file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        let state_dir = std::env::var_os("KILN_MOCK_DIR")
            .map_or_else(|| std::env::temp_dir().join("kiln-mock"), PathBuf::from);
        Self::with_state_dir(state_dir)
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn state_path(&self, instance: &InstanceRef) -> PathBuf {
        self.state_dir
            .join(&instance.project)
            .join(format!("{}.json", instance.name))
    }

    fn load(&self, instance: &InstanceRef) -> Result<Option<MockInstance>, ProviderError> {
        let path = self.state_path(instance);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(state_error(&path, e)),
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            ProviderError::new(format!("corrupt mock state: {}", path.display()))
                .with_details(e.to_string())
        })
    }

    fn save(&self, instance: &InstanceRef, state: &MockInstance) -> Result<(), ProviderError> {
        let path = self.state_path(instance);
        let dir = path.parent().unwrap_or(self.state_dir.as_path());
        std::fs::create_dir_all(dir).map_err(|e| state_error(dir, e))?;
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| ProviderError::new(format!("failed to serialize mock state: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| state_error(dir, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| state_error(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| state_error(&path, e.error))?;
        Ok(())
    }

    fn remove(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        let path = self.state_path(instance);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(state_error(&path, e)),
        }
    }

    /// Apply `f` to an existing instance's state under the state lock.
    fn update<T>(
        &self,
        instance: &InstanceRef,
        f: impl FnOnce(&mut MockInstance) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let _lock = StateLock::acquire(&self.state_dir)?;
        let mut state = self
            .load(instance)?
            .ok_or_else(|| instance_not_found(instance))?;
        let out = f(&mut state)?;
        self.save(instance, &state)?;
        Ok(out)
    }

    /// Drop the instance and unbind whatever it still has mounted.
    fn destroy(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        let _lock = StateLock::acquire(&self.state_dir)?;
        let state = self
            .load(instance)?
            .ok_or_else(|| instance_not_found(instance))?;
        for mount in &state.mounts {
            unbind(&mount.target)?;
        }
        self.remove(instance)
    }

    fn require_running(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        match self.load(instance)? {
            Some(state) if state.running => Ok(()),
            Some(_) => Err(ProviderError::new(format!(
                "Instance {:?} is not running.",
                instance.name
            ))),
            None => Err(instance_not_found(instance)),
        }
    }
}

fn state_error(path: &Path, error: std::io::Error) -> ProviderError {
    ProviderError::new(format!("mock state I/O failed: {}", path.display())).with_source(error)
}

fn copy_command(source: &Path, destination: &Path) -> Command {
    let mut cmd = Command::new("cp");
    cmd.arg(source).arg(destination);
    cmd
}

/// Point `target` at `host_source`. The mount point the caller created is
/// expected to be empty.
fn bind(host_source: &Path, target: &Path) -> Result<(), ProviderError> {
    let brief = || {
        format!(
            "Failed to mount {} to {}.",
            host_source.display(),
            target.display()
        )
    };
    if target.is_dir() && !target.is_symlink() {
        std::fs::remove_dir(target).map_err(|e| ProviderError::new(brief()).with_source(e))?;
    }
    std::os::unix::fs::symlink(host_source, target)
        .map_err(|e| ProviderError::new(brief()).with_source(e))
}

/// Restore the empty mount point left behind after unmounting.
fn unbind(target: &Path) -> Result<(), ProviderError> {
    if !target.is_symlink() {
        return Ok(());
    }
    let brief = || format!("Failed to unmount {}.", target.display());
    std::fs::remove_file(target).map_err(|e| ProviderError::new(brief()).with_source(e))?;
    std::fs::create_dir(target).map_err(|e| ProviderError::new(brief()).with_source(e))
}

impl InstanceBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn status(&self, instance: &InstanceRef) -> Result<InstanceStatus, ProviderError> {
        Ok(match self.load(instance)? {
            None => InstanceStatus::Absent,
            Some(state) if state.running => InstanceStatus::Running,
            Some(_) => InstanceStatus::Stopped,
        })
    }

    fn launch(
        &self,
        instance: &InstanceRef,
        options: &LaunchOptions,
    ) -> Result<(), ProviderError> {
        let _lock = StateLock::acquire(&self.state_dir)?;
        if self.load(instance)?.is_some() {
            return Err(ProviderError::new(format!(
                "Failed to launch instance {:?}.",
                instance.name
            ))
            .with_details("* Instance already exists"));
        }
        let image = if options.image_remote.is_empty() {
            options.image.clone()
        } else {
            format!("{}:{}", options.image_remote, options.image)
        };
        self.save(
            instance,
            &MockInstance {
                running: true,
                image,
                ephemeral: options.ephemeral,
                mounts: Vec::new(),
            },
        )
    }

    fn start(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        self.update(instance, |state| {
            state.running = true;
            Ok(())
        })
    }

    fn stop(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        let ephemeral = self.update(instance, |state| {
            state.running = false;
            Ok(state.ephemeral)
        })?;
        // Ephemeral instances do not survive a stop.
        if ephemeral {
            self.destroy(instance)?;
        }
        Ok(())
    }

    fn delete(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        self.destroy(instance)
    }

    fn exec_command(
        &self,
        instance: &InstanceRef,
        command: &[String],
        cwd: Option<&Path>,
        env: &EnvVars,
    ) -> Result<Command, ProviderError> {
        self.require_running(instance)?;
        let argv: Vec<String> = env_prefix(env)
            .into_iter()
            .chain(command.iter().cloned())
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProviderError::new("Cannot execute an empty command."))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }

    fn push_file(
        &self,
        instance: &InstanceRef,
        source: &Path,
        destination: &Path,
    ) -> Result<(), ProviderError> {
        self.require_running(instance)?;
        run_checked(
            &mut copy_command(source, destination),
            &format!("Failed to push file to {}.", destination.display()),
        )?;
        Ok(())
    }

    fn pull_file(
        &self,
        instance: &InstanceRef,
        source: &Path,
        destination: &Path,
    ) -> Result<(), ProviderError> {
        self.require_running(instance)?;
        run_checked(
            &mut copy_command(source, destination),
            &format!("Failed to pull file {}.", source.display()),
        )?;
        Ok(())
    }

    fn mounts(&self, instance: &InstanceRef) -> Result<Vec<Mount>, ProviderError> {
        self.load(instance)?
            .map(|state| state.mounts)
            .ok_or_else(|| instance_not_found(instance))
    }

    fn mount(
        &self,
        instance: &InstanceRef,
        host_source: &Path,
        target: &Path,
    ) -> Result<(), ProviderError> {
        self.update(instance, |state| {
            bind(host_source, target)?;
            state.mounts.push(Mount {
                host_source: host_source.to_path_buf(),
                target: target.to_path_buf(),
                device: target.to_string_lossy().into_owned(),
            });
            Ok(())
        })
    }

    fn unmount(&self, instance: &InstanceRef, mount: &Mount) -> Result<(), ProviderError> {
        self.update(instance, |state| {
            unbind(&mount.target)?;
            state.mounts.retain(|m| m.device != mount.device);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, MockBackend, InstanceRef) {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::with_state_dir(dir.path());
        (dir, backend, InstanceRef::new("mock-test"))
    }

    #[test]
    fn mock_lifecycle() {
        let (_dir, backend, inst) = setup();
        assert_eq!(backend.status(&inst).unwrap(), InstanceStatus::Absent);

        backend
            .launch(&inst, &LaunchOptions::new("22.04", "ubuntu"))
            .unwrap();
        assert_eq!(backend.status(&inst).unwrap(), InstanceStatus::Running);

        backend.stop(&inst).unwrap();
        assert_eq!(backend.status(&inst).unwrap(), InstanceStatus::Stopped);

        backend.start(&inst).unwrap();
        assert_eq!(backend.status(&inst).unwrap(), InstanceStatus::Running);

        backend.delete(&inst).unwrap();
        assert_eq!(backend.status(&inst).unwrap(), InstanceStatus::Absent);
        assert!(backend.delete(&inst).is_err());
    }

    #[test]
    fn mock_launch_twice_fails_at_backend_level() {
        let (_dir, backend, inst) = setup();
        let opts = LaunchOptions::new("22.04", "ubuntu");
        backend.launch(&inst, &opts).unwrap();
        let err = backend.launch(&inst, &opts).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn mock_ephemeral_disappears_on_stop() {
        let (_dir, backend, inst) = setup();
        backend
            .launch(&inst, &LaunchOptions::new("22.04", "ubuntu").ephemeral(true))
            .unwrap();
        backend.stop(&inst).unwrap();
        assert_eq!(backend.status(&inst).unwrap(), InstanceStatus::Absent);
    }

    #[test]
    fn mock_projects_are_separate() {
        let (_dir, backend, inst) = setup();
        let mut other = inst.clone();
        other.project = "other".to_owned();
        backend
            .launch(&inst, &LaunchOptions::new("22.04", ""))
            .unwrap();
        assert_eq!(backend.status(&other).unwrap(), InstanceStatus::Absent);
    }

    #[test]
    fn mock_exec_requires_running() {
        let (_dir, backend, inst) = setup();
        let cmd = ["true".to_owned()];
        assert!(backend
            .exec_command(&inst, &cmd, None, &EnvVars::new())
            .is_err());
        backend
            .launch(&inst, &LaunchOptions::new("22.04", ""))
            .unwrap();
        backend.stop(&inst).unwrap();
        let err = backend
            .exec_command(&inst, &cmd, None, &EnvVars::new())
            .unwrap_err();
        assert!(err.brief.contains("not running"));
    }

    #[test]
    fn mock_state_shared_between_handles() {
        let (dir, backend, inst) = setup();
        backend
            .launch(&inst, &LaunchOptions::new("22.04", ""))
            .unwrap();
        let second = MockBackend::with_state_dir(dir.path());
        assert_eq!(second.status(&inst).unwrap(), InstanceStatus::Running);
    }

    #[test]
    fn mock_mounts_on_absent_instance_fail() {
        let (_dir, backend, inst) = setup();
        let err = backend.mounts(&inst).unwrap_err();
        assert_eq!(err.brief, "Instance \"mock-test\" not found.");
    }

    #[test]
    fn mock_mount_links_target_to_source() {
        let (dir, backend, inst) = setup();
        backend
            .launch(&inst, &LaunchOptions::new("22.04", ""))
            .unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("test.txt"), "hello").unwrap();
        let target = dir.path().join("mnt");
        std::fs::create_dir(&target).unwrap();

        backend.mount(&inst, &source, &target).unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("test.txt")).unwrap(),
            "hello"
        );

        let mounts = backend.mounts(&inst).unwrap();
        backend.unmount(&inst, &mounts[0]).unwrap();
        assert!(!target.is_symlink());
        assert!(target.is_dir());
        assert!(!target.join("test.txt").exists());
        assert!(backend.mounts(&inst).unwrap().is_empty());
    }

    #[test]
    fn mock_concurrent_handles_keep_every_update() {
        let (dir, backend, inst) = setup();
        backend
            .launch(&inst, &LaunchOptions::new("22.04", ""))
            .unwrap();
        let source = dir.path().join("src");

        std::thread::scope(|scope| {
            for worker in 0..2 {
                let (dir, inst, source) = (dir.path(), &inst, &source);
                scope.spawn(move || {
                    let handle = MockBackend::with_state_dir(dir);
                    for i in 0..40 {
                        let target = dir.join(format!("mnt-{worker}-{i}"));
                        handle.mount(inst, source, &target).unwrap();
                    }
                });
            }
        });

        assert_eq!(backend.mounts(&inst).unwrap().len(), 80);
    }

    #[test]
    fn mock_delete_unbinds_mounts() {
        let (dir, backend, inst) = setup();
        backend
            .launch(&inst, &LaunchOptions::new("22.04", ""))
            .unwrap();
        let target = dir.path().join("mnt");
        backend
            .mount(&inst, &dir.path().join("src"), &target)
            .unwrap();
        assert!(target.is_symlink());

        backend.delete(&inst).unwrap();
        assert!(!target.is_symlink());
    }
}
