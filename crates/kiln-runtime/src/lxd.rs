use crate::backend::{
    env_prefix, instance_not_found, EnvVars, InstanceBackend, InstanceRef, InstanceStatus,
    LaunchOptions,
};
use crate::error::ProviderError;
use crate::mounts::{device_name, Mount};
use crate::process::run_checked;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

/// Drives LXD containers and VMs through the `lxc` client.
pub struct LxdBackend {
    program: String,
}

impl Default for LxdBackend {
    fn default() -> Self {
        Self {
            program: "lxc".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    status: String,
    #[serde(default)]
    devices: BTreeMap<String, BTreeMap<String, String>>,
}

impl LxdBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn lxc(&self, instance: &InstanceRef) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--project", &instance.project]);
        cmd
    }

    fn target(instance: &InstanceRef) -> String {
        format!("{}:{}", instance.remote, instance.name)
    }

    fn file_target(instance: &InstanceRef, path: &Path) -> String {
        format!("{}{}", Self::target(instance), path.display())
    }

    fn list_command(&self, instance: &InstanceRef) -> Command {
        let mut cmd = self.lxc(instance);
        cmd.args(["list", "--format", "json", &format!("{}:", instance.remote)]);
        cmd
    }

    fn launch_command(&self, instance: &InstanceRef, options: &LaunchOptions) -> Command {
        let image = if options.image_remote.is_empty() {
            options.image.clone()
        } else {
            format!("{}:{}", options.image_remote, options.image)
        };
        let mut cmd = self.lxc(instance);
        cmd.args(["launch", &image, &Self::target(instance)]);
        if options.ephemeral {
            cmd.arg("--ephemeral");
        }
        cmd
    }

    fn simple_command(&self, instance: &InstanceRef, action: &str) -> Command {
        let mut cmd = self.lxc(instance);
        cmd.args([action, &Self::target(instance)]);
        cmd
    }

    fn mount_command(&self, instance: &InstanceRef, host_source: &Path, target: &Path) -> Command {
        let mut cmd = self.lxc(instance);
        cmd.args([
            "config",
            "device",
            "add",
            &Self::target(instance),
            &device_name(target),
            "disk",
        ])
        .arg(format!("source={}", host_source.display()))
        .arg(format!("path={}", target.display()));
        cmd
    }

    fn unmount_command(&self, instance: &InstanceRef, mount: &Mount) -> Command {
        let mut cmd = self.lxc(instance);
        cmd.args([
            "config",
            "device",
            "remove",
            &Self::target(instance),
            &mount.device,
        ]);
        cmd
    }

    fn query(&self, instance: &InstanceRef) -> Result<Option<ListEntry>, ProviderError> {
        let result = run_checked(
            &mut self.list_command(instance),
            "Failed to query LXD instances.",
        )?;
        parse_list_output(result.stdout_bytes(), &instance.name)
    }
}

fn parse_list_output(stdout: &[u8], name: &str) -> Result<Option<ListEntry>, ProviderError> {
    let entries: Vec<ListEntry> = serde_json::from_slice(stdout).map_err(|e| {
        ProviderError::new("Failed to parse LXD instance list.")
            .with_details(format!("* Parse error: {e}"))
    })?;
    Ok(entries.into_iter().find(|e| e.name == name))
}

fn status_from(entry: Option<&ListEntry>) -> InstanceStatus {
    match entry.map(|e| e.status.as_str()) {
        None => InstanceStatus::Absent,
        Some("Running") => InstanceStatus::Running,
        Some("Stopped") => InstanceStatus::Stopped,
        Some(other) => InstanceStatus::Other(other.to_owned()),
    }
}

fn mounts_from(entry: &ListEntry) -> Vec<Mount> {
    entry
        .devices
        .iter()
        .filter(|(_, config)| config.get("type").map(String::as_str) == Some("disk"))
        .filter_map(|(device, config)| {
            // The root disk has a pool, not a host source.
            let source = config.get("source")?;
            let path = config.get("path")?;
            Some(Mount {
                host_source: PathBuf::from(source),
                target: PathBuf::from(path),
                device: device.clone(),
            })
        })
        .collect()
}

impl InstanceBackend for LxdBackend {
    fn name(&self) -> &'static str {
        "lxd"
    }

    fn available(&self) -> bool {
        Command::new(&self.program)
            .arg("version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn status(&self, instance: &InstanceRef) -> Result<InstanceStatus, ProviderError> {
        Ok(status_from(self.query(instance)?.as_ref()))
    }

    fn launch(
        &self,
        instance: &InstanceRef,
        options: &LaunchOptions,
    ) -> Result<(), ProviderError> {
        info!("launching {instance} from {}", options.image);
        run_checked(
            &mut self.launch_command(instance, options),
            &format!("Failed to launch instance {:?}.", instance.name),
        )?;
        Ok(())
    }

    fn start(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        run_checked(
            &mut self.simple_command(instance, "start"),
            &format!("Failed to start instance {:?}.", instance.name),
        )?;
        Ok(())
    }

    fn stop(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        run_checked(
            &mut self.simple_command(instance, "stop"),
            &format!("Failed to stop instance {:?}.", instance.name),
        )?;
        Ok(())
    }

    fn delete(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        let mut cmd = self.simple_command(instance, "delete");
        cmd.arg("--force");
        run_checked(
            &mut cmd,
            &format!("Failed to delete instance {:?}.", instance.name),
        )?;
        Ok(())
    }

    fn exec_command(
        &self,
        instance: &InstanceRef,
        command: &[String],
        cwd: Option<&Path>,
        env: &EnvVars,
    ) -> Result<Command, ProviderError> {
        let mut cmd = self.lxc(instance);
        cmd.args(["exec", &Self::target(instance)]);
        if let Some(cwd) = cwd {
            cmd.arg("--cwd").arg(cwd);
        }
        cmd.arg("--");
        cmd.args(env_prefix(env));
        cmd.args(command);
        Ok(cmd)
    }

    fn push_file(
        &self,
        instance: &InstanceRef,
        source: &Path,
        destination: &Path,
    ) -> Result<(), ProviderError> {
        let mut cmd = self.lxc(instance);
        cmd.args(["file", "push"])
            .arg(source)
            .arg(Self::file_target(instance, destination));
        run_checked(
            &mut cmd,
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
        let mut cmd = self.lxc(instance);
        cmd.args(["file", "pull"])
            .arg(Self::file_target(instance, source))
            .arg(destination);
        run_checked(
            &mut cmd,
            &format!("Failed to pull file {}.", source.display()),
        )?;
        Ok(())
    }

    fn mounts(&self, instance: &InstanceRef) -> Result<Vec<Mount>, ProviderError> {
        self.query(instance)?
            .as_ref()
            .map(mounts_from)
            .ok_or_else(|| instance_not_found(instance))
    }

    fn mount(
        &self,
        instance: &InstanceRef,
        host_source: &Path,
        target: &Path,
    ) -> Result<(), ProviderError> {
        run_checked(
            &mut self.mount_command(instance, host_source, target),
            &format!(
                "Failed to mount {} to {}.",
                host_source.display(),
                target.display()
            ),
        )?;
        Ok(())
    }

    fn unmount(&self, instance: &InstanceRef, mount: &Mount) -> Result<(), ProviderError> {
        run_checked(
            &mut self.unmount_command(instance, mount),
            &format!("Failed to unmount {}.", mount.target.display()),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::command_args;

    fn instance() -> InstanceRef {
        InstanceRef {
            name: "builder".to_owned(),
            project: "craft".to_owned(),
            remote: "local".to_owned(),
        }
    }

    #[test]
    fn launch_argv() {
        let backend = LxdBackend::new();
        let opts = LaunchOptions::new("22.04", "ubuntu").ephemeral(true);
        assert_eq!(
            command_args(&backend.launch_command(&instance(), &opts)),
            vec![
                "lxc",
                "--project",
                "craft",
                "launch",
                "ubuntu:22.04",
                "local:builder",
                "--ephemeral"
            ]
        );
    }

    #[test]
    fn launch_without_image_remote() {
        let backend = LxdBackend::new();
        let opts = LaunchOptions::new("my-image", "");
        let args = command_args(&backend.launch_command(&instance(), &opts));
        assert_eq!(args[4], "my-image");
        assert!(!args.contains(&"--ephemeral".to_owned()));
    }

    #[test]
    fn exec_argv_with_cwd_and_env() {
        let backend = LxdBackend::new();
        let mut env = EnvVars::new();
        env.insert("FOO".to_owned(), Some("bar".to_owned()));
        let cmd = backend
            .exec_command(
                &instance(),
                &["ls".to_owned(), "-l".to_owned()],
                Some(Path::new("/root")),
                &env,
            )
            .unwrap();
        assert_eq!(
            command_args(&cmd),
            vec![
                "lxc",
                "--project",
                "craft",
                "exec",
                "local:builder",
                "--cwd",
                "/root",
                "--",
                "env",
                "FOO=bar",
                "ls",
                "-l"
            ]
        );
    }

    #[test]
    fn exec_argv_plain() {
        let backend = LxdBackend::with_program("/snap/bin/lxc");
        let cmd = backend
            .exec_command(&instance(), &["true".to_owned()], None, &EnvVars::new())
            .unwrap();
        assert_eq!(
            command_args(&cmd),
            vec!["/snap/bin/lxc", "--project", "craft", "exec", "local:builder", "--", "true"]
        );
    }

    #[test]
    fn file_target_joins_absolute_path() {
        assert_eq!(
            LxdBackend::file_target(&instance(), Path::new("/tmp/f")),
            "local:builder/tmp/f"
        );
    }

    const LIST_JSON: &str = r#"[
        {"name": "other", "status": "Stopped", "devices": {}},
        {"name": "builder", "status": "Running", "devices": {
            "root": {"path": "/", "pool": "default", "type": "disk"},
            "disk-/tmp/mnt": {"path": "/tmp/mnt", "source": "/home/u/src", "type": "disk"},
            "eth1": {"type": "nic", "nictype": "bridged", "parent": "lxdbr0"}
        }}
    ]"#;

    #[test]
    fn parse_status_and_mounts() {
        let entry = parse_list_output(LIST_JSON.as_bytes(), "builder").unwrap();
        assert_eq!(status_from(entry.as_ref()), InstanceStatus::Running);
        let mounts = mounts_from(entry.as_ref().unwrap());
        assert_eq!(
            mounts,
            vec![Mount {
                host_source: PathBuf::from("/home/u/src"),
                target: PathBuf::from("/tmp/mnt"),
                device: "disk-/tmp/mnt".to_owned(),
            }]
        );
    }

    #[test]
    fn parse_missing_instance_is_absent() {
        let entry = parse_list_output(LIST_JSON.as_bytes(), "nope").unwrap();
        assert_eq!(status_from(entry.as_ref()), InstanceStatus::Absent);
        let stopped = parse_list_output(LIST_JSON.as_bytes(), "other").unwrap();
        assert_eq!(status_from(stopped.as_ref()), InstanceStatus::Stopped);
    }

    #[test]
    fn parse_garbage_fails_cleanly() {
        let err = parse_list_output(b"not json", "builder").unwrap_err();
        assert_eq!(err.brief, "Failed to parse LXD instance list.");
    }

    #[test]
    fn missing_lxc_surfaces_provider_error() {
        let backend = LxdBackend::with_program("kiln-no-such-lxc");
        let err = backend.status(&instance()).unwrap_err();
        assert!(err.brief.contains("not found on PATH"));
        assert!(!backend.available());
    }

    #[test]
    fn mount_and_unmount_argv() {
        let backend = LxdBackend::new();
        let cmd = backend.mount_command(
            &instance(),
            Path::new("/home/u/project"),
            Path::new("/root/project"),
        );
        assert_eq!(
            command_args(&cmd),
            vec![
                "lxc",
                "--project",
                "craft",
                "config",
                "device",
                "add",
                "local:builder",
                "disk-/root/project",
                "disk",
                "source=/home/u/project",
                "path=/root/project"
            ]
        );

        let mount = Mount {
            host_source: PathBuf::from("/home/u/project"),
            target: PathBuf::from("/root/project"),
            device: "disk-/root/project".to_owned(),
        };
        assert_eq!(
            command_args(&backend.unmount_command(&instance(), &mount)),
            vec![
                "lxc",
                "--project",
                "craft",
                "config",
                "device",
                "remove",
                "local:builder",
                "disk-/root/project"
            ]
        );
    }

    #[test]
    fn mounts_of_absent_instance_fail() {
        let dir = tempfile::tempdir().unwrap();
        let lxc = crate::backend::fake_tool(dir.path(), "lxc", "echo '[]'");
        let backend = LxdBackend::with_program(lxc.to_string_lossy());
        let err = backend.mounts(&instance()).unwrap_err();
        assert_eq!(err.brief, "Instance \"builder\" not found.");
        assert_eq!(
            backend.status(&instance()).unwrap(),
            InstanceStatus::Absent
        );
    }
}
