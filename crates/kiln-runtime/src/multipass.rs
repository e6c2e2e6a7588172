use crate::backend::{
    env_prefix, instance_not_found, EnvVars, InstanceBackend, InstanceRef, InstanceStatus,
    LaunchOptions,
};
use crate::error::ProviderError;
use crate::mounts::Mount;
use crate::process::{run, run_checked, Capture};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

static PUSH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Drives Multipass VMs through the `multipass` client.
///
/// Multipass has no notion of projects or remotes; both are ignored.
pub struct MultipassBackend {
    program: String,
}

impl Default for MultipassBackend {
    fn default() -> Self {
        Self {
            program: "multipass".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InfoOutput {
    #[serde(default)]
    info: BTreeMap<String, InfoEntry>,
}

#[derive(Debug, Deserialize)]
struct InfoEntry {
    state: String,
    #[serde(default)]
    mounts: BTreeMap<String, MountInfo>,
}

#[derive(Debug, Deserialize)]
struct MountInfo {
    source_path: String,
}

impl MultipassBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn multipass(&self) -> Command {
        Command::new(&self.program)
    }

    fn launch_command(&self, instance: &InstanceRef, options: &LaunchOptions) -> Command {
        let image = if options.image_remote.is_empty() {
            options.image.clone()
        } else {
            format!("{}:{}", options.image_remote, options.image)
        };
        let mut cmd = self.multipass();
        cmd.args(["launch", "--name", &instance.name, &image]);
        cmd
    }

    fn simple_command(&self, action: &str, instance: &InstanceRef) -> Command {
        let mut cmd = self.multipass();
        cmd.args([action, &instance.name]);
        cmd
    }

    fn mount_command(&self, instance: &InstanceRef, host_source: &Path, target: &Path) -> Command {
        let mut cmd = self.multipass();
        cmd.arg("mount")
            .arg(host_source)
            .arg(format!("{}:{}", instance.name, target.display()));
        cmd
    }

    fn unmount_command(&self, instance: &InstanceRef, mount: &Mount) -> Command {
        let mut cmd = self.multipass();
        cmd.arg("umount")
            .arg(format!("{}:{}", instance.name, mount.device));
        cmd
    }

    fn query(&self, instance: &InstanceRef) -> Result<Option<InfoEntry>, ProviderError> {
        let mut cmd = self.multipass();
        cmd.args(["info", &instance.name, "--format", "json"]);
        let result = run(&mut cmd, Capture::Bytes)?;
        if !result.success() {
            if String::from_utf8_lossy(result.stderr_bytes()).contains("does not exist") {
                return Ok(None);
            }
            return Err(ProviderError::from_called_process_error(
                "Failed to query Multipass instance.",
                &result.to_called_process_error(),
                None,
            ));
        }
        parse_info_output(result.stdout_bytes(), &instance.name)
    }
}

fn parse_info_output(stdout: &[u8], name: &str) -> Result<Option<InfoEntry>, ProviderError> {
    let mut parsed: InfoOutput = serde_json::from_slice(stdout).map_err(|e| {
        ProviderError::new("Failed to parse Multipass instance info.")
            .with_details(format!("* Parse error: {e}"))
    })?;
    Ok(parsed.info.remove(name))
}

fn status_from(entry: Option<&InfoEntry>) -> InstanceStatus {
    match entry.map(|e| e.state.as_str()) {
        None => InstanceStatus::Absent,
        Some("Running") => InstanceStatus::Running,
        Some("Stopped") => InstanceStatus::Stopped,
        Some(other) => InstanceStatus::Other(other.to_owned()),
    }
}

fn mounts_from(entry: &InfoEntry) -> Vec<Mount> {
    entry
        .mounts
        .iter()
        .map(|(target, info)| Mount {
            host_source: PathBuf::from(&info.source_path),
            target: PathBuf::from(target),
            device: target.clone(),
        })
        .collect()
}

impl InstanceBackend for MultipassBackend {
    fn name(&self) -> &'static str {
        "multipass"
    }

    fn available(&self) -> bool {
        self.multipass()
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
        if options.ephemeral {
            warn!("multipass does not support ephemeral instances; launching a persistent one");
        }
        info!("launching {instance} from {}", options.image);
        run_checked(
            &mut self.launch_command(instance, options),
            &format!("Failed to launch instance {:?}.", instance.name),
        )?;
        Ok(())
    }

    fn start(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        run_checked(
            &mut self.simple_command("start", instance),
            &format!("Failed to start instance {:?}.", instance.name),
        )?;
        Ok(())
    }

    fn stop(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        run_checked(
            &mut self.simple_command("stop", instance),
            &format!("Failed to stop instance {:?}.", instance.name),
        )?;
        Ok(())
    }

    fn delete(&self, instance: &InstanceRef) -> Result<(), ProviderError> {
        let mut cmd = self.multipass();
        cmd.args(["delete", "--purge", &instance.name]);
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
        let mut cmd = self.multipass();
        cmd.args(["exec", &instance.name]);
        if let Some(cwd) = cwd {
            cmd.arg("--working-directory").arg(cwd);
        }
        cmd.args(["--", "sudo", "-H", "--"]);
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
        // `transfer` writes as the default user, so stage in /tmp and move.
        let staging = format!(
            "/tmp/kiln-push-{}-{}",
            std::process::id(),
            PUSH_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let brief = format!("Failed to push file to {}.", destination.display());

        let mut transfer = self.multipass();
        transfer
            .arg("transfer")
            .arg(source)
            .arg(format!("{}:{staging}", instance.name));
        run_checked(&mut transfer, &brief)?;

        let mv = vec![
            "mv".to_owned(),
            staging.clone(),
            destination.to_string_lossy().into_owned(),
        ];
        if let Err(e) = run_checked(
            &mut self.exec_command(instance, &mv, None, &EnvVars::new())?,
            &brief,
        ) {
            let rm = vec!["rm".to_owned(), "-f".to_owned(), staging];
            if let Err(cleanup) = run(
                &mut self.exec_command(instance, &rm, None, &EnvVars::new())?,
                Capture::Bytes,
            ) {
                warn!("failed to remove staged push file: {}", cleanup.brief);
            }
            return Err(e);
        }
        Ok(())
    }

    fn pull_file(
        &self,
        instance: &InstanceRef,
        source: &Path,
        destination: &Path,
    ) -> Result<(), ProviderError> {
        let mut cmd = self.multipass();
        cmd.arg("transfer")
            .arg(format!("{}:{}", instance.name, source.display()))
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
        InstanceRef::new("vm1")
    }

    #[test]
    fn launch_argv() {
        let backend = MultipassBackend::new();
        let opts = LaunchOptions::new("core22", "snapcraft");
        assert_eq!(
            command_args(&backend.launch_command(&instance(), &opts)),
            vec!["multipass", "launch", "--name", "vm1", "snapcraft:core22"]
        );
    }

    #[test]
    fn exec_argv_runs_under_sudo() {
        let backend = MultipassBackend::new();
        let mut env = EnvVars::new();
        env.insert("DEBIAN_FRONTEND".to_owned(), Some("noninteractive".to_owned()));
        let cmd = backend
            .exec_command(
                &instance(),
                &["apt-get".to_owned(), "update".to_owned()],
                Some(Path::new("/root/project")),
                &env,
            )
            .unwrap();
        assert_eq!(
            command_args(&cmd),
            vec![
                "multipass",
                "exec",
                "vm1",
                "--working-directory",
                "/root/project",
                "--",
                "sudo",
                "-H",
                "--",
                "env",
                "DEBIAN_FRONTEND=noninteractive",
                "apt-get",
                "update"
            ]
        );
    }

    const INFO_JSON: &str = r#"{
        "errors": [],
        "info": {
            "vm1": {
                "state": "Running",
                "ipv4": ["10.0.0.2"],
                "mounts": {
                    "/root/project": {
                        "gid_mappings": ["1000:default"],
                        "source_path": "/home/u/project",
                        "uid_mappings": ["1000:default"]
                    }
                }
            }
        }
    }"#;

    #[test]
    fn parse_status_and_mounts() {
        let entry = parse_info_output(INFO_JSON.as_bytes(), "vm1").unwrap();
        assert_eq!(status_from(entry.as_ref()), InstanceStatus::Running);
        assert_eq!(
            mounts_from(entry.as_ref().unwrap()),
            vec![Mount {
                host_source: PathBuf::from("/home/u/project"),
                target: PathBuf::from("/root/project"),
                device: "/root/project".to_owned(),
            }]
        );
    }

    #[test]
    fn parse_other_states() {
        let json = r#"{"info": {"vm1": {"state": "Suspended"}}}"#;
        let entry = parse_info_output(json.as_bytes(), "vm1").unwrap();
        assert_eq!(
            status_from(entry.as_ref()),
            InstanceStatus::Other("Suspended".to_owned())
        );
        assert!(mounts_from(entry.as_ref().unwrap()).is_empty());
        assert!(parse_info_output(json.as_bytes(), "vm2").unwrap().is_none());
    }

    #[test]
    fn missing_multipass_surfaces_provider_error() {
        let backend = MultipassBackend::with_program("kiln-no-such-multipass");
        let err = backend.status(&instance()).unwrap_err();
        assert!(err.brief.contains("not found on PATH"));
    }

    #[test]
    fn mount_and_unmount_argv() {
        let backend = MultipassBackend::new();
        let cmd = backend.mount_command(
            &instance(),
            Path::new("/home/u/project"),
            Path::new("/root/project"),
        );
        assert_eq!(
            command_args(&cmd),
            vec!["multipass", "mount", "/home/u/project", "vm1:/root/project"]
        );

        let mount = Mount {
            host_source: PathBuf::from("/home/u/project"),
            target: PathBuf::from("/root/project"),
            device: "/root/project".to_owned(),
        };
        assert_eq!(
            command_args(&backend.unmount_command(&instance(), &mount)),
            vec!["multipass", "umount", "vm1:/root/project"]
        );
    }

    #[test]
    fn mounts_of_absent_instance_fail() {
        let dir = tempfile::tempdir().unwrap();
        let multipass = crate::backend::fake_tool(
            dir.path(),
            "multipass",
            "echo 'info failed: instance \"vm1\" does not exist' >&2; exit 2",
        );
        let backend = MultipassBackend::with_program(multipass.to_string_lossy());
        assert_eq!(
            backend.status(&instance()).unwrap(),
            InstanceStatus::Absent
        );
        let err = backend.mounts(&instance()).unwrap_err();
        assert_eq!(err.brief, "Instance \"vm1\" not found.");
    }

    #[test]
    fn failed_push_removes_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let multipass = crate::backend::fake_tool(
            dir.path(),
            "multipass",
            &format!(
                "echo \"$*\" >> '{}'\ncase \"$*\" in *' mv '*) exit 1;; esac\nexit 0",
                log.display()
            ),
        );
        let backend = MultipassBackend::with_program(multipass.to_string_lossy());

        let err = backend
            .push_file(&instance(), Path::new("/etc/hostname"), Path::new("/etc/dest"))
            .unwrap_err();
        assert_eq!(err.brief, "Failed to push file to /etc/dest.");

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 3, "{calls:?}");
        assert!(calls[0].starts_with("transfer /etc/hostname vm1:/tmp/kiln-push-"));
        let staging = calls[0].rsplit(':').next().unwrap();
        assert_eq!(
            calls[2],
            format!("exec vm1 -- sudo -H -- rm -f {staging}")
        );
    }

    #[test]
    fn successful_push_leaves_no_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let multipass = crate::backend::fake_tool(
            dir.path(),
            "multipass",
            &format!("echo \"$*\" >> '{}'", log.display()),
        );
        let backend = MultipassBackend::with_program(multipass.to_string_lossy());
        backend
            .push_file(&instance(), Path::new("/etc/hostname"), Path::new("/etc/dest"))
            .unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().count(), 2);
        assert!(!calls.contains("rm -f"));
    }
}
