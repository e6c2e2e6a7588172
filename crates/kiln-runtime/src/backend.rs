use crate::error::ProviderError;
use crate::mounts::Mount;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::Command;

pub const DEFAULT_PROJECT: &str = "default";
pub const DEFAULT_REMOTE: &str = "local";

/// Environment overrides for a guest command. `None` unsets the variable.
pub type EnvVars = BTreeMap<String, Option<String>>;

/// Identifying keys of one instance; holds no live backend handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    pub name: String,
    pub project: String,
    pub remote: String,
}

impl InstanceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project: DEFAULT_PROJECT.to_owned(),
            remote: DEFAULT_REMOTE.to_owned(),
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Absent,
    Running,
    Stopped,
    /// Any other backend-reported state (frozen, suspended, starting...).
    Other(String),
}

impl InstanceStatus {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Absent)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Other(s) => write!(f, "{}", s.to_lowercase()),
        }
    }
}

/// Serialized as its display string, e.g. `"running"` or `"frozen"`.
impl Serialize for InstanceStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub image: String,
    /// Image server, e.g. `ubuntu` or `images`. Empty means the backend default.
    pub image_remote: String,
    pub ephemeral: bool,
}

impl LaunchOptions {
    pub fn new(image: impl Into<String>, image_remote: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            image_remote: image_remote.into(),
            ephemeral: false,
        }
    }

    #[must_use]
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }
}

/// Maps abstract instance operations onto one provider's native tooling.
///
/// Implementations are stateless apart from configuration: every query is
/// answered by asking the provider, never from a cache.
pub trait InstanceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn status(&self, instance: &InstanceRef) -> Result<InstanceStatus, ProviderError>;

    fn launch(&self, instance: &InstanceRef, options: &LaunchOptions)
        -> Result<(), ProviderError>;

    fn start(&self, instance: &InstanceRef) -> Result<(), ProviderError>;

    fn stop(&self, instance: &InstanceRef) -> Result<(), ProviderError>;

    fn delete(&self, instance: &InstanceRef) -> Result<(), ProviderError>;

    /// Build the host command that runs `command` inside the instance.
    fn exec_command(
        &self,
        instance: &InstanceRef,
        command: &[String],
        cwd: Option<&Path>,
        env: &EnvVars,
    ) -> Result<Command, ProviderError>;

    fn push_file(
        &self,
        instance: &InstanceRef,
        source: &Path,
        destination: &Path,
    ) -> Result<(), ProviderError>;

    fn pull_file(
        &self,
        instance: &InstanceRef,
        source: &Path,
        destination: &Path,
    ) -> Result<(), ProviderError>;

    /// Host directory bindings currently active on the instance.
    fn mounts(&self, instance: &InstanceRef) -> Result<Vec<Mount>, ProviderError>;

    fn mount(
        &self,
        instance: &InstanceRef,
        host_source: &Path,
        target: &Path,
    ) -> Result<(), ProviderError>;

    fn unmount(&self, instance: &InstanceRef, mount: &Mount) -> Result<(), ProviderError>;
}

/// Raised by any backend query that needs the instance to exist.
pub(crate) fn instance_not_found(instance: &InstanceRef) -> ProviderError {
    ProviderError::new(format!("Instance {:?} not found.", instance.name))
        .with_details(format!("* Instance {instance} does not exist"))
        .with_resolution("Launch the instance first.")
}

/// `env` prefix shared by backends that wrap guest commands in `env(1)`.
pub(crate) fn env_prefix(env: &EnvVars) -> Vec<String> {
    if env.is_empty() {
        return Vec::new();
    }
    // env(1) stops option parsing at the first assignment, so unsets go first.
    let mut args = vec!["env".to_owned()];
    for key in env.iter().filter(|(_, v)| v.is_none()).map(|(k, _)| k) {
        args.push("-u".to_owned());
        args.push(key.clone());
    }
    for (key, value) in env {
        if let Some(value) = value {
            args.push(format!("{key}={value}"));
        }
    }
    args
}

pub fn select_backend(name: &str) -> Result<Box<dyn InstanceBackend>, ProviderError> {
    match name {
        "lxd" => Ok(Box::new(crate::lxd::LxdBackend::new())),
        "multipass" => Ok(Box::new(crate::multipass::MultipassBackend::new())),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(ProviderError::new(format!("unknown backend '{other}'"))
            .with_resolution("Use one of: lxd, multipass, mock.")),
    }
}

/// Write an executable shell script standing in for a backend tool.
#[cfg(test)]
pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
