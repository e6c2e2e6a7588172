use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An active binding of a host directory into an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_source: PathBuf,
    pub target: PathBuf,
    /// Backend handle for the binding: the LXD device name, or the target
    /// path for backends that address mounts by target.
    pub device: String,
}

impl Mount {
    pub fn matches(&self, host_source: &Path, target: &Path) -> bool {
        self.host_source == host_source && self.target == target
    }
}

/// What to do with a requested `(host_source, target)` binding given the
/// mounts the backend currently reports.
#[derive(Debug, PartialEq, Eq)]
pub enum MountPlan<'a> {
    AlreadyMounted,
    Conflict(&'a Mount),
    Create,
}

pub fn plan_mount<'a>(active: &'a [Mount], host_source: &Path, target: &Path) -> MountPlan<'a> {
    if active.iter().any(|m| m.matches(host_source, target)) {
        return MountPlan::AlreadyMounted;
    }
    match active.iter().find(|m| m.target == target) {
        Some(existing) => MountPlan::Conflict(existing),
        None => MountPlan::Create,
    }
}

pub fn find_by_target<'a>(active: &'a [Mount], target: &Path) -> Option<&'a Mount> {
    active.iter().find(|m| m.target == target)
}

/// LXD disk device name for a guest target path.
pub fn device_name(target: &Path) -> String {
    format!("disk-{}", target.display())
}

pub(crate) fn require_absolute(path: &Path, what: &str) -> Result<(), ProviderError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(
            ProviderError::new(format!("{what} must be an absolute path: {}", path.display()))
                .with_resolution("Pass an absolute path; relative paths are not resolved."),
        )
    }
}
