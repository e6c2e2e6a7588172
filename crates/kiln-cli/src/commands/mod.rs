pub mod completions;
pub mod config;
pub mod doctor;
pub mod exec;
pub mod launch;
pub mod lifecycle;
pub mod mount;
pub mod status;
pub mod transfer;

use indicatif::{ProgressBar, ProgressStyle};
use kiln_runtime::{select_backend, Instance};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;

/// Backend and namespace an instance name is resolved against.
#[derive(Debug, Clone)]
pub struct Target {
    pub backend: String,
    pub project: String,
    pub remote: String,
}

impl Target {
    pub fn instance(&self, name: &str) -> Result<Instance, String> {
        let backend = select_backend(&self.backend).map_err(|e| e.to_string())?;
        Ok(Instance::new(name, backend)
            .with_project(&self.project)
            .with_remote(&self.remote))
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "running" => Style::new().green().bold().apply_to(status).to_string(),
        "stopped" => Style::new().yellow().apply_to(status).to_string(),
        "absent" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Make a host path absolute against the current directory; the runtime
/// itself never resolves relative paths.
pub fn absolute_host_path(path: &Path) -> Result<PathBuf, String> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|e| format!("cannot resolve {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_string() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_unknown_status_passthrough() {
        assert_eq!(colorize_status("frozen"), "frozen");
    }

    #[test]
    fn absolute_paths_untouched() {
        assert_eq!(
            absolute_host_path(Path::new("/srv/src")).unwrap(),
            PathBuf::from("/srv/src")
        );
        assert!(absolute_host_path(Path::new("rel")).unwrap().is_absolute());
    }

    #[test]
    fn unknown_backend_target_fails() {
        let target = Target {
            backend: "podman".to_owned(),
            project: "default".to_owned(),
            remote: "local".to_owned(),
        };
        let err = target.instance("x").err().unwrap();
        assert!(err.contains("unknown backend 'podman'"));
    }
}
