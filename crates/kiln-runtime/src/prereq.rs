use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Check the host tooling a backend shells out to.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_backend_prereqs(backend: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    match backend {
        "lxd" => {
            if !command_exists("lxc") {
                missing.push(MissingPrereq {
                    name: "lxc",
                    purpose: "LXD client for container and VM instances",
                    install_hint: "snap install lxd && lxd init --auto",
                });
            }
        }
        "multipass" => {
            if !command_exists("multipass") {
                missing.push(MissingPrereq {
                    name: "multipass",
                    purpose: "Multipass client for VM instances",
                    install_hint: "snap install multipass | brew install --cask multipass",
                });
            }
        }
        _ => {}
    }

    // The guest-side helpers used for file metadata run on the host for the mock.
    if backend == "mock" {
        for (name, purpose) in [("cp", "file transfer"), ("chown", "file ownership")] {
            if !command_exists(name) {
                missing.push(MissingPrereq {
                    name,
                    purpose,
                    install_hint: "part of coreutils (usually pre-installed)",
                });
            }
        }
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nkiln drives instances through these tools.");
    msg
}
