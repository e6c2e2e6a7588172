//! Uniform instance layer over build-environment backends.
//!
//! An [`Instance`] names one container or VM on a backend (LXD via `lxc`,
//! Multipass via `multipass`, or an in-process mock) and exposes the same
//! lifecycle, command execution, file transfer and mount tracking on all of
//! them. Every backend call goes through the [`process`] invocation path,
//! and every failure surfaces as a [`ProviderError`].

pub mod backend;
pub mod error;
pub mod instance;
pub mod lxd;
pub mod mock;
pub mod mounts;
pub mod multipass;
pub mod prereq;
pub mod process;

pub use backend::{
    select_backend, EnvVars, InstanceBackend, InstanceRef, InstanceStatus, LaunchOptions,
    DEFAULT_PROJECT, DEFAULT_REMOTE,
};
pub use error::{
    details_from_called_process_error, details_from_command_error, CalledProcessError,
    ProviderError,
};
pub use instance::{Instance, RunOptions};
pub use mounts::Mount;
pub use prereq::{check_backend_prereqs, format_missing, MissingPrereq};
pub use process::{CapturedOutput, ExecResult};
