use super::{absolute_host_path, Target, EXIT_SUCCESS};
use std::path::Path;

pub struct PushArgs<'a> {
    pub source: &'a Path,
    pub destination: &'a Path,
    pub mode: &'a str,
    pub user: &'a str,
    pub group: &'a str,
}

pub fn push(target: &Target, name: &str, args: &PushArgs<'_>) -> Result<u8, String> {
    let source = absolute_host_path(args.source)?;
    let content = std::fs::read(&source)
        .map_err(|e| format!("failed to read {}: {e}", source.display()))?;
    target
        .instance(name)?
        .create_file(args.destination, &content, args.mode, args.user, args.group)
        .map_err(|e| e.to_string())?;
    println!(
        "pushed {} to {name}:{} ({} {}:{})",
        source.display(),
        args.destination.display(),
        args.mode,
        args.user,
        args.group
    );
    Ok(EXIT_SUCCESS)
}

pub fn pull(target: &Target, name: &str, source: &Path, destination: &Path) -> Result<u8, String> {
    let destination = absolute_host_path(destination)?;
    target
        .instance(name)?
        .pull_file(source, &destination)
        .map_err(|e| e.to_string())?;
    println!(
        "pulled {name}:{} to {}",
        source.display(),
        destination.display()
    );
    Ok(EXIT_SUCCESS)
}
