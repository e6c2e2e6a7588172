use super::{json_pretty, Target, EXIT_FAILURE};
use kiln_runtime::RunOptions;
use std::path::PathBuf;

/// Split `KEY=VALUE` into a set, or bare `KEY` into an unset.
pub fn parse_env_arg(arg: &str) -> Result<(String, Option<String>), String> {
    match arg.split_once('=') {
        Some(("", _)) => Err(format!("invalid --env '{arg}': empty variable name")),
        Some((key, value)) => Ok((key.to_owned(), Some(value.to_owned()))),
        None if arg.is_empty() => Err("invalid --env: empty variable name".to_owned()),
        None => Ok((arg.to_owned(), None)),
    }
}

pub fn run(
    target: &Target,
    name: &str,
    command: &[String],
    cwd: Option<PathBuf>,
    env: &[String],
    json: bool,
) -> Result<u8, String> {
    let instance = target.instance(name)?;

    let mut options = if json {
        RunOptions::captured().with_text()
    } else {
        RunOptions::default()
    };
    options.cwd = cwd;
    for arg in env {
        let (key, value) = parse_env_arg(arg)?;
        options = options.with_env(key, value.as_deref());
    }

    let result = instance
        .execute_run(command, &options)
        .map_err(|e| e.to_string())?;

    if json {
        let out = serde_json::json!({
            "command": command,
            "returncode": result.returncode,
            "stdout": result.stdout_text(),
            "stderr": result.stderr_text(),
        });
        println!("{}", json_pretty(&out)?);
    }

    Ok(u8::try_from(result.returncode).unwrap_or(EXIT_FAILURE))
}
