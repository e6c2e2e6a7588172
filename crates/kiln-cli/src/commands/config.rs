use super::{json_pretty, Target, EXIT_SUCCESS};
use crate::config::KilnConfig;
use std::path::Path;

/// Print the effective settings; with `save`, persist them to `path`.
pub fn run(target: &Target, path: Option<&Path>, save: bool, json: bool) -> Result<u8, String> {
    let config = KilnConfig {
        backend: target.backend.clone(),
        project: target.project.clone(),
        remote: target.remote.clone(),
    };

    if save {
        let path = path.ok_or("config error: no config path (set HOME or pass --config)")?;
        config.save(path).map_err(|e| e.to_string())?;
        if !json {
            println!("saved {}", path.display());
        }
    }

    if json {
        println!("{}", json_pretty(&config)?);
    } else {
        println!("backend: {}", config.backend);
        println!("project: {}", config.project);
        println!("remote:  {}", config.remote);
    }
    Ok(EXIT_SUCCESS)
}
