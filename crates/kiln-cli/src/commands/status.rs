use super::{colorize_status, json_pretty, Target, EXIT_SUCCESS};

pub fn run(target: &Target, name: &str, json: bool) -> Result<u8, String> {
    let instance = target.instance(name)?;
    let status = instance.status().map_err(|e| e.to_string())?;
    let mounts = if status.exists() {
        instance.mounts().map_err(|e| e.to_string())?
    } else {
        Vec::new()
    };

    if json {
        let out = serde_json::json!({
            "name": name,
            "project": instance.project(),
            "backend": instance.backend_name(),
            "status": status,
            "exists": status.exists(),
            "running": status.is_running(),
            "mounts": mounts,
        });
        println!("{}", json_pretty(&out)?);
    } else {
        println!("name:    {name}");
        println!("project: {}", instance.project());
        println!("backend: {}", instance.backend_name());
        println!("status:  {}", colorize_status(&status.to_string()));
        if !mounts.is_empty() {
            println!("mounts:");
            for m in &mounts {
                println!("  {} -> {}", m.host_source.display(), m.target.display());
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
