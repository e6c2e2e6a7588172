use super::{json_pretty, spin_fail, spin_ok, spinner, Target, EXIT_SUCCESS};
use kiln_runtime::LaunchOptions;

pub fn run(target: &Target, name: &str, options: &LaunchOptions, json: bool) -> Result<u8, String> {
    let instance = target.instance(name)?;
    let pb = (!json).then(|| spinner(&format!("launching {name} ({})", options.image)));

    match instance.launch(options) {
        Ok(()) => {
            if let Some(pb) = &pb {
                spin_ok(pb, &format!("instance {name} is up"));
            }
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("failed to launch {name}"));
            }
            return Err(e.to_string());
        }
    }

    if json {
        let out = serde_json::json!({
            "name": name,
            "project": instance.project(),
            "backend": instance.backend_name(),
            "image": options.image,
            "status": instance.status().map_err(|e| e.to_string())?,
        });
        println!("{}", json_pretty(&out)?);
    }
    Ok(EXIT_SUCCESS)
}
