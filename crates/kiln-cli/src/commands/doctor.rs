use super::{Target, EXIT_FAILURE, EXIT_SUCCESS};
use kiln_runtime::select_backend;

pub fn run(target: &Target, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let missing = kiln_runtime::check_backend_prereqs(&target.backend);
    if missing.is_empty() {
        checks.push(Check::pass(
            "backend_prereqs",
            &format!("{} prerequisites satisfied", target.backend),
        ));
    } else {
        all_pass = false;
        checks.push(Check::fail(
            "backend_prereqs",
            &kiln_runtime::format_missing(&missing),
        ));
    }

    match select_backend(&target.backend) {
        Ok(backend) if backend.available() => {
            checks.push(Check::pass(
                "backend_available",
                &format!("{} backend responds", backend.name()),
            ));
        }
        Ok(backend) => {
            all_pass = false;
            checks.push(Check::fail(
                "backend_available",
                &format!("{} backend does not respond", backend.name()),
            ));
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("backend_available", &e.to_string()));
        }
    }

    checks.push(Check::info(
        "namespace",
        &format!("project {}, remote {}", target.project, target.remote),
    ));

    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("kiln doctor\n");
        for check in &checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn pass(name: &'static str, message: &str) -> Self {
        Self {
            name,
            status: "pass",
            message: message.to_owned(),
        }
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self {
            name,
            status: "fail",
            message: message.to_owned(),
        }
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self {
            name,
            status: "info",
            message: message.to_owned(),
        }
    }
}
