use super::{absolute_host_path, Target, EXIT_SUCCESS};
use std::path::Path;

pub fn mount(target: &Target, name: &str, host_source: &Path, guest: &Path) -> Result<u8, String> {
    let host_source = absolute_host_path(host_source)?;
    target
        .instance(name)?
        .mount(&host_source, guest)
        .map_err(|e| e.to_string())?;
    println!(
        "mounted {} at {name}:{}",
        host_source.display(),
        guest.display()
    );
    Ok(EXIT_SUCCESS)
}

pub fn unmount(target: &Target, name: &str, guest: Option<&Path>, all: bool) -> Result<u8, String> {
    let instance = target.instance(name)?;
    match (guest, all) {
        (_, true) => {
            instance.unmount_all().map_err(|e| e.to_string())?;
            println!("unmounted everything in {name}");
        }
        (Some(guest), false) => {
            instance.unmount(guest).map_err(|e| e.to_string())?;
            println!("unmounted {name}:{}", guest.display());
        }
        (None, false) => return Err("unmount needs a TARGET or --all".to_owned()),
    }
    Ok(EXIT_SUCCESS)
}
