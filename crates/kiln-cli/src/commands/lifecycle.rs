use super::{Target, EXIT_SUCCESS};

pub fn start(target: &Target, name: &str) -> Result<u8, String> {
    target.instance(name)?.start().map_err(|e| e.to_string())?;
    println!("started instance {name}");
    Ok(EXIT_SUCCESS)
}

pub fn stop(target: &Target, name: &str) -> Result<u8, String> {
    target.instance(name)?.stop().map_err(|e| e.to_string())?;
    println!("stopped instance {name}");
    Ok(EXIT_SUCCESS)
}

pub fn delete(target: &Target, name: &str) -> Result<u8, String> {
    target.instance(name)?.delete().map_err(|e| e.to_string())?;
    println!("deleted instance {name}");
    Ok(EXIT_SUCCESS)
}
