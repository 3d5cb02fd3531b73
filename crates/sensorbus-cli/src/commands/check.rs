//! Check-config command implementation.

use std::path::Path;

use anyhow::Result;

use sensorbus_types::DeviceAddress;

use crate::config::Config;

pub fn cmd_check_config(path: &Path, quiet: bool) -> Result<()> {
    let config = Config::load_validated(path)?;
    println!("{}: {} device(s), configuration OK", path.display(), config.devices.len());
    if quiet {
        return Ok(());
    }

    for (i, device) in config.devices.iter().enumerate() {
        let capability = device.capability(&format!("devices[{i}]"))?;
        println!(
            "  {:<20} {:<20} {:<20} {:?}",
            device.label(),
            DeviceAddress::new(&device.address),
            capability.kind(),
            device.decode,
        );
    }
    Ok(())
}
