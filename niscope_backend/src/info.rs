use std::fmt;

use nisession_backend::{attr, DaqResult, DriverClient, SessionRegistry};

/// Inputs and outputs of one device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub product_type: String,
    pub simulated: bool,
    pub ai_channels: Vec<String>,
    pub ao_channels: Vec<String>,
}

/// What the driver knows about the system: version, devices, saved channels and tasks.
#[derive(Clone, Debug, PartialEq)]
pub struct SystemInfo {
    pub version: (u32, u32),
    pub devices: Vec<DeviceInfo>,
    pub global_channels: Vec<String>,
    pub tasks: Vec<String>,
}

impl SystemInfo {
    pub fn query<D: DriverClient + 'static>(registry: &SessionRegistry<D>) -> DaqResult<Self> {
        let devices = registry
            .devices()?
            .into_iter()
            .map(|name| -> DaqResult<DeviceInfo> {
                Ok(DeviceInfo {
                    product_type: registry.device_attribute(&name, attr::DEVICE_PRODUCT_TYPE)?,
                    simulated: registry.device_attribute(&name, attr::DEVICE_IS_SIMULATED)?,
                    ai_channels: registry
                        .device_attribute(&name, attr::DEVICE_AI_PHYSICAL_CHANNELS)?,
                    ao_channels: registry
                        .device_attribute(&name, attr::DEVICE_AO_PHYSICAL_CHANNELS)?,
                    name,
                })
            })
            .collect::<DaqResult<Vec<_>>>()?;
        Ok(Self {
            version: registry.version()?,
            devices,
            global_channels: registry.global_channels()?,
            tasks: registry.system_tasks()?,
        })
    }
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NI-DAQmx {}.{}", self.version.0, self.version.1)?;
        writeln!(f, "Devices:")?;
        for dev in &self.devices {
            let simulated = if dev.simulated { " (simulated)" } else { "" };
            writeln!(f, "> Device {} [{}]{}", dev.name, dev.product_type, simulated)?;
            writeln!(f, "\tInputs  >> {}", dev.ai_channels.join(", "))?;
            writeln!(f, "\tOutputs >> {}", dev.ao_channels.join(", "))?;
        }
        writeln!(f, "Channels: {:?}", self.global_channels)?;
        write!(f, "Tasks: {:?}", self.tasks)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nisession_backend::sim::{SimDevice, SimDriver};

    #[test]
    fn lists_simulated_devices() {
        let sim = SimDriver::new().with_devices(vec![
            SimDevice::new("Dev1", 2, 1),
            SimDevice::new("Dev2", 1, 0),
        ]);
        let info = SystemInfo::query(&SessionRegistry::new(sim)).unwrap();

        assert_eq!(info.version, (23, 8));
        assert_eq!(info.devices.len(), 2);
        assert_eq!(info.devices[0].ai_channels, ["Dev1/ai0", "Dev1/ai1"]);
        assert_eq!(info.devices[0].ao_channels, ["Dev1/ao0"]);
        assert!(info.devices[1].ao_channels.is_empty());
        assert!(info.tasks.is_empty());

        let text = info.to_string();
        assert!(text.contains("> Device Dev2"));
        assert!(text.contains("Inputs  >> Dev1/ai0, Dev1/ai1"));
    }
}
