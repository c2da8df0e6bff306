//! Typed attribute access.
//!
//! Each driver attribute is described once as an [`Attribute`] constant in [`attr`], carrying
//! its vendor id, what it is addressed to (the scope marker `S`) and the decoded value type
//! `T`. Reading goes through [`AttributeValue`], which hides the two-phase size query for
//! strings and arrays; callers only ever see the final value.
//!
//! ```
//! use nisession_backend::{attr, sim::SimDriver, SessionRegistry};
//!
//! let registry = SessionRegistry::new(SimDriver::new());
//! let devices = registry.system_attribute(attr::SYSTEM_DEVICES).unwrap();
//! assert_eq!(devices, ["Dev1"]);
//! let simulated = registry.device_attribute("Dev1", attr::DEVICE_IS_SIMULATED).unwrap();
//! assert!(simulated);
//! ```

use std::fmt;
use std::marker::PhantomData;

use crate::driver::{
    check_status, AttrBuffer, AttrTarget, DriverClient, TerminalConfig,
    ERROR_BUFFER_TOO_SMALL_FOR_STRING, ERROR_READ_BUFFER_TOO_SMALL,
};
use crate::error::{DaqError, DaqResult, DriverError};

/// Vendor attribute ids (NIDAQmx.h).
pub mod ids {
    pub const SYS_GLOBAL_CHANS: i32 = 0x1265;
    pub const SYS_SCALES: i32 = 0x1266;
    pub const SYS_TASKS: i32 = 0x1267;
    pub const SYS_DEV_NAMES: i32 = 0x193B;
    pub const SYS_NIDAQ_MAJOR_VERSION: i32 = 0x1272;
    pub const SYS_NIDAQ_MINOR_VERSION: i32 = 0x1923;

    pub const TASK_NAME: i32 = 0x1276;
    pub const TASK_CHANNELS: i32 = 0x1273;
    pub const TASK_NUM_CHANS: i32 = 0x2181;
    pub const TASK_DEVICES: i32 = 0x230E;
    pub const TASK_NUM_DEVICES: i32 = 0x29BA;
    pub const TASK_COMPLETE: i32 = 0x1274;

    pub const DEV_IS_SIMULATED: i32 = 0x22CA;
    pub const DEV_PRODUCT_TYPE: i32 = 0x0631;
    pub const DEV_SERIAL_NUM: i32 = 0x0632;
    pub const DEV_AI_PHYSICAL_CHANS: i32 = 0x231E;
    pub const DEV_AO_PHYSICAL_CHANS: i32 = 0x231F;
    pub const DEV_AI_MAX_SINGLE_CHAN_RATE: i32 = 0x298C;
    pub const DEV_AI_MAX_MULTI_CHAN_RATE: i32 = 0x298D;
    pub const DEV_AI_MIN_RATE: i32 = 0x298E;
    pub const DEV_AI_VOLTAGE_RNGS: i32 = 0x2990;

    pub const AI_MAX: i32 = 0x17DD;
    pub const AI_MIN: i32 = 0x17DE;
    pub const AI_TERM_CFG: i32 = 0x1097;

    pub const PHYS_CHAN_AI_TERM_CFGS: i32 = 0x2342;

    pub const READ_AVAIL_SAMP_PER_CHAN: i32 = 0x1223;
    pub const READ_TOTAL_SAMP_PER_CHAN_ACQUIRED: i32 = 0x192A;

    /// Bits of [`PHYS_CHAN_AI_TERM_CFGS`].
    pub const BIT_TERM_CFG_RSE: i32 = 1 << 0;
    pub const BIT_TERM_CFG_NRSE: i32 = 1 << 1;
    pub const BIT_TERM_CFG_DIFF: i32 = 1 << 2;
    pub const BIT_TERM_CFG_PSEUDO_DIFF: i32 = 1 << 3;
}

/// Scope markers: what an [`Attribute`] is addressed to.
pub mod scope {
    pub enum System {}
    pub enum Device {}
    pub enum PhysicalChannel {}
    pub enum Task {}
    pub enum Channel {}
    pub enum Read {}
}

/// A driver attribute of scope `S` decoding to `T`.
pub struct Attribute<S, T> {
    id: i32,
    name: &'static str,
    _marker: PhantomData<fn() -> (S, T)>,
}

impl<S, T> Attribute<S, T> {
    pub const fn new(id: i32, name: &'static str) -> Self {
        Self {
            id,
            name,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// Manual impls: derives would require `S: Clone, T: Clone`.
impl<S, T> Clone for Attribute<S, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, T> Copy for Attribute<S, T> {}

impl<S, T> fmt::Debug for Attribute<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", self.name, self.id)
    }
}

/// Decoding of an attribute value from the driver.
pub trait AttributeValue: Sized {
    fn get<D: DriverClient + ?Sized>(
        driver: &D,
        target: AttrTarget<'_>,
        attribute: i32,
    ) -> DaqResult<Self>;
}

macro_rules! scalar_attribute_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl AttributeValue for $ty {
                fn get<D: DriverClient + ?Sized>(
                    driver: &D,
                    target: AttrTarget<'_>,
                    attribute: i32,
                ) -> DaqResult<Self> {
                    let mut value = <$ty>::default();
                    let status = driver.get_attribute(target, attribute, AttrBuffer::$variant(&mut value));
                    check_status(driver, status)?;
                    Ok(value)
                }
            }
        )*
    };
}

scalar_attribute_value! {
    i32 => I32,
    u32 => U32,
    u64 => U64,
    f64 => F64,
    bool => Bool,
}

// The required size can grow between the size query and the fill call (a task created
// meanwhile, ...); retry a few times before giving up.
const SIZE_QUERY_ATTEMPTS: usize = 3;

/// Runs the two-phase protocol: `fill` is called first with an empty buffer to learn the
/// size, then with a buffer of that size.
fn two_phase<D, E>(
    driver: &D,
    too_small: i32,
    mut fill: impl FnMut(&mut [E]) -> i32,
) -> DaqResult<Vec<E>>
where
    D: DriverClient + ?Sized,
    E: Clone + Default,
{
    for _ in 0..SIZE_QUERY_ATTEMPTS {
        let size = fill(&mut []);
        if size < 0 {
            check_status(driver, size)?;
        }
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![E::default(); size as usize];
        let status = fill(&mut buffer);
        if status == too_small {
            continue;
        }
        check_status(driver, status)?;
        return Ok(buffer);
    }
    Err(DriverError {
        code: too_small,
        message: driver.error_string(too_small),
    }
    .into())
}

impl AttributeValue for String {
    fn get<D: DriverClient + ?Sized>(
        driver: &D,
        target: AttrTarget<'_>,
        attribute: i32,
    ) -> DaqResult<Self> {
        let bytes = two_phase(driver, ERROR_BUFFER_TOO_SMALL_FOR_STRING, |buf: &mut [u8]| {
            driver.get_attribute(target, attribute, AttrBuffer::Text(buf))
        })?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

/// Comma separated name lists (devices, tasks, channels).
impl AttributeValue for Vec<String> {
    fn get<D: DriverClient + ?Sized>(
        driver: &D,
        target: AttrTarget<'_>,
        attribute: i32,
    ) -> DaqResult<Self> {
        let list = String::get(driver, target, attribute)?;
        Ok(list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl AttributeValue for Vec<f64> {
    fn get<D: DriverClient + ?Sized>(
        driver: &D,
        target: AttrTarget<'_>,
        attribute: i32,
    ) -> DaqResult<Self> {
        two_phase(driver, ERROR_READ_BUFFER_TOO_SMALL, |buf: &mut [f64]| {
            driver.get_attribute(target, attribute, AttrBuffer::F64Array(buf))
        })
    }
}

impl AttributeValue for TerminalConfig {
    fn get<D: DriverClient + ?Sized>(
        driver: &D,
        target: AttrTarget<'_>,
        attribute: i32,
    ) -> DaqResult<Self> {
        let code = i32::get(driver, target, attribute)?;
        TerminalConfig::from_code(code).ok_or_else(|| {
            DaqError::InvalidArgument(format!("driver reported unknown terminal configuration {code}"))
        })
    }
}

/// Decoded from the supported terminal configuration bit field.
impl AttributeValue for Vec<TerminalConfig> {
    fn get<D: DriverClient + ?Sized>(
        driver: &D,
        target: AttrTarget<'_>,
        attribute: i32,
    ) -> DaqResult<Self> {
        let bits = i32::get(driver, target, attribute)?;
        Ok([
            (ids::BIT_TERM_CFG_RSE, TerminalConfig::Rse),
            (ids::BIT_TERM_CFG_NRSE, TerminalConfig::Nrse),
            (ids::BIT_TERM_CFG_DIFF, TerminalConfig::Differential),
            (ids::BIT_TERM_CFG_PSEUDO_DIFF, TerminalConfig::PseudoDifferential),
        ]
        .into_iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, config)| config)
        .collect())
    }
}

/// The attributes the registry exposes.
pub mod attr {
    use super::{ids, scope, Attribute};
    use crate::driver::TerminalConfig;

    pub const SYSTEM_DEVICES: Attribute<scope::System, Vec<String>> =
        Attribute::new(ids::SYS_DEV_NAMES, "DevNames");
    pub const SYSTEM_TASKS: Attribute<scope::System, Vec<String>> =
        Attribute::new(ids::SYS_TASKS, "Tasks");
    pub const SYSTEM_GLOBAL_CHANNELS: Attribute<scope::System, Vec<String>> =
        Attribute::new(ids::SYS_GLOBAL_CHANS, "GlobalChans");
    pub const SYSTEM_SCALES: Attribute<scope::System, Vec<String>> =
        Attribute::new(ids::SYS_SCALES, "Scales");
    pub const SYSTEM_MAJOR_VERSION: Attribute<scope::System, u32> =
        Attribute::new(ids::SYS_NIDAQ_MAJOR_VERSION, "NIDAQMajorVersion");
    pub const SYSTEM_MINOR_VERSION: Attribute<scope::System, u32> =
        Attribute::new(ids::SYS_NIDAQ_MINOR_VERSION, "NIDAQMinorVersion");

    pub const DEVICE_IS_SIMULATED: Attribute<scope::Device, bool> =
        Attribute::new(ids::DEV_IS_SIMULATED, "Dev_IsSimulated");
    pub const DEVICE_PRODUCT_TYPE: Attribute<scope::Device, String> =
        Attribute::new(ids::DEV_PRODUCT_TYPE, "Dev_ProductType");
    pub const DEVICE_SERIAL_NUMBER: Attribute<scope::Device, u32> =
        Attribute::new(ids::DEV_SERIAL_NUM, "Dev_SerialNum");
    pub const DEVICE_AI_PHYSICAL_CHANNELS: Attribute<scope::Device, Vec<String>> =
        Attribute::new(ids::DEV_AI_PHYSICAL_CHANS, "Dev_AI_PhysicalChans");
    pub const DEVICE_AO_PHYSICAL_CHANNELS: Attribute<scope::Device, Vec<String>> =
        Attribute::new(ids::DEV_AO_PHYSICAL_CHANS, "Dev_AO_PhysicalChans");
    pub const DEVICE_AI_MAX_SINGLE_CHANNEL_RATE: Attribute<scope::Device, f64> =
        Attribute::new(ids::DEV_AI_MAX_SINGLE_CHAN_RATE, "Dev_AI_MaxSingleChanRate");
    pub const DEVICE_AI_MAX_MULTI_CHANNEL_RATE: Attribute<scope::Device, f64> =
        Attribute::new(ids::DEV_AI_MAX_MULTI_CHAN_RATE, "Dev_AI_MaxMultiChanRate");
    pub const DEVICE_AI_MIN_RATE: Attribute<scope::Device, f64> =
        Attribute::new(ids::DEV_AI_MIN_RATE, "Dev_AI_MinRate");
    /// Flat `[min0, max0, min1, max1, ...]` list of supported input ranges.
    pub const DEVICE_AI_VOLTAGE_RANGES: Attribute<scope::Device, Vec<f64>> =
        Attribute::new(ids::DEV_AI_VOLTAGE_RNGS, "Dev_AI_VoltageRngs");

    pub const PHYSICAL_CHANNEL_AI_TERMINAL_CONFIGS: Attribute<
        scope::PhysicalChannel,
        Vec<TerminalConfig>,
    > = Attribute::new(ids::PHYS_CHAN_AI_TERM_CFGS, "PhysicalChan_AI_TermCfgs");

    pub const TASK_NAME: Attribute<scope::Task, String> = Attribute::new(ids::TASK_NAME, "Task_Name");
    pub const TASK_CHANNELS: Attribute<scope::Task, Vec<String>> =
        Attribute::new(ids::TASK_CHANNELS, "Task_Channels");
    pub const TASK_NUM_CHANNELS: Attribute<scope::Task, u32> =
        Attribute::new(ids::TASK_NUM_CHANS, "Task_NumChans");
    pub const TASK_DEVICES: Attribute<scope::Task, Vec<String>> =
        Attribute::new(ids::TASK_DEVICES, "Task_Devices");
    pub const TASK_NUM_DEVICES: Attribute<scope::Task, u32> =
        Attribute::new(ids::TASK_NUM_DEVICES, "Task_NumDevices");
    pub const TASK_COMPLETE: Attribute<scope::Task, bool> =
        Attribute::new(ids::TASK_COMPLETE, "Task_Complete");

    pub const CHANNEL_AI_MAX: Attribute<scope::Channel, f64> = Attribute::new(ids::AI_MAX, "AI_Max");
    pub const CHANNEL_AI_MIN: Attribute<scope::Channel, f64> = Attribute::new(ids::AI_MIN, "AI_Min");
    pub const CHANNEL_AI_TERMINAL_CONFIG: Attribute<scope::Channel, TerminalConfig> =
        Attribute::new(ids::AI_TERM_CFG, "AI_TermCfg");

    pub const READ_AVAILABLE_SAMPLES_PER_CHANNEL: Attribute<scope::Read, u32> =
        Attribute::new(ids::READ_AVAIL_SAMP_PER_CHAN, "Read_AvailSampPerChan");
    pub const READ_TOTAL_SAMPLES_ACQUIRED: Attribute<scope::Read, u64> =
        Attribute::new(ids::READ_TOTAL_SAMP_PER_CHAN_ACQUIRED, "Read_TotalSampPerChanAcquired");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimDriver, SimOp};

    #[test]
    fn text_and_list_values() {
        let sim = SimDriver::new();
        let product = String::get(&sim, AttrTarget::Device("Dev1"), ids::DEV_PRODUCT_TYPE).unwrap();
        assert_eq!(product, "PCIe-6363");
        let chans = Vec::<String>::get(&sim, AttrTarget::Device("Dev1"), ids::DEV_AI_PHYSICAL_CHANS)
            .unwrap();
        assert_eq!(chans.len(), 8);
        assert_eq!(chans[0], "Dev1/ai0");
    }

    #[test]
    fn empty_list_is_empty() {
        let sim = SimDriver::new();
        let tasks = Vec::<String>::get(&sim, AttrTarget::System, ids::SYS_TASKS).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn array_and_bitfield_values() {
        let sim = SimDriver::new();
        let ranges =
            Vec::<f64>::get(&sim, AttrTarget::Device("Dev1"), ids::DEV_AI_VOLTAGE_RNGS).unwrap();
        assert_eq!(ranges.len() % 2, 0);
        assert!(ranges.contains(&10.0));

        let configs = Vec::<TerminalConfig>::get(
            &sim,
            AttrTarget::PhysicalChannel("Dev1/ai0"),
            ids::PHYS_CHAN_AI_TERM_CFGS,
        )
        .unwrap();
        assert_eq!(
            configs,
            [TerminalConfig::Rse, TerminalConfig::Nrse, TerminalConfig::Differential]
        );
    }

    #[test]
    fn driver_errors_propagate() {
        let sim = SimDriver::new();
        let err = bool::get(&sim, AttrTarget::Device("Dev9"), ids::DEV_IS_SIMULATED).unwrap_err();
        assert!(err.driver_code().unwrap() < 0);

        sim.inject(SimOp::GetAttribute, -200_170);
        let err = String::get(&sim, AttrTarget::Device("Dev1"), ids::DEV_PRODUCT_TYPE).unwrap_err();
        assert_eq!(err.driver_code(), Some(-200_170));
    }
}
