//! The driver contract the registry is built on.
//!
//! ## Overview
//!
//! [`DriverClient`] is the narrow slice of the NI-DAQmx C API the registry needs: task
//! lifecycle, analog input channel creation, timing and buffer configuration, the every-N
//! samples callback, the analog `f64` read and attribute queries. The methods deliberately
//! keep the shape of the vendor calls: they take out-parameters and return the raw signed
//! status so the status convention stays the one wire-level contract every implementation
//! reproduces exactly:
//!
//! - `0`: success
//! - `< 0`: fatal error, message available through [`DriverClient::error_string`]
//! - `> 0`: non-fatal warning
//!
//! Status codes are turned into typed results in exactly one place, [`check_status`].
//!
//! Two implementations exist: [`crate::sim::SimDriver`] (in-process simulation used by the
//! tests and the demo binary) and `NiDriver` in the `niscope_backend` crate, which forwards to
//! the vendor library.
//!
//! ## Attribute queries
//!
//! Variable-length attributes use the vendor's two-phase protocol. Calling
//! [`DriverClient::get_attribute`] with an empty [`AttrBuffer::Text`] or
//! [`AttrBuffer::F64Array`] returns the required buffer length as a positive status; a
//! second call with a buffer of that length fills it. Callers are not expected to do this by
//! hand: [`crate::attributes`] wraps both phases behind one typed accessor per attribute.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverWarning};

/// Vendor `DAQmxErrorSamplesNotYetAvailable`: the read timed out before enough samples arrived.
pub const ERROR_SAMPLES_NOT_YET_AVAILABLE: i32 = -200284;
/// Vendor `DAQmxErrorBufferTooSmallForString`.
pub const ERROR_BUFFER_TOO_SMALL_FOR_STRING: i32 = -200228;
/// Vendor `DAQmxErrorReadBufferTooSmall`.
pub const ERROR_READ_BUFFER_TOO_SMALL: i32 = -200229;
/// Vendor `DAQmxErrorInvalidTask`.
pub const ERROR_INVALID_TASK: i32 = -200088;

/// Timeout sentinel of the read call: block until the request is satisfied.
pub const WAIT_INFINITELY: f64 = -1.0;
/// Samples-per-channel sentinel of the read call: read whatever is available.
pub const READ_ALL_AVAILABLE: i32 = -1;

/// How long a read may wait for the requested samples.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    Seconds(f64),
    Infinite,
}

impl Timeout {
    /// The value passed to the driver's read call.
    pub fn as_driver(self) -> f64 {
        match self {
            Timeout::Seconds(seconds) => seconds,
            Timeout::Infinite => WAIT_INFINITELY,
        }
    }

    pub fn is_infinite(self) -> bool {
        self == Timeout::Infinite
    }

    pub(crate) fn validate(self) -> Result<(), String> {
        match self {
            Timeout::Seconds(s) if !(s.is_finite() && s >= 0.0) => {
                Err(format!("read timeout must be a non-negative number of seconds, got {s}"))
            }
            _ => Ok(()),
        }
    }
}

/// Opaque driver-assigned task handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalConfig {
    #[default]
    Default,
    Rse,
    Nrse,
    Differential,
    PseudoDifferential,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageUnits {
    #[default]
    Volts,
    /// Units of a custom scale saved in the driver, referenced by name.
    FromCustomScale(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleMode {
    Finite,
    #[default]
    Continuous,
    HwTimedSinglePoint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    #[default]
    Rising,
    Falling,
}

/// Interleaving of a multi-channel read buffer.
///
/// `GroupByChannel` (channel-major) stores all samples of the first channel, then all of the
/// second, ...; `GroupByScanNumber` (scan-major) stores one sample of every channel per scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    #[default]
    GroupByChannel,
    GroupByScanNumber,
}

/// Vendor task-control actions (`DAQmxTaskControl`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAction {
    Start,
    Stop,
    Verify,
    Commit,
    Reserve,
    Unreserve,
    Abort,
}

// Vendor numeric values of the enumerations above (NIDAQmx.h).
impl TerminalConfig {
    pub fn code(self) -> i32 {
        match self {
            TerminalConfig::Default => -1,
            TerminalConfig::Rse => 10083,
            TerminalConfig::Nrse => 10078,
            TerminalConfig::Differential => 10106,
            TerminalConfig::PseudoDifferential => 12529,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            TerminalConfig::Default,
            TerminalConfig::Rse,
            TerminalConfig::Nrse,
            TerminalConfig::Differential,
            TerminalConfig::PseudoDifferential,
        ]
        .into_iter()
        .find(|t| t.code() == code)
    }
}

impl VoltageUnits {
    pub fn code(&self) -> i32 {
        match self {
            VoltageUnits::Volts => 10348,
            VoltageUnits::FromCustomScale(_) => 10065,
        }
    }

    pub fn custom_scale(&self) -> Option<&str> {
        match self {
            VoltageUnits::Volts => None,
            VoltageUnits::FromCustomScale(name) => Some(name),
        }
    }
}

impl SampleMode {
    pub fn code(self) -> i32 {
        match self {
            SampleMode::Finite => 10178,
            SampleMode::Continuous => 10123,
            SampleMode::HwTimedSinglePoint => 12522,
        }
    }
}

impl Edge {
    pub fn code(self) -> i32 {
        match self {
            Edge::Rising => 10280,
            Edge::Falling => 10171,
        }
    }
}

impl FillMode {
    pub fn code(self) -> u32 {
        match self {
            FillMode::GroupByChannel => 0,
            FillMode::GroupByScanNumber => 1,
        }
    }
}

impl TaskAction {
    pub fn code(self) -> i32 {
        match self {
            TaskAction::Start => 0,
            TaskAction::Stop => 1,
            TaskAction::Verify => 2,
            TaskAction::Commit => 3,
            TaskAction::Reserve => 4,
            TaskAction::Unreserve => 5,
            TaskAction::Abort => 6,
        }
    }
}

/// What an attribute query is addressed to.
#[derive(Clone, Copy, Debug)]
pub enum AttrTarget<'a> {
    System,
    Device(&'a str),
    Task(TaskHandle),
    Channel(TaskHandle, &'a str),
    PhysicalChannel(&'a str),
    Read(TaskHandle),
}

/// Out-parameter of an attribute query.
///
/// An empty `Text` or `F64Array` slice is the size query of the two-phase protocol.
#[derive(Debug)]
pub enum AttrBuffer<'a> {
    I32(&'a mut i32),
    U32(&'a mut u32),
    U64(&'a mut u64),
    F64(&'a mut f64),
    Bool(&'a mut bool),
    Text(&'a mut [u8]),
    F64Array(&'a mut [f64]),
}

/// Callback invoked by the driver with the number of samples per channel that triggered it.
/// The returned value is handed back to the driver as the callback status.
pub type EveryNSamplesCallback = Arc<dyn Fn(u32) -> i32 + Send + Sync>;

/// Analog input voltage channel creation arguments, in vendor call order.
#[derive(Clone, Copy, Debug)]
pub struct AiVoltageArgs<'a> {
    pub physical_channel: &'a str,
    pub assigned_name: &'a str,
    pub terminal_config: TerminalConfig,
    pub min: f64,
    pub max: f64,
    pub units: &'a VoltageUnits,
}

/// The operations of the vendor driver the registry relies on. See the module docs for the
/// status convention.
pub trait DriverClient: Send + Sync {
    fn create_task(&self, name: &str, handle: &mut TaskHandle) -> i32;
    fn start_task(&self, handle: TaskHandle) -> i32;
    fn stop_task(&self, handle: TaskHandle) -> i32;
    fn clear_task(&self, handle: TaskHandle) -> i32;
    fn task_control(&self, handle: TaskHandle, action: TaskAction) -> i32;
    fn is_task_done(&self, handle: TaskHandle, done: &mut bool) -> i32;

    fn create_ai_voltage_chan(&self, handle: TaskHandle, args: AiVoltageArgs<'_>) -> i32;

    fn cfg_samp_clk_timing(
        &self,
        handle: TaskHandle,
        source: &str,
        rate: f64,
        active_edge: Edge,
        sample_mode: SampleMode,
        samps_per_chan: u64,
    ) -> i32;
    fn cfg_implicit_timing(
        &self,
        handle: TaskHandle,
        sample_mode: SampleMode,
        samps_per_chan: u64,
    ) -> i32;
    fn cfg_input_buffer(&self, handle: TaskHandle, samps_per_chan: u32) -> i32;

    /// Registers `callback` to fire every `n_samples` acquired samples per channel; `None`
    /// removes the current registration.
    fn register_every_n_samples(
        &self,
        handle: TaskHandle,
        n_samples: u32,
        callback: Option<EveryNSamplesCallback>,
    ) -> i32;

    /// Reads up to `samps_per_chan` samples per channel ([`READ_ALL_AVAILABLE`] for all
    /// available) into `buffer`. `timeout` is in seconds, [`WAIT_INFINITELY`] to block.
    fn read_analog_f64(
        &self,
        handle: TaskHandle,
        samps_per_chan: i32,
        timeout: f64,
        fill_mode: FillMode,
        buffer: &mut [f64],
        samps_per_chan_read: &mut i32,
    ) -> i32;

    fn get_attribute(&self, target: AttrTarget<'_>, attribute: i32, value: AttrBuffer<'_>) -> i32;

    fn reset_device(&self, device: &str) -> i32;

    /// Human readable description of a status code.
    fn error_string(&self, status: i32) -> String;
}

/// Translates a driver status into a typed result.
///
/// This is the single place where the status convention is interpreted: negative statuses
/// become [`DriverError`], positive ones a [`DriverWarning`] returned alongside success.
/// Warnings are logged here so no caller can drop one silently.
pub fn check_status<D: DriverClient + ?Sized>(
    driver: &D,
    status: i32,
) -> Result<Option<DriverWarning>, DriverError> {
    match status {
        0 => Ok(None),
        code if code < 0 => Err(DriverError {
            code,
            message: driver.error_string(code),
        }),
        code => {
            let warning = DriverWarning {
                code,
                message: driver.error_string(code),
            };
            log::warn!("{}", warning);
            Ok(Some(warning))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimDriver;

    #[test]
    fn status_convention() {
        let sim = SimDriver::new();
        assert_eq!(check_status(&sim, 0), Ok(None));

        let err = check_status(&sim, ERROR_INVALID_TASK).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_TASK);
        assert!(!err.message.is_empty());

        let warning = check_status(&sim, 200_015).unwrap().unwrap();
        assert_eq!(warning.code, 200_015);
    }
}
