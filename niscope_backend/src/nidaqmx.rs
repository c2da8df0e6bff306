//! Provides the [`DriverClient`] implementation backed by the NI-DAQmx C library.
//!
//! ## Overview
//!
//! [`NiDriver`] forwards every [`DriverClient`] method to the matching
//! [DAQmx C-function](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html)
//! and hands the raw status back unchanged. Interpreting the status is left to
//! [`nisession_backend::check_status`], so this module never panics on a driver error: a
//! negative status travels up to the registry like any other result.
//!
//! ## Safety
//!
//! All calls go through `unsafe` blocks. Strings are converted to `CString` first; a string
//! with an interior NUL cannot be passed to the driver and is reported as the vendor's
//! "invalid attribute value" status instead.
//!
//! Every-N-samples callbacks are boxed and kept in a slot map owned by the driver. The address
//! of the boxed callback is the `callbackData` pointer handed to DAQmx, and the box is only
//! released after the registration has been removed from the driver (or the task cleared), so
//! the pointer stays valid for as long as DAQmx can call the trampoline. Panics inside a
//! callback are caught in the trampoline and never unwind into C.
//!
//! ## Constants and Types
//!
//! The type aliases (`CConstStr`, `CUint32`, ...) mirror the C types of `NIDAQmx.h`; the enum
//! values of the task configuration come from the `code()` methods of the
//! [`nisession_backend::driver`] enums.
//!
//! ## Example
//!
//! ```ignore
//! use nisession_backend::*;
//! use niscope_backend::nidaqmx::NiDriver;
//!
//! let registry = SessionRegistry::new(NiDriver::new());
//! println!("{:?}", registry.devices());
//! ```

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};

use libc;
use parking_lot::Mutex;

use nisession_backend::driver::{
    AiVoltageArgs, AttrBuffer, AttrTarget, DriverClient, Edge, EveryNSamplesCallback, FillMode,
    SampleMode, TaskAction, TaskHandle,
};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
type RawTaskHandle = *mut libc::c_void;

type EveryNSamplesEventCallbackPtr =
    extern "C" fn(RawTaskHandle, CInt32, CUint32, *mut libc::c_void) -> CInt32;

pub const DAQMX_VAL_ACQUIRED_INTO_BUFFER: CInt32 = 1;
/// Vendor `DAQmxErrorInvalidAttributeValue`.
pub const DAQMX_ERROR_INVALID_ATTRIBUTE_VALUE: CInt32 = -200077;

const ERROR_BUFFER_SIZE: usize = 2048;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(deviceName: CConstStr) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;
    fn DAQmxGetErrorString(errorCode: CInt32, errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: *mut RawTaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: RawTaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: RawTaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: RawTaskHandle) -> CInt32;
    fn DAQmxTaskControl(handle: RawTaskHandle, action: CInt32) -> CInt32;
    fn DAQmxIsTaskDone(handle: RawTaskHandle, isTaskDone: *mut CBool32) -> CInt32;

    fn DAQmxCreateAIVoltageChan(
        handle: RawTaskHandle,
        physicalChannel: CConstStr,
        nameToAssignToChannel: CConstStr,
        terminalConfig: CInt32,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;

    fn DAQmxCfgSampClkTiming(
        handle: RawTaskHandle,
        source: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;
    fn DAQmxCfgImplicitTiming(handle: RawTaskHandle, sampleMode: CInt32, sampsPerChan: CUint64) -> CInt32;
    fn DAQmxCfgInputBuffer(handle: RawTaskHandle, numSampsPerChan: CUint32) -> CInt32;

    fn DAQmxRegisterEveryNSamplesEvent(
        handle: RawTaskHandle,
        everyNsamplesEventType: CInt32,
        nSamples: CUint32,
        options: CUint32,
        callbackFunction: Option<EveryNSamplesEventCallbackPtr>,
        callbackData: *mut libc::c_void,
    ) -> CInt32;

    fn DAQmxReadAnalogF64(
        handle: RawTaskHandle,
        numSampsPerChan: CInt32,
        timeout: CFloat64,
        fillMode: CBool32,
        readArray: *mut CFloat64,
        arraySizeInSamps: CUint32,
        sampsPerChanRead: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;

    fn DAQmxGetSystemInfoAttribute(attribute: CInt32, value: *mut libc::c_void, ...) -> CInt32;
    fn DAQmxGetDeviceAttribute(
        deviceName: CConstStr,
        attribute: CInt32,
        value: *mut libc::c_void,
        ...
    ) -> CInt32;
    fn DAQmxGetPhysicalChanAttribute(
        physicalChannel: CConstStr,
        attribute: CInt32,
        value: *mut libc::c_void,
        ...
    ) -> CInt32;
    fn DAQmxGetTaskAttribute(
        handle: RawTaskHandle,
        attribute: CInt32,
        value: *mut libc::c_void,
        ...
    ) -> CInt32;
    fn DAQmxGetChanAttribute(
        handle: RawTaskHandle,
        channel: CConstStr,
        attribute: CInt32,
        value: *mut libc::c_void,
        ...
    ) -> CInt32;
    fn DAQmxGetReadAttribute(
        handle: RawTaskHandle,
        attribute: CInt32,
        value: *mut libc::c_void,
        ...
    ) -> CInt32;
}

fn raw(handle: TaskHandle) -> RawTaskHandle {
    handle.0 as usize as RawTaskHandle
}

/// Converts `$s` to a `CString`, returning the invalid-value status from the enclosing
/// function if it contains a NUL byte.
macro_rules! c_string {
    ($s:expr) => {
        match CString::new($s) {
            Ok(s) => s,
            Err(_) => return DAQMX_ERROR_INVALID_ATTRIBUTE_VALUE,
        }
    };
}

extern "C" fn every_n_samples_trampoline(
    _handle: RawTaskHandle,
    _event_type: CInt32,
    n_samples: CUint32,
    callback_data: *mut libc::c_void,
) -> CInt32 {
    if callback_data.is_null() {
        return 0;
    }
    // SAFETY: `callback_data` is the address of a boxed callback held in `NiDriver::callbacks`
    // until DAQmx no longer calls this registration.
    let callback = unsafe { &*(callback_data as *const EveryNSamplesCallback) };
    catch_unwind(AssertUnwindSafe(|| callback(n_samples))).unwrap_or_else(|_| {
        log::error!("every-N-samples callback panicked; notification ignored");
        0
    })
}

/// The NI-DAQmx driver. See the module docs.
pub struct NiDriver {
    // Keyed by task handle. Boxed so the address handed to DAQmx survives map rehashing.
    callbacks: Mutex<HashMap<u64, Box<EveryNSamplesCallback>>>,
}

impl NiDriver {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Extended description of the most recent error on this thread.
    fn extended_error_info(&self) -> String {
        let mut buffer = [0 as libc::c_char; ERROR_BUFFER_SIZE];
        unsafe {
            DAQmxGetExtendedErrorInfo(buffer.as_mut_ptr(), ERROR_BUFFER_SIZE as CUint32);
            CStr::from_ptr(buffer.as_ptr())
        }
        .to_string_lossy()
        .into_owned()
    }

    fn get_scalar(
        target: &AttrTarget<'_>,
        attribute: CInt32,
        value: *mut libc::c_void,
    ) -> CInt32 {
        match *target {
            AttrTarget::System => unsafe { DAQmxGetSystemInfoAttribute(attribute, value) },
            AttrTarget::Device(device) => {
                let device = c_string!(device);
                unsafe { DAQmxGetDeviceAttribute(device.as_ptr(), attribute, value) }
            }
            AttrTarget::PhysicalChannel(channel) => {
                let channel = c_string!(channel);
                unsafe { DAQmxGetPhysicalChanAttribute(channel.as_ptr(), attribute, value) }
            }
            AttrTarget::Task(handle) => unsafe {
                DAQmxGetTaskAttribute(raw(handle), attribute, value)
            },
            AttrTarget::Channel(handle, channel) => {
                let channel = c_string!(channel);
                unsafe { DAQmxGetChanAttribute(raw(handle), channel.as_ptr(), attribute, value) }
            }
            AttrTarget::Read(handle) => unsafe {
                DAQmxGetReadAttribute(raw(handle), attribute, value)
            },
        }
    }

    // Variable-length attributes take the buffer size as the trailing variadic argument.
    fn get_sized(
        target: &AttrTarget<'_>,
        attribute: CInt32,
        value: *mut libc::c_void,
        size: CUint32,
    ) -> CInt32 {
        match *target {
            AttrTarget::System => unsafe { DAQmxGetSystemInfoAttribute(attribute, value, size) },
            AttrTarget::Device(device) => {
                let device = c_string!(device);
                unsafe { DAQmxGetDeviceAttribute(device.as_ptr(), attribute, value, size) }
            }
            AttrTarget::PhysicalChannel(channel) => {
                let channel = c_string!(channel);
                unsafe { DAQmxGetPhysicalChanAttribute(channel.as_ptr(), attribute, value, size) }
            }
            AttrTarget::Task(handle) => unsafe {
                DAQmxGetTaskAttribute(raw(handle), attribute, value, size)
            },
            AttrTarget::Channel(handle, channel) => {
                let channel = c_string!(channel);
                unsafe {
                    DAQmxGetChanAttribute(raw(handle), channel.as_ptr(), attribute, value, size)
                }
            }
            AttrTarget::Read(handle) => unsafe {
                DAQmxGetReadAttribute(raw(handle), attribute, value, size)
            },
        }
    }
}

impl Default for NiDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverClient for NiDriver {
    fn create_task(&self, name: &str, handle: &mut TaskHandle) -> i32 {
        let name = c_string!(name);
        let mut task: RawTaskHandle = std::ptr::null_mut();
        let status = unsafe { DAQmxCreateTask(name.as_ptr(), &mut task) };
        *handle = TaskHandle(task as usize as u64);
        status
    }

    fn start_task(&self, handle: TaskHandle) -> i32 {
        unsafe { DAQmxStartTask(raw(handle)) }
    }

    fn stop_task(&self, handle: TaskHandle) -> i32 {
        unsafe { DAQmxStopTask(raw(handle)) }
    }

    fn clear_task(&self, handle: TaskHandle) -> i32 {
        let status = unsafe { DAQmxClearTask(raw(handle)) };
        if status >= 0 {
            self.callbacks.lock().remove(&handle.0);
        }
        status
    }

    fn task_control(&self, handle: TaskHandle, action: TaskAction) -> i32 {
        unsafe { DAQmxTaskControl(raw(handle), action.code()) }
    }

    fn is_task_done(&self, handle: TaskHandle, done: &mut bool) -> i32 {
        let mut value: CBool32 = 0;
        let status = unsafe { DAQmxIsTaskDone(raw(handle), &mut value) };
        *done = value != 0;
        status
    }

    fn create_ai_voltage_chan(&self, handle: TaskHandle, args: AiVoltageArgs<'_>) -> i32 {
        let physical = c_string!(args.physical_channel);
        let assigned = c_string!(args.assigned_name);
        let scale = match args.units.custom_scale() {
            Some(scale) => Some(c_string!(scale)),
            None => None,
        };
        unsafe {
            DAQmxCreateAIVoltageChan(
                raw(handle),
                physical.as_ptr(),
                assigned.as_ptr(),
                args.terminal_config.code(),
                args.min,
                args.max,
                args.units.code(),
                scale.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            )
        }
    }

    fn cfg_samp_clk_timing(
        &self,
        handle: TaskHandle,
        source: &str,
        rate: f64,
        active_edge: Edge,
        sample_mode: SampleMode,
        samps_per_chan: u64,
    ) -> i32 {
        let source = c_string!(source);
        unsafe {
            DAQmxCfgSampClkTiming(
                raw(handle),
                source.as_ptr(),
                rate,
                active_edge.code(),
                sample_mode.code(),
                samps_per_chan as CUint64,
            )
        }
    }

    fn cfg_implicit_timing(
        &self,
        handle: TaskHandle,
        sample_mode: SampleMode,
        samps_per_chan: u64,
    ) -> i32 {
        unsafe { DAQmxCfgImplicitTiming(raw(handle), sample_mode.code(), samps_per_chan as CUint64) }
    }

    fn cfg_input_buffer(&self, handle: TaskHandle, samps_per_chan: u32) -> i32 {
        unsafe { DAQmxCfgInputBuffer(raw(handle), samps_per_chan) }
    }

    fn register_every_n_samples(
        &self,
        handle: TaskHandle,
        n_samples: u32,
        callback: Option<EveryNSamplesCallback>,
    ) -> i32 {
        match callback {
            Some(callback) => {
                let mut slots = self.callbacks.lock();
                let boxed = Box::new(callback);
                let data = &*boxed as *const EveryNSamplesCallback as *mut libc::c_void;
                let status = unsafe {
                    DAQmxRegisterEveryNSamplesEvent(
                        raw(handle),
                        DAQMX_VAL_ACQUIRED_INTO_BUFFER,
                        n_samples,
                        0,
                        Some(every_n_samples_trampoline),
                        data,
                    )
                };
                if status >= 0 {
                    // DAQmx rejects a second registration on a task, so a box replaced here is
                    // no longer referenced by the driver.
                    slots.insert(handle.0, boxed);
                }
                status
            }
            None => {
                let status = unsafe {
                    DAQmxRegisterEveryNSamplesEvent(
                        raw(handle),
                        DAQMX_VAL_ACQUIRED_INTO_BUFFER,
                        n_samples,
                        0,
                        None,
                        std::ptr::null_mut(),
                    )
                };
                if status >= 0 {
                    self.callbacks.lock().remove(&handle.0);
                }
                status
            }
        }
    }

    fn read_analog_f64(
        &self,
        handle: TaskHandle,
        samps_per_chan: i32,
        timeout: f64,
        fill_mode: FillMode,
        buffer: &mut [f64],
        samps_per_chan_read: &mut i32,
    ) -> i32 {
        let size = CUint32::try_from(buffer.len()).unwrap_or(CUint32::MAX);
        unsafe {
            DAQmxReadAnalogF64(
                raw(handle),
                samps_per_chan,
                timeout,
                fill_mode.code(),
                buffer.as_mut_ptr(),
                size,
                samps_per_chan_read,
                std::ptr::null_mut(),
            )
        }
    }

    fn get_attribute(&self, target: AttrTarget<'_>, attribute: i32, value: AttrBuffer<'_>) -> i32 {
        match value {
            AttrBuffer::I32(v) => Self::get_scalar(&target, attribute, v as *mut i32 as *mut _),
            AttrBuffer::U32(v) => Self::get_scalar(&target, attribute, v as *mut u32 as *mut _),
            AttrBuffer::U64(v) => Self::get_scalar(&target, attribute, v as *mut u64 as *mut _),
            AttrBuffer::F64(v) => Self::get_scalar(&target, attribute, v as *mut f64 as *mut _),
            AttrBuffer::Bool(v) => {
                let mut value: CBool32 = 0;
                let status = Self::get_scalar(&target, attribute, &mut value as *mut CBool32 as *mut _);
                *v = value != 0;
                status
            }
            AttrBuffer::Text(buffer) => {
                let size = CUint32::try_from(buffer.len()).unwrap_or(CUint32::MAX);
                let ptr = if buffer.is_empty() {
                    std::ptr::null_mut()
                } else {
                    buffer.as_mut_ptr() as *mut libc::c_void
                };
                Self::get_sized(&target, attribute, ptr, size)
            }
            AttrBuffer::F64Array(buffer) => {
                let size = CUint32::try_from(buffer.len()).unwrap_or(CUint32::MAX);
                let ptr = if buffer.is_empty() {
                    std::ptr::null_mut()
                } else {
                    buffer.as_mut_ptr() as *mut libc::c_void
                };
                Self::get_sized(&target, attribute, ptr, size)
            }
        }
    }

    fn reset_device(&self, device: &str) -> i32 {
        let device = c_string!(device);
        unsafe { DAQmxResetDevice(device.as_ptr()) }
    }

    fn error_string(&self, status: i32) -> String {
        if status < 0 {
            let extended = self.extended_error_info();
            if !extended.is_empty() {
                return extended;
            }
        }
        let mut buffer = [0 as libc::c_char; ERROR_BUFFER_SIZE];
        let lookup = unsafe {
            DAQmxGetErrorString(status, buffer.as_mut_ptr(), ERROR_BUFFER_SIZE as CUint32)
        };
        if lookup < 0 {
            return format!("unknown DAQmx status {}", status);
        }
        unsafe { CStr::from_ptr(buffer.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}
