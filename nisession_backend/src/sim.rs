//! In-process stand-in for the NI-DAQmx driver.
//!
//! [`SimDriver`] implements [`DriverClient`] with the same status codes the vendor library
//! reports, so everything above the trait (registry, pipeline, scope front) runs unchanged
//! against it. Time does not pass on its own: [`SimDriver::advance`] acquires samples, wakes
//! blocked reads and fires every-N-samples callbacks from the calling thread, the way the
//! vendor library fires them from its own.
//!
//! Sample values come from a waveform function of `(channel index, sample index)`; the
//! default is the ramp `1000 * channel + sample`, which makes reshape errors easy to spot.
//! Any driver call can be made to fail (or warn) once with [`SimDriver::inject`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use maplit::hashmap;
use parking_lot::{Condvar, Mutex};

use crate::attributes::ids;
use crate::channel::{device_of, AiVoltageChannel};
use crate::driver::{
    AiVoltageArgs, AttrBuffer, AttrTarget, DriverClient, Edge, EveryNSamplesCallback, FillMode,
    SampleMode, TaskAction, TaskHandle, TerminalConfig, ERROR_BUFFER_TOO_SMALL_FOR_STRING,
    ERROR_INVALID_TASK, ERROR_READ_BUFFER_TOO_SMALL, ERROR_SAMPLES_NOT_YET_AVAILABLE,
    READ_ALL_AVAILABLE,
};

/// Ends a read that was waiting when its task was aborted.
pub const ERROR_TRANSFER_ABORTED: i32 = -50405;
pub const ERROR_INVALID_ATTRIBUTE_VALUE: i32 = -200077;
pub const ERROR_DUPLICATE_TASK: i32 = -200089;
pub const ERROR_PHYSICAL_CHAN_DOES_NOT_EXIST: i32 = -200170;
pub const ERROR_INVALID_DEVICE_ID: i32 = -200220;
pub const ERROR_SAMPLES_NO_LONGER_AVAILABLE: i32 = -200279;
pub const ERROR_ATTRIBUTE_NOT_SUPPORTED: i32 = -200452;
pub const ERROR_NO_CHANS_IN_TASK: i32 = -200478;
pub const ERROR_TASK_RUNNING: i32 = -200479;
pub const ERROR_CHAN_NOT_IN_TASK: i32 = -200486;
pub const ERROR_DUPLICATE_CHAN_NAME: i32 = -200489;
/// Reported when a requested channel range is narrowed to what the device supports.
pub const WARNING_RANGE_COERCED: i32 = 200_015;

const FULL_SCALE: f64 = 10.0;

/// Driver calls that can be made to fail with [`SimDriver::inject`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateTask,
    StartTask,
    StopTask,
    ClearTask,
    TaskControl,
    CreateChannel,
    ConfigureTiming,
    ConfigureBuffer,
    RegisterCallback,
    Read,
    IsTaskDone,
    GetAttribute,
    ResetDevice,
}

/// A simulated device.
#[derive(Clone, Debug)]
pub struct SimDevice {
    pub name: String,
    pub product_type: String,
    pub serial_number: u32,
    pub ai_channels: usize,
    pub ao_channels: usize,
}

impl SimDevice {
    pub fn new(name: &str, ai_channels: usize, ao_channels: usize) -> Self {
        Self {
            name: name.to_string(),
            product_type: "PCIe-6363".to_string(),
            serial_number: 0x01AB_CDEF,
            ai_channels,
            ao_channels,
        }
    }

    fn has_ai(&self, physical: &str) -> bool {
        physical
            .trim_start_matches('/')
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix("/ai"))
            .and_then(|index| index.parse::<usize>().ok())
            .map_or(false, |index| index < self.ai_channels)
    }
}

pub type Waveform = Box<dyn Fn(usize, u64) -> f64 + Send + Sync>;

struct SimChannel {
    name: String,
    physical: String,
    min: f64,
    max: f64,
    terminal_config: TerminalConfig,
}

struct SimTask {
    name: String,
    channels: Vec<SimChannel>,
    timing: Option<(SampleMode, u64)>,
    input_buffer: Option<u32>,
    running: bool,
    committed: bool,
    // Samples per channel since the last start.
    acquired: u64,
    read: u64,
    callback: Option<(u32, EveryNSamplesCallback)>,
    notified: u64,
    aborts: u64,
}

impl SimTask {
    fn new(name: String) -> Self {
        Self {
            name,
            channels: Vec::new(),
            timing: None,
            input_buffer: None,
            running: false,
            committed: false,
            acquired: 0,
            read: 0,
            callback: None,
            notified: 0,
            aborts: 0,
        }
    }

    fn finite_total(&self) -> Option<u64> {
        match self.timing {
            Some((SampleMode::Finite, total)) => Some(total),
            _ => None,
        }
    }

    fn is_done(&self) -> bool {
        !self.running || self.finite_total().map_or(false, |total| self.acquired >= total)
    }

    fn available(&self) -> u64 {
        self.acquired - self.read
    }

    fn start(&mut self) -> i32 {
        if self.channels.is_empty() {
            return ERROR_NO_CHANS_IN_TASK;
        }
        if self.running {
            return ERROR_TASK_RUNNING;
        }
        self.running = true;
        self.committed = true;
        self.acquired = 0;
        self.read = 0;
        self.notified = 0;
        0
    }
}

struct SimState {
    next_handle: u64,
    tasks: HashMap<u64, SimTask>,
    faults: HashMap<SimOp, i32>,
    resets: Vec<String>,
    devices: Vec<SimDevice>,
}

impl SimState {
    fn device(&self, name: &str) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.name == name)
    }
}

enum SimValue {
    I32(i32),
    U32(u32),
    U64(u64),
    F64(f64),
    Bool(bool),
    Text(String),
    F64Array(Vec<f64>),
}

impl SimValue {
    fn list<'a>(items: impl IntoIterator<Item = &'a str>) -> Self {
        SimValue::Text(items.into_iter().collect::<Vec<_>>().join(", "))
    }

    fn write(self, buffer: AttrBuffer<'_>) -> i32 {
        match (self, buffer) {
            (SimValue::I32(v), AttrBuffer::I32(out)) => *out = v,
            (SimValue::U32(v), AttrBuffer::U32(out)) => *out = v,
            (SimValue::U64(v), AttrBuffer::U64(out)) => *out = v,
            (SimValue::F64(v), AttrBuffer::F64(out)) => *out = v,
            (SimValue::Bool(v), AttrBuffer::Bool(out)) => *out = v,
            (SimValue::Text(text), AttrBuffer::Text(out)) => {
                let needed = text.len() + 1;
                if out.is_empty() {
                    return needed as i32;
                }
                if out.len() < needed {
                    return ERROR_BUFFER_TOO_SMALL_FOR_STRING;
                }
                out[..text.len()].copy_from_slice(text.as_bytes());
                out[text.len()] = 0;
            }
            (SimValue::F64Array(values), AttrBuffer::F64Array(out)) => {
                if out.is_empty() {
                    return values.len() as i32;
                }
                if out.len() < values.len() {
                    return ERROR_READ_BUFFER_TOO_SMALL;
                }
                out[..values.len()].copy_from_slice(&values);
            }
            _ => return ERROR_ATTRIBUTE_NOT_SUPPORTED,
        }
        0
    }
}

/// Simulated driver. See the module docs.
pub struct SimDriver {
    state: Mutex<SimState>,
    data_ready: Condvar,
    // Held while callbacks run; stop, clear and (un)registration wait for it like the vendor
    // library waits for an in-flight callback.
    dispatch: Mutex<()>,
    waveform: Waveform,
    messages: HashMap<i32, &'static str>,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDriver {
    /// A driver with one simulated device `Dev1` (8 analog inputs, 2 analog outputs).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_handle: 0x1000,
                tasks: HashMap::new(),
                faults: HashMap::new(),
                resets: Vec::new(),
                devices: vec![SimDevice::new("Dev1", 8, 2)],
            }),
            data_ready: Condvar::new(),
            dispatch: Mutex::new(()),
            waveform: Box::new(|channel, sample| (channel * 1000) as f64 + sample as f64),
            messages: hashmap! {
                ERROR_INVALID_TASK => "Task specified is invalid or does not exist.",
                ERROR_SAMPLES_NOT_YET_AVAILABLE => "Some or all of the samples requested have not yet been acquired.",
                ERROR_SAMPLES_NO_LONGER_AVAILABLE => "The application is not able to keep up with the hardware acquisition.",
                ERROR_BUFFER_TOO_SMALL_FOR_STRING => "Buffer is too small to fit the string.",
                ERROR_READ_BUFFER_TOO_SMALL => "Buffer is too small to fit read data.",
                ERROR_TRANSFER_ABORTED => "No transfer is in progress because the transfer was aborted by the client.",
                ERROR_INVALID_ATTRIBUTE_VALUE => "Requested value is not a supported value for this property.",
                ERROR_DUPLICATE_TASK => "Task name specified conflicts with an existing task name.",
                ERROR_PHYSICAL_CHAN_DOES_NOT_EXIST => "Physical channel specified does not exist on this device.",
                ERROR_INVALID_DEVICE_ID => "Device identifier is invalid.",
                ERROR_ATTRIBUTE_NOT_SUPPORTED => "Specified property is not supported by the device or is not applicable to the task.",
                ERROR_NO_CHANS_IN_TASK => "Task contains no channels.",
                ERROR_TASK_RUNNING => "Specified operation cannot be performed while the task is running.",
                ERROR_CHAN_NOT_IN_TASK => "Specified channel is not in the task.",
                ERROR_DUPLICATE_CHAN_NAME => "A channel with the same name is already in the task.",
                WARNING_RANGE_COERCED => "Requested channel range was coerced to the device range.",
            },
        }
    }

    pub fn with_waveform(mut self, waveform: impl Fn(usize, u64) -> f64 + Send + Sync + 'static) -> Self {
        self.waveform = Box::new(waveform);
        self
    }

    pub fn with_devices(self, devices: Vec<SimDevice>) -> Self {
        self.state.lock().devices = devices;
        self
    }

    /// Makes the next call of `op` report `status`. A negative status fails the call without
    /// effect; a positive one lets it complete with that warning.
    pub fn inject(&self, op: SimOp, status: i32) {
        self.state.lock().faults.insert(op, status);
    }

    /// Acquires `samples` more samples per channel on a running task.
    pub fn advance(&self, handle: TaskHandle, samples: u64) {
        let _dispatch = self.dispatch.lock();
        let fired = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(&handle.0) else {
                return;
            };
            if !task.running {
                return;
            }
            let target = task.acquired + samples;
            task.acquired = task.finite_total().map_or(target, |total| target.min(total));

            let mut fired = Vec::new();
            if let Some((n, callback)) = &task.callback {
                let crossings = task.acquired / u64::from(*n);
                while task.notified < crossings {
                    task.notified += 1;
                    fired.push((Arc::clone(callback), *n));
                }
            }
            fired
        };
        self.data_ready.notify_all();
        for (callback, n) in fired {
            callback(n);
        }
    }

    /// [`advance`](Self::advance) on every running task.
    pub fn advance_all(&self, samples: u64) {
        let running: Vec<u64> = {
            let state = self.state.lock();
            state
                .tasks
                .iter()
                .filter(|(_, t)| t.running)
                .map(|(h, _)| *h)
                .collect()
        };
        for handle in running {
            self.advance(TaskHandle(handle), samples);
        }
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_running(&self, handle: TaskHandle) -> bool {
        self.state
            .lock()
            .tasks
            .get(&handle.0)
            .map_or(false, |t| t.running)
    }

    pub fn has_callback(&self, handle: TaskHandle) -> bool {
        self.state
            .lock()
            .tasks
            .get(&handle.0)
            .map_or(false, |t| t.callback.is_some())
    }

    pub fn input_buffer(&self, handle: TaskHandle) -> Option<u32> {
        self.state
            .lock()
            .tasks
            .get(&handle.0)
            .and_then(|t| t.input_buffer)
    }

    /// Devices reset so far, in call order.
    pub fn resets(&self) -> Vec<String> {
        self.state.lock().resets.clone()
    }

    /// Runs `f` on a task unless a negative fault was injected for `op`. The injected warning,
    /// if any, replaces a zero status.
    fn with_task(
        &self,
        op: SimOp,
        handle: TaskHandle,
        f: impl FnOnce(&mut SimState, u64) -> i32,
    ) -> i32 {
        let mut state = self.state.lock();
        let injected = state.faults.remove(&op);
        if let Some(code) = injected.filter(|c| *c < 0) {
            return code;
        }
        if !state.tasks.contains_key(&handle.0) {
            return ERROR_INVALID_TASK;
        }
        match f(&mut state, handle.0) {
            0 => injected.unwrap_or(0),
            status => status,
        }
    }

    fn task_mut<'a>(state: &'a mut SimState, handle: u64) -> &'a mut SimTask {
        // Presence is checked by `with_task` under the same lock.
        state
            .tasks
            .get_mut(&handle)
            .unwrap_or_else(|| unreachable!("task {handle:#x} checked before use"))
    }

    fn attribute_value(state: &SimState, target: AttrTarget<'_>, attribute: i32) -> Result<SimValue, i32> {
        match target {
            AttrTarget::System => match attribute {
                ids::SYS_DEV_NAMES => Ok(SimValue::list(state.devices.iter().map(|d| d.name.as_str()))),
                ids::SYS_TASKS | ids::SYS_GLOBAL_CHANS | ids::SYS_SCALES => {
                    Ok(SimValue::Text(String::new()))
                }
                ids::SYS_NIDAQ_MAJOR_VERSION => Ok(SimValue::U32(23)),
                ids::SYS_NIDAQ_MINOR_VERSION => Ok(SimValue::U32(8)),
                _ => Err(ERROR_ATTRIBUTE_NOT_SUPPORTED),
            },
            AttrTarget::Device(name) => {
                let device = state.device(name).ok_or(ERROR_INVALID_DEVICE_ID)?;
                match attribute {
                    ids::DEV_IS_SIMULATED => Ok(SimValue::Bool(true)),
                    ids::DEV_PRODUCT_TYPE => Ok(SimValue::Text(device.product_type.clone())),
                    ids::DEV_SERIAL_NUM => Ok(SimValue::U32(device.serial_number)),
                    ids::DEV_AI_PHYSICAL_CHANS => Ok(SimValue::Text(
                        (0..device.ai_channels)
                            .map(|i| format!("{}/ai{}", device.name, i))
                            .collect::<Vec<_>>()
                            .join(", "),
                    )),
                    ids::DEV_AO_PHYSICAL_CHANS => Ok(SimValue::Text(
                        (0..device.ao_channels)
                            .map(|i| format!("{}/ao{}", device.name, i))
                            .collect::<Vec<_>>()
                            .join(", "),
                    )),
                    ids::DEV_AI_MAX_SINGLE_CHAN_RATE => Ok(SimValue::F64(2.0e6)),
                    ids::DEV_AI_MAX_MULTI_CHAN_RATE => Ok(SimValue::F64(1.0e6)),
                    ids::DEV_AI_MIN_RATE => Ok(SimValue::F64(0.0)),
                    ids::DEV_AI_VOLTAGE_RNGS => Ok(SimValue::F64Array(
                        [0.1, 0.2, 0.5, 1.0, 2.0, 5.0, FULL_SCALE]
                            .iter()
                            .flat_map(|r| [-r, *r])
                            .collect(),
                    )),
                    _ => Err(ERROR_ATTRIBUTE_NOT_SUPPORTED),
                }
            }
            AttrTarget::PhysicalChannel(physical) => {
                let device = state
                    .device(device_of(physical))
                    .ok_or(ERROR_INVALID_DEVICE_ID)?;
                if !device.has_ai(physical) {
                    return Err(ERROR_PHYSICAL_CHAN_DOES_NOT_EXIST);
                }
                match attribute {
                    ids::PHYS_CHAN_AI_TERM_CFGS => Ok(SimValue::I32(
                        ids::BIT_TERM_CFG_RSE | ids::BIT_TERM_CFG_NRSE | ids::BIT_TERM_CFG_DIFF,
                    )),
                    _ => Err(ERROR_ATTRIBUTE_NOT_SUPPORTED),
                }
            }
            AttrTarget::Task(handle) => {
                let task = state.tasks.get(&handle.0).ok_or(ERROR_INVALID_TASK)?;
                let mut devices: Vec<&str> = Vec::new();
                for chan in &task.channels {
                    let device = device_of(&chan.physical);
                    if !devices.contains(&device) {
                        devices.push(device);
                    }
                }
                match attribute {
                    ids::TASK_NAME => Ok(SimValue::Text(task.name.clone())),
                    ids::TASK_CHANNELS => Ok(SimValue::list(task.channels.iter().map(|c| c.name.as_str()))),
                    ids::TASK_NUM_CHANS => Ok(SimValue::U32(task.channels.len() as u32)),
                    ids::TASK_DEVICES => Ok(SimValue::list(devices.iter().copied())),
                    ids::TASK_NUM_DEVICES => Ok(SimValue::U32(devices.len() as u32)),
                    ids::TASK_COMPLETE => Ok(SimValue::Bool(task.is_done())),
                    _ => Err(ERROR_ATTRIBUTE_NOT_SUPPORTED),
                }
            }
            AttrTarget::Channel(handle, name) => {
                let task = state.tasks.get(&handle.0).ok_or(ERROR_INVALID_TASK)?;
                let chan = task
                    .channels
                    .iter()
                    .find(|c| c.name == name)
                    .ok_or(ERROR_CHAN_NOT_IN_TASK)?;
                match attribute {
                    ids::AI_MAX => Ok(SimValue::F64(chan.max)),
                    ids::AI_MIN => Ok(SimValue::F64(chan.min)),
                    ids::AI_TERM_CFG => {
                        // The device resolves the default configuration to RSE.
                        let config = match chan.terminal_config {
                            TerminalConfig::Default => TerminalConfig::Rse,
                            other => other,
                        };
                        Ok(SimValue::I32(config.code()))
                    }
                    _ => Err(ERROR_ATTRIBUTE_NOT_SUPPORTED),
                }
            }
            AttrTarget::Read(handle) => {
                let task = state.tasks.get(&handle.0).ok_or(ERROR_INVALID_TASK)?;
                match attribute {
                    ids::READ_AVAIL_SAMP_PER_CHAN => Ok(SimValue::U32(task.available() as u32)),
                    ids::READ_TOTAL_SAMP_PER_CHAN_ACQUIRED => Ok(SimValue::U64(task.acquired)),
                    _ => Err(ERROR_ATTRIBUTE_NOT_SUPPORTED),
                }
            }
        }
    }
}

impl DriverClient for SimDriver {
    fn create_task(&self, name: &str, handle: &mut TaskHandle) -> i32 {
        let mut state = self.state.lock();
        let injected = state.faults.remove(&SimOp::CreateTask);
        if let Some(code) = injected.filter(|c| *c < 0) {
            return code;
        }
        if !name.is_empty() && state.tasks.values().any(|t| t.name == name) {
            return ERROR_DUPLICATE_TASK;
        }
        let raw = state.next_handle;
        state.next_handle += 1;
        let name = if name.is_empty() {
            format!("_unnamedTask<{raw:X}>")
        } else {
            name.to_string()
        };
        state.tasks.insert(raw, SimTask::new(name));
        *handle = TaskHandle(raw);
        injected.unwrap_or(0)
    }

    fn start_task(&self, handle: TaskHandle) -> i32 {
        self.with_task(SimOp::StartTask, handle, |state, h| {
            Self::task_mut(state, h).start()
        })
    }

    fn stop_task(&self, handle: TaskHandle) -> i32 {
        let _dispatch = self.dispatch.lock();
        let status = self.with_task(SimOp::StopTask, handle, |state, h| {
            Self::task_mut(state, h).running = false;
            0
        });
        self.data_ready.notify_all();
        status
    }

    fn clear_task(&self, handle: TaskHandle) -> i32 {
        let _dispatch = self.dispatch.lock();
        let status = self.with_task(SimOp::ClearTask, handle, |state, h| {
            state.tasks.remove(&h);
            0
        });
        self.data_ready.notify_all();
        status
    }

    fn task_control(&self, handle: TaskHandle, action: TaskAction) -> i32 {
        match action {
            TaskAction::Start => self.start_task(handle),
            TaskAction::Stop => self.stop_task(handle),
            _ => {
                let status = self.with_task(SimOp::TaskControl, handle, |state, h| {
                    let task = Self::task_mut(state, h);
                    match action {
                        TaskAction::Abort => {
                            task.running = false;
                            task.aborts += 1;
                            0
                        }
                        TaskAction::Unreserve => {
                            task.committed = false;
                            0
                        }
                        _ if task.channels.is_empty() => ERROR_NO_CHANS_IN_TASK,
                        TaskAction::Commit | TaskAction::Reserve => {
                            task.committed = true;
                            0
                        }
                        _ => 0,
                    }
                });
                self.data_ready.notify_all();
                status
            }
        }
    }

    fn is_task_done(&self, handle: TaskHandle, done: &mut bool) -> i32 {
        self.with_task(SimOp::IsTaskDone, handle, |state, h| {
            *done = Self::task_mut(state, h).is_done();
            0
        })
    }

    fn create_ai_voltage_chan(&self, handle: TaskHandle, args: AiVoltageArgs<'_>) -> i32 {
        self.with_task(SimOp::CreateChannel, handle, |state, h| {
            if state.tasks[&h].running {
                return ERROR_TASK_RUNNING;
            }
            if !(args.min < args.max) {
                return ERROR_INVALID_ATTRIBUTE_VALUE;
            }
            let config = AiVoltageChannel::new(args.physical_channel, args.min, args.max)
                .named(args.assigned_name);
            let (Ok(physical), Ok(names)) = (
                crate::channel::expand_physical_channels(args.physical_channel),
                config.virtual_names(),
            ) else {
                return ERROR_PHYSICAL_CHAN_DOES_NOT_EXIST;
            };
            for chan in &physical {
                let Some(device) = state.device(device_of(chan)) else {
                    return ERROR_INVALID_DEVICE_ID;
                };
                if !device.has_ai(chan) {
                    return ERROR_PHYSICAL_CHAN_DOES_NOT_EXIST;
                }
            }
            let task = Self::task_mut(state, h);
            if names
                .iter()
                .any(|n| task.channels.iter().any(|c| &c.name == n))
            {
                return ERROR_DUPLICATE_CHAN_NAME;
            }
            let min = args.min.max(-FULL_SCALE);
            let max = args.max.min(FULL_SCALE);
            let coerced = min != args.min || max != args.max;
            task.channels
                .extend(physical.into_iter().zip(names).map(|(physical, name)| SimChannel {
                    name,
                    physical,
                    min,
                    max,
                    terminal_config: args.terminal_config,
                }));
            if coerced {
                WARNING_RANGE_COERCED
            } else {
                0
            }
        })
    }

    fn cfg_samp_clk_timing(
        &self,
        handle: TaskHandle,
        _source: &str,
        rate: f64,
        _active_edge: Edge,
        sample_mode: SampleMode,
        samps_per_chan: u64,
    ) -> i32 {
        self.with_task(SimOp::ConfigureTiming, handle, |state, h| {
            let task = Self::task_mut(state, h);
            if task.running {
                return ERROR_TASK_RUNNING;
            }
            if !(rate > 0.0) {
                return ERROR_INVALID_ATTRIBUTE_VALUE;
            }
            task.timing = Some((sample_mode, samps_per_chan));
            0
        })
    }

    fn cfg_implicit_timing(&self, handle: TaskHandle, sample_mode: SampleMode, samps_per_chan: u64) -> i32 {
        self.with_task(SimOp::ConfigureTiming, handle, |state, h| {
            let task = Self::task_mut(state, h);
            if task.running {
                return ERROR_TASK_RUNNING;
            }
            task.timing = Some((sample_mode, samps_per_chan));
            0
        })
    }

    fn cfg_input_buffer(&self, handle: TaskHandle, samps_per_chan: u32) -> i32 {
        self.with_task(SimOp::ConfigureBuffer, handle, |state, h| {
            let task = Self::task_mut(state, h);
            if task.running {
                return ERROR_TASK_RUNNING;
            }
            task.input_buffer = Some(samps_per_chan);
            0
        })
    }

    fn register_every_n_samples(
        &self,
        handle: TaskHandle,
        n_samples: u32,
        callback: Option<EveryNSamplesCallback>,
    ) -> i32 {
        let _dispatch = self.dispatch.lock();
        self.with_task(SimOp::RegisterCallback, handle, |state, h| {
            let task = Self::task_mut(state, h);
            match callback {
                None => {
                    task.callback = None;
                    0
                }
                Some(_) if task.running => ERROR_TASK_RUNNING,
                Some(_) if n_samples == 0 => ERROR_INVALID_ATTRIBUTE_VALUE,
                Some(callback) => {
                    task.callback = Some((n_samples, callback));
                    task.notified = task.acquired / u64::from(n_samples);
                    0
                }
            }
        })
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
        *samps_per_chan_read = 0;
        // Negative (or unrepresentable) timeouts wait forever.
        let deadline = Duration::try_from_secs_f64(timeout)
            .ok()
            .and_then(|timeout| Instant::now().checked_add(timeout));

        let mut state = self.state.lock();
        let injected = state.faults.remove(&SimOp::Read);
        if let Some(code) = injected.filter(|c| *c < 0) {
            return code;
        }
        let (channels, wanted, aborts) = {
            let Some(task) = state.tasks.get(&handle.0) else {
                return ERROR_INVALID_TASK;
            };
            if task.channels.is_empty() {
                return ERROR_NO_CHANS_IN_TASK;
            }
            if let Some(capacity) = task.input_buffer {
                if task.finite_total().is_none() && task.available() > u64::from(capacity) {
                    return ERROR_SAMPLES_NO_LONGER_AVAILABLE;
                }
            }
            let wanted = if samps_per_chan == READ_ALL_AVAILABLE {
                task.available()
            } else {
                let requested = u64::from(samps_per_chan.max(0) as u32);
                match task.finite_total() {
                    Some(total) => requested.min(total - task.read),
                    None => requested,
                }
            };
            (task.channels.len(), wanted, task.aborts)
        };
        if (buffer.len() as u64) < wanted * channels as u64 {
            return ERROR_READ_BUFFER_TOO_SMALL;
        }

        loop {
            let Some(task) = state.tasks.get(&handle.0) else {
                return ERROR_INVALID_TASK;
            };
            if task.aborts != aborts {
                return ERROR_TRANSFER_ABORTED;
            }
            if task.available() >= wanted || !task.running {
                break;
            }
            match deadline {
                None => self.data_ready.wait(&mut state),
                Some(deadline) => {
                    if self.data_ready.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }

        let Some(task) = state.tasks.get_mut(&handle.0) else {
            return ERROR_INVALID_TASK;
        };
        let count = task.available().min(wanted);
        let stride = count as usize;
        for i in 0..stride {
            let sample = task.read + i as u64;
            for c in 0..channels {
                let index = match fill_mode {
                    FillMode::GroupByChannel => c * stride + i,
                    FillMode::GroupByScanNumber => i * channels + c,
                };
                buffer[index] = (self.waveform)(c, sample);
            }
        }
        task.read += count;
        *samps_per_chan_read = count as i32;

        if count < wanted {
            ERROR_SAMPLES_NOT_YET_AVAILABLE
        } else {
            injected.unwrap_or(0)
        }
    }

    fn get_attribute(&self, target: AttrTarget<'_>, attribute: i32, value: AttrBuffer<'_>) -> i32 {
        let mut state = self.state.lock();
        if let Some(code) = state.faults.remove(&SimOp::GetAttribute) {
            if code < 0 {
                return code;
            }
        }
        match Self::attribute_value(&state, target, attribute) {
            Ok(v) => v.write(value),
            Err(code) => code,
        }
    }

    fn reset_device(&self, device: &str) -> i32 {
        let mut state = self.state.lock();
        let injected = state.faults.remove(&SimOp::ResetDevice);
        if let Some(code) = injected.filter(|c| *c < 0) {
            return code;
        }
        if state.device(device).is_none() {
            return ERROR_INVALID_DEVICE_ID;
        }
        for task in state.tasks.values_mut() {
            if task.channels.iter().any(|c| device_of(&c.physical) == device) {
                task.running = false;
                task.aborts += 1;
            }
        }
        state.resets.push(device.to_string());
        self.data_ready.notify_all();
        injected.unwrap_or(0)
    }

    fn error_string(&self, status: i32) -> String {
        match self.messages.get(&status) {
            Some(message) => message.to_string(),
            None => format!("Simulated driver status {status}."),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::VoltageUnits;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn task_with_channels(sim: &SimDriver, physical: &str, names: &str) -> TaskHandle {
        let mut handle = TaskHandle(0);
        assert_eq!(sim.create_task("t", &mut handle), 0);
        let status = sim.create_ai_voltage_chan(
            handle,
            AiVoltageArgs {
                physical_channel: physical,
                assigned_name: names,
                terminal_config: TerminalConfig::Default,
                min: 0.0,
                max: 0.5,
                units: &VoltageUnits::Volts,
            },
        );
        assert_eq!(status, 0);
        handle
    }

    #[test]
    fn duplicate_task_names() {
        let sim = SimDriver::new();
        let mut first = TaskHandle(0);
        let mut second = TaskHandle(0);
        assert_eq!(sim.create_task("scope", &mut first), 0);
        assert_eq!(sim.create_task("scope", &mut second), ERROR_DUPLICATE_TASK);
        assert_eq!(sim.create_task("", &mut second), 0);
        assert_ne!(first, second);
    }

    #[test]
    fn unknown_physical_channels() {
        let sim = SimDriver::new();
        let mut handle = TaskHandle(0);
        sim.create_task("t", &mut handle);
        let volts = VoltageUnits::Volts;
        let args = |physical| AiVoltageArgs {
            physical_channel: physical,
            assigned_name: "",
            terminal_config: TerminalConfig::Default,
            min: -1.0,
            max: 1.0,
            units: &volts,
        };
        assert_eq!(sim.create_ai_voltage_chan(handle, args("Dev2/ai0")), ERROR_INVALID_DEVICE_ID);
        assert_eq!(
            sim.create_ai_voltage_chan(handle, args("Dev1/ai8")),
            ERROR_PHYSICAL_CHAN_DOES_NOT_EXIST
        );
        assert_eq!(sim.create_ai_voltage_chan(handle, args("Dev1/ai0:7")), 0);
    }

    #[test]
    fn read_fill_modes() {
        let sim = SimDriver::new();
        let handle = task_with_channels(&sim, "Dev1/ai0:1", "");
        assert_eq!(sim.start_task(handle), 0);
        sim.advance(handle, 3);

        let mut buffer = [0.0; 6];
        let mut read = 0;
        let status = sim.read_analog_f64(handle, 3, 0.0, FillMode::GroupByChannel, &mut buffer, &mut read);
        assert_eq!((status, read), (0, 3));
        assert_eq!(buffer, [0.0, 1.0, 2.0, 1000.0, 1001.0, 1002.0]);

        sim.advance(handle, 2);
        let status = sim.read_analog_f64(handle, 2, 0.0, FillMode::GroupByScanNumber, &mut buffer, &mut read);
        assert_eq!((status, read), (0, 2));
        assert_eq!(buffer[..4], [3.0, 1003.0, 4.0, 1004.0]);
    }

    #[test]
    fn read_timeout_returns_partial() {
        let sim = SimDriver::new();
        let handle = task_with_channels(&sim, "Dev1/ai0", "");
        sim.start_task(handle);
        sim.advance(handle, 2);

        let mut buffer = [0.0; 4];
        let mut read = -1;
        let status = sim.read_analog_f64(handle, 4, 0.01, FillMode::GroupByChannel, &mut buffer, &mut read);
        assert_eq!(status, ERROR_SAMPLES_NOT_YET_AVAILABLE);
        assert_eq!(read, 2);
    }

    #[test]
    fn callbacks_fire_per_threshold() {
        let sim = SimDriver::new();
        let handle = task_with_channels(&sim, "Dev1/ai0", "");
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let callback: EveryNSamplesCallback = Arc::new(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
            0
        });
        assert_eq!(sim.register_every_n_samples(handle, 10, Some(callback)), 0);
        sim.start_task(handle);
        sim.advance(handle, 25);
        assert_eq!(calls.load(Ordering::SeqCst), 20);
        sim.advance(handle, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 30);

        assert_eq!(sim.register_every_n_samples(handle, 0, None), 0);
        sim.advance(handle, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 30);
    }

    #[test]
    fn abort_ends_a_waiting_read() {
        let sim = Arc::new(SimDriver::new());
        let handle = task_with_channels(&sim, "Dev1/ai0", "");
        sim.start_task(handle);

        let aborter = {
            let sim = Arc::clone(&sim);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                sim.task_control(handle, TaskAction::Abort)
            })
        };
        let mut buffer = [0.0; 8];
        let mut read = 0;
        let status = sim.read_analog_f64(handle, 8, -1.0, FillMode::GroupByChannel, &mut buffer, &mut read);
        assert_eq!(aborter.join().unwrap(), 0);
        assert_eq!((status, read), (ERROR_TRANSFER_ABORTED, 0));
    }

    #[test]
    fn finite_acquisition_completes() {
        let sim = SimDriver::new();
        let handle = task_with_channels(&sim, "Dev1/ai0", "");
        sim.cfg_samp_clk_timing(handle, "", 1000.0, Edge::Rising, SampleMode::Finite, 5);
        sim.start_task(handle);
        sim.advance(handle, 100);

        let mut done = false;
        assert_eq!(sim.is_task_done(handle, &mut done), 0);
        assert!(done);

        let mut buffer = [0.0; 10];
        let mut read = 0;
        let status = sim.read_analog_f64(handle, 10, 1.0, FillMode::GroupByChannel, &mut buffer, &mut read);
        assert_eq!((status, read), (0, 5));
    }

    #[test]
    fn injected_faults_are_one_shot() {
        let sim = SimDriver::new();
        let handle = task_with_channels(&sim, "Dev1/ai0", "");
        sim.inject(SimOp::StartTask, -50103);
        assert_eq!(sim.start_task(handle), -50103);
        assert!(!sim.is_running(handle));
        assert_eq!(sim.start_task(handle), 0);

        sim.inject(SimOp::StopTask, 200_010);
        assert_eq!(sim.stop_task(handle), 200_010);
        assert!(!sim.is_running(handle));
    }

    #[test]
    fn range_coercion_warns() {
        let sim = SimDriver::new();
        let mut handle = TaskHandle(0);
        sim.create_task("t", &mut handle);
        let status = sim.create_ai_voltage_chan(
            handle,
            AiVoltageArgs {
                physical_channel: "Dev1/ai0",
                assigned_name: "wide",
                terminal_config: TerminalConfig::Differential,
                min: -20.0,
                max: 20.0,
                units: &VoltageUnits::Volts,
            },
        );
        assert_eq!(status, WARNING_RANGE_COERCED);
        let mut max = 0.0;
        sim.get_attribute(AttrTarget::Channel(handle, "wide"), ids::AI_MAX, AttrBuffer::F64(&mut max));
        assert_eq!(max, FULL_SCALE);
    }
}
