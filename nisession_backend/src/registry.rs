//! The acquisition session registry.
//!
//! [`SessionRegistry`] owns every driver task created through it, keyed by the session name
//! chosen by the caller. It is the only component that talks to the driver: it checks each
//! request against the session's [`Lifecycle`] before forwarding it, translates the returned
//! status, and records the local mirror of what was configured.
//!
//! ## Locking
//!
//! Every session has its own mutex, taken by every operation on the session and by every
//! delivery callback. [`SessionRegistry::read`] only holds it to check the request and to
//! record the outcome; reads are serialized by a second per-session lock that nothing else
//! takes. The name map sits behind a read-write lock that is only held for
//! lookups, except in [`SessionRegistry::clear`] which removes the entry while it still holds
//! the session lock. Operations that may block inside the driver until an in-flight callback
//! returns (stop, abort, clear, unregistering delivery) first switch delivery off, so a
//! callback waiting for the session lock gives up instead of deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::Array2;
use parking_lot::{MutexGuard, RwLock};

use crate::attributes::{attr, scope, Attribute, AttributeValue};
use crate::channel::{device_of, expand_physical_channels, AiVoltageChannel};
use crate::driver::{
    check_status, AiVoltageArgs, AttrTarget, DriverClient, FillMode, TaskAction, TaskHandle,
    Timeout, ERROR_SAMPLES_NOT_YET_AVAILABLE,
};
use crate::error::{DaqError, DaqResult, DriverWarning};
use crate::pipeline::{delivery_queue, every_n_samples_callback, BlockReceiver, DeliveryConfig};
use crate::session::{
    ChannelRecord, Clock, DeliverySlot, Lifecycle, Session, SessionCell, SessionState, Timing,
};

/// Samples per channel requested by a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadCount {
    Exactly(u32),
    /// Whatever has been acquired and not read yet; never waits.
    AllAvailable,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadRequest {
    pub samples_per_channel: ReadCount,
    pub timeout: Timeout,
    pub fill_mode: FillMode,
}

impl ReadRequest {
    pub const DEFAULT_TIMEOUT: Timeout = Timeout::Seconds(10.0);

    pub fn new(samples_per_channel: u32) -> Self {
        Self {
            samples_per_channel: ReadCount::Exactly(samples_per_channel),
            timeout: Self::DEFAULT_TIMEOUT,
            fill_mode: FillMode::GroupByChannel,
        }
    }

    pub fn all_available() -> Self {
        Self {
            samples_per_channel: ReadCount::AllAvailable,
            ..Self::new(0)
        }
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fill_mode(mut self, fill_mode: FillMode) -> Self {
        self.fill_mode = fill_mode;
        self
    }
}

/// Result of [`SessionRegistry::read`].
#[derive(Clone, Debug, PartialEq)]
pub struct ReadOutcome {
    /// `channels * samples_per_channel` values laid out as `fill_mode` says.
    pub data: Vec<f64>,
    pub samples_per_channel: usize,
    pub channels: usize,
    pub fill_mode: FillMode,
    pub warning: Option<DriverWarning>,
}

impl ReadOutcome {
    /// Whether the read returned early because the timeout expired.
    pub fn timed_out(&self) -> bool {
        self.warning
            .as_ref()
            .map_or(false, |w| w.code == ERROR_SAMPLES_NOT_YET_AVAILABLE)
    }

    /// The data as a `(channels, samples_per_channel)` matrix.
    pub fn into_array(self) -> DaqResult<Array2<f64>> {
        crate::pipeline::reshape(self.data, self.channels, self.samples_per_channel, self.fill_mode)
    }
}

/// Registry of acquisition sessions on one driver. See the module docs.
pub struct SessionRegistry<D: DriverClient + 'static> {
    driver: Arc<D>,
    sessions: RwLock<IndexMap<String, Arc<SessionCell>>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

fn invalid_state(cell: &SessionCell, operation: &'static str, state: Lifecycle) -> DaqError {
    DaqError::InvalidState {
        session: cell.name.to_string(),
        operation,
        state,
    }
}

fn transition(cell: &SessionCell, state: &mut SessionState, to: Lifecycle) {
    if state.lifecycle != to {
        log::debug!("session `{}`: {} -> {}", cell.name, state.lifecycle, to);
        state.lifecycle = to;
    }
}

impl<D: DriverClient + 'static> SessionRegistry<D> {
    pub fn new(driver: D) -> Self {
        Self::from_arc(Arc::new(driver))
    }

    /// A registry on a driver shared with other owners.
    pub fn from_arc(driver: Arc<D>) -> Self {
        Self {
            driver,
            sessions: RwLock::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    fn check(&self, status: i32) -> DaqResult<Option<DriverWarning>> {
        Ok(check_status(&*self.driver, status)?)
    }

    fn cell(&self, session: &Session) -> DaqResult<Arc<SessionCell>> {
        self.sessions
            .read()
            .get(session.name())
            .filter(|cell| cell.id == session.id())
            .cloned()
            .ok_or_else(|| DaqError::UnknownSession(session.name().to_string()))
    }

    fn lock<'a>(
        &self,
        session: &Session,
        cell: &'a SessionCell,
    ) -> DaqResult<MutexGuard<'a, SessionState>> {
        let state = cell.state.lock();
        if state.lifecycle == Lifecycle::Cleared {
            return Err(DaqError::UnknownSession(session.name().to_string()));
        }
        Ok(state)
    }

    fn with_session<T>(
        &self,
        session: &Session,
        f: impl FnOnce(&SessionCell, &mut SessionState) -> DaqResult<T>,
    ) -> DaqResult<T> {
        let cell = self.cell(session)?;
        let mut state = self.lock(session, &cell)?;
        f(&cell, &mut state)
    }

    /// Creates a driver task named `name` and registers it.
    pub fn create(&self, name: &str) -> DaqResult<Session> {
        if name.trim().is_empty() {
            return Err(DaqError::InvalidArgument(
                "session name must not be empty".to_string(),
            ));
        }
        let mut sessions = self.sessions.write();
        if sessions.contains_key(name) {
            return Err(DaqError::DuplicateSession(name.to_string()));
        }
        let mut handle = TaskHandle(0);
        let warning = self.check(self.driver.create_task(name, &mut handle))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(SessionCell::new(id, Arc::from(name), handle));
        cell.state.lock().record(warning);
        log::debug!("session `{}`: created as task {}", name, handle);
        let session = cell.session();
        sessions.insert(name.to_string(), cell);
        Ok(session)
    }

    /// Adds an analog input voltage channel (or one per terminal of a range).
    pub fn add_channel(
        &self,
        session: &Session,
        channel: AiVoltageChannel,
    ) -> DaqResult<Option<DriverWarning>> {
        self.with_session(session, |cell, state| {
            if !state.lifecycle.is_reconfigurable() || state.timing.is_some() {
                return Err(invalid_state(cell, "add a channel", state.lifecycle));
            }
            let virtual_names = channel.validate()?;
            let status = self.driver.create_ai_voltage_chan(
                cell.handle,
                AiVoltageArgs {
                    physical_channel: &channel.physical,
                    assigned_name: &channel.name,
                    terminal_config: channel.terminal_config,
                    min: channel.min,
                    max: channel.max,
                    units: &channel.units,
                },
            );
            let warning = self.check(status)?;
            state.channels.push(ChannelRecord {
                config: channel,
                virtual_names,
            });
            transition(cell, state, Lifecycle::Configured);
            Ok(state.record(warning))
        })
    }

    /// Configures (or replaces) the timing of a session that has channels.
    pub fn configure_timing(
        &self,
        session: &Session,
        timing: Timing,
    ) -> DaqResult<Option<DriverWarning>> {
        self.with_session(session, |cell, state| {
            if !state.lifecycle.is_reconfigurable() || state.channels.is_empty() {
                return Err(invalid_state(cell, "configure timing", state.lifecycle));
            }
            timing.validate()?;
            let status = match &timing.clock {
                Clock::SampleClock {
                    source,
                    rate,
                    active_edge,
                } => self.driver.cfg_samp_clk_timing(
                    cell.handle,
                    source,
                    *rate,
                    *active_edge,
                    timing.mode,
                    timing.samples_per_channel,
                ),
                Clock::Implicit => self.driver.cfg_implicit_timing(
                    cell.handle,
                    timing.mode,
                    timing.samples_per_channel,
                ),
            };
            let warning = self.check(status)?;
            state.timing = Some(timing);
            transition(cell, state, Lifecycle::Configured);
            Ok(state.record(warning))
        })
    }

    /// Overrides the driver's input buffer size, in samples per channel.
    pub fn configure_input_buffer(
        &self,
        session: &Session,
        samples_per_channel: u32,
    ) -> DaqResult<Option<DriverWarning>> {
        self.with_session(session, |cell, state| {
            if !state.lifecycle.is_reconfigurable() || state.channels.is_empty() {
                return Err(invalid_state(cell, "configure the input buffer", state.lifecycle));
            }
            let warning = self.check(self.driver.cfg_input_buffer(cell.handle, samples_per_channel))?;
            state.input_buffer = Some(samples_per_channel);
            Ok(state.record(warning))
        })
    }

    /// Issues a vendor task-control action.
    pub fn control(&self, session: &Session, action: TaskAction) -> DaqResult<Option<DriverWarning>> {
        match action {
            TaskAction::Start => return self.start(session),
            TaskAction::Stop => return self.stop(session),
            TaskAction::Abort => return self.abort(session),
            _ => {}
        }
        self.with_session(session, |cell, state| {
            if state.lifecycle.is_running() {
                return Err(invalid_state(cell, "change its reservation", state.lifecycle));
            }
            let warning = self.check(self.driver.task_control(cell.handle, action))?;
            match action {
                TaskAction::Commit | TaskAction::Reserve => {
                    transition(cell, state, Lifecycle::Committed)
                }
                TaskAction::Unreserve => transition(cell, state, Lifecycle::Configured),
                _ => {}
            }
            Ok(state.record(warning))
        })
    }

    pub fn start(&self, session: &Session) -> DaqResult<Option<DriverWarning>> {
        self.with_session(session, |cell, state| {
            match state.lifecycle {
                Lifecycle::Configured
                | Lifecycle::Committed
                | Lifecycle::Stopped
                | Lifecycle::Aborted => {}
                other => return Err(invalid_state(cell, "start", other)),
            }
            let deliver = state.delivery.as_ref().map_or(false, |slot| !slot.faulted);
            // Enabled ahead of the start so the first notification waits for the lock
            // instead of being skipped.
            cell.delivery_enabled.store(deliver, Ordering::Release);
            match self.check(self.driver.start_task(cell.handle)) {
                Ok(warning) => {
                    transition(cell, state, Lifecycle::Running);
                    Ok(state.record(warning))
                }
                Err(err) => {
                    cell.delivery_enabled.store(false, Ordering::Release);
                    Err(err)
                }
            }
        })
    }

    /// Stops a running or aborted session. Stopping a stopped session does nothing.
    pub fn stop(&self, session: &Session) -> DaqResult<Option<DriverWarning>> {
        self.halt(session, TaskAction::Stop)
    }

    /// Aborts a running session without waiting for a finite acquisition to complete.
    pub fn abort(&self, session: &Session) -> DaqResult<Option<DriverWarning>> {
        self.halt(session, TaskAction::Abort)
    }

    fn halt(&self, session: &Session, action: TaskAction) -> DaqResult<Option<DriverWarning>> {
        let cell = self.cell(session)?;
        let was_enabled = cell.delivery_enabled.swap(false, Ordering::AcqRel);
        let result = self.lock(session, &cell).and_then(|mut state| {
            let (target, status) = match (action, state.lifecycle) {
                (TaskAction::Stop, Lifecycle::Stopped) => return Ok(None),
                (TaskAction::Stop, Lifecycle::Running | Lifecycle::Aborted) => {
                    (Lifecycle::Stopped, self.driver.stop_task(cell.handle))
                }
                (TaskAction::Abort, Lifecycle::Running) => (
                    Lifecycle::Aborted,
                    self.driver.task_control(cell.handle, TaskAction::Abort),
                ),
                (_, other) => {
                    let operation = if action == TaskAction::Abort { "abort" } else { "stop" };
                    return Err(invalid_state(&cell, operation, other));
                }
            };
            let warning = self.check(status)?;
            transition(&cell, &mut state, target);
            Ok(state.record(warning))
        });
        if result.is_err() {
            cell.delivery_enabled.store(was_enabled, Ordering::Release);
        }
        result
    }

    /// Whether a finite acquisition has acquired all its samples.
    pub fn is_done(&self, session: &Session) -> DaqResult<bool> {
        self.with_session(session, |cell, state| {
            if !state.timing.as_ref().map_or(false, Timing::is_finite) {
                return Err(invalid_state(
                    cell,
                    "report completion of a non-finite acquisition",
                    state.lifecycle,
                ));
            }
            let mut done = false;
            let warning = self.check(self.driver.is_task_done(cell.handle, &mut done))?;
            state.record(warning);
            Ok(done)
        })
    }

    /// Reads acquired samples.
    ///
    /// A read that runs out of time is not an error: the samples that did arrive are returned
    /// with a timeout warning (see [`ReadOutcome::timed_out`]). With [`Timeout::Infinite`] the
    /// call blocks until the request is satisfied or the acquisition ends. The session lock is
    /// not held while the driver reads, so [`abort`](Self::abort) cancels a blocked read and
    /// [`clear`](Self::clear) always goes through.
    pub fn read(&self, session: &Session, request: &ReadRequest) -> DaqResult<ReadOutcome> {
        request.timeout.validate().map_err(DaqError::InvalidArgument)?;
        let cell = self.cell(session)?;
        // Serializes reads of the session; stop, abort and clear never take it.
        let _reading = cell.read_lock.lock();

        let (channels, requested) = {
            let state = self.lock(session, &cell)?;
            match state.lifecycle {
                Lifecycle::Running | Lifecycle::Stopped | Lifecycle::Aborted => {}
                other => return Err(invalid_state(&cell, "read", other)),
            }
            let requested = match request.samples_per_channel {
                ReadCount::Exactly(n) => {
                    if let Some(buffer) = state.input_buffer.filter(|buffer| n > *buffer) {
                        return Err(DaqError::InvalidArgument(format!(
                            "cannot read {n} samples per channel from a buffer of {buffer}"
                        )));
                    }
                    i32::try_from(n).map_err(|_| {
                        DaqError::InvalidArgument(format!("cannot read {n} samples per channel"))
                    })?
                }
                // Sized from the available count rather than the driver's "all available"
                // sentinel: samples arriving meanwhile would not fit the buffer.
                ReadCount::AllAvailable => {
                    let available = u32::get(
                        &*self.driver,
                        AttrTarget::Read(cell.handle),
                        attr::READ_AVAILABLE_SAMPLES_PER_CHANNEL.id(),
                    )?;
                    i32::try_from(available).unwrap_or(i32::MAX)
                }
            };
            (state.channel_count(), requested)
        };
        let timeout = match request.samples_per_channel {
            ReadCount::Exactly(_) => request.timeout.as_driver(),
            ReadCount::AllAvailable => 0.0,
        };

        let values = channels
            .checked_mul(requested as usize)
            .ok_or_else(|| {
                DaqError::InvalidArgument(format!(
                    "{requested} samples of {channels} channels overflow a read buffer"
                ))
            })?;
        let mut data = Vec::new();
        data.try_reserve_exact(values).map_err(|err| {
            DaqError::InvalidArgument(format!("cannot allocate a read of {values} values: {err}"))
        })?;
        data.resize(values, 0.0);

        let mut read = 0;
        let status = self.driver.read_analog_f64(
            cell.handle,
            requested,
            timeout,
            request.fill_mode,
            &mut data,
            &mut read,
        );
        let warning = if status == ERROR_SAMPLES_NOT_YET_AVAILABLE {
            let warning = DriverWarning {
                code: status,
                message: self.driver.error_string(status),
            };
            log::warn!("session `{}`: read timed out after {} samples", cell.name, read);
            Some(warning)
        } else {
            self.check(status)?
        };

        let samples_per_channel = read.max(0) as usize;
        data.truncate(channels * samples_per_channel);
        // Cleared while the driver was reading: nothing left to record the warning on.
        let warning = match self.lock(session, &cell) {
            Ok(mut state) => state.record(warning),
            Err(_) => warning,
        };
        Ok(ReadOutcome {
            data,
            samples_per_channel,
            channels,
            fill_mode: request.fill_mode,
            warning,
        })
    }

    /// Stops (if needed) and releases the session.
    ///
    /// The entry is removed and the driver task cleared even when a step fails on the way;
    /// the first failure is returned afterwards.
    pub fn clear(&self, session: &Session) -> DaqResult<()> {
        let cell = self.cell(session)?;
        cell.delivery_enabled.store(false, Ordering::Release);
        let mut state = self.lock(session, &cell)?;

        let mut first_error: Option<DaqError> = None;
        let mut note = |step: &str, result: DaqResult<Option<DriverWarning>>| {
            if let Err(err) = result {
                log::warn!("session `{}`: {} during clear failed: {}", cell.name, step, err);
                first_error.get_or_insert(err);
            }
        };
        if state.lifecycle.is_running() {
            note("stop", self.check(self.driver.stop_task(cell.handle)));
        }
        if let Some(slot) = state.delivery.take() {
            let status = self
                .driver
                .register_every_n_samples(cell.handle, slot.config.threshold, None);
            note("unregistering delivery", self.check(status));
        }
        note("clear", self.check(self.driver.clear_task(cell.handle)));
        transition(&cell, &mut state, Lifecycle::Cleared);

        let mut sessions = self.sessions.write();
        if sessions.get(&*cell.name).map_or(false, |c| c.id == cell.id) {
            sessions.shift_remove(&*cell.name);
        }
        drop(sessions);
        drop(state);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Installs block delivery on a session that has channels and timing and is not running.
    pub fn register_delivery(
        &self,
        session: &Session,
        config: DeliveryConfig,
    ) -> DaqResult<BlockReceiver> {
        config.validate()?;
        let cell = self.cell(session)?;
        let mut state = self.lock(session, &cell)?;
        if state.lifecycle.is_running() || state.timing.is_none() {
            return Err(invalid_state(&cell, "register delivery", state.lifecycle));
        }
        if state.delivery.is_some() {
            return Err(invalid_state(&cell, "register a second delivery", state.lifecycle));
        }

        let (sender, receiver) = delivery_queue(config.capacity)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let callback =
            every_n_samples_callback(Arc::downgrade(&self.driver), Arc::downgrade(&cell), generation);
        let status = self
            .driver
            .register_every_n_samples(cell.handle, config.threshold, Some(callback));
        let warning = self.check(status)?;
        state.record(warning);
        log::debug!(
            "session `{}`: delivering blocks of {} samples per channel",
            cell.name,
            config.threshold
        );
        state.delivery = Some(DeliverySlot {
            generation,
            config,
            sender,
            faulted: false,
        });
        Ok(receiver)
    }

    /// Removes block delivery. Notifications still in flight are ignored from the moment this
    /// is called, even if the driver fails to unregister.
    pub fn unregister_delivery(&self, session: &Session) -> DaqResult<Option<DriverWarning>> {
        let cell = self.cell(session)?;
        cell.delivery_enabled.store(false, Ordering::Release);
        let mut state = self.lock(session, &cell)?;
        let Some(slot) = state.delivery.take() else {
            return Ok(None);
        };
        let status = self
            .driver
            .register_every_n_samples(cell.handle, slot.config.threshold, None);
        let warning = self.check(status)?;
        log::debug!("session `{}`: delivery removed", cell.name);
        Ok(state.record(warning))
    }

    /// The most recent driver warnings of the session (at most
    /// [`WARNING_LOG_CAPACITY`](crate::session::WARNING_LOG_CAPACITY)), oldest first.
    pub fn warnings(&self, session: &Session) -> DaqResult<Vec<DriverWarning>> {
        self.with_session(session, |_, state| Ok(state.warnings.iter().cloned().collect()))
    }

    /// Registered sessions in creation order.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().values().map(|cell| cell.session()).collect()
    }

    pub fn find(&self, name: &str) -> Option<Session> {
        self.sessions.read().get(name).map(|cell| cell.session())
    }

    pub fn lifecycle(&self, session: &Session) -> DaqResult<Lifecycle> {
        self.with_session(session, |_, state| Ok(state.lifecycle))
    }

    pub fn channels(&self, session: &Session) -> DaqResult<Vec<ChannelRecord>> {
        self.with_session(session, |_, state| Ok(state.channels.clone()))
    }

    pub fn timing(&self, session: &Session) -> DaqResult<Option<Timing>> {
        self.with_session(session, |_, state| Ok(state.timing.clone()))
    }

    pub fn input_buffer(&self, session: &Session) -> DaqResult<Option<u32>> {
        self.with_session(session, |_, state| Ok(state.input_buffer))
    }

    /// Driver handle of the session's task.
    pub fn task_handle(&self, session: &Session) -> DaqResult<TaskHandle> {
        self.with_session(session, |cell, _| Ok(cell.handle))
    }

    /// Number of virtual channels, i.e. rows of every delivered block.
    pub fn channel_count(&self, session: &Session) -> DaqResult<usize> {
        self.with_session(session, |_, state| Ok(state.channel_count()))
    }

    pub fn system_attribute<T: AttributeValue>(
        &self,
        attribute: Attribute<scope::System, T>,
    ) -> DaqResult<T> {
        T::get(&*self.driver, AttrTarget::System, attribute.id())
    }

    pub fn device_attribute<T: AttributeValue>(
        &self,
        device: &str,
        attribute: Attribute<scope::Device, T>,
    ) -> DaqResult<T> {
        T::get(&*self.driver, AttrTarget::Device(device), attribute.id())
    }

    pub fn physical_channel_attribute<T: AttributeValue>(
        &self,
        physical: &str,
        attribute: Attribute<scope::PhysicalChannel, T>,
    ) -> DaqResult<T> {
        T::get(&*self.driver, AttrTarget::PhysicalChannel(physical), attribute.id())
    }

    pub fn task_attribute<T: AttributeValue>(
        &self,
        session: &Session,
        attribute: Attribute<scope::Task, T>,
    ) -> DaqResult<T> {
        self.with_session(session, |cell, _| {
            T::get(&*self.driver, AttrTarget::Task(cell.handle), attribute.id())
        })
    }

    /// Attribute of one virtual channel of the session, addressed by its virtual name.
    pub fn channel_attribute<T: AttributeValue>(
        &self,
        session: &Session,
        channel: &str,
        attribute: Attribute<scope::Channel, T>,
    ) -> DaqResult<T> {
        self.with_session(session, |cell, _| {
            T::get(&*self.driver, AttrTarget::Channel(cell.handle, channel), attribute.id())
        })
    }

    pub fn read_attribute<T: AttributeValue>(
        &self,
        session: &Session,
        attribute: Attribute<scope::Read, T>,
    ) -> DaqResult<T> {
        self.with_session(session, |cell, _| {
            T::get(&*self.driver, AttrTarget::Read(cell.handle), attribute.id())
        })
    }

    pub fn devices(&self) -> DaqResult<Vec<String>> {
        self.system_attribute(attr::SYSTEM_DEVICES)
    }

    /// Tasks saved in the driver configuration (not the sessions of this registry).
    pub fn system_tasks(&self) -> DaqResult<Vec<String>> {
        self.system_attribute(attr::SYSTEM_TASKS)
    }

    pub fn global_channels(&self) -> DaqResult<Vec<String>> {
        self.system_attribute(attr::SYSTEM_GLOBAL_CHANNELS)
    }

    /// Driver `(major, minor)` version.
    pub fn version(&self) -> DaqResult<(u32, u32)> {
        Ok((
            self.system_attribute(attr::SYSTEM_MAJOR_VERSION)?,
            self.system_attribute(attr::SYSTEM_MINOR_VERSION)?,
        ))
    }

    /// Supported input ranges of a device as `(min, max)` pairs.
    pub fn ai_voltage_ranges(&self, device: &str) -> DaqResult<Vec<(f64, f64)>> {
        let flat = self.device_attribute(device, attr::DEVICE_AI_VOLTAGE_RANGES)?;
        Ok(flat.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
    }

    pub fn available_samples(&self, session: &Session) -> DaqResult<u32> {
        self.read_attribute(session, attr::READ_AVAILABLE_SAMPLES_PER_CHANNEL)
    }

    /// Resets a device. Running sessions using it are marked aborted.
    pub fn reset_device(&self, device: &str) -> DaqResult<Option<DriverWarning>> {
        let affected: Vec<Arc<SessionCell>> = self.sessions.read().values().cloned().collect();
        for cell in &affected {
            cell.delivery_enabled.store(false, Ordering::Release);
        }
        let result = self.check(self.driver.reset_device(device));

        for cell in &affected {
            let mut state = cell.state.lock();
            let uses_device = state.channels.iter().any(|c| {
                expand_physical_channels(&c.config.physical)
                    .map_or(false, |chans| chans.iter().any(|p| device_of(p) == device))
            });
            if result.is_ok() && uses_device && state.lifecycle.is_running() {
                transition(cell, &mut state, Lifecycle::Aborted);
            }
            if state.lifecycle.is_running() {
                let deliver = state.delivery.as_ref().map_or(false, |slot| !slot.faulted);
                cell.delivery_enabled.store(deliver, Ordering::Release);
            }
        }
        if result.is_ok() {
            log::info!("device {} reset", device);
        }
        result
    }
}

impl<D: DriverClient + 'static> Drop for SessionRegistry<D> {
    fn drop(&mut self) {
        for session in self.sessions() {
            if let Err(err) = self.clear(&session) {
                log::warn!("clearing session `{}` on shutdown failed: {}", session, err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::SampleMode;
    use crate::sim::SimDriver;

    fn configured(registry: &SessionRegistry<SimDriver>, name: &str) -> Session {
        let session = registry.create(name).unwrap();
        registry
            .add_channel(&session, AiVoltageChannel::new("Dev1/ai0:1", 0.0, 0.5).named("I, Q"))
            .unwrap();
        registry
            .configure_timing(&session, Timing::sample_clock(1024.0, SampleMode::Continuous, 128))
            .unwrap();
        session
    }

    #[test]
    fn stale_reference_never_resolves() {
        let registry = SessionRegistry::new(SimDriver::new());
        let old = registry.create("scope").unwrap();
        registry.clear(&old).unwrap();
        let new = registry.create("scope").unwrap();

        assert_eq!(
            registry.lifecycle(&old),
            Err(DaqError::UnknownSession("scope".to_string()))
        );
        assert_eq!(registry.lifecycle(&new), Ok(Lifecycle::Created));
        assert_eq!(registry.sessions(), [new]);
    }

    #[test]
    fn empty_name_rejected() {
        let registry = SessionRegistry::new(SimDriver::new());
        assert!(matches!(registry.create(" "), Err(DaqError::InvalidArgument(_))));
        assert!(registry.sessions().is_empty());
    }

    #[test]
    fn timing_needs_channels() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = registry.create("t").unwrap();
        let err = registry
            .configure_timing(&session, Timing::sample_clock(1000.0, SampleMode::Continuous, 0))
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidState { .. }));
        assert_eq!(registry.timing(&session).unwrap(), None);
    }

    #[test]
    fn lifecycle_transitions() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = configured(&registry, "t");
        assert_eq!(registry.channel_count(&session).unwrap(), 2);

        registry.control(&session, TaskAction::Commit).unwrap();
        assert_eq!(registry.lifecycle(&session).unwrap(), Lifecycle::Committed);
        registry.start(&session).unwrap();
        assert_eq!(registry.lifecycle(&session).unwrap(), Lifecycle::Running);
        assert!(registry.start(&session).is_err());

        registry.abort(&session).unwrap();
        assert_eq!(registry.lifecycle(&session).unwrap(), Lifecycle::Aborted);
        registry.stop(&session).unwrap();
        assert_eq!(registry.lifecycle(&session).unwrap(), Lifecycle::Stopped);
        assert_eq!(registry.stop(&session).unwrap(), None);

        registry.start(&session).unwrap();
        registry.control(&session, TaskAction::Stop).unwrap();
        assert_eq!(registry.lifecycle(&session).unwrap(), Lifecycle::Stopped);
    }

    #[test]
    fn failed_start_leaves_state() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = configured(&registry, "t");
        registry.driver().inject(crate::sim::SimOp::StartTask, -200_020);
        let err = registry.start(&session).unwrap_err();
        assert_eq!(err.driver_code(), Some(-200_020));
        assert_eq!(registry.lifecycle(&session).unwrap(), Lifecycle::Configured);
    }

    #[test]
    fn is_done_only_for_finite() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = configured(&registry, "t");
        assert!(matches!(
            registry.is_done(&session),
            Err(DaqError::InvalidState { .. })
        ));

        let finite = registry.create("finite").unwrap();
        registry
            .add_channel(&finite, AiVoltageChannel::new("Dev1/ai2", -1.0, 1.0))
            .unwrap();
        registry
            .configure_timing(&finite, Timing::sample_clock(1000.0, SampleMode::Finite, 10))
            .unwrap();
        registry.start(&finite).unwrap();
        let handle = registry.cell(&finite).unwrap().handle;
        assert!(!registry.is_done(&finite).unwrap());
        registry.driver().advance(handle, 10);
        assert!(registry.is_done(&finite).unwrap());
    }

    #[test]
    fn attributes_through_registry() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = configured(&registry, "t");
        assert_eq!(registry.devices().unwrap(), ["Dev1"]);
        assert_eq!(registry.version().unwrap(), (23, 8));
        assert_eq!(
            registry.task_attribute(&session, attr::TASK_CHANNELS).unwrap(),
            ["I", "Q"]
        );
        assert_eq!(
            registry.task_attribute(&session, attr::TASK_DEVICES).unwrap(),
            ["Dev1"]
        );
        assert_eq!(
            registry
                .channel_attribute(&session, "Q", attr::CHANNEL_AI_MAX)
                .unwrap(),
            0.5
        );
        assert!(registry
            .channel_attribute(&session, "X", attr::CHANNEL_AI_MAX)
            .is_err());
        assert!(registry.ai_voltage_ranges("Dev1").unwrap().contains(&(-10.0, 10.0)));
    }

    #[test]
    fn reset_aborts_running_sessions() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = configured(&registry, "t");
        registry.start(&session).unwrap();
        registry.reset_device("Dev1").unwrap();
        assert_eq!(registry.lifecycle(&session).unwrap(), Lifecycle::Aborted);
        assert_eq!(registry.driver().resets(), ["Dev1"]);
        assert!(registry.reset_device("Dev7").is_err());
    }

    #[test]
    fn drop_clears_driver_tasks() {
        let driver = Arc::new(SimDriver::new());
        {
            let registry = SessionRegistry::from_arc(Arc::clone(&driver));
            configured(&registry, "a");
            configured(&registry, "b");
            assert_eq!(driver.task_count(), 2);
        }
        assert_eq!(driver.task_count(), 0);
    }
}
