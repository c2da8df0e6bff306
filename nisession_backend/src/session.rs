//! Session references, lifecycle states and timing configuration.
//!
//! A [`Session`] is the only way callers address an acquisition: it is returned by
//! [`SessionRegistry::create`](crate::SessionRegistry::create) and carries both the
//! user-chosen name and a registry-unique id. A reference whose session has been cleared never
//! resolves again, even if a new session re-uses the name.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::AiVoltageChannel;
use crate::driver::{Edge, SampleMode, TaskHandle};
use crate::error::{DaqError, DaqResult, DriverWarning};
use crate::pipeline::{BlockSender, DeliveryConfig};

/// Opaque reference to a registered acquisition session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Session {
    id: u64,
    name: Arc<str>,
}

impl Session {
    pub(crate) fn new(id: u64, name: Arc<str>) -> Self {
        Self { id, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Local mirror of the vendor task lifecycle.
///
/// ```text
/// Created -> Configured -> Committed -> Running -> Stopped -> Cleared
///                                          |  ^         ^
///                                          v  |         |
///                                         Aborted ------+
/// ```
///
/// Channel and timing configuration are only accepted in `Created` and `Configured`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Created,
    Configured,
    Committed,
    Running,
    Stopped,
    Aborted,
    Cleared,
}

impl Lifecycle {
    pub fn is_running(self) -> bool {
        self == Lifecycle::Running
    }

    pub(crate) fn is_reconfigurable(self) -> bool {
        matches!(self, Lifecycle::Created | Lifecycle::Configured)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Created => "created",
            Lifecycle::Configured => "configured",
            Lifecycle::Committed => "committed",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Aborted => "aborted",
            Lifecycle::Cleared => "cleared",
        };
        f.write_str(name)
    }
}

/// Clock driving the acquisition.
#[derive(Clone, Debug, PartialEq)]
pub enum Clock {
    /// Sample clock at `rate` S/s; an empty `source` selects the onboard clock.
    SampleClock {
        source: String,
        rate: f64,
        active_edge: Edge,
    },
    /// Timing implied by the measurement itself, no sample clock.
    Implicit,
}

/// Timing configuration of a session. At most one is active per session; configuring again
/// replaces it.
#[derive(Clone, Debug, PartialEq)]
pub struct Timing {
    pub mode: SampleMode,
    /// Samples per channel to acquire in finite mode, buffer size hint in continuous mode.
    pub samples_per_channel: u64,
    pub clock: Clock,
}

impl Timing {
    pub fn sample_clock(rate: f64, mode: SampleMode, samples_per_channel: u64) -> Self {
        Self {
            mode,
            samples_per_channel,
            clock: Clock::SampleClock {
                source: String::new(),
                rate,
                active_edge: Edge::Rising,
            },
        }
    }

    pub fn implicit(mode: SampleMode, samples_per_channel: u64) -> Self {
        Self {
            mode,
            samples_per_channel,
            clock: Clock::Implicit,
        }
    }

    /// Sets the active clock edge. Has no effect on implicit timing.
    pub fn with_edge(mut self, edge: Edge) -> Self {
        if let Clock::SampleClock { active_edge, .. } = &mut self.clock {
            *active_edge = edge;
        }
        self
    }

    /// Sets the clock source terminal. Has no effect on implicit timing.
    pub fn with_source(mut self, terminal: &str) -> Self {
        if let Clock::SampleClock { source, .. } = &mut self.clock {
            *source = terminal.to_string();
        }
        self
    }

    pub fn rate(&self) -> Option<f64> {
        match self.clock {
            Clock::SampleClock { rate, .. } => Some(rate),
            Clock::Implicit => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.mode == SampleMode::Finite
    }

    pub(crate) fn validate(&self) -> DaqResult<()> {
        if let Some(rate) = self.rate() {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(DaqError::InvalidArgument(format!(
                    "sample clock rate must be positive, got {rate}"
                )));
            }
        }
        if self.mode != SampleMode::Continuous && self.samples_per_channel == 0 {
            return Err(DaqError::InvalidArgument(format!(
                "{:?} timing needs a non-zero sample count",
                self.mode
            )));
        }
        Ok(())
    }
}

/// A channel as recorded by the registry, with the virtual channel names it expanded to.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelRecord {
    pub config: AiVoltageChannel,
    pub virtual_names: Vec<String>,
}

pub(crate) struct DeliverySlot {
    pub generation: u64,
    pub config: DeliveryConfig,
    pub sender: BlockSender,
    pub faulted: bool,
}

/// Warnings kept per session; older ones are discarded first.
pub const WARNING_LOG_CAPACITY: usize = 64;

pub(crate) struct SessionState {
    pub lifecycle: Lifecycle,
    pub channels: Vec<ChannelRecord>,
    pub timing: Option<Timing>,
    pub input_buffer: Option<u32>,
    pub delivery: Option<DeliverySlot>,
    pub warnings: VecDeque<DriverWarning>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Created,
            channels: Vec::new(),
            timing: None,
            input_buffer: None,
            delivery: None,
            warnings: VecDeque::with_capacity(WARNING_LOG_CAPACITY),
        }
    }

    /// Number of virtual channels, i.e. rows of every sample block.
    pub fn channel_count(&self) -> usize {
        self.channels.iter().map(|c| c.virtual_names.len()).sum()
    }

    pub fn record(&mut self, warning: Option<DriverWarning>) -> Option<DriverWarning> {
        if let Some(w) = &warning {
            self.push_warning(w.clone());
        }
        warning
    }

    pub fn push_warning(&mut self, warning: DriverWarning) {
        if self.warnings.len() == WARNING_LOG_CAPACITY {
            self.warnings.pop_front();
        }
        self.warnings.push_back(warning);
    }
}

/// Registry entry. The driver handle is fixed for the lifetime of the cell; the mutex
/// serializes every operation and every delivery callback on the session.
pub(crate) struct SessionCell {
    pub id: u64,
    pub name: Arc<str>,
    pub handle: TaskHandle,
    pub state: Mutex<SessionState>,
    /// Held for the duration of a driver read issued by the registry.
    pub read_lock: Mutex<()>,
    /// Cleared before any driver call that may wait for an in-flight callback.
    pub delivery_enabled: AtomicBool,
}

impl SessionCell {
    pub fn new(id: u64, name: Arc<str>, handle: TaskHandle) -> Self {
        Self {
            id,
            name,
            handle,
            state: Mutex::new(SessionState::new()),
            read_lock: Mutex::new(()),
            delivery_enabled: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> Session {
        Session::new(self.id, Arc::clone(&self.name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timing_builders() {
        let timing = Timing::sample_clock(1024.0, SampleMode::Continuous, 128)
            .with_edge(Edge::Falling)
            .with_source("/Dev1/PFI0");
        assert_eq!(timing.rate(), Some(1024.0));
        assert_eq!(
            timing.clock,
            Clock::SampleClock {
                source: "/Dev1/PFI0".to_string(),
                rate: 1024.0,
                active_edge: Edge::Falling
            }
        );

        let implicit = Timing::implicit(SampleMode::Finite, 10).with_edge(Edge::Falling);
        assert_eq!(implicit.clock, Clock::Implicit);
        assert_eq!(implicit.rate(), None);
    }

    #[test]
    fn warning_log_keeps_the_most_recent() {
        let mut state = SessionState::new();
        for code in 0..WARNING_LOG_CAPACITY as i32 + 10 {
            state.record(Some(DriverWarning {
                code,
                message: String::new(),
            }));
        }
        assert_eq!(state.warnings.len(), WARNING_LOG_CAPACITY);
        assert_eq!(state.warnings.front().map(|w| w.code), Some(10));
        assert_eq!(
            state.warnings.back().map(|w| w.code),
            Some(WARNING_LOG_CAPACITY as i32 + 9)
        );
        assert_eq!(state.record(None), None);
        assert_eq!(state.warnings.len(), WARNING_LOG_CAPACITY);
    }

    #[test]
    fn timing_validation() {
        assert!(Timing::sample_clock(1024.0, SampleMode::Continuous, 0).validate().is_ok());
        assert!(Timing::sample_clock(0.0, SampleMode::Continuous, 128).validate().is_err());
        assert!(Timing::sample_clock(f64::NAN, SampleMode::Finite, 128).validate().is_err());
        assert!(Timing::sample_clock(100.0, SampleMode::Finite, 0).validate().is_err());
    }
}
