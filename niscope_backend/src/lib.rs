//! # niscope_backend
//!
//! Two-channel oscilloscope on top of [`nisession_backend`]: the NI-DAQmx driver binding
//! (`nidaqmx::NiDriver`, feature `hardware`), the [`Scope`] acquisition front with its TOML
//! [`ScopeConfig`], a fixed-period [`PollWorker`](poll::PollWorker) as an alternative to the
//! driver callback, and Python bindings (feature `python`).

pub mod config;
pub mod error;
pub mod info;
#[cfg(feature = "hardware")]
pub mod nidaqmx;
pub mod poll;
#[cfg(feature = "python")]
pub mod python;
pub mod scope;
pub mod worker_cmd_chan;

pub use crate::config::{ChannelConfig, DeliveryMode, ScopeConfig};
pub use crate::error::{ScopeError, ScopeResult};
pub use crate::scope::Scope;
