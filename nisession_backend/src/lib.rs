//! # NI-DAQmx session backend
//!
//! Hardware-independent core of the acquisition stack: a registry that maps named sessions
//! to driver tasks and a pipeline that turns the driver's every-N-samples notifications into
//! fixed-shape sample blocks on a bounded queue.
//!
//! ## Crate layout
//!
//! - [`driver`]: the [`DriverClient`] trait every driver implementation provides, and the
//!   status-code translation ([`check_status`]).
//! - [`registry`]: [`SessionRegistry`], the only component that calls the driver.
//! - [`pipeline`]: delivery configuration, [`SampleBlock`] and the drop-oldest block queue.
//! - [`attributes`]: one typed accessor per driver attribute.
//! - [`channel`], [`session`]: configuration types and the session lifecycle.
//! - [`sim`]: [`SimDriver`](sim::SimDriver), an in-process driver used by tests and demos.
//!
//! The binding to the vendor library lives in the `niscope_backend` crate.
//!
//! ## Example
//!
//! ```
//! use nisession_backend::*;
//! use nisession_backend::sim::SimDriver;
//!
//! let registry = SessionRegistry::new(SimDriver::new());
//! let scope = registry.create("scope").unwrap();
//! registry.add_channel(&scope, AiVoltageChannel::new("Dev1/ai0:1", 0.0, 0.5).named("I, Q")).unwrap();
//! registry.configure_timing(&scope, Timing::sample_clock(1024.0, SampleMode::Continuous, 128)).unwrap();
//! let blocks = registry.register_delivery(&scope, DeliveryConfig::new(256)).unwrap();
//! registry.start(&scope).unwrap();
//!
//! registry.driver().advance_all(256);
//! let block = blocks.try_pop().unwrap().unwrap();
//! assert_eq!(block.shape(), (2, 256));
//! ```

pub mod attributes;
pub mod channel;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod sim;

pub use attributes::{attr, Attribute, AttributeValue};
pub use channel::{expand_physical_channels, AiVoltageChannel};
pub use driver::{
    check_status, DriverClient, Edge, FillMode, SampleMode, TaskAction, TaskHandle,
    TerminalConfig, Timeout, VoltageUnits,
};
pub use error::{DaqError, DaqResult, DriverError, DriverWarning};
pub use pipeline::{delivery_queue, BlockReceiver, BlockSender, DeliveryConfig, SampleBlock};
pub use registry::{ReadCount, ReadOutcome, ReadRequest, SessionRegistry};
pub use session::{ChannelRecord, Clock, Lifecycle, Session, Timing};
