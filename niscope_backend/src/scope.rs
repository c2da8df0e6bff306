//! # Two-channel oscilloscope
//!
//! [`Scope`] is the acquisition front of the crate: it turns a [`ScopeConfig`] into a
//! configured session on a [`SessionRegistry`] and exposes the delivered blocks to a display
//! loop. Typical use:
//!
//! 1. **Setup:** [`Scope::new`] creates the session, adds the channels, configures the sample
//!    clock and input buffer and installs block delivery (driver callback or
//!    [`PollWorker`], as the configuration says).
//! 2. **Acquisition:** [`Scope::start`] starts the task. The display side calls
//!    [`Scope::latest`] at its own pace, discarding whatever it did not get to show, or
//!    [`Scope::pop_timeout`] to consume every block in order.
//! 3. **Shutdown:** [`Scope::stop`] stops and clears the session. Dropping a scope that was
//!    not stopped clears it as well.
//!
//! ```
//! use std::sync::Arc;
//! use nisession_backend::{sim::SimDriver, SessionRegistry};
//! use niscope_backend::{Scope, ScopeConfig};
//!
//! let registry = Arc::new(SessionRegistry::new(SimDriver::new()));
//! let mut scope = Scope::new(Arc::clone(&registry), ScopeConfig::default()).unwrap();
//! scope.start().unwrap();
//! registry.driver().advance_all(256);
//! assert_eq!(scope.latest().unwrap().unwrap().shape(), (2, 256));
//! scope.stop().unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use nisession_backend::{
    delivery_queue, BlockReceiver, BlockSender, DaqResult, DriverClient, Lifecycle, SampleBlock,
    Session, SessionRegistry,
};

use crate::config::{DeliveryMode, ScopeConfig};
use crate::error::ScopeResult;
use crate::poll::PollWorker;

pub struct Scope<D: DriverClient + 'static> {
    registry: Arc<SessionRegistry<D>>,
    session: Session,
    config: ScopeConfig,
    blocks: BlockReceiver,
    // Producer half kept for the poll worker; `None` with callback delivery.
    poll_sender: Option<BlockSender>,
    worker: Option<PollWorker>,
    closed: bool,
}

impl<D: DriverClient + 'static> Scope<D> {
    /// Configures the session described by `config`. Nothing is acquired until
    /// [`start`](Self::start). If any step fails the half-configured session is cleared.
    pub fn new(registry: Arc<SessionRegistry<D>>, config: ScopeConfig) -> ScopeResult<Self> {
        config.validate()?;
        let session = registry.create(&config.session)?;
        match Self::configure(&registry, &session, &config) {
            Ok((blocks, poll_sender)) => {
                log::info!(
                    "scope `{}`: {} channel(s) at {} S/s, blocks of {}",
                    session,
                    registry.channel_count(&session).unwrap_or(0),
                    config.rate,
                    config.threshold
                );
                Ok(Self {
                    registry,
                    session,
                    config,
                    blocks,
                    poll_sender,
                    worker: None,
                    closed: false,
                })
            }
            Err(err) => {
                if let Err(clear_err) = registry.clear(&session) {
                    log::warn!("scope `{}`: clearing after failed setup: {}", session, clear_err);
                }
                Err(err)
            }
        }
    }

    fn configure(
        registry: &SessionRegistry<D>,
        session: &Session,
        config: &ScopeConfig,
    ) -> ScopeResult<(BlockReceiver, Option<BlockSender>)> {
        for channel in config.ai_channels() {
            registry.add_channel(session, channel)?;
        }
        registry.configure_timing(session, config.timing())?;
        if let Some(samples) = config.input_buffer {
            registry.configure_input_buffer(session, samples)?;
        }
        match config.delivery {
            DeliveryMode::Callback => {
                let blocks = registry.register_delivery(session, config.delivery_config())?;
                Ok((blocks, None))
            }
            DeliveryMode::Poll { .. } => {
                let delivery = config.delivery_config();
                delivery.validate()?;
                let (sender, blocks) = delivery_queue(delivery.capacity)?;
                Ok((blocks, Some(sender)))
            }
        }
    }

    pub fn start(&mut self) -> ScopeResult<()> {
        self.registry.start(&self.session)?;
        if let (Some(sender), DeliveryMode::Poll { poll_period_ms }) =
            (&self.poll_sender, self.config.delivery)
        {
            self.worker = Some(PollWorker::spawn(
                Arc::clone(&self.registry),
                self.session.clone(),
                self.config.delivery_config(),
                sender.clone(),
                Duration::from_millis(poll_period_ms),
            )?);
        }
        Ok(())
    }

    /// Stops the acquisition and releases the session. The scope cannot be restarted.
    pub fn stop(&mut self) -> ScopeResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let worker_result = match self.worker.take() {
            Some(mut worker) => worker.close(),
            None => Ok(()),
        };
        self.registry.clear(&self.session)?;
        log::info!(
            "scope `{}` stopped, {} block(s) dropped",
            self.session,
            self.blocks.dropped()
        );
        worker_result
    }

    /// Next block in acquisition order, if one is queued.
    pub fn pop(&self) -> DaqResult<Option<SampleBlock>> {
        self.blocks.try_pop()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> DaqResult<Option<SampleBlock>> {
        self.blocks.pop_timeout(timeout)
    }

    /// Freshest block; older queued blocks are discarded.
    pub fn latest(&self) -> DaqResult<Option<SampleBlock>> {
        self.blocks.latest()
    }

    pub fn receiver(&self) -> &BlockReceiver {
        &self.blocks
    }

    pub fn dropped(&self) -> u64 {
        self.blocks.dropped()
    }

    pub fn lifecycle(&self) -> DaqResult<Lifecycle> {
        self.registry.lifecycle(&self.session)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<D>> {
        &self.registry
    }

    /// Virtual channel names, in block row order.
    pub fn channel_names(&self) -> DaqResult<Vec<String>> {
        Ok(self
            .registry
            .channels(&self.session)?
            .into_iter()
            .flat_map(|record| record.virtual_names)
            .collect())
    }
}

impl<D: DriverClient + 'static> Drop for Scope<D> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("scope `{}`: shutdown failed: {}", self.session, err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ChannelConfig;
    use nisession_backend::sim::SimDriver;
    use nisession_backend::DaqError;

    #[test]
    fn failed_setup_leaves_no_session() {
        let registry = Arc::new(SessionRegistry::new(SimDriver::new()));
        let mut config = ScopeConfig::default();
        config.channels.push(ChannelConfig {
            physical: "Dev1/ai99".to_string(),
            name: String::new(),
            min: 0.0,
            max: 0.5,
            terminal: Default::default(),
        });

        assert!(Scope::new(Arc::clone(&registry), config).is_err());
        assert!(registry.sessions().is_empty());
        assert_eq!(registry.driver().task_count(), 0);
    }

    #[test]
    fn second_scope_with_the_same_name_is_rejected() {
        let registry = Arc::new(SessionRegistry::new(SimDriver::new()));
        let _first = Scope::new(Arc::clone(&registry), ScopeConfig::default()).unwrap();
        let second = Scope::new(Arc::clone(&registry), ScopeConfig::default());
        assert!(matches!(
            second,
            Err(crate::error::ScopeError::Daq(DaqError::DuplicateSession(_)))
        ));
        assert_eq!(registry.sessions().len(), 1);
    }

    #[test]
    fn drop_clears_the_session() {
        let registry = Arc::new(SessionRegistry::new(SimDriver::new()));
        let mut scope = Scope::new(Arc::clone(&registry), ScopeConfig::default()).unwrap();
        scope.start().unwrap();
        assert_eq!(scope.channel_names().unwrap(), ["I", "Q"]);
        drop(scope);
        assert!(registry.find("scope").is_none());
        assert_eq!(registry.driver().task_count(), 0);
    }
}
