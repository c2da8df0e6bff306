//! Fixed-period block delivery for drivers or setups where the every-N-samples callback is
//! not wanted.
//!
//! A [`PollWorker`] thread wakes every `period`, reads as many complete blocks as the driver
//! has buffered and pushes them onto the same kind of drop-oldest queue the callback delivery
//! uses, so consumers cannot tell the two apart. The thread is driven through a [`CmdChan`]:
//! [`WorkerCmd::Poll`] suspends or resumes polling and [`WorkerCmd::Close`] ends it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nisession_backend::{
    BlockSender, DaqError, DaqResult, DeliveryConfig, DriverClient, Lifecycle, ReadRequest, Session,
    SessionRegistry,
};

use crate::error::{ScopeError, ScopeResult};
use crate::worker_cmd_chan::{CmdChan, CmdRecvr, WorkerCmd};

pub struct PollWorker {
    cmd_chan: CmdChan,
    handle: Option<JoinHandle<()>>,
}

impl PollWorker {
    /// Starts polling `session` into `sender`. Reads use the threshold, fill mode and timeout
    /// of `config`.
    pub fn spawn<D: DriverClient + 'static>(
        registry: Arc<SessionRegistry<D>>,
        session: Session,
        config: DeliveryConfig,
        sender: BlockSender,
        period: Duration,
    ) -> ScopeResult<Self> {
        if period.is_zero() {
            return Err(ScopeError::Worker("poll period must be positive".to_string()));
        }
        config.validate()?;
        let cmd_chan = CmdChan::new();
        let recvr = cmd_chan.new_recvr();
        let handle = std::thread::Builder::new()
            .name(format!("poll-{}", session.name()))
            .spawn(move || poll_loop(&registry, &session, &config, &sender, recvr, period))
            .map_err(|e| ScopeError::Worker(e.to_string()))?;
        Ok(Self {
            cmd_chan,
            handle: Some(handle),
        })
    }

    pub fn pause(&self) {
        self.cmd_chan.send(WorkerCmd::Poll(false));
    }

    pub fn resume(&self) {
        self.cmd_chan.send(WorkerCmd::Poll(true));
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ends the worker and waits for its thread.
    pub fn close(&mut self) -> ScopeResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.cmd_chan.send(WorkerCmd::Close);
        handle
            .join()
            .map_err(|_| ScopeError::Worker("poll thread panicked".to_string()))
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("{}", err);
        }
    }
}

fn poll_loop<D: DriverClient + 'static>(
    registry: &SessionRegistry<D>,
    session: &Session,
    config: &DeliveryConfig,
    sender: &BlockSender,
    mut recvr: CmdRecvr,
    period: Duration,
) {
    log::debug!("poll worker for `{}` started, period {:?}", session, period);
    let mut polling = true;
    loop {
        match recvr.recv_timeout(period) {
            Ok(None) => {}
            Ok(Some(WorkerCmd::Poll(on))) => {
                polling = on;
                continue;
            }
            Ok(Some(WorkerCmd::Close)) => break,
            Err(msg) => {
                log::warn!("poll worker for `{}`: {}; closing", session, msg);
                sender.fail(DaqError::Delivery(msg));
                break;
            }
        }
        if !polling {
            continue;
        }
        if let Err(err) = poll_once(registry, session, config, sender) {
            sender.fail(err);
            break;
        }
    }
    log::debug!("poll worker for `{}` stopped", session);
}

/// Moves every complete block the driver holds onto the queue. Returns the number of blocks
/// pushed.
pub fn poll_once<D: DriverClient + 'static>(
    registry: &SessionRegistry<D>,
    session: &Session,
    config: &DeliveryConfig,
    sender: &BlockSender,
) -> DaqResult<usize> {
    if registry.lifecycle(session)? != Lifecycle::Running {
        return Ok(0);
    }
    let request = ReadRequest::new(config.threshold)
        .with_timeout(config.read_timeout)
        .with_fill_mode(config.fill_mode);
    let mut pushed = 0;
    while registry.available_samples(session)? >= config.threshold {
        let outcome = registry.read(session, &request)?;
        if let Some(warning) = &outcome.warning {
            sender.record_warning(warning);
        }
        if outcome.samples_per_channel != config.threshold as usize {
            log::debug!(
                "session `{}`: short read of {} samples, block skipped",
                session,
                outcome.samples_per_channel
            );
            break;
        }
        sender.push_raw(
            outcome.data,
            outcome.channels,
            outcome.samples_per_channel,
            outcome.fill_mode,
        )?;
        pushed += 1;
    }
    Ok(pushed)
}

#[cfg(test)]
mod test {
    use super::*;
    use nisession_backend::sim::SimDriver;
    use nisession_backend::{delivery_queue, AiVoltageChannel, SampleMode, Timing};

    fn running(registry: &SessionRegistry<SimDriver>) -> Session {
        let session = registry.create("poll").unwrap();
        registry
            .add_channel(&session, AiVoltageChannel::new("Dev1/ai0:2", -1.0, 1.0))
            .unwrap();
        registry
            .configure_timing(&session, Timing::sample_clock(1000.0, SampleMode::Continuous, 100))
            .unwrap();
        registry.start(&session).unwrap();
        session
    }

    #[test]
    fn poll_once_reads_complete_blocks_only() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = running(&registry);
        let (sender, blocks) = delivery_queue(4).unwrap();
        let config = DeliveryConfig::new(10);

        registry.driver().advance_all(25);
        assert_eq!(poll_once(&registry, &session, &config, &sender).unwrap(), 2);
        assert_eq!(registry.available_samples(&session).unwrap(), 5);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks.try_pop().unwrap().unwrap().shape(), (3, 10));
    }

    #[test]
    fn poll_once_skips_sessions_that_are_not_running() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = running(&registry);
        let (sender, blocks) = delivery_queue(4).unwrap();
        registry.driver().advance_all(20);
        registry.stop(&session).unwrap();

        assert_eq!(poll_once(&registry, &session, &DeliveryConfig::new(10), &sender).unwrap(), 0);
        assert!(blocks.is_empty());
    }

    #[test]
    fn worker_fails_the_queue_when_the_session_disappears() {
        let registry = Arc::new(SessionRegistry::new(SimDriver::new()));
        let session = running(&registry);
        let (sender, blocks) = delivery_queue(4).unwrap();
        let mut worker = PollWorker::spawn(
            Arc::clone(&registry),
            session.clone(),
            DeliveryConfig::new(10),
            sender,
            Duration::from_millis(1),
        )
        .unwrap();

        registry.clear(&session).unwrap();
        let err = blocks.pop_timeout(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, DaqError::UnknownSession(_)));
        assert!(worker.close().is_ok());
    }

    #[test]
    fn missed_command_fails_the_queue() {
        let registry = SessionRegistry::new(SimDriver::new());
        let session = running(&registry);
        let (sender, blocks) = delivery_queue(4).unwrap();
        let cmd_chan = CmdChan::new();
        let recvr = cmd_chan.new_recvr();
        cmd_chan.send(WorkerCmd::Poll(false));
        cmd_chan.send(WorkerCmd::Poll(true));

        // Returns at once: the receiver has fallen two commands behind
        poll_loop(
            &registry,
            &session,
            &DeliveryConfig::new(10),
            &sender,
            recvr,
            Duration::from_millis(1),
        );
        assert!(blocks.is_terminated());
        assert!(matches!(blocks.try_pop(), Err(DaqError::Delivery(_))));
    }

    #[test]
    fn paused_worker_leaves_samples_in_the_buffer() {
        let registry = Arc::new(SessionRegistry::new(SimDriver::new()));
        let session = running(&registry);
        let (sender, blocks) = delivery_queue(4).unwrap();
        let mut worker = PollWorker::spawn(
            Arc::clone(&registry),
            session.clone(),
            DeliveryConfig::new(10),
            sender,
            Duration::from_millis(1),
        )
        .unwrap();

        worker.pause();
        std::thread::sleep(Duration::from_millis(20));
        registry.driver().advance_all(10);
        std::thread::sleep(Duration::from_millis(20));
        assert!(blocks.is_empty());

        worker.resume();
        let block = blocks.pop_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(block.shape(), (3, 10));
        worker.close().unwrap();
        assert!(worker.is_finished());
    }
}
