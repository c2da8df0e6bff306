//! Sample delivery pipeline.
//!
//! ## Overview
//!
//! Once a session has channels and timing, [`SessionRegistry::register_delivery`] installs an
//! every-N-samples callback with the driver. Each time `threshold` new samples per channel are
//! acquired, the callback (on the driver's thread) reads exactly that many, reshapes the flat
//! buffer into a `(channels, threshold)` [`SampleBlock`] and pushes it onto a bounded queue.
//! The consumer side of the queue is the [`BlockReceiver`] returned by the registration.
//!
//! The queue keeps the most recent `capacity` blocks: pushing onto a full queue discards the
//! oldest block and counts it in [`BlockReceiver::dropped`]. Order is never changed.
//!
//! ## Faults
//!
//! A timed-out or short read produces no block; the acquisition carries on. A negative read
//! status ends delivery: the registration is marked faulted and the error is stored on the
//! queue. Blocks queued before the fault are still handed out in order; once they are drained
//! every pop returns the stored error.
//!
//! [`SessionRegistry::register_delivery`]: crate::SessionRegistry::register_delivery

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use ndarray::{Array2, ArrayView1, Axis};
use parking_lot::{Condvar, Mutex};

use crate::driver::{
    check_status, DriverClient, EveryNSamplesCallback, FillMode, Timeout,
    ERROR_SAMPLES_NOT_YET_AVAILABLE,
};
use crate::error::{DaqError, DaqResult, DriverWarning};
use crate::session::SessionCell;

/// Parameters of a delivery registration.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryConfig {
    /// Samples per channel per block; also the callback period of the driver.
    pub threshold: u32,
    pub fill_mode: FillMode,
    /// Number of blocks the queue retains before dropping the oldest.
    pub capacity: usize,
    /// Timeout of each read issued from the callback.
    pub read_timeout: Timeout,
}

impl DeliveryConfig {
    pub const DEFAULT_CAPACITY: usize = 16;

    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            fill_mode: FillMode::GroupByChannel,
            capacity: Self::DEFAULT_CAPACITY,
            read_timeout: Timeout::Seconds(1.0),
        }
    }

    pub fn with_fill_mode(mut self, fill_mode: FillMode) -> Self {
        self.fill_mode = fill_mode;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Timeout) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn validate(&self) -> DaqResult<()> {
        if self.threshold == 0 || self.threshold > i32::MAX as u32 {
            return Err(DaqError::InvalidArgument(format!(
                "delivery threshold {} out of range",
                self.threshold
            )));
        }
        if self.capacity == 0 {
            return Err(DaqError::InvalidArgument(
                "delivery queue capacity must be at least 1".to_string(),
            ));
        }
        self.read_timeout.validate().map_err(DaqError::InvalidArgument)
    }
}

/// One delivered block: `(channels, samples_per_channel)` samples in channel order.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBlock {
    sequence: u64,
    data: Array2<f64>,
}

impl SampleBlock {
    /// Position of the block in the delivery stream, starting at 0. Gaps mean dropped blocks.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn into_data(self) -> Array2<f64> {
        self.data
    }

    pub fn channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.data.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Samples of one channel. Panics if `index` is not a channel of the block.
    pub fn channel(&self, index: usize) -> ArrayView1<'_, f64> {
        self.data.index_axis(Axis(0), index)
    }
}

/// Arranges a flat driver buffer as a `(channels, samples)` matrix.
///
/// `fill` is the layout the buffer was read with; the result is always channel-major, so a
/// scan-major buffer comes back transposed relative to its raw order.
pub fn reshape(
    raw: Vec<f64>,
    channels: usize,
    samples: usize,
    fill: FillMode,
) -> DaqResult<Array2<f64>> {
    if raw.len() != channels * samples {
        return Err(DaqError::InvalidArgument(format!(
            "{} values do not fill a ({}, {}) block",
            raw.len(),
            channels,
            samples
        )));
    }
    let shape_error = |e: ndarray::ShapeError| DaqError::InvalidArgument(e.to_string());
    match fill {
        FillMode::GroupByChannel => Array2::from_shape_vec((channels, samples), raw).map_err(shape_error),
        FillMode::GroupByScanNumber => Ok(Array2::from_shape_vec((samples, channels), raw)
            .map_err(shape_error)?
            .reversed_axes()
            .as_standard_layout()
            .into_owned()),
    }
}

struct Shared {
    blocks: ArrayQueue<SampleBlock>,
    next_sequence: AtomicU64,
    dropped: AtomicU64,
    warnings: AtomicU64,
    terminated: AtomicBool,
    terminal: Mutex<Option<DaqError>>,
    ready: Condvar,
}

/// Creates a bounded drop-oldest block queue.
pub fn delivery_queue(capacity: usize) -> DaqResult<(BlockSender, BlockReceiver)> {
    if capacity == 0 {
        return Err(DaqError::InvalidArgument(
            "delivery queue capacity must be at least 1".to_string(),
        ));
    }
    let shared = Arc::new(Shared {
        blocks: ArrayQueue::new(capacity),
        next_sequence: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        warnings: AtomicU64::new(0),
        terminated: AtomicBool::new(false),
        terminal: Mutex::new(None),
        ready: Condvar::new(),
    });
    Ok((
        BlockSender {
            shared: Arc::clone(&shared),
        },
        BlockReceiver { shared },
    ))
}

/// Producer half of a delivery queue.
#[derive(Clone)]
pub struct BlockSender {
    shared: Arc<Shared>,
}

impl BlockSender {
    /// Queues a block, discarding the oldest one if the queue is full. Returns the sequence
    /// number assigned to the block.
    pub fn push(&self, data: Array2<f64>) -> u64 {
        let sequence = self.shared.next_sequence.fetch_add(1, Ordering::Relaxed);
        let block = SampleBlock { sequence, data };
        if let Some(old) = self.shared.blocks.force_push(block) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("delivery queue full, dropped block {}", old.sequence);
        }
        log::trace!("queued block {}", sequence);
        // Taking the lock orders the push before any waiter's emptiness check.
        let _guard = self.shared.terminal.lock();
        self.shared.ready.notify_all();
        sequence
    }

    /// Reshapes a flat driver buffer (see [`reshape`]) and queues it.
    pub fn push_raw(
        &self,
        raw: Vec<f64>,
        channels: usize,
        samples: usize,
        fill: FillMode,
    ) -> DaqResult<u64> {
        let data = reshape(raw, channels, samples, fill)?;
        Ok(self.push(data))
    }

    pub fn record_warning(&self, warning: &DriverWarning) {
        self.shared.warnings.fetch_add(1, Ordering::Relaxed);
        log::debug!("delivery continues after {}", warning);
    }

    /// Ends the stream with `error`. Only the first error is kept.
    pub fn fail(&self, error: DaqError) {
        let mut terminal = self.shared.terminal.lock();
        if terminal.is_none() {
            log::error!("delivery stopped: {}", error);
            *terminal = Some(error);
            self.shared.terminated.store(true, Ordering::Release);
        }
        self.shared.ready.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }
}

/// Consumer half of a delivery queue.
///
/// Pops return `Ok(Some(block))` for a queued block, `Ok(None)` when nothing is queued yet and
/// `Err` once the stream has failed and every block queued before the failure was taken.
#[derive(Clone)]
pub struct BlockReceiver {
    shared: Arc<Shared>,
}

impl BlockReceiver {
    fn terminal_or_none(&self) -> DaqResult<Option<SampleBlock>> {
        match &*self.shared.terminal.lock() {
            Some(err) => Err(err.clone()),
            None => Ok(None),
        }
    }

    pub fn try_pop(&self) -> DaqResult<Option<SampleBlock>> {
        match self.shared.blocks.pop() {
            Some(block) => Ok(Some(block)),
            None => self.terminal_or_none(),
        }
    }

    /// Waits up to `timeout` for a block.
    pub fn pop_timeout(&self, timeout: Duration) -> DaqResult<Option<SampleBlock>> {
        let deadline = Instant::now() + timeout;
        let mut terminal = self.shared.terminal.lock();
        loop {
            if let Some(block) = self.shared.blocks.pop() {
                return Ok(Some(block));
            }
            if let Some(err) = &*terminal {
                return Err(err.clone());
            }
            if self.shared.ready.wait_until(&mut terminal, deadline).timed_out() {
                return Ok(self.shared.blocks.pop());
            }
        }
    }

    /// Takes the freshest block, discarding every older one still queued.
    pub fn latest(&self) -> DaqResult<Option<SampleBlock>> {
        let mut latest = None;
        while let Some(block) = self.shared.blocks.pop() {
            latest = Some(block);
        }
        match latest {
            Some(block) => Ok(Some(block)),
            None => self.terminal_or_none(),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.blocks.capacity()
    }

    /// Blocks discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Driver warnings (including read timeouts) seen by the producer.
    pub fn warnings(&self) -> u64 {
        self.shared.warnings.load(Ordering::Relaxed)
    }

    /// Whether the producer has failed. Queued blocks may still be pending.
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    pub fn terminal_error(&self) -> Option<DaqError> {
        self.shared.terminal.lock().clone()
    }
}

// Interval at which a waiting callback re-checks whether delivery was disabled.
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Builds the closure handed to the driver for one registration.
///
/// The closure only holds weak references: a session cleared (or a registry dropped) while the
/// driver still fires turns every notification into a no-op.
pub(crate) fn every_n_samples_callback<D: DriverClient + 'static>(
    driver: Weak<D>,
    cell: Weak<SessionCell>,
    generation: u64,
) -> EveryNSamplesCallback {
    Arc::new(move |n_samples: u32| {
        if let (Some(driver), Some(cell)) = (driver.upgrade(), cell.upgrade()) {
            on_every_n_samples(&*driver, &cell, generation, n_samples);
        }
        0
    })
}

/// Body of the every-N-samples callback.
pub(crate) fn on_every_n_samples<D: DriverClient + ?Sized>(
    driver: &D,
    cell: &SessionCell,
    generation: u64,
    n_samples: u32,
) {
    // A stop or clear holding the session lock may be waiting inside the driver for this very
    // callback to return, so never block on the lock unconditionally.
    let mut guard = loop {
        if !cell.delivery_enabled.load(Ordering::Acquire) {
            return;
        }
        if let Some(guard) = cell.state.try_lock_for(LOCK_POLL) {
            break guard;
        }
    };
    if !cell.delivery_enabled.load(Ordering::Acquire) || !guard.lifecycle.is_running() {
        return;
    }

    let state = &mut *guard;
    let channels = state.channel_count();
    let Some(slot) = state
        .delivery
        .as_mut()
        .filter(|slot| slot.generation == generation && !slot.faulted)
    else {
        return;
    };
    let threshold = slot.config.threshold;
    if n_samples != threshold {
        log::debug!(
            "session `{}`: notified for {} samples, reading {}",
            cell.name,
            n_samples,
            threshold
        );
    }

    let mut buffer = vec![0.0; channels * threshold as usize];
    let mut read = 0;
    let status = driver.read_analog_f64(
        cell.handle,
        threshold as i32,
        slot.config.read_timeout.as_driver(),
        slot.config.fill_mode,
        &mut buffer,
        &mut read,
    );
    let outcome = if status == ERROR_SAMPLES_NOT_YET_AVAILABLE {
        let warning = DriverWarning {
            code: status,
            message: driver.error_string(status),
        };
        log::warn!("session `{}`: delivery read timed out: {}", cell.name, warning);
        Ok(Some(warning))
    } else {
        check_status(driver, status)
    };

    match outcome {
        Ok(warning) => {
            if let Some(warning) = warning {
                slot.sender.record_warning(&warning);
                state.push_warning(warning);
            }
        }
        Err(err) => {
            slot.faulted = true;
            cell.delivery_enabled.store(false, Ordering::Release);
            slot.sender.fail(err.into());
            return;
        }
    }

    // Re-borrow the slot: pushing a warning above needed `state` mutably. The lock is still
    // held, so this is the same registration checked at the top.
    let Some(slot) = state.delivery.as_mut() else {
        return;
    };

    if read != threshold as i32 {
        log::debug!(
            "session `{}`: partial read of {}/{} samples not queued",
            cell.name,
            read,
            threshold
        );
        return;
    }
    if let Err(err) = slot
        .sender
        .push_raw(buffer, channels, threshold as usize, slot.config.fill_mode)
    {
        slot.faulted = true;
        cell.delivery_enabled.store(false, Ordering::Release);
        slot.sender.fail(err);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn reshape_orientations() {
        let raw: Vec<f64> = (0..6).map(f64::from).collect();

        let by_channel = reshape(raw.clone(), 2, 3, FillMode::GroupByChannel).unwrap();
        assert_eq!(by_channel, array![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]]);

        let by_scan = reshape(raw, 2, 3, FillMode::GroupByScanNumber).unwrap();
        assert_eq!(by_scan, array![[0.0, 2.0, 4.0], [1.0, 3.0, 5.0]]);
        assert!(by_scan.is_standard_layout());
    }

    #[test]
    fn reshape_rejects_wrong_length() {
        assert!(reshape(vec![0.0; 5], 2, 3, FillMode::GroupByChannel).is_err());
    }

    #[test]
    fn drop_oldest_keeps_order() {
        let capacity = 4;
        let (tx, rx) = delivery_queue(capacity).unwrap();
        for i in 0..=capacity {
            tx.push(Array2::from_elem((1, 2), i as f64));
        }
        assert_eq!(rx.len(), capacity);
        assert_eq!(rx.dropped(), 1);

        let sequences: Vec<u64> = std::iter::from_fn(|| rx.try_pop().unwrap())
            .map(|b| b.sequence())
            .collect();
        assert_eq!(sequences, [1, 2, 3, 4]);
    }

    #[test]
    fn latest_discards_older_blocks() {
        let (tx, rx) = delivery_queue(8).unwrap();
        for i in 0..3 {
            tx.push(Array2::from_elem((2, 2), i as f64));
        }
        let block = rx.latest().unwrap().unwrap();
        assert_eq!(block.sequence(), 2);
        assert_eq!(block.data()[[1, 1]], 2.0);
        assert!(rx.is_empty());
        assert_eq!(rx.latest().unwrap(), None);
    }

    #[test]
    fn terminal_error_after_queued_blocks() {
        let (tx, rx) = delivery_queue(4).unwrap();
        tx.push(Array2::zeros((1, 1)));
        tx.fail(DaqError::InvalidArgument("first".to_string()));
        tx.fail(DaqError::InvalidArgument("second".to_string()));
        assert!(rx.is_terminated());

        assert_eq!(rx.try_pop().unwrap().map(|b| b.sequence()), Some(0));
        assert_eq!(
            rx.try_pop().unwrap_err(),
            DaqError::InvalidArgument("first".to_string())
        );
        assert!(rx.pop_timeout(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let (tx, rx) = delivery_queue(2).unwrap();
        assert_eq!(rx.pop_timeout(Duration::from_millis(5)).unwrap(), None);

        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.push(Array2::zeros((2, 4)))
        });
        let block = rx.pop_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(block.shape(), (2, 4));
        assert_eq!(producer.join().unwrap(), block.sequence());
    }

    #[test]
    fn config_validation() {
        assert!(DeliveryConfig::new(256).validate().is_ok());
        assert!(DeliveryConfig::new(0).validate().is_err());
        assert!(DeliveryConfig::new(256).with_capacity(0).validate().is_err());
        assert!(DeliveryConfig::new(256)
            .with_read_timeout(Timeout::Seconds(-1.0))
            .validate()
            .is_err());
        assert!(delivery_queue(0).is_err());
    }
}
