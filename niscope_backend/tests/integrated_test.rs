use std::sync::Arc;
use std::time::Duration;

use nisession_backend::sim::{SimDriver, SimOp, ERROR_SAMPLES_NO_LONGER_AVAILABLE};
use nisession_backend::{DaqError, FillMode, Lifecycle, SessionRegistry};
use niscope_backend::{DeliveryMode, Scope, ScopeConfig};

fn registry() -> Arc<SessionRegistry<SimDriver>> {
    Arc::new(SessionRegistry::new(SimDriver::new()))
}

// The input buffer holds one block, so samples are produced a block at a time.
fn acquire_blocks(registry: &SessionRegistry<SimDriver>, blocks: usize, threshold: u64) {
    for _ in 0..blocks {
        registry.driver().advance_all(threshold);
    }
}

#[test]
fn stock_scope_delivers_iq_blocks() {
    let registry = registry();
    let mut scope = Scope::new(Arc::clone(&registry), ScopeConfig::default()).unwrap();
    assert_eq!(scope.lifecycle().unwrap(), Lifecycle::Configured);
    scope.start().unwrap();

    acquire_blocks(&registry, 3, 256);
    for expected in 0..3u64 {
        let block = scope.pop().unwrap().unwrap();
        assert_eq!(block.sequence(), expected);
        assert_eq!(block.shape(), (2, 256));
        // Default simulated waveform: channel * 1000 + sample index
        let first = (expected * 256) as f64;
        assert_eq!(block.channel(0)[0], first);
        assert_eq!(block.channel(1)[0], 1000.0 + first);
    }
    assert!(scope.pop().unwrap().is_none());

    scope.stop().unwrap();
    assert!(registry.sessions().is_empty());
    assert_eq!(registry.driver().task_count(), 0);
}

#[test]
fn display_takes_the_freshest_block() {
    let registry = registry();
    let mut scope = Scope::new(Arc::clone(&registry), ScopeConfig::default()).unwrap();
    scope.start().unwrap();

    acquire_blocks(&registry, 4, 256);
    let block = scope.latest().unwrap().unwrap();
    assert_eq!(block.sequence(), 3);
    assert!(scope.pop().unwrap().is_none());
    assert_eq!(scope.dropped(), 0);
}

#[test]
fn slow_consumer_loses_the_oldest_blocks() {
    let registry = registry();
    let config = ScopeConfig {
        queue_capacity: 2,
        ..ScopeConfig::default()
    };
    let mut scope = Scope::new(Arc::clone(&registry), config).unwrap();
    scope.start().unwrap();

    acquire_blocks(&registry, 5, 256);
    assert_eq!(scope.dropped(), 3);
    assert_eq!(scope.pop().unwrap().unwrap().sequence(), 3);
    assert_eq!(scope.pop().unwrap().unwrap().sequence(), 4);
}

#[test]
fn poll_delivery_matches_callback_shape() {
    let registry = registry();
    let config = ScopeConfig {
        threshold: 64,
        input_buffer: None,
        fill_mode: FillMode::GroupByScanNumber,
        delivery: DeliveryMode::Poll { poll_period_ms: 1 },
        ..ScopeConfig::default()
    };
    let mut scope = Scope::new(Arc::clone(&registry), config).unwrap();
    scope.start().unwrap();
    assert!(!registry.driver().has_callback(registry.task_handle(scope.session()).unwrap()));

    registry.driver().advance_all(64 * 2 + 10);
    let first = scope.pop_timeout(Duration::from_secs(5)).unwrap().unwrap();
    let second = scope.pop_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(first.shape(), (2, 64));
    assert_eq!((first.sequence(), second.sequence()), (0, 1));
    assert_eq!(second.channel(0)[0], 64.0);
    assert_eq!(second.channel(1)[63], 1000.0 + 127.0);

    scope.stop().unwrap();
    assert_eq!(registry.driver().task_count(), 0);
}

#[test]
fn overflow_ends_the_stream_after_queued_blocks() {
    let registry = registry();
    let mut scope = Scope::new(Arc::clone(&registry), ScopeConfig::default()).unwrap();
    scope.start().unwrap();

    acquire_blocks(&registry, 1, 256);
    registry
        .driver()
        .inject(SimOp::Read, ERROR_SAMPLES_NO_LONGER_AVAILABLE);
    acquire_blocks(&registry, 2, 256);

    assert_eq!(scope.pop().unwrap().unwrap().sequence(), 0);
    let err = scope.pop().unwrap_err();
    assert_eq!(err.driver_code(), Some(ERROR_SAMPLES_NO_LONGER_AVAILABLE));
    assert!(matches!(scope.latest(), Err(DaqError::Driver(_))));

    // Stopping a faulted scope still releases the task.
    scope.stop().unwrap();
    assert_eq!(registry.driver().task_count(), 0);
}

#[test]
fn config_file_drives_the_scope() {
    let path = std::env::temp_dir().join(format!("niscope_test_{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
        session = "probe"
        threshold = 32
        input_buffer = 64

        [[channels]]
        physical = "Dev1/ai2:4"
        name = "x"
        min = -1.0
        max = 1.0
        "#,
    )
    .unwrap();
    let config = ScopeConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let registry = registry();
    let mut scope = Scope::new(Arc::clone(&registry), config).unwrap();
    assert_eq!(scope.channel_names().unwrap(), ["x0", "x1", "x2"]);
    assert_eq!(registry.input_buffer(scope.session()).unwrap(), Some(64));
    scope.start().unwrap();

    acquire_blocks(&registry, 1, 32);
    let block = scope.pop().unwrap().unwrap();
    assert_eq!(block.shape(), (3, 32));
    assert_eq!(block.channel(2)[0], 2000.0);
}

#[test]
fn missing_config_file_is_an_io_error() {
    let err = ScopeConfig::load("/nonexistent/niscope.toml").unwrap_err();
    assert!(matches!(err, niscope_backend::ScopeError::Io(_)));
}
