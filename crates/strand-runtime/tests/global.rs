//! The process-wide runtime handle: exactly one initialization per process

use strand_config::RuntimeConfig;
use strand_runtime::{global, init_global, RuntimeError};

#[test]
fn global_runtime_initializes_once() {
    assert!(global().is_none());

    let config = RuntimeConfig {
        num_pes: 1,
        ..Default::default()
    };
    let rt = init_global(config.clone()).unwrap();
    assert!(global().is_some());

    // Re-initialization within a process is an error
    let err = match init_global(config) {
        Err(err) => err,
        Ok(_) => panic!("second initialization accepted"),
    };
    assert!(matches!(err, RuntimeError::AlreadyInitialized));

    rt.shutdown().unwrap();
}
