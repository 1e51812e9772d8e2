//! The process-wide worker pool

mod common;

use common::{setup_tracing, WAIT};
use miniss_bridge::{global_pool, init_pool, run_blocking, BridgeError, OwnerLoop};

#[test]
fn test_global_pool_initializes_once() {
    setup_tracing();
    init_pool(Some(2)).unwrap();

    let pool = global_pool().unwrap();
    assert_eq!(pool.thread_count(), 2);
    assert!(matches!(init_pool(Some(4)), Err(BridgeError::Spawn(_))));
    assert_eq!(global_pool().unwrap().thread_count(), 2);

    let owner = OwnerLoop::new();
    let promise = run_blocking(&owner.handle(), pool, || "from the global pool").unwrap();
    assert_eq!(owner.block_on_timeout(promise, WAIT).unwrap(), Ok("from the global pool"));
}
