#![allow(dead_code)]

use miniss_bridge::OwnerLoop;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Generous upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(10);

/// Sets up the tracing subscriber for tests, ensuring it's only initialized once.
pub fn setup_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Run the owner loop for `duration` without any exit condition
pub fn run_for(owner: &OwnerLoop, duration: Duration) {
    owner.run_until(|| false, duration);
}
