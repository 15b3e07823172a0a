pub mod client;
pub mod server;

use std::time::Duration;

/// How long a flow waits for an expected frame or status.
pub const WAIT: Duration = Duration::from_secs(3);

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                "callbridge_server=debug,callbridge_daemon=debug,callbridge_call=debug",
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
