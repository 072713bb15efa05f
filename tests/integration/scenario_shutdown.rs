//! Scenario 6 from spec §8: three listeners, the second's `start` failing
//! 50 ms in. Expect the other two to observe cancellation and have `stop`
//! called within the configured budget, and the joined error to carry the
//! synthetic failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use otterscale::error::CoreError;
use otterscale::lifecycle::{serve, Listener};
use tokio_util::sync::CancellationToken;

struct PatientListener {
    name: &'static str,
    stopped: Arc<AtomicBool>,
}

#[tonic::async_trait]
impl Listener for PatientListener {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), CoreError> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn stop(self: Arc<Self>) -> Result<(), CoreError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct DelayedFailureListener {
    name: &'static str,
    delay: Duration,
}

#[tonic::async_trait]
impl Listener for DelayedFailureListener {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(self: Arc<Self>, _cancel: CancellationToken) -> Result<(), CoreError> {
        tokio::time::sleep(self.delay).await;
        Err(CoreError::Transient("synthetic failure".into()))
    }

    async fn stop(self: Arc<Self>) -> Result<(), CoreError> {
        Ok(())
    }
}

#[test_log::test(tokio::test)]
async fn a_mid_flight_failure_cancels_and_stops_the_whole_group() {
    let stopped_a = Arc::new(AtomicBool::new(false));
    let stopped_c = Arc::new(AtomicBool::new(false));

    let listener_a = Arc::new(PatientListener {
        name: "listener-a",
        stopped: stopped_a.clone(),
    });
    let listener_b = Arc::new(DelayedFailureListener {
        name: "listener-b",
        delay: Duration::from_millis(50),
    });
    let listener_c = Arc::new(PatientListener {
        name: "listener-c",
        stopped: stopped_c.clone(),
    });

    let result = serve(
        vec![listener_a, listener_b, listener_c],
        CancellationToken::new(),
        Duration::from_secs(1),
    )
    .await;

    let err = result.expect_err("one failing listener must fail the whole group");
    assert!(err.to_string().contains("synthetic failure"));
    assert!(stopped_a.load(Ordering::SeqCst));
    assert!(stopped_c.load(Ordering::SeqCst));
}
