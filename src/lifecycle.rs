//! The lifecycle coordinator (spec §4.7): starts a heterogeneous group of
//! [`Listener`]s concurrently, cancels the whole group the moment any one
//! of them returns an error, and then stops each with its own bounded
//! timeout.
//!
//! Grounded on the teacher's `tower_server::Builder::bind().await?.serve(...)`
//! plus `with_graceful_shutdown(ctx.shutdown.clone())` pattern in
//! `src/lib.rs`'s `serve()`, generalized from "one HTTP server" to "N
//! listeners cancelled as a group" via `tokio::task::JoinSet`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::CoreError;

/// Anything the coordinator can run and later shut down gracefully.
///
/// `start`/`stop` take `self: Arc<Self>` rather than `&self` so that
/// implementations (e.g. [`crate::listener::TunnelListener`]) can hand out
/// `Arc<Self>` clones to the machinery they drive (tonic service structs,
/// spawned tasks) without the coordinator needing to know about that.
#[tonic::async_trait]
pub trait Listener: Send + Sync + 'static {
    /// A short, stable label used in logs and in aggregated error messages.
    fn name(&self) -> &str;

    /// Blocks until the listener ends on its own, `cancel` fires and the
    /// listener has wound down in response, or an unrecoverable error occurs.
    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), CoreError>;

    /// Bounded graceful shutdown; the coordinator also enforces its own
    /// overall timeout, so this may simply await internal cleanup.
    async fn stop(self: Arc<Self>) -> Result<(), CoreError>;
}

/// Run every listener in `listeners` until either all of them end cleanly
/// or one returns an error, in which case the rest are cancelled and each
/// is given `stop_timeout` to wind down before the error is reported.
///
/// `parent_cancel` lets the caller (e.g. a signal handler) trigger the same
/// shutdown path from outside.
pub async fn serve(
    listeners: Vec<Arc<dyn Listener>>,
    parent_cancel: CancellationToken,
    stop_timeout: Duration,
) -> Result<(), CoreError> {
    let group_cancel = parent_cancel.child_token();

    let mut starts = JoinSet::new();
    for listener in &listeners {
        let listener = listener.clone();
        let cancel = group_cancel.clone();
        starts.spawn(async move {
            let name = listener.name().to_string();
            let result = listener.start(cancel).await;
            (name, result)
        });
    }

    let mut first_error: Option<CoreError> = None;
    while let Some(joined) = starts.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(listener = name, "listener stopped cleanly"),
            Ok((name, Err(err))) => {
                error!(listener = name, %err, "listener failed, cancelling group");
                group_cancel.cancel();
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                warn!(%join_err, "listener task panicked");
                group_cancel.cancel();
                if first_error.is_none() {
                    first_error = Some(CoreError::Transient(join_err.to_string()));
                }
            }
        }
    }

    // `stop` is only reached once every `start` has returned, so it never
    // races a listener that hasn't begun yet.
    let mut stop_errors = Vec::new();
    for listener in &listeners {
        match tokio::time::timeout(stop_timeout, listener.clone().stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => stop_errors.push(format!("{}: {err}", listener.name())),
            Err(_) => stop_errors.push(format!("{}: stop timed out after {stop_timeout:?}", listener.name())),
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    if !stop_errors.is_empty() {
        return Err(CoreError::Transient(stop_errors.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct CleanListener {
        name: String,
        stopped: Arc<AtomicBool>,
    }

    #[tonic::async_trait]
    impl Listener for CleanListener {
        fn name(&self) -> &str {
            &self.name
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

    struct FailingListener {
        name: String,
    }

    #[tonic::async_trait]
    impl Listener for FailingListener {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(self: Arc<Self>, _cancel: CancellationToken) -> Result<(), CoreError> {
            Err(CoreError::Transient("synthetic failure".into()))
        }

        async fn stop(self: Arc<Self>) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_failure_cancels_the_group_and_stops_everyone() {
        let stopped = Arc::new(AtomicBool::new(false));
        let clean = Arc::new(CleanListener {
            name: "clean".into(),
            stopped: stopped.clone(),
        });
        let failing = Arc::new(FailingListener {
            name: "failing".into(),
        });

        let result = serve(
            vec![clean, failing],
            CancellationToken::new(),
            Duration::from_secs(1),
        )
        .await;

        assert!(result.is_err());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn parent_cancellation_shuts_everyone_down_cleanly() {
        let stopped = Arc::new(AtomicBool::new(false));
        let clean = Arc::new(CleanListener {
            name: "clean".into(),
            stopped: stopped.clone(),
        });
        let parent = CancellationToken::new();
        let parent_clone = parent.clone();

        let handle = tokio::spawn(async move {
            serve(vec![clean], parent_clone, Duration::from_secs(1)).await
        });

        parent.cancel();
        let result = handle.await.unwrap();

        assert!(result.is_ok());
        assert!(stopped.load(Ordering::SeqCst));
    }
}
