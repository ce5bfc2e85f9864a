//! Per-source workers, the runtime that owns them, and graceful
//! shutdown.
//!
//! One independent periodic task runs per source. Each iteration executes
//! a tick, fans the records out to the source's shippers, then waits for
//! the scrape interval or the shared stop signal — whichever comes first.
//! Workers never coordinate with each other; a failing source does not
//! stop the others' schedules. A fatal shipping error (bad token,
//! malformed payload) cancels the whole runtime.

use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::Source;
use crate::shipper::LogzioShipper;

/// Runtime that manages worker task lifecycles.
///
/// The runtime owns a `CancellationToken` shared by all spawned tasks
/// and collects their `JoinHandle`s for graceful shutdown.
pub struct Runtime {
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Runtime {
    /// Create a new runtime with a fresh cancellation token.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Return a clone of the cancellation token for passing to tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a worker task with a descriptive name.
    ///
    /// The task's `JoinHandle` is tracked for shutdown. The task should
    /// observe the cancellation token to exit gracefully.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::info!(task = %name, "spawning worker");
        let handle = tokio::spawn(future);
        self.handles.push((name, handle));
    }

    /// Return the number of spawned tasks.
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Await all workers without cancelling them.
    ///
    /// Used by test mode, where every worker exits on its own after one
    /// tick.
    pub async fn join_all(&mut self) {
        for (name, handle) in self.handles.drain(..) {
            match handle.await {
                Ok(()) => tracing::info!(task = %name, "task completed"),
                Err(e) => tracing::warn!(task = %name, error = %e, "task panicked"),
            }
        }
    }

    /// Initiate graceful shutdown.
    ///
    /// Cancels the token, then awaits all handles with a 30-second
    /// timeout; workers drain their current tick before exiting.
    pub async fn shutdown(&mut self) {
        tracing::info!("initiating graceful shutdown");
        self.cancel.cancel();

        let handles: Vec<_> = self.handles.drain(..).collect();
        let drain = async {
            for (name, handle) in handles {
                match handle.await {
                    Ok(()) => tracing::info!(task = %name, "task completed cleanly"),
                    Err(e) => {
                        tracing::warn!(task = %name, error = %e, "task panicked during shutdown");
                    }
                }
            }
        };

        if tokio::time::timeout(Duration::from_secs(30), drain)
            .await
            .is_err()
        {
            tracing::warn!("shutdown timeout exceeded (30s), some tasks may still be running");
        } else {
            tracing::info!("graceful shutdown complete");
        }
    }

    /// Block until a shutdown signal is received, then gracefully stop
    /// all tasks.
    pub async fn run_until_shutdown(mut self) {
        wait_for_shutdown_signal(&self.cancel).await;
        self.shutdown().await;
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for an OS shutdown signal (Ctrl+C or SIGTERM) or for the runtime
/// to be cancelled from within (fatal shipping error).
pub async fn wait_for_shutdown_signal(cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to register SIGTERM handler, using Ctrl+C only"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "Ctrl+C handler error");
                        } else {
                            tracing::info!("received Ctrl+C");
                        }
                    }
                }
                return;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("runtime cancelled internally");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Ctrl+C handler error");
                }
                tracing::info!("received Ctrl+C");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("runtime cancelled internally");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for Ctrl+C");
                } else {
                    tracing::info!("received Ctrl+C");
                }
            }
        }
    }
}

/// Run one source's periodic worker until cancellation.
///
/// With `run_once` set (test mode) the worker exits after a single tick.
pub async fn run_source_worker(
    mut source: Source,
    mut shippers: Vec<LogzioShipper>,
    cancel: CancellationToken,
    run_once: bool,
) {
    let interval = source.fetcher.scrape_interval();
    let name = source.name().to_string();
    tracing::info!(source = %name, interval_secs = interval.as_secs(), "worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        tracing::info!(source = %name, "starting collection task");
        match source.run_tick().await {
            Ok(records) if !records.is_empty() => {
                tracing::info!(source = %name, count = records.len(), "collected records");
                ship_records(
                    &name,
                    &records,
                    source.fetcher.additional_fields(),
                    &mut shippers,
                    &cancel,
                )
                .await;
            }
            Ok(_) => {
                tracing::debug!(source = %name, "tick emitted no records");
            }
            Err(e) => {
                tracing::warn!(
                    source = %name,
                    error = %e,
                    transient = e.is_transient(),
                    "tick failed, will try again next interval"
                );
            }
        }
        tracing::info!(
            source = %name,
            next_in_secs = interval.as_secs(),
            "collection task finished"
        );

        if run_once {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::info!(source = %name, "worker stopped");
}

/// Fan records out to every shipper bound to the source.
///
/// Sinks are independent: a failure on one cancels further sends to that
/// sink for this tick but never suppresses the others. Fatal errors
/// cancel the runtime.
async fn ship_records(
    source: &str,
    records: &[Value],
    additional_fields: &Map<String, Value>,
    shippers: &mut [LogzioShipper],
    cancel: &CancellationToken,
) {
    let mut failed = vec![false; shippers.len()];

    for record in records {
        for (i, shipper) in shippers.iter_mut().enumerate() {
            if failed[i] {
                continue;
            }
            if let Err(e) = shipper.add_record(record, additional_fields).await {
                note_sink_failure(source, &e, cancel);
                failed[i] = true;
            }
        }
    }

    for (i, shipper) in shippers.iter_mut().enumerate() {
        if failed[i] {
            continue;
        }
        if let Err(e) = shipper.flush().await {
            note_sink_failure(source, &e, cancel);
        }
    }
}

fn note_sink_failure(source: &str, error: &crate::error::ShipperError, cancel: &CancellationToken) {
    if error.is_fatal() {
        tracing::error!(source, error = %error, "fatal shipping error, stopping the fetcher");
        cancel.cancel();
    } else {
        tracing::error!(source, error = %error, "failed to ship records");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawn_and_cancel() {
        let mut runtime = Runtime::new();
        let cancel = runtime.cancel_token();
        let ran = Arc::new(AtomicBool::new(false));

        let ran_clone = ran.clone();
        runtime.spawn("test-task", async move {
            ran_clone.store(true, Ordering::SeqCst);
            cancel.cancelled().await;
        });

        assert_eq!(runtime.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));

        runtime.shutdown().await;
        assert_eq!(runtime.task_count(), 0);
    }

    #[tokio::test]
    async fn multiple_tasks_all_stopped() {
        let mut runtime = Runtime::new();
        let counter = Arc::new(AtomicU32::new(0));

        for i in 0..5 {
            let cancel = runtime.cancel_token();
            let counter_clone = counter.clone();
            runtime.spawn(format!("task-{i}"), async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
            });
        }

        assert_eq!(runtime.task_count(), 5);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        runtime.shutdown().await;
        assert_eq!(runtime.task_count(), 0);
    }

    #[tokio::test]
    async fn join_all_waits_for_self_terminating_tasks() {
        let mut runtime = Runtime::new();
        let done = Arc::new(AtomicBool::new(false));

        let done_clone = done.clone();
        runtime.spawn("one-shot", async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            done_clone.store(true, Ordering::SeqCst);
        });

        runtime.join_all().await;
        assert!(done.load(Ordering::SeqCst));
        assert!(!runtime.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_handles_already_completed_tasks() {
        let mut runtime = Runtime::new();
        runtime.spawn("instant-task", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_token_is_shared() {
        let runtime = Runtime::new();
        let t1 = runtime.cancel_token();
        let t2 = runtime.cancel_token();

        assert!(!t1.is_cancelled());
        t1.cancel();
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn default_impl() {
        let runtime = Runtime::default();
        assert_eq!(runtime.task_count(), 0);
        assert!(!runtime.cancel_token().is_cancelled());
    }

    mod integration {
        use super::*;
        use crate::fetcher::ApiFetcher;
        use serde_json::json;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn source_for(url: String, name: &str) -> Source {
            Source::new(
                ApiFetcher::new(url)
                    .with_name(name)
                    .with_response_data_path("result")
                    .expect("valid path"),
            )
        }

        #[tokio::test]
        async fn worker_ships_collected_records_once() {
            let api = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "result": [{"msg": "a"}, {"msg": "b"}]
                })))
                .mount(&api)
                .await;

            let listener = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&listener)
                .await;

            let source = source_for(format!("{}/api", api.uri()), "one-shot");
            let shippers = vec![LogzioShipper::new(&listener.uri(), "tok")];
            run_source_worker(source, shippers, CancellationToken::new(), true).await;
        }

        #[tokio::test]
        async fn sink_failure_does_not_suppress_other_sinks() {
            let api = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "result": [{"msg": "fan-out"}]
                })))
                .mount(&api)
                .await;

            // Terminal failure on the first sink; the second still gets
            // its bulk.
            let bad_listener = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(400))
                .expect(1)
                .mount(&bad_listener)
                .await;
            let good_listener = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&good_listener)
                .await;

            let source = source_for(format!("{}/api", api.uri()), "fan-out");
            let shippers = vec![
                LogzioShipper::new(&bad_listener.uri(), "t1"),
                LogzioShipper::new(&good_listener.uri(), "t2"),
            ];
            let cancel = CancellationToken::new();
            run_source_worker(source, shippers, cancel.clone(), true).await;

            // The 400 is fatal: the runtime was asked to stop.
            assert!(cancel.is_cancelled());
        }

        #[tokio::test]
        async fn failing_source_does_not_stop_other_sources() {
            let broken_api = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&broken_api)
                .await;
            let healthy_api = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "result": [{"msg": "still here"}]
                })))
                .mount(&healthy_api)
                .await;

            let listener = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&listener)
                .await;

            let mut runtime = Runtime::new();
            let broken = source_for(format!("{}/api", broken_api.uri()), "broken");
            let healthy = source_for(format!("{}/api", healthy_api.uri()), "healthy");
            runtime.spawn(
                "source-broken",
                run_source_worker(broken, Vec::new(), runtime.cancel_token(), true),
            );
            runtime.spawn(
                "source-healthy",
                run_source_worker(
                    healthy,
                    vec![LogzioShipper::new(&listener.uri(), "tok")],
                    runtime.cancel_token(),
                    true,
                ),
            );
            runtime.join_all().await;
            assert!(!runtime.cancel_token().is_cancelled());
        }
    }
}
