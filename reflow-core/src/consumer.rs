//! The stream session controller.
//!
//! [`AgentRunConsumer`] owns the lifecycle of exactly one active agent run:
//! it verifies liveness before opening the stream, drives the transport from
//! a background task, routes decoded events into the [`StreamSession`], and
//! surfaces a consistent [`RunSnapshot`] through a watch channel. Races
//! between a superseded stream's trailing events and a newly started run are
//! resolved by instance identity, never by merging.
//!
//! Side-channel notifications (billing alerts, live tool output, disconnect
//! warnings, stop-request failures) go through the injectable
//! [`RunObserver`].

use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::StreamConfig;
use crate::event::{ToolOutputEvent, parse_stream_event};
use crate::reconstruct::{NotifyGate, ReconstructedToolCall};
use crate::session::{InstanceRegistry, RunSnapshot, SessionSignal, StreamSession};
use crate::status::{BillingAlert, RunStatus, is_billing_message, map_agent_status};
use crate::transport::{AgentTransport, RawMessageStream, TransportError};

/// Error type for consumer operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The requested run is not running, and a still-active session for a
    /// different run was deliberately left untouched.
    #[error("agent run {run_id} is not live (status: {status})")]
    NotLive {
        /// The run that was requested.
        run_id: String,
        /// The terminal status it mapped to.
        status: RunStatus,
    },

    /// The liveness check failed for a non-benign reason.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Side-channel notifications from the consumer.
///
/// All methods default to no-ops; implement only what the surface needs.
/// Methods are called from the driver task and must not block.
pub trait RunObserver: Send + Sync {
    /// A billing-classified halt was intercepted.
    fn on_billing_alert(&self, _alert: &BillingAlert) {}

    /// Live tool output arrived; passed through verbatim.
    fn on_tool_output(&self, _output: &ToolOutputEvent) {}

    /// A user-visible warning, e.g. a disconnect notice.
    fn on_warning(&self, _message: &str) {}

    /// An unexpected error was surfaced.
    fn on_error(&self, _message: &str) {}

    /// The best-effort stop request failed; local state is already stopped.
    fn on_stop_failure(&self, _message: &str) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default)]
pub struct NullObserver;

impl RunObserver for NullObserver {}

/// Lock the shared session slot, recovering from a poisoned mutex.
fn lock_session(
    session: &Mutex<Option<StreamSession>>,
) -> MutexGuard<'_, Option<StreamSession>> {
    match session.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Consumer of one logical agent-run stream.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use reflow_core::config::StreamConfig;
/// use reflow_core::consumer::AgentRunConsumer;
/// use reflow_core::transport::MockTransport;
///
/// # async fn example() {
/// let transport = Arc::new(MockTransport::new().with_status("running"));
/// let mut consumer = AgentRunConsumer::new(transport, StreamConfig::default());
///
/// consumer.start_streaming("run-1").await.unwrap();
/// let mut updates = consumer.subscribe();
/// let snapshot = updates.wait_for(|s| s.status.is_terminal()).await.unwrap();
/// # let _ = snapshot;
/// # }
/// ```
pub struct AgentRunConsumer {
    transport: Arc<dyn AgentTransport>,
    stream_config: StreamConfig,
    observer: Arc<dyn RunObserver>,
    registry: Arc<InstanceRegistry>,
    thread_id: String,
    session: Arc<Mutex<Option<StreamSession>>>,
    snapshot_tx: Arc<watch::Sender<RunSnapshot>>,
    snapshot_rx: watch::Receiver<RunSnapshot>,
    driver: Option<JoinHandle<()>>,
}

impl AgentRunConsumer {
    /// Create a consumer over the given transport.
    pub fn new(transport: Arc<dyn AgentTransport>, stream_config: StreamConfig) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(RunSnapshot::default());
        Self {
            transport,
            stream_config,
            observer: Arc::new(NullObserver),
            registry: Arc::new(InstanceRegistry::new()),
            thread_id: "default".to_string(),
            session: Arc::new(Mutex::new(None)),
            snapshot_tx: Arc::new(snapshot_tx),
            snapshot_rx,
            driver: None,
        }
    }

    /// Attach an observer for side-channel notifications.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Bind the consumer to a thread/conversation context.
    #[must_use]
    pub fn for_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot_rx.clone()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Current run status.
    pub fn status(&self) -> RunStatus {
        self.snapshot_rx.borrow().status
    }

    /// Canonical ordered assistant text.
    pub fn text_content(&self) -> String {
        self.snapshot_rx.borrow().text_content.clone()
    }

    /// Reconstructed tool calls, ordered by index.
    pub fn tool_calls(&self) -> Vec<ReconstructedToolCall> {
        self.snapshot_rx.borrow().tool_calls.clone()
    }

    /// Surfaced error, when the run ended in error.
    pub fn error(&self) -> Option<String> {
        self.snapshot_rx.borrow().error.clone()
    }

    /// Id of the tracked run; `None` once finalized or idle.
    pub fn agent_run_id(&self) -> Option<String> {
        self.snapshot_rx.borrow().agent_run_id.clone()
    }

    /// Start streaming `run_id`.
    ///
    /// Verifies liveness first. A run reported `completed`/`stopped`
    /// transitions directly to that terminal state without opening a stream;
    /// any other non-running status resolves to
    /// [`RunStatus::AgentNotRunning`]. A previous session for a *different*
    /// run is only disposed once the new run is confirmed running — a
    /// spurious restart for an already-finished run must not destroy a
    /// still-valid in-flight run.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotLive`] when the new run is not running and
    /// an active session for another run was left untouched, or
    /// [`SessionError::Transport`] when the liveness check itself failed
    /// unexpectedly.
    pub async fn start_streaming(&mut self, run_id: &str) -> Result<(), SessionError> {
        {
            let guard = lock_session(&self.session);
            if let Some(ref active) = *guard
                && active.run_id() == run_id
                && !active.is_finalized()
            {
                tracing::debug!(run_id, "consumer: run already being streamed");
                return Ok(());
            }
        }

        tracing::debug!(run_id, "consumer: verifying run liveness");
        let verdict = self.transport.get_agent_status(run_id).await;

        let conflicting = {
            let guard = lock_session(&self.session);
            guard
                .as_ref()
                .is_some_and(|s| s.run_id() != run_id && !s.is_finalized())
        };

        match verdict {
            Ok(response) if response.is_running() => {
                self.dispose_active();
                self.spawn_driver(run_id);
                Ok(())
            }
            Ok(response) => {
                let mapped = map_agent_status(&response.status);
                if conflicting {
                    tracing::debug!(
                        run_id,
                        status = %response.status,
                        "consumer: spurious restart ignored, keeping active run"
                    );
                    return Err(SessionError::NotLive {
                        run_id: run_id.to_string(),
                        status: mapped,
                    });
                }
                if let Some(ref message) = response.error
                    && is_billing_message(message)
                {
                    self.observer
                        .on_billing_alert(&BillingAlert::from_message(message));
                    self.settle_without_stream(run_id, RunStatus::Stopped, None);
                } else {
                    self.settle_without_stream(run_id, mapped, response.error);
                }
                Ok(())
            }
            Err(error) if error.is_not_found() => {
                // Benign race with an already-expired run; no alert.
                if conflicting {
                    return Err(SessionError::NotLive {
                        run_id: run_id.to_string(),
                        status: RunStatus::AgentNotRunning,
                    });
                }
                self.settle_without_stream(run_id, RunStatus::AgentNotRunning, None);
                Ok(())
            }
            Err(error) => {
                if conflicting {
                    return Err(SessionError::Transport(error));
                }
                self.observer.on_error(&error.to_string());
                self.settle_without_stream(run_id, RunStatus::Error, Some(error.to_string()));
                Err(SessionError::Transport(error))
            }
        }
    }

    /// Stop the tracked run.
    ///
    /// Hard cancellation: local state moves to [`RunStatus::Stopped`] and
    /// the transport handle is torn down *before* the out-of-band stop
    /// request resolves; its failure is reported through the observer and
    /// changes nothing locally. A second call is a no-op, since the run id
    /// is already cleared.
    pub async fn stop_streaming(&mut self) {
        let run_id = {
            let mut guard = lock_session(&self.session);
            match guard.take() {
                Some(mut session) => {
                    let run_id = session.run_id().to_string();
                    let snapshot = session.finalize(RunStatus::Stopped, None);
                    self.snapshot_tx.send_replace(snapshot);
                    run_id
                }
                None => {
                    tracing::debug!("consumer: stop requested with no active run");
                    return;
                }
            }
        };

        self.registry.advance();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }

        tracing::debug!(run_id, "consumer: stopped locally, sending stop request");
        if let Err(error) = self.transport.stop_agent(&run_id).await {
            tracing::warn!(%error, run_id, "consumer: stop request failed");
            self.observer.on_stop_failure(&error.to_string());
        }
    }

    /// Switch to a different thread/conversation context.
    ///
    /// Tears down the transport handle and resets all state, exactly like a
    /// stop, but without sending a stop request: the run keeps executing
    /// server-side.
    pub fn switch_thread(&mut self, thread_id: impl Into<String>) {
        self.dispose_active();
        self.thread_id = thread_id.into();
        self.snapshot_tx.send_replace(RunSnapshot::default());
    }

    /// Dispose the active session and driver, invalidating their instance.
    fn dispose_active(&mut self) {
        {
            let mut guard = lock_session(&self.session);
            if guard.take().is_some() {
                tracing::debug!("consumer: disposing previous session");
            }
        }
        self.registry.advance();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }

    /// Resolve a start request to a terminal state without opening a stream.
    fn settle_without_stream(&mut self, run_id: &str, status: RunStatus, error: Option<String>) {
        self.dispose_active();
        let instance = self.registry.advance();
        let mut session =
            StreamSession::new(&self.thread_id, run_id, instance, &self.stream_config);
        let snapshot = session.finalize(status, error);
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Create the session, publish the connecting snapshot, and spawn the
    /// driver task over a freshly opened stream.
    fn spawn_driver(&mut self, run_id: &str) {
        let instance = self.registry.advance();
        let session =
            StreamSession::new(&self.thread_id, run_id, instance, &self.stream_config);
        let connecting = session.snapshot();
        {
            let mut guard = lock_session(&self.session);
            *guard = Some(session);
        }
        self.snapshot_tx.send_replace(connecting);

        let stream = self.transport.stream_agent(run_id);
        let ctx = DriverContext {
            transport: Arc::clone(&self.transport),
            observer: Arc::clone(&self.observer),
            registry: Arc::clone(&self.registry),
            session: Arc::clone(&self.session),
            snapshot_tx: Arc::clone(&self.snapshot_tx),
            config: self.stream_config.clone(),
            thread_id: self.thread_id.clone(),
            run_id: run_id.to_string(),
            instance,
        };
        self.driver = Some(tokio::spawn(drive(ctx, stream)));
    }
}

impl Drop for AgentRunConsumer {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Everything the driver task needs to process events for one session
/// instance.
struct DriverContext {
    transport: Arc<dyn AgentTransport>,
    observer: Arc<dyn RunObserver>,
    registry: Arc<InstanceRegistry>,
    session: Arc<Mutex<Option<StreamSession>>>,
    snapshot_tx: Arc<watch::Sender<RunSnapshot>>,
    config: StreamConfig,
    thread_id: String,
    run_id: String,
    instance: u64,
}

impl DriverContext {
    /// Run `f` against the session iff this instance still owns it.
    ///
    /// Both guards from the design apply here: the thread/context identity
    /// and the run id must match, and the instance must still be current.
    /// Any mismatch silently drops the work.
    fn with_session<T>(&self, f: impl FnOnce(&mut StreamSession) -> T) -> Option<T> {
        let mut guard = lock_session(&self.session);
        match guard.as_mut() {
            Some(session)
                if session.owns_event(&self.registry, &self.thread_id, &self.run_id) =>
            {
                Some(f(session))
            }
            _ => {
                tracing::debug!(run_id = %self.run_id, "consumer: stale event dropped");
                None
            }
        }
    }

    /// Finalize the session (if still owned), clear the slot, and publish
    /// the final snapshot.
    fn finalize(&self, status: RunStatus, error: Option<String>) {
        let snapshot = {
            let mut guard = lock_session(&self.session);
            match guard.as_mut() {
                Some(session)
                    if session.owns_event(&self.registry, &self.thread_id, &self.run_id) =>
                {
                    let snapshot = session.finalize(status, error);
                    *guard = None;
                    Some(snapshot)
                }
                _ => None,
            }
        };
        if let Some(snapshot) = snapshot {
            self.snapshot_tx.send_replace(snapshot);
        }
    }

    /// Publish a progress snapshot, subject to the cadence policy: status
    /// and text changes go out unconditionally, tool-call changes pass
    /// through the [`NotifyGate`].
    fn publish_progress(&self, gate: &mut NotifyGate, snapshot: RunSnapshot) {
        let tools_notify = gate.should_notify(&snapshot.tool_calls);
        let (status_changed, text_changed) = {
            let current = self.snapshot_tx.borrow();
            (
                current.status != snapshot.status
                    || current.error != snapshot.error
                    || current.agent_run_id != snapshot.agent_run_id,
                current.text_content != snapshot.text_content,
            )
        };
        if status_changed || text_changed || tools_notify {
            self.snapshot_tx.send_replace(snapshot);
        }
    }

    /// Process one raw transport message. Returns `true` when the driver
    /// should stop.
    fn handle_raw(&self, raw: &str, gate: &mut NotifyGate) -> bool {
        let signal = match parse_stream_event(raw) {
            Ok(event) => match self.with_session(|s| s.apply_event(event)) {
                Some(signal) => signal,
                // Superseded mid-stream: nothing left to drive.
                None => return true,
            },
            Err(error) => {
                // Billing phrases are honored even in unrecognized payloads,
                // so the billing path never falls into the generic drop.
                if is_billing_message(raw) {
                    SessionSignal::Billing(BillingAlert::from_message(raw))
                } else {
                    tracing::debug!(%error, "consumer: dropping malformed payload");
                    return false;
                }
            }
        };

        match signal {
            SessionSignal::Progress => {
                if let Some(snapshot) = self.with_session(|s| s.snapshot()) {
                    self.publish_progress(gate, snapshot);
                }
                false
            }
            SessionSignal::ToolOutput(output) => {
                self.observer.on_tool_output(&output);
                false
            }
            SessionSignal::Billing(alert) => {
                self.observer.on_billing_alert(&alert);
                // The server intentionally halted the run: stopped, not error.
                self.finalize(RunStatus::Stopped, None);
                true
            }
            SessionSignal::Complete => {
                self.finalize(RunStatus::Completed, None);
                true
            }
            SessionSignal::Fatal(message) => {
                self.observer.on_error(&message);
                self.finalize(RunStatus::Error, Some(message));
                true
            }
        }
    }

    /// Classify a mid-stream transport failure and finalize accordingly.
    fn handle_stream_error(&self, error: &TransportError) {
        let message = error.to_string();
        if is_billing_message(&message) {
            self.observer.on_billing_alert(&BillingAlert::from_message(&message));
            self.finalize(RunStatus::Stopped, None);
        } else if error.is_not_found() {
            tracing::debug!(run_id = %self.run_id, %error, "consumer: benign transport error");
            self.finalize(RunStatus::AgentNotRunning, None);
        } else {
            self.observer.on_error(&message);
            self.finalize(RunStatus::Error, Some(message));
        }
    }

    /// The stream closed without a terminal event: re-query liveness to
    /// decide what actually happened.
    async fn handle_close(&self) {
        if self.with_session(|_| ()).is_none() {
            return;
        }
        tracing::debug!(run_id = %self.run_id, "consumer: stream closed, re-verifying liveness");

        match self.transport.get_agent_status(&self.run_id).await {
            Ok(response) if response.is_running() => {
                // Unexpected disconnect, distinct from a confirmed failure.
                let warning = format!(
                    "Stream disconnected, but agent run {} may still be executing server-side",
                    self.run_id
                );
                self.observer.on_warning(&warning);
                let _ = self.with_session(|s| s.record_warning(&warning));
                self.finalize(
                    RunStatus::Error,
                    Some("stream disconnected unexpectedly".to_string()),
                );
            }
            Ok(response) => {
                if let Some(ref message) = response.error
                    && is_billing_message(message)
                {
                    self.observer
                        .on_billing_alert(&BillingAlert::from_message(message));
                    self.finalize(RunStatus::Stopped, None);
                } else {
                    self.finalize(map_agent_status(&response.status), response.error);
                }
            }
            Err(error) if error.is_not_found() => {
                self.finalize(RunStatus::AgentNotRunning, None);
            }
            Err(error) => {
                self.observer.on_error(&error.to_string());
                self.finalize(RunStatus::Error, Some(error.to_string()));
            }
        }
    }

    /// Single-shot liveness re-verification after the no-message window.
    /// Returns `true` when the driver should stop.
    async fn recheck_liveness(&self) -> bool {
        if self.with_session(|_| ()).is_none() {
            return true;
        }
        tracing::debug!(run_id = %self.run_id, "consumer: no message yet, re-verifying liveness");

        match self.transport.get_agent_status(&self.run_id).await {
            // Still running: keep waiting on the stream, no further timer.
            Ok(response) if response.is_running() => false,
            Ok(response) => {
                if let Some(ref message) = response.error
                    && is_billing_message(message)
                {
                    self.observer
                        .on_billing_alert(&BillingAlert::from_message(message));
                    self.finalize(RunStatus::Stopped, None);
                } else {
                    self.finalize(map_agent_status(&response.status), response.error);
                }
                true
            }
            Err(error) if error.is_not_found() => {
                self.finalize(RunStatus::AgentNotRunning, None);
                true
            }
            Err(error) => {
                self.observer.on_error(&error.to_string());
                self.finalize(RunStatus::Error, Some(error.to_string()));
                true
            }
        }
    }

    /// Frame tick: flush pending text and publish if anything changed.
    /// Returns `true` when the session is gone and the driver should stop.
    fn on_frame_tick(&self, gate: &mut NotifyGate) -> bool {
        match self.with_session(|s| {
            s.flush_text();
            s.snapshot()
        }) {
            Some(snapshot) => {
                self.publish_progress(gate, snapshot);
                false
            }
            None => true,
        }
    }
}

/// Drive one session instance to completion.
///
/// Interleaves three event sources: the transport stream, the render-frame
/// tick, and the single-shot liveness timer armed until the first message.
async fn drive(ctx: DriverContext, mut stream: RawMessageStream) {
    let mut gate = NotifyGate::new(ctx.config.notify_interval());

    let liveness = tokio::time::sleep(ctx.config.liveness_window());
    tokio::pin!(liveness);
    let mut liveness_armed = true;

    let mut frame = tokio::time::interval(ctx.config.frame_interval());
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(raw)) => {
                    liveness_armed = false;
                    if ctx.handle_raw(&raw, &mut gate) {
                        break;
                    }
                }
                Some(Err(error)) => {
                    ctx.handle_stream_error(&error);
                    break;
                }
                None => {
                    ctx.handle_close().await;
                    break;
                }
            },
            _ = &mut liveness, if liveness_armed => {
                liveness_armed = false;
                if ctx.recheck_liveness().await {
                    break;
                }
            }
            _ = frame.tick() => {
                if ctx.on_frame_tick(&mut gate) {
                    break;
                }
            }
        }
    }
    tracing::debug!(run_id = %ctx.run_id, instance = ctx.instance, "consumer: driver finished");
}
