//! Backend process lifecycle
//!
//! One backend at a time moves through `OFFLINE -> STARTING -> ONLINE -> OFFLINE`.
//! Status changes are published on a `watch` channel; sessions subscribe to it
//! instead of polling.
//!
//! Three kinds of background task hang off the lifecycle:
//!
//! - a readiness watcher per process, fed by the log tail or stdout
//! - a supervisor per process, which owns the exit notification
//! - at most one idle shutdown timer
//!
//! Every task captures the process generation it was started for and does
//! nothing if the current process is a different one.

use crate::checkpoint::{CheckpointImage, CheckpointRecord, Checkpointing};
use crate::config::BackendConfig;
use crate::error::{CheckpointError, LifecycleError};
use crate::identity::IdentitySpace;
use crate::logtail;
use crate::process::{
    ProcessInput, ProcessLauncher, ProcessOutput, Signal, SpawnRequest, UNKNOWN_EXIT_CODE,
};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval for polling process exit during proxy shutdown
const EXIT_POLL_INTERVAL_MS: u64 = 50;

/// Identity map shared between the lifecycle and every session
pub type SharedIdentities = Arc<Mutex<IdentitySpace>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Offline,
    Starting,
    Online,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Offline => "OFFLINE",
            Status::Starting => "STARTING",
            Status::Online => "ONLINE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A fresh backend process was spawned
    Started,
    /// A restore from a checkpoint image was launched
    Resuming,
    /// The previous process is still exiting; start runs once it is gone
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A stop request was delivered; the process exits on its own
    Stopping,
    /// A checkpoint dump is running and will end the process
    Hibernating,
    /// A launch was in flight; its process is stopped as soon as it exists
    LaunchCancelled,
    /// Nothing was running
    AlreadyOffline,
}

#[derive(Debug, Clone, Copy)]
enum ReadyRule {
    /// Wait for the configured ready pattern
    Marker,
    /// Any output means the restored process is running again
    FirstLine,
}

struct LiveProcess {
    generation: u64,
    pid: u32,
    input: Option<ProcessInput>,
    /// Image this process was restored from, until it reaches ONLINE
    resumed_from: Option<CheckpointImage>,
}

struct StopRequest {
    pid: u32,
    generation: u64,
    previous: Status,
    input: Option<ProcessInput>,
}

struct ShutdownTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    generation: u64,
    process: Option<LiveProcess>,
    start_deferred: bool,
    /// Between `start` and the launched process being installed
    launching: bool,
    /// A stop arrived while launching
    stop_pending: bool,
    timer_seq: u64,
    shutdown_timer: Option<ShutdownTimer>,
    /// Pending hibernate; the supervisor waits for it before declaring the process gone
    teardown: Option<JoinHandle<()>>,
}

pub struct BackendLifecycle {
    config: BackendConfig,
    ready_pattern: Regex,
    launcher: Arc<dyn ProcessLauncher>,
    checkpoint: Option<Checkpointing>,
    identities: SharedIdentities,
    status_tx: watch::Sender<Status>,
    state: Mutex<State>,
    /// Serializes dump, pointer updates and image deletion
    checkpoint_gate: tokio::sync::Mutex<()>,
    log_poll_interval: Duration,
}

impl BackendLifecycle {
    pub fn new(
        config: BackendConfig,
        launcher: Arc<dyn ProcessLauncher>,
        checkpoint: Option<Checkpointing>,
    ) -> anyhow::Result<Arc<Self>> {
        let ready_pattern = config.ready_regex()?;
        let (status_tx, _) = watch::channel(Status::Offline);

        Ok(Arc::new(Self {
            config,
            ready_pattern,
            launcher,
            checkpoint,
            identities: Arc::new(Mutex::new(IdentitySpace::new())),
            status_tx,
            state: Mutex::new(State::default()),
            checkpoint_gate: tokio::sync::Mutex::new(()),
            log_poll_interval: logtail::DEFAULT_POLL_INTERVAL,
        }))
    }

    pub fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub fn identities(&self) -> SharedIdentities {
        Arc::clone(&self.identities)
    }

    /// Pid of the tracked backend process, if one exists
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().process.as_ref().map(|p| p.pid)
    }

    pub fn has_pending_shutdown(&self) -> bool {
        self.state.lock().shutdown_timer.is_some()
    }

    fn set_status(&self, status: Status) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!(status = %status, "Backend status changed");
        }
    }

    /// Start the backend, resuming from a checkpoint image when one exists.
    ///
    /// Fails with [`LifecycleError::Misuse`] unless the backend is offline.
    /// If the previous process is still exiting the start is deferred until
    /// its exit has been processed.
    pub async fn start(self: &Arc<Self>) -> Result<StartOutcome, LifecycleError> {
        self.unqueue_shutdown();
        {
            let mut state = self.state.lock();
            let status = self.status();
            if status != Status::Offline {
                return Err(LifecycleError::Misuse { status });
            }
            if state.launching {
                // Still launching after a stop: withdraw the stop and let the launch finish
                info!("Start requested during a cancelled launch, keeping the launch");
                state.stop_pending = false;
                self.set_status(Status::Starting);
                return Ok(StartOutcome::Started);
            }
            if state.process.is_some() {
                if !state.start_deferred {
                    info!("Previous backend still exiting, deferring start");
                }
                state.start_deferred = true;
                return Ok(StartOutcome::Deferred);
            }
            state.launching = true;
            self.set_status(Status::Starting);
        }

        let result = self.launch().await;
        if let Err(ref e) = result {
            error!(error = %e, "Backend start failed");
            let mut state = self.state.lock();
            state.launching = false;
            state.stop_pending = false;
            self.set_status(Status::Offline);
        }
        result
    }

    /// Start the backend if it is offline; a no-op otherwise
    pub async fn ensure_started(self: &Arc<Self>) -> Result<Option<StartOutcome>, LifecycleError> {
        match self.start().await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(LifecycleError::Misuse { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn launch(self: &Arc<Self>) -> Result<StartOutcome, LifecycleError> {
        if let Some(checkpoint) = &self.checkpoint {
            let image = {
                let _gate = self.checkpoint_gate.lock().await;
                checkpoint.store.load().await?
            };
            if let Some(image) = image {
                return self.resume(checkpoint, image).await;
            }
        }
        self.cold_start().await
    }

    async fn cold_start(self: &Arc<Self>) -> Result<StartOutcome, LifecycleError> {
        self.identities.lock().reset();

        let request = SpawnRequest {
            executable: self.config.executable.clone(),
            args: self.config.args.clone(),
            cwd: self.config.working_dir.as_ref().map(PathBuf::from),
            env: self.config.env.clone(),
            pty: self.checkpoint.is_some(),
        };
        // Tail before spawning so the ready line cannot slip past
        let log = self.open_log_tail();

        let spawned = self
            .launcher
            .spawn(&request)
            .await
            .map_err(|e| LifecycleError::spawn(&request.executable, e))?;
        info!(pid = spawned.pid, executable = %request.executable, "Backend process started");

        let (generation, cancelled) = self.install(spawned.pid, spawned.input, None);
        let lines = self.readiness_source(log, spawned.output);
        self.watch_readiness(generation, lines, ReadyRule::Marker);
        self.supervise(generation, spawned.exit);
        if cancelled {
            self.stop_cancelled_launch().await;
        }
        Ok(StartOutcome::Started)
    }

    async fn resume(
        self: &Arc<Self>,
        checkpoint: &Checkpointing,
        image: CheckpointImage,
    ) -> Result<StartOutcome, LifecycleError> {
        info!(
            id = %image.id,
            pid = image.pid,
            saved_status = %image.saved_status,
            "Resuming backend from checkpoint"
        );
        let log = self.open_log_tail();

        let spawned = checkpoint
            .tool
            .restore(&image.path)
            .await
            .map_err(|e| LifecycleError::spawn("checkpoint restore", e))?;

        let rule = match image.saved_status {
            Status::Online => ReadyRule::FirstLine,
            _ => ReadyRule::Marker,
        };
        // The restored tree keeps its original pid; the restore process is only its parent
        let (generation, cancelled) = self.install(image.pid, spawned.input, Some(image));
        let lines = self.readiness_source(log, spawned.output);
        self.watch_readiness(generation, lines, rule);
        self.supervise(generation, spawned.exit);
        if cancelled {
            self.stop_cancelled_launch().await;
        }
        Ok(StartOutcome::Resuming)
    }

    /// Track a launched process. Also reports whether a stop arrived while launching.
    fn install(
        &self,
        pid: u32,
        input: Option<ProcessInput>,
        resumed_from: Option<CheckpointImage>,
    ) -> (u64, bool) {
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        state.process = Some(LiveProcess {
            generation,
            pid,
            input,
            resumed_from,
        });
        state.launching = false;
        (generation, std::mem::take(&mut state.stop_pending))
    }

    fn open_log_tail(&self) -> Option<mpsc::Receiver<String>> {
        self.config
            .log_path()
            .map(|path| logtail::tail_file(path, self.log_poll_interval))
    }

    fn readiness_source(
        &self,
        log: Option<mpsc::Receiver<String>>,
        output: Option<ProcessOutput>,
    ) -> mpsc::Receiver<String> {
        let output_lines = output.map(logtail::lines_from_reader);
        match (log, output_lines) {
            (Some(log), _) => log,
            (None, Some(lines)) => lines,
            (None, None) => {
                warn!("Backend has neither a log file nor captured output, it will never become ready");
                logtail::empty()
            }
        }
    }

    fn watch_readiness(
        self: &Arc<Self>,
        generation: u64,
        mut lines: mpsc::Receiver<String>,
        rule: ReadyRule,
    ) {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let ready = match rule {
                    ReadyRule::FirstLine => true,
                    ReadyRule::Marker => lifecycle.ready_pattern.is_match(&line),
                };
                if !ready {
                    continue;
                }
                let warmup = lifecycle.config.warmup();
                if !warmup.is_zero() {
                    debug!(warmup_ms = warmup.as_millis() as u64, "Backend ready, warming up");
                    tokio::time::sleep(warmup).await;
                }
                lifecycle.mark_online(generation);
                return;
            }
            debug!(generation, "Backend output ended before it became ready");
        });
    }

    fn mark_online(self: &Arc<Self>, generation: u64) {
        let resumed_from = {
            let mut state = self.state.lock();
            let Some(process) = state
                .process
                .as_mut()
                .filter(|p| p.generation == generation)
            else {
                return;
            };
            if self.status() != Status::Starting {
                return;
            }
            self.set_status(Status::Online);
            process.resumed_from.take()
        };

        if let Some(image) = resumed_from {
            self.spawn_image_cleanup(image);
        }
    }

    /// Delete an image that has been restored successfully
    fn spawn_image_cleanup(self: &Arc<Self>, image: CheckpointImage) {
        let Some(checkpoint) = self.checkpoint.clone() else {
            return;
        };
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            let _gate = lifecycle.checkpoint_gate.lock().await;
            if let Err(e) = checkpoint.store.remove(&image).await {
                error!(id = %image.id, error = %e, "Failed to remove restored checkpoint image");
            }
        });
    }

    fn supervise(self: &Arc<Self>, generation: u64, exit: oneshot::Receiver<i32>) {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            let code = exit.await.unwrap_or(UNKNOWN_EXIT_CODE);
            lifecycle.handle_exit(generation, code).await;
        });
    }

    async fn handle_exit(self: &Arc<Self>, generation: u64, code: i32) {
        let teardown = self.state.lock().teardown.take();
        if let Some(teardown) = teardown {
            if let Err(e) = teardown.await {
                error!(error = %e, "Hibernate task failed");
            }
        }

        let (status_at_exit, failed_image, deferred) = {
            let mut state = self.state.lock();
            if state.process.as_ref().map(|p| p.generation) != Some(generation) {
                return;
            }
            let Some(process) = state.process.take() else {
                return;
            };
            let status = self.status();
            let failed_image = if status == Status::Starting && code != 0 {
                process.resumed_from
            } else {
                None
            };
            let deferred = std::mem::take(&mut state.start_deferred);
            self.set_status(Status::Offline);
            (status, failed_image, deferred)
        };

        match status_at_exit {
            Status::Offline => info!(code, "Backend process exited"),
            status => warn!(code, status = %status, "Backend process exited unexpectedly"),
        }

        if let Some(image) = failed_image {
            warn!(id = %image.id, code, "Restore failed, discarding checkpoint image");
            if let Some(checkpoint) = &self.checkpoint {
                let removed = {
                    let _gate = self.checkpoint_gate.lock().await;
                    checkpoint.store.remove(&image).await
                };
                if let Err(e) = removed {
                    error!(id = %image.id, error = %e, "Failed to discard checkpoint image");
                    return;
                }
            }
            self.run_start("cold start after failed restore").await;
            return;
        }

        if deferred {
            self.run_start("deferred start").await;
        }
    }

    async fn run_start(self: &Arc<Self>, reason: &str) {
        info!(reason, "Starting backend");
        if let Err(e) = self.start().await {
            error!(reason, error = %e, "Backend start failed");
        }
    }

    /// Stop the backend.
    ///
    /// Status becomes OFFLINE immediately. With checkpointing enabled the
    /// process is dumped to disk; otherwise it is asked to exit and killed
    /// after the grace period.
    pub async fn stop(self: &Arc<Self>) -> StopOutcome {
        let plan = {
            let mut state = self.state.lock();
            let status = self.status();
            if status == Status::Offline {
                return StopOutcome::AlreadyOffline;
            }
            if state.process.is_none() {
                if !state.launching {
                    return StopOutcome::AlreadyOffline;
                }
                info!(previous = %status, "Stop requested while launching, stopping once launched");
                state.stop_pending = true;
                self.set_status(Status::Offline);
                return StopOutcome::LaunchCancelled;
            }
            self.set_status(Status::Offline);
            self.begin_stop(&mut state, status)
        };
        self.finish_stop(plan).await
    }

    /// Stop a process whose launch was cancelled by an earlier `stop`
    async fn stop_cancelled_launch(self: &Arc<Self>) {
        let plan = {
            let mut state = self.state.lock();
            if state.process.is_none() || self.status() != Status::Offline {
                return;
            }
            self.begin_stop(&mut state, Status::Starting)
        };
        self.finish_stop(plan).await;
    }

    /// Hibernate in the background, or hand back what a signalled stop needs
    fn begin_stop(self: &Arc<Self>, state: &mut State, previous: Status) -> Option<StopRequest> {
        let process = state.process.as_mut()?;
        let pid = process.pid;
        let generation = process.generation;

        if let Some(checkpoint) = self.checkpoint.clone() {
            let lifecycle = Arc::clone(self);
            info!(pid, previous = %previous, "Hibernating backend");
            state.teardown = Some(tokio::spawn(async move {
                lifecycle.hibernate(&checkpoint, pid, previous).await;
            }));
            return None;
        }
        Some(StopRequest {
            pid,
            generation,
            previous,
            input: process.input.take(),
        })
    }

    async fn finish_stop(self: &Arc<Self>, plan: Option<StopRequest>) -> StopOutcome {
        let Some(request) = plan else {
            return StopOutcome::Hibernating;
        };
        info!(pid = request.pid, previous = %request.previous, "Stopping backend");
        self.request_stop(request.pid, request.input).await;
        self.escalate_after_grace(request.pid, request.generation);
        StopOutcome::Stopping
    }

    async fn request_stop(&self, pid: u32, input: Option<ProcessInput>) {
        let command = self
            .config
            .stop_command
            .as_deref()
            .filter(|c| !c.trim().is_empty());

        if let (Some(command), Some(mut input)) = (command, input) {
            let line = format!("{}\n", command);
            let written = async {
                input.write_all(line.as_bytes()).await?;
                input.flush().await
            }
            .await;
            match written {
                Ok(()) => {
                    debug!(pid, command, "Sent stop command");
                    return;
                }
                Err(e) => warn!(pid, error = %e, "Failed to send stop command, falling back to SIGTERM"),
            }
        }

        if let Err(e) = self.launcher.signal(pid, Signal::Terminate) {
            warn!(pid, error = %e, "Failed to send SIGTERM");
        }
    }

    fn escalate_after_grace(self: &Arc<Self>, pid: u32, generation: u64) {
        let grace = self.config.shutdown_grace_period();
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = lifecycle
                .state
                .lock()
                .process
                .as_ref()
                .is_some_and(|p| p.generation == generation);
            if still_running {
                warn!(pid, grace_secs = grace.as_secs(), "Backend did not exit in time, sending SIGKILL");
                lifecycle.kill(pid);
            }
        });
    }

    fn kill(&self, pid: u32) {
        if let Err(e) = self.launcher.signal(pid, Signal::Kill) {
            error!(pid, error = %e, "Failed to kill backend");
        }
    }

    async fn hibernate(&self, checkpoint: &Checkpointing, pid: u32, saved_status: Status) {
        if let Err(e) = self.dump_and_commit(checkpoint, pid, saved_status).await {
            error!(pid, error = %e, "Hibernate failed, killing backend");
            self.kill(pid);
        }
    }

    async fn dump_and_commit(
        &self,
        checkpoint: &Checkpointing,
        pid: u32,
        saved_status: Status,
    ) -> Result<(), CheckpointError> {
        let _gate = self.checkpoint_gate.lock().await;
        let prior = checkpoint.store.load().await?;
        let (id, dir) = checkpoint.store.prepare().await?;

        let code = match checkpoint.tool.dump(pid, &dir).await {
            Ok(code) => code,
            Err(e) => {
                warn!(pid, error = %e, "Could not run checkpoint dump");
                UNKNOWN_EXIT_CODE
            }
        };
        if code != 0 {
            warn!(pid, code, "Checkpoint dump failed, killing backend");
            self.kill(pid);
            checkpoint.store.discard_dir(&dir).await?;
            return Ok(());
        }

        let image = checkpoint
            .store
            .commit(CheckpointRecord {
                id,
                pid,
                status: saved_status,
            })
            .await?;

        if let Some(prior) = prior.filter(|p| p.id != image.id) {
            checkpoint.store.remove(&prior).await?;
        }
        Ok(())
    }

    /// Arm the idle shutdown timer unless one is already pending
    pub fn queue_shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.shutdown_timer.is_some() {
            debug!("Idle shutdown already queued");
            return;
        }
        state.timer_seq += 1;
        let id = state.timer_seq;
        let delay = self.config.idle_shutdown();
        let deadline = tokio::time::Instant::now() + delay;
        let lifecycle = Arc::clone(self);

        // The lock is held until the timer is recorded, so the task always finds it
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fired = {
                let mut state = lifecycle.state.lock();
                if state.shutdown_timer.as_ref().map(|t| t.id) == Some(id) {
                    state.shutdown_timer = None;
                    true
                } else {
                    false
                }
            };
            if fired {
                info!("Idle timeout reached, stopping backend");
                lifecycle.stop().await;
            }
        });
        state.shutdown_timer = Some(ShutdownTimer { id, handle });
        info!(delay_secs = delay.as_secs(), "Idle shutdown queued");
    }

    /// Cancel a pending idle shutdown
    pub fn unqueue_shutdown(&self) {
        if let Some(timer) = self.state.lock().shutdown_timer.take() {
            timer.handle.abort();
            info!("Idle shutdown cancelled");
        }
    }

    /// Wait until no backend process is tracked, up to `limit`
    pub async fn wait_for_exit(&self, limit: Duration) -> bool {
        let poll = async {
            while self.state.lock().process.is_some() {
                tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
            }
        };
        tokio::time::timeout(limit, poll).await.is_ok()
    }
}
