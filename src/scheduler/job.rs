use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinError;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handlers::Handlers;
use super::hooks::RunnerHook;
use crate::command::Command;
use crate::config::ManagerConfig;
use crate::error::{PmError, Result};
use crate::process::builtin::panic_text;
use crate::process::{PidTable, Process, ProcessEnv, ProcessFactory};
use crate::result::{JobResult, JobState, Streams};
use crate::stream::message::{
    LEVEL_CRITICAL, LEVEL_STDERR, LEVEL_STDOUT, RESULT_LEVELS,
};
use crate::stream::{Flag, Message, RingBuffer};

pub type Subscriber = Arc<dyn Fn(&Message) + Send + Sync>;

/// Shared handle on a submitted job.
pub type JobHandle = Arc<Job>;

/// What a job needs besides its command and factory.
#[derive(Clone)]
pub struct JobOptions {
    pub table: Arc<dyn PidTable>,
    pub handlers: Arc<Handlers>,
    pub config: ManagerConfig,
}

impl JobOptions {
    pub fn new(table: Arc<dyn PidTable>) -> Self {
        Self {
            table,
            handlers: Arc::new(Handlers::new()),
            config: ManagerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handlers(mut self, handlers: Arc<Handlers>) -> Self {
        self.handlers = handlers;
        self
    }
}

/// Pid table of one job: registrations go to the shared table, then the
/// job's hooks learn the pid.
struct HookedPidTable {
    inner: Arc<dyn PidTable>,
    hooks: Arc<Vec<Arc<dyn RunnerHook>>>,
}

impl PidTable for HookedPidTable {
    fn register_pid(&self, spawn: &mut dyn FnMut() -> Result<i32>) -> Result<i32> {
        let pid = self.inner.register_pid(spawn)?;
        for hook in self.hooks.iter() {
            hook.pid(pid);
        }
        Ok(pid)
    }

    fn wait_pid(&self, pid: i32) -> Result<oneshot::Receiver<WaitStatus>> {
        self.inner.wait_pid(pid)
    }
}

struct Fanout {
    backlog: RingBuffer<Message>,
    subscribers: Vec<Subscriber>,
}

fn deliver(subscriber: &Subscriber, msg: &Message) {
    if catch_unwind(AssertUnwindSafe(|| subscriber(msg))).is_err() {
        warn!("message subscriber panicked");
    }
}

fn elapsed_ms(since: DateTime<Utc>) -> i64 {
    (Utc::now() - since).num_milliseconds()
}

/// Supervised lifecycle of one command, across restarts and recurrences.
pub struct Job {
    command: Command,
    factory: ProcessFactory,
    hooks: Arc<Vec<Arc<dyn RunnerHook>>>,
    env: ProcessEnv,
    handlers: Arc<Handlers>,
    config: ManagerConfig,

    signal_tx: mpsc::Sender<Signal>,
    signal_rx: tokio::sync::Mutex<mpsc::Receiver<Signal>>,
    running: AtomicBool,
    unschedule: CancellationToken,

    process: RwLock<Option<Arc<dyn Process>>>,
    start_time: AtomicI64,
    fanout: Mutex<Fanout>,
    result: watch::Sender<Option<Arc<JobResult>>>,
}

impl Job {
    pub fn new(
        command: Command,
        factory: ProcessFactory,
        hooks: Vec<Arc<dyn RunnerHook>>,
        options: JobOptions,
    ) -> JobHandle {
        let hooks = Arc::new(hooks);
        let env = ProcessEnv {
            table: Arc::new(HookedPidTable {
                inner: options.table,
                hooks: hooks.clone(),
            }),
            unprivileged: options.config.unprivileged,
        };
        let (signal_tx, signal_rx) = mpsc::channel(options.config.signal_buffer.max(1));
        let (result, _) = watch::channel(None);

        Arc::new(Self {
            command,
            factory,
            hooks,
            env,
            handlers: options.handlers,
            fanout: Mutex::new(Fanout {
                backlog: RingBuffer::new(options.config.backlog_size),
                subscribers: Vec::new(),
            }),
            config: options.config,
            signal_tx,
            signal_rx: tokio::sync::Mutex::new(signal_rx),
            running: AtomicBool::new(false),
            unschedule: CancellationToken::new(),
            process: RwLock::new(None),
            start_time: AtomicI64::new(0),
            result,
        })
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queues `signal` for the running process.
    ///
    /// # Errors
    ///
    /// `NotRunning` before the job started or after it finished, and
    /// `SignalRejected` when too many signals are already pending.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if !self.is_running() {
            return Err(PmError::NotRunning(self.command.id.clone()));
        }
        self.signal_tx
            .try_send(signal)
            .map_err(|_| PmError::SignalRejected(self.command.id.clone()))
    }

    /// The process of the current attempt, if one is running.
    pub fn process(&self) -> Option<Arc<dyn Process>> {
        self.process
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_process(&self, process: Option<Arc<dyn Process>>) {
        *self.process.write().unwrap_or_else(|e| e.into_inner()) = process;
    }

    /// Start of the current attempt, in milliseconds since the Unix epoch.
    pub fn start_time(&self) -> i64 {
        self.start_time.load(Ordering::SeqCst)
    }

    /// The final result, once the job is done.
    pub fn result(&self) -> Option<Arc<JobResult>> {
        self.result.borrow().clone()
    }

    /// Waits for the final result.
    pub async fn wait(&self) -> Arc<JobResult> {
        let mut rx = self.result.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Arc::new(JobResult::new(&self.command));
            }
        }
    }

    /// Replays the backlog to `listener`, then adds it to the live
    /// subscribers. Both happen under the lock the job loop takes to publish,
    /// so the listener sees every message exactly once. `listener` must not
    /// subscribe to the same job.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let listener: Subscriber = Arc::new(listener);
        let mut fanout = self.fanout();
        for msg in fanout.backlog.iter() {
            deliver(&listener, msg);
        }
        fanout.subscribers.push(listener);
    }

    /// Stops any pending restart or recurrence. Idempotent.
    pub fn unschedule(&self) {
        self.unschedule.cancel();
    }

    fn fanout(&self) -> MutexGuard<'_, Fanout> {
        self.fanout.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs the job until it reaches a final state, then publishes the
    /// result to the result handlers and to waiters.
    pub async fn start(self: Arc<Self>) -> Arc<JobResult> {
        self.running.store(true, Ordering::SeqCst);
        info!(job_id = %self.command.id, command = %self.command.command, "job started");

        let mut runs: u64 = 0;
        let mut result = loop {
            let mut result = match tokio::spawn(self.clone().run()).await {
                Ok(result) => result,
                Err(e) => self.recover(e),
            };

            for hook in self.hooks.iter() {
                hook.exit(result.state);
            }

            let pause = if self.command.flags.protected {
                info!(job_id = %self.command.id, "re-spawning protected job");
                Some(self.config.restart_delay)
            } else if result.state == JobState::Killed {
                None
            } else {
                let mut pause = None;
                if result.state != JobState::Success && self.command.max_restart > 0 {
                    runs += 1;
                    if runs < self.command.max_restart {
                        info!(
                            job_id = %self.command.id,
                            attempt = runs + 1,
                            max_restart = self.command.max_restart,
                            state = %result.state,
                            "restarting job after abnormal exit"
                        );
                        pause = Some(self.config.restart_delay);
                    }
                }
                if self.command.recurring_period > 0 {
                    pause = Some(Duration::from_secs(self.command.recurring_period));
                }
                pause
            };

            let Some(pause) = pause else {
                break result;
            };
            debug!(job_id = %self.command.id, ?pause, "job rescheduled");
            if !self.pause(pause).await {
                result.state = JobState::Killed;
                break result;
            }
        };

        self.running.store(false, Ordering::SeqCst);
        self.unschedule.cancel();

        result.tags = self.command.tags.clone();
        let result = Arc::new(result);
        info!(
            job_id = %self.command.id,
            state = %result.state,
            code = result.code,
            "job finished"
        );
        self.handlers.result(&self.command, &result);
        self.result.send_replace(Some(result.clone()));
        result
    }

    /// Finishes a job that was never started with `state`. Returns false,
    /// and reports nothing, when the job already has a result.
    pub(crate) fn discard(&self, state: JobState) -> bool {
        self.unschedule.cancel();
        let result = Arc::new(JobResult::with_state(&self.command, state));
        let discarded = self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result.clone());
            true
        });
        if discarded {
            info!(job_id = %self.command.id, state = %state, "job discarded before start");
            self.handlers.result(&self.command, &result);
        }
        discarded
    }

    /// Sleeps between attempts. Returns false when unscheduled or signalled
    /// while waiting.
    async fn pause(&self, pause: Duration) -> bool {
        let mut signals = self.signal_rx.lock().await;
        tokio::select! {
            _ = sleep(pause) => true,
            _ = self.unschedule.cancelled() => false,
            Some(signal) = signals.recv() => {
                info!(job_id = %self.command.id, ?signal, "job signalled while waiting, unscheduling");
                false
            }
        }
    }

    fn recover(&self, err: JoinError) -> JobResult {
        self.set_process(None);
        let text = if err.is_panic() {
            panic_text(err.into_panic().as_ref())
        } else {
            err.to_string()
        };
        error!(job_id = %self.command.id, panic = %text, "job loop panicked");

        let mut result = JobResult::with_state(&self.command, JobState::Error);
        result.critical = format!("PANIC({text})");
        result.start_time = self.start_time();
        result
    }

    fn forward_signal(&self, process: &dyn Process, signal: Signal) {
        match process.as_signaler() {
            Some(signaler) => {
                if let Err(e) = signaler.signal(signal) {
                    warn!(job_id = %self.command.id, ?signal, error = %e, "failed to signal process");
                }
            }
            None => debug!(job_id = %self.command.id, ?signal, "process does not take signals"),
        }
    }

    /// Stamps and publishes a message to the handlers and subscribers.
    fn publish(&self, mut msg: Message) {
        msg.epoch = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        if self.command.stream {
            msg.meta = msg.meta.set(Flag::STREAM);
        }

        self.handlers.message(&self.command, &msg);

        let mut fanout = self.fanout();
        for subscriber in &fanout.subscribers {
            deliver(subscriber, &msg);
        }
        fanout.backlog.push(msg);
    }

    /// One attempt: spawn the process and follow it to its exit message.
    async fn run(self: Arc<Self>) -> JobResult {
        let started = Utc::now();
        self.start_time
            .store(started.timestamp_millis(), Ordering::SeqCst);

        let mut result = JobResult::with_state(&self.command, JobState::Error);
        result.start_time = started.timestamp_millis();

        let process = (self.factory)(self.env.clone(), self.command.clone());
        self.set_process(Some(process.clone()));

        let mut messages = match process.run() {
            Ok(rx) => rx,
            Err(e) => {
                error!(job_id = %self.command.id, error = %e, "failed to start process");
                self.set_process(None);
                result.code = e.code();
                result.data = e.to_string();
                result.time = elapsed_ms(started);
                return result;
            }
        };

        let mut stdout = RingBuffer::new(self.config.stream_buffer_size);
        let mut stderr = RingBuffer::new(self.config.stream_buffer_size);
        let mut critical = String::new();
        let mut output: Option<Message> = None;

        let deadline = sleep(Duration::from_secs(self.command.max_time));
        tokio::pin!(deadline);
        let mut armed = self.command.max_time > 0;

        let tick = self.config.tick_interval;
        let begun = Instant::now();
        let mut ticker = interval_at(begun + tick, tick);

        let mut signals = self.signal_rx.lock().await;

        loop {
            tokio::select! {
                Some(signal) = signals.recv() => self.forward_signal(process.as_ref(), signal),
                _ = &mut deadline, if armed => {
                    armed = false;
                    if let Some(signaler) = process.as_signaler() {
                        warn!(job_id = %self.command.id, max_time = self.command.max_time, "job timed out");
                        if let Err(e) = signaler.signal(Signal::SIGKILL) {
                            warn!(job_id = %self.command.id, error = %e, "failed to kill timed out job");
                        }
                        result.state = JobState::Timeout;
                    }
                }
                _ = ticker.tick() => {
                    let elapsed = begun.elapsed();
                    for hook in self.hooks.iter().cloned() {
                        tokio::task::spawn_blocking(move || hook.tick(elapsed));
                    }
                }
                received = messages.recv() => {
                    let Some(mut msg) = received else {
                        warn!(job_id = %self.command.id, "process stream ended without exit message");
                        break;
                    };

                    let terminal = msg.meta.is_terminal();
                    if msg.meta.is(Flag::EXIT_SUCCESS) && result.state != JobState::Timeout {
                        result.state = JobState::Success;
                    }

                    if msg.meta.is_level(&RESULT_LEVELS) {
                        output = Some(msg.clone());
                    } else if !(terminal && msg.message.is_empty()) {
                        match msg.level() {
                            LEVEL_STDOUT => stdout.push(msg.message.clone()),
                            LEVEL_STDERR => stderr.push(msg.message.clone()),
                            LEVEL_CRITICAL => critical = msg.message.clone(),
                            _ => {}
                        }
                    }

                    for hook in self.hooks.iter() {
                        hook.message(&msg);
                    }

                    let code = msg.meta.code();
                    msg.meta = msg.meta.base();
                    self.publish(msg);

                    if terminal {
                        result.code = code;
                        break;
                    }
                }
            }
        }
        drop(signals);

        self.set_process(None);
        while messages.recv().await.is_some() {}

        if let Some(output) = output {
            result.level = output.level();
            result.data = output.message;
        }
        result.streams = Streams(stdout.joined(), stderr.joined());
        result.critical = critical;
        result.time = elapsed_ms(started);

        debug!(job_id = %self.command.id, state = %result.state, code = result.code, "attempt finished");
        result
    }
}
