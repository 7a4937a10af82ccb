use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use nix::sys::signal::Signal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handlers::{Handlers, MessageHandler, PreHandler, ResultHandler, StatsHandler, Tag};
use super::hooks::{RunnerHook, StreamHook};
use super::job::{Job, JobHandle, JobOptions};
use super::queue::NamedQueues;
use crate::command::{Command, CORE_SYSTEM};
use crate::config::ManagerConfig;
use crate::error::{PmError, Result};
use crate::process::system::lookup_path;
use crate::process::{
    BuiltinProcess, Context, Extension, PidTable, ProcessFactory, Runnable, SystemPidTable,
    SystemProcess,
};
use crate::result::{JobResult, JobState, Streams};
use crate::stream::message::LEVEL_RESULT_JSON;

/// Resolves command names the factory table doesn't know.
pub trait Router: Send + Sync {
    fn get(&self, name: &str) -> Option<Runnable>;
}

struct Admission {
    job: JobHandle,
    /// Released once the job holds a run slot. Jobs dispatched from a named
    /// queue have nobody waiting.
    admitted: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: ManagerConfig,
    unprivileged: AtomicBool,
    table: Arc<dyn PidTable>,
    handlers: Arc<Handlers>,

    jobs: RwLock<HashMap<String, JobHandle>>,
    queues: Mutex<NamedQueues<JobHandle>>,
    factories: RwLock<HashMap<String, ProcessFactory>>,
    routers: RwLock<Vec<Arc<dyn Router>>>,

    admission: Mutex<Option<mpsc::UnboundedSender<Admission>>>,
    closed: AtomicBool,
}

impl Inner {
    fn queues(&self) -> MutexGuard<'_, NamedQueues<JobHandle>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn job_options(&self) -> JobOptions {
        let mut config = self.config.clone();
        config.unprivileged |= self.unprivileged.load(Ordering::SeqCst);
        JobOptions::new(self.table.clone())
            .with_config(config)
            .with_handlers(self.handlers.clone())
    }

    fn send(&self, admission: Admission) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PmError::QueueClosed);
        }
        let admission_tx = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        admission_tx
            .as_ref()
            .ok_or(PmError::QueueClosed)?
            .send(admission)
            .map_err(|_| PmError::QueueClosed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.admission
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn unregister(&self, job: &Job) {
        let id = &job.command().id;
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        // The id may already belong to a newer job.
        if jobs
            .get(id)
            .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered), job))
        {
            jobs.remove(id);
        }
    }

    /// Drops a finished job and dispatches the next one of its named queue.
    fn clean_up(&self, job: &Job) {
        self.unregister(job);

        let queue = &job.command().queue;
        if queue.is_empty() {
            return;
        }

        loop {
            let Some(next) = self.queues().notify(queue) else {
                return;
            };
            debug!(queue = %queue, job_id = %next.command().id, "dispatching next queued job");
            match self.send(Admission {
                job: next.clone(),
                admitted: None,
            }) {
                Ok(()) => return,
                Err(_) => {
                    next.discard(JobState::Killed);
                    self.unregister(&next);
                }
            }
        }
    }
}

/// Admits jobs as run slots free up, and starts them.
async fn dispatch(
    inner: Weak<Inner>,
    mut admissions: mpsc::UnboundedReceiver<Admission>,
    permits: Arc<Semaphore>,
) {
    loop {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let Some(Admission { job, admitted }) = admissions.recv().await else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        if inner.closed.load(Ordering::SeqCst) {
            debug!(job_id = %job.command().id, "admission closed, dropping job");
            if job.discard(JobState::Killed) {
                inner.clean_up(&job);
            }
            continue;
        }

        if let Some(admitted) = admitted {
            let _ = admitted.send(());
        }
        debug!(job_id = %job.command().id, "job admitted");

        tokio::spawn(async move {
            job.clone().start().await;
            inner.clean_up(&job);
            drop(permit);
        });
    }
    debug!("dispatch loop exited");
}

/// Supervisor of every job on this node.
///
/// Cloning is cheap and every clone drives the same registry. Must be
/// created inside a tokio runtime, which hosts the dispatch loop.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// A manager reaping its children through the process-wide SIGCHLD
    /// reaper.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_pid_table(config, SystemPidTable::global())
    }

    pub fn with_pid_table(config: ManagerConfig, table: Arc<dyn PidTable>) -> Self {
        let (admission_tx, admission_rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(config.max_jobs.max(1)));

        let mut factories: HashMap<String, ProcessFactory> = HashMap::new();
        factories.insert(CORE_SYSTEM.to_string(), SystemProcess::factory());

        let inner = Arc::new(Inner {
            unprivileged: AtomicBool::new(config.unprivileged),
            config,
            table,
            handlers: Arc::new(Handlers::new()),
            jobs: RwLock::new(HashMap::new()),
            queues: Mutex::new(NamedQueues::new()),
            factories: RwLock::new(factories),
            routers: RwLock::new(Vec::new()),
            admission: Mutex::new(Some(admission_tx)),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(dispatch(Arc::downgrade(&inner), admission_rx, permits));

        info!(max_jobs = inner.config.max_jobs, "job manager started");
        Self { inner }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Switches every future child to the restricted capability set. There
    /// is no way back.
    pub fn set_unprivileged(&self) {
        if !self.inner.unprivileged.swap(true, Ordering::SeqCst) {
            info!("switching to unprivileged mode");
        }
    }

    pub fn is_unprivileged(&self) -> bool {
        self.inner.unprivileged.load(Ordering::SeqCst)
    }

    /// Registers `factory` under `name`.
    ///
    /// # Panics
    ///
    /// When `name` is already registered.
    pub fn register(&self, name: &str, factory: ProcessFactory) {
        let mut factories = self
            .inner
            .factories
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if factories.contains_key(name) {
            panic!("command registered twice: {name}");
        }
        debug!(command = name, "command registered");
        factories.insert(name.to_string(), factory);
    }

    /// Registers an in-process action; its return value becomes the JSON
    /// result of the job.
    ///
    /// # Panics
    ///
    /// When `name` is already registered.
    pub fn register_builtin<F, T>(&self, name: &str, action: F)
    where
        F: Fn(&Command) -> Result<T> + Send + Sync + 'static,
        T: Serialize,
    {
        let runnable = Runnable::plain(move |cmd| Ok(serde_json::to_value(action(cmd)?)?));
        self.register(name, BuiltinProcess::factory(runnable));
    }

    /// Like [`Manager::register_builtin`] for actions that stream messages
    /// through their [`Context`].
    pub fn register_builtin_with_ctx<F, T>(&self, name: &str, action: F)
    where
        F: Fn(&Context) -> Result<T> + Send + Sync + 'static,
        T: Serialize,
    {
        let runnable = Runnable::with_context(move |ctx| Ok(serde_json::to_value(action(ctx)?)?));
        self.register(name, BuiltinProcess::factory(runnable));
    }

    /// Registers a command running `extension.exe` with templated arguments.
    ///
    /// # Errors
    ///
    /// When the name is taken or the executable can't be found.
    pub fn register_extension(&self, name: &str, extension: Extension) -> Result<()> {
        if self
            .inner
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
        {
            return Err(PmError::bad_request(format!(
                "command registered twice: {name}"
            )));
        }
        if lookup_path(&extension.exe).is_none() {
            return Err(PmError::not_found(format!(
                "extension executable not found: {}",
                extension.exe
            )));
        }
        self.register(name, extension.factory());
        Ok(())
    }

    /// Adds a fallback resolver for unregistered command names.
    pub fn add_router(&self, router: Arc<dyn Router>) {
        self.inner
            .routers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(router);
    }

    pub fn add_pre_handler(&self, handler: Arc<dyn PreHandler>) {
        self.inner.handlers.add_pre(handler);
    }

    pub fn add_result_handler(&self, handler: Arc<dyn ResultHandler>) {
        self.inner.handlers.add_result(handler);
    }

    pub fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.add_message(handler);
    }

    pub fn add_stats_handler(&self, handler: Arc<dyn StatsHandler>) {
        self.inner.handlers.add_stats(handler);
    }

    /// Fans a statistics sample out to the stats handlers.
    pub fn aggregate(&self, operation: &str, key: &str, value: f64, id: &str, tags: &[Tag]) {
        self.inner.handlers.aggregate(operation, key, value, id, tags);
    }

    fn factory_of(&self, name: &str) -> Option<ProcessFactory> {
        if let Some(factory) = self
            .inner
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Some(factory.clone());
        }

        let routers = self
            .inner
            .routers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        routers
            .iter()
            .find_map(|router| router.get(name))
            .map(BuiltinProcess::factory)
    }

    /// Reports a submission that never became a job.
    fn reject(&self, cmd: &Command, state: JobState) {
        warn!(job_id = %cmd.id, command = %cmd.command, state = %state, "job rejected");
        let result = JobResult::with_state(cmd, state);
        self.inner.handlers.result(cmd, &result);
    }

    /// Submits `cmd`. Resolves once the job is admitted, or parked behind
    /// its named queue.
    ///
    /// # Errors
    ///
    /// `UnknownCommand` and `DuplicateId` after a synthetic result went to
    /// the result handlers, `QueueClosed` after shutdown.
    pub async fn run(&self, mut cmd: Command, hooks: Vec<Arc<dyn RunnerHook>>) -> Result<JobHandle> {
        if cmd.id.is_empty() {
            cmd.id = Uuid::new_v4().to_string();
        }

        let Some(factory) = self.factory_of(&cmd.command) else {
            self.reject(&cmd, JobState::UnknownCmd);
            return Err(PmError::UnknownCommand(cmd.command));
        };
        self.run_factory(cmd, factory, hooks).await
    }

    /// Submits `cmd` to run through `factory`, bypassing name resolution.
    pub async fn run_factory(
        &self,
        mut cmd: Command,
        factory: ProcessFactory,
        hooks: Vec<Arc<dyn RunnerHook>>,
    ) -> Result<JobHandle> {
        if cmd.id.is_empty() {
            cmd.id = Uuid::new_v4().to_string();
        }
        self.inner.handlers.pre(&mut cmd);

        let job = {
            let mut jobs = self.inner.jobs.write().unwrap_or_else(|e| e.into_inner());
            if jobs.contains_key(&cmd.id) {
                drop(jobs);
                self.reject(&cmd, JobState::DuplicateId);
                return Err(PmError::DuplicateId(cmd.id));
            }
            let job = Job::new(cmd, factory, hooks, self.inner.job_options());
            jobs.insert(job.command().id.clone(), job.clone());
            job
        };

        debug!(job_id = %job.command().id, command = %job.command().command, "job submitted");
        if let Err(e) = self.push(job.clone()).await {
            // A job dropped by the dispatch loop is already discarded and
            // cleaned up.
            if job.discard(JobState::Killed) {
                self.inner.clean_up(&job);
            }
            return Err(e);
        }
        Ok(job)
    }

    async fn push(&self, job: JobHandle) -> Result<()> {
        let queue = job.command().queue.clone();
        if !queue.is_empty() && !self.inner.queues().push(&queue, job.clone()) {
            debug!(job_id = %job.command().id, queue = %queue, "job parked behind named queue");
            return Ok(());
        }

        let (admitted_tx, admitted_rx) = oneshot::channel();
        self.inner.send(Admission {
            job,
            admitted: Some(admitted_tx),
        })?;
        admitted_rx.await.map_err(|_| PmError::QueueClosed)
    }

    /// Snapshot of the registry.
    pub fn jobs(&self) -> HashMap<String, JobHandle> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn job_of(&self, id: &str) -> Option<JobHandle> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Sends SIGTERM to job `id`.
    pub fn kill(&self, id: &str) -> Result<()> {
        let job = self
            .job_of(id)
            .ok_or_else(|| PmError::JobNotFound(id.to_string()))?;
        info!(job_id = %id, "killing job");
        job.signal(Signal::SIGTERM)
    }

    /// Sends SIGTERM to every job that isn't protected.
    pub fn killall(&self) {
        for (id, job) in self.jobs() {
            if job.command().flags.protected {
                continue;
            }
            if let Err(e) = job.signal(Signal::SIGTERM) {
                debug!(job_id = %id, error = %e, "job not signalled");
            }
        }
    }

    /// Stops accepting jobs, sends SIGTERM to every job not listed in
    /// `except`, and SIGKILL to the ones still running after the grace
    /// period.
    pub async fn shutdown(&self, except: &[&str]) {
        info!(grace = ?self.inner.config.shutdown_grace, "shutting down job manager");
        self.inner.close();

        let parked = self.inner.queues().drain_waiting();
        for job in parked {
            job.discard(JobState::Killed);
            self.inner.unregister(&job);
        }

        let targets: Vec<JobHandle> = self
            .jobs()
            .into_values()
            .filter(|job| !except.contains(&job.command().id.as_str()))
            .collect();

        for job in &targets {
            job.unschedule();
            if let Err(e) = job.signal(Signal::SIGTERM) {
                debug!(job_id = %job.command().id, error = %e, "job not signalled");
            }
        }

        tokio::time::sleep(self.inner.config.shutdown_grace).await;

        for job in targets.iter().filter(|job| job.is_running()) {
            warn!(job_id = %job.command().id, "job survived SIGTERM, killing");
            if let Err(e) = job.signal(Signal::SIGKILL) {
                debug!(job_id = %job.command().id, error = %e, "job not killed");
            }
        }
    }

    /// Runs `bin` to completion and returns its result with complete
    /// output.
    ///
    /// # Errors
    ///
    /// Any outcome but SUCCESS, as a run error carrying the result code.
    pub async fn system(&self, bin: &str, args: &[&str]) -> Result<JobResult> {
        let streams = Arc::new(StreamHook::new());
        let job = self
            .run(Command::system(bin, args), vec![streams.clone()])
            .await?;

        let mut result = JobResult::clone(&*job.wait().await);
        result.streams = Streams(streams.stdout(), streams.stderr());

        if result.state != JobState::Success {
            let detail = match result.streams.stderr() {
                "" => result.data.as_str(),
                stderr => stderr,
            };
            return Err(PmError::coded(
                result.code,
                format!("({}) {bin}: {detail}", result.state),
            ));
        }
        Ok(result)
    }

    /// Runs command `cmd` with `args` and decodes its JSON result.
    ///
    /// # Errors
    ///
    /// Any outcome but SUCCESS as a run error, and `InvalidResultFormat`
    /// when the result isn't JSON.
    pub async fn internal<T: DeserializeOwned>(&self, cmd: &str, args: Value) -> Result<T> {
        let mut command = Command::new(cmd);
        command.arguments = args;
        let job = self.run(command, Vec::new()).await?;
        let result = job.wait().await;

        if result.state != JobState::Success {
            let message = serde_json::from_str::<String>(&result.data)
                .unwrap_or_else(|_| result.data.clone());
            return Err(PmError::coded(result.code, message));
        }
        if result.level != LEVEL_RESULT_JSON {
            return Err(PmError::InvalidResultFormat(result.level));
        }
        Ok(serde_json::from_str(&result.data)?)
    }
}
