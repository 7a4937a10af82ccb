use std::time::Duration;

/// Default admission cap on concurrently running jobs.
pub const DEFAULT_MAX_JOBS: usize = 100;

/// Tuning of a [`crate::scheduler::Manager`] and the jobs it runs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of jobs running at once.
    pub max_jobs: usize,
    /// Drop the restricted capabilities from every child's bounding set.
    pub unprivileged: bool,
    /// Time between SIGTERM and SIGKILL on shutdown.
    pub shutdown_grace: Duration,
    /// Pause before a failed job is restarted or a protected job respawned.
    pub restart_delay: Duration,
    /// Period of hook ticks.
    pub tick_interval: Duration,
    /// Messages kept for late subscribers.
    pub backlog_size: usize,
    /// Lines of stdout and stderr kept in a job result.
    pub stream_buffer_size: usize,
    /// Signals that may be pending on a job.
    pub signal_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            unprivileged: false,
            shutdown_grace: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            tick_interval: Duration::from_secs(1),
            backlog_size: 10,
            stream_buffer_size: 100,
            signal_buffer: 5,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ManagerConfig {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            max_jobs,
            ..Default::default()
        }
    }

    /// Defaults overlaid with `PM_MAX_JOBS` and `PM_UNPRIVILEGED`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with the values `lookup` returns. Unparseable
    /// values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(max_jobs) = lookup("PM_MAX_JOBS").and_then(|v| v.trim().parse().ok()) {
            cfg.max_jobs = max_jobs;
        }
        if let Some(unprivileged) = lookup("PM_UNPRIVILEGED").and_then(|v| parse_bool(&v)) {
            cfg.unprivileged = unprivileged;
        }
        cfg
    }

    pub fn with_unprivileged(mut self, unprivileged: bool) -> Self {
        self.unprivileged = unprivileged;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}
